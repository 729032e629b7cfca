//! Error type shared by the gRPC server and its clients.
//!
//! Wraps [`doctok::Error`] and adds the failures that only exist at the wire
//! boundary. `From<Error> for tonic::Status` picks the status code a client
//! sees.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// Any failure reported by the orchestrator.
    #[error(transparent)]
    Tokenization(#[from] doctok::Error),

    /// An identifier field is not a valid UUID.
    #[error("Invalid {field}: '{value}' is not a UUID")]
    InvalidId { field: &'static str, value: String },

    /// The requested task row does not exist.
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidId { .. } => Status::invalid_argument(err.to_string()),
            Error::TaskNotFound { .. } => Status::not_found(err.to_string()),
            Error::Tokenization(inner) => tokenization_status(inner),
        }
    }
}

fn tokenization_status(err: doctok::Error) -> Status {
    use doctok::Error as E;
    let message = err.to_string();
    match err {
        E::NotFound { .. } => Status::not_found(message),
        E::InvalidRequest { .. } => Status::invalid_argument(message),
        E::TokenizerNotAllowed { .. } | E::AttributeNotText { .. } => {
            Status::failed_precondition(message)
        }
        E::InvalidTransition { .. } => Status::aborted(message),
        E::ServiceShutdown => Status::unavailable("Service is shutting down"),
        E::Store { .. }
        | E::Config { .. }
        | E::TokenizerLoad { .. }
        | E::BlobSync { .. }
        | E::Broadcast { .. }
        | E::Worker { .. } => Status::unavailable(message),
        E::BlobMissing { .. }
        | E::BlobColumnsMismatch { .. }
        | E::RequiredBlobsMissing { .. }
        | E::Codec { .. } => {
            Status::internal(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn caller_mistakes_map_to_client_codes() {
        let status: Status = Error::InvalidId {
            field: "project_id",
            value: "nope".to_owned(),
        }
        .into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("project_id"));

        let status: Status = Error::from(doctok::Error::NotFound {
            entity: "project",
            id: "p".to_owned(),
        })
        .into();
        assert_eq!(status.code(), Code::NotFound);

        let status: Status = Error::from(doctok::Error::TokenizerNotAllowed {
            config_id: "xx".to_owned(),
            allowed: vec!["en_core_web_sm".to_owned()],
        })
        .into();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }

    #[test]
    fn dependency_failures_are_retryable() {
        let status: Status = Error::from(doctok::Error::BlobSync {
            reason: "down".to_owned(),
        })
        .into();
        assert_eq!(status.code(), Code::Unavailable);

        let status: Status = Error::from(doctok::Error::ServiceShutdown).into();
        assert_eq!(status.code(), Code::Unavailable);

        let status: Status = Error::from(doctok::Error::RequiredBlobsMissing {
            expected: 3,
            found: 1,
        })
        .into();
        assert_eq!(status.code(), Code::Internal);
    }
}
