//! Wire types and their mapping onto the orchestrator.
//!
//! - [`proto`] - generated messages, client and server stubs
//! - [`error`] - gRPC-facing error type and its `tonic::Status` mapping
//! - [`convert`] - identifier parsing and message conversions

pub mod convert;
pub mod error;

pub use convert::*;
pub use error::*;

pub mod proto {
    tonic::include_proto!("doctok");

    /// Encoded descriptor set for the reflection service.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("doctok_descriptor");
}
