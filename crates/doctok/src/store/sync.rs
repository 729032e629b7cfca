use crate::{Error, OrganizationId, ProjectId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::PathBuf;

/// Object name of the exported non-text data inside a project's bucket.
pub const TOKENIZER_DATA_OBJECT: &str = "docbin_full.json";

/// Pushes exported tokenizer data to the organization's blob storage.
#[async_trait]
pub trait BlobSync: Send + Sync {
    async fn upload_tokenizer_data(
        &self,
        organization_id: OrganizationId,
        project_id: ProjectId,
        payload: Bytes,
    ) -> Result<()>;
}

/// Writes uploads to `<root>/<organization>/<project>/docbin_full.json`.
#[derive(Debug, Clone)]
pub struct FsBlobSync {
    root: PathBuf,
}

impl FsBlobSync {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobSync for FsBlobSync {
    async fn upload_tokenizer_data(
        &self,
        organization_id: OrganizationId,
        project_id: ProjectId,
        payload: Bytes,
    ) -> Result<()> {
        let dir = self
            .root
            .join(organization_id.to_string())
            .join(project_id.to_string());
        let sync_err = |e: std::io::Error| Error::BlobSync {
            reason: format!("{}: {e}", dir.display()),
        };
        tokio::fs::create_dir_all(&dir).await.map_err(sync_err)?;
        tokio::fs::write(dir.join(TOKENIZER_DATA_OBJECT), &payload)
            .await
            .map_err(sync_err)?;
        tracing::debug!(%project_id, bytes = payload.len(), "Uploaded tokenizer data");
        Ok(())
    }
}

/// One recorded upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
    pub payload: Bytes,
}

/// Keeps uploads in memory. Can be switched to failing mode.
#[derive(Debug, Default)]
pub struct RecordingBlobSync {
    uploads: Mutex<Vec<Upload>>,
    failing: Mutex<bool>,
}

impl RecordingBlobSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self, project_id: ProjectId) -> Vec<Upload> {
        self.uploads
            .lock()
            .iter()
            .filter(|u| u.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl BlobSync for RecordingBlobSync {
    async fn upload_tokenizer_data(
        &self,
        organization_id: OrganizationId,
        project_id: ProjectId,
        payload: Bytes,
    ) -> Result<()> {
        if *self.failing.lock() {
            return Err(Error::BlobSync {
                reason: "storage unavailable".to_owned(),
            });
        }
        self.uploads.lock().push(Upload {
            organization_id,
            project_id,
            payload,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn fs_sync_writes_under_org_and_project() {
        let root = std::env::temp_dir().join(format!("doctok-sync-{}", Uuid::new_v4()));
        let sync = FsBlobSync::new(&root);
        let (org, project) = (Uuid::new_v4(), Uuid::new_v4());

        sync.upload_tokenizer_data(org, project, Bytes::from_static(b"[]"))
            .await
            .unwrap();
        sync.upload_tokenizer_data(org, project, Bytes::from_static(b"[1]"))
            .await
            .unwrap();

        let path = root
            .join(org.to_string())
            .join(project.to_string())
            .join(TOKENIZER_DATA_OBJECT);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"[1]");
        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
