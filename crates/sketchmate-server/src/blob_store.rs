use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

/// Upload/delete collaborator used by the send and inbox pipelines.
/// Blobs are addressed by the URL returned from `upload`.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn upload(&self, data: Vec<u8>) -> Result<String, ServerError>;

    async fn delete(&self, url: &str) -> Result<(), ServerError>;
}

/// Reject any target that would resolve outside of `base`.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Filesystem blob store. Files are named by uuid; URLs look like
/// `<public_base_url>/blob/<uuid>`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
    public_base_url: String,
}

impl BlobStore {
    pub async fn new(
        base_path: PathBuf,
        max_size: usize,
        public_base_url: impl Into<String>,
    ) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::BlobStorage(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            max_size,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, id: Uuid) -> String {
        format!("{}/blob/{}", self.public_base_url, id)
    }

    /// Extract the blob id from a URL produced by [`BlobStore::url_for`].
    pub fn id_from_url(url: &str) -> Result<Uuid, ServerError> {
        let tail = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        Uuid::parse_str(tail)
            .map_err(|_| ServerError::BadRequest(format!("Not a blob URL: {url}")))
    }

    pub async fn store_blob(&self, data: &[u8]) -> Result<Uuid, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BlobStorage("Empty blob".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::BlobTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let id = Uuid::new_v4();
        let path = self.blob_path(&id)?;

        fs::write(&path, data)
            .await
            .map_err(|e| ServerError::BlobStorage(format!("Failed to write blob {id}: {e}")))?;

        debug!(id = %id, size = data.len(), "Stored blob");
        Ok(id)
    }

    pub async fn get_blob(&self, id: Uuid) -> Result<Vec<u8>, ServerError> {
        let path = self.blob_path(&id)?;

        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ServerError::BlobNotFound(id)),
            Err(e) => Err(ServerError::BlobStorage(format!(
                "Failed to read blob {id}: {e}"
            ))),
        }
    }

    pub async fn delete_blob(&self, id: Uuid) -> Result<(), ServerError> {
        let path = self.blob_path(&id)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(id = %id, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ServerError::BlobNotFound(id)),
            Err(e) => Err(ServerError::BlobStorage(format!(
                "Failed to delete blob {id}: {e}"
            ))),
        }
    }

    fn blob_path(&self, id: &Uuid) -> Result<PathBuf, ServerError> {
        ensure_within(&self.base_path, &self.base_path.join(id.to_string()))
    }
}

#[async_trait]
impl BlobStorage for BlobStore {
    async fn upload(&self, data: Vec<u8>) -> Result<String, ServerError> {
        let id = self.store_blob(&data).await?;
        Ok(self.url_for(id))
    }

    async fn delete(&self, url: &str) -> Result<(), ServerError> {
        let id = Self::id_from_url(url)?;
        self.delete_blob(id).await
    }
}
