use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use parley_shared::constants::IMAGE_CONTENT_TYPES;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
/// Prevents path traversal attacks.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    // Canonicalize base; target may not exist yet so normalize manually
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(&canonical_base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::BadRequest(
                    "Path traversal detected".to_string(),
                ));
            }
            _ => {} // RootDir, CurDir, Prefix — skip
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest(
            "Path traversal detected".to_string(),
        ));
    }
    Ok(resolved)
}

/// On-disk store for uploaded images, one file per blob id.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
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
        })
    }

    /// Store an image blob. Only whitelisted image content types are
    /// accepted and the size cap is enforced on the actual bytes received,
    /// not on anything the client declared.
    pub async fn store_image(&self, data: &[u8], content_type: &str) -> Result<Uuid, ServerError> {
        if !IMAGE_CONTENT_TYPES.contains(&content_type) {
            return Err(ServerError::UnsupportedMediaType(content_type.to_string()));
        }
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty upload".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::BlobTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let id = Uuid::new_v4();
        let path = self.safe_blob_path(&id)?;

        fs::write(&path, data)
            .await
            .map_err(|e| ServerError::BlobStorage(format!("Failed to write blob {}: {}", id, e)))?;

        debug!(id = %id, size = data.len(), content_type, "Stored image blob");
        Ok(id)
    }

    pub async fn get_blob(&self, id: Uuid) -> Result<Vec<u8>, ServerError> {
        let path = self.safe_blob_path(&id)?;

        if !path.exists() {
            return Err(ServerError::BlobNotFound(id));
        }

        let data = fs::read(&path)
            .await
            .map_err(|e| ServerError::BlobStorage(format!("Failed to read blob {}: {}", id, e)))?;

        debug!(id = %id, size = data.len(), "Retrieved blob");
        Ok(data)
    }

    pub async fn delete_blob(&self, id: Uuid) -> Result<(), ServerError> {
        let path = self.safe_blob_path(&id)?;

        if !path.exists() {
            return Err(ServerError::BlobNotFound(id));
        }

        fs::remove_file(&path)
            .await
            .map_err(|e| ServerError::BlobStorage(format!("Failed to delete blob {}: {}", id, e)))?;

        debug!(id = %id, "Deleted blob");
        Ok(())
    }

    /// Safe blob path that validates against traversal.
    fn safe_blob_path(&self, id: &Uuid) -> Result<PathBuf, ServerError> {
        let raw = self.base_path.join(id.to_string());
        ensure_within(&self.base_path, &raw)
    }
}
