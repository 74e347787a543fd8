use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use super::{ImageStore, StoreError};
use crate::object::StoreObject;
use crate::path_mapper::PathMapper;

/// Local filesystem image store.
pub struct LocalStore {
    base_path: PathBuf,
    mapper: PathMapper,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P, mapper: PathMapper) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path, mapper })
    }

    /// Absolute location of `name` on disk. Mapped paths that would escape
    /// the base directory are rejected.
    pub fn object_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let relative = self.mapper.map(name);
        let relative_path = Path::new(&relative);

        let safe = !relative.is_empty()
            && relative_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::InvalidName(name.to_string()));
        }

        Ok(self.base_path.join(relative_path))
    }
}

#[async_trait]
impl ImageStore for LocalStore {
    async fn save(&self, object: &StoreObject, data: Bytes) -> Result<String, StoreError> {
        let path = self.object_path(object.name())?;
        let write_err =
            |e: std::io::Error| StoreError::Write(format!("{}: {e}", path.display()));

        let parent = path.parent().unwrap_or(self.base_path.as_path());
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;

        // Readers must never see a half-written file.
        let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_err(e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_err(e));
        }

        tracing::debug!(
            name = object.name(),
            mime_type = object.mime_type(),
            path = %path.display(),
            bytes = data.len(),
            "Saved object to local store"
        );
        Ok(self.url_for(object.name()))
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.object_path(name)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::Query(format!("{}: {e}", path.display())))
    }

    async fn get(&self, name: &str) -> Result<Bytes, StoreError> {
        let path = self.object_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(StoreError::Query(format!("{}: {e}", path.display()))),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.object_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(StoreError::Write(format!("{}: {e}", path.display()))),
        }
    }

    fn url_for(&self, name: &str) -> String {
        let root = self.base_path.to_string_lossy();
        let root = root.trim_end_matches('/');
        format!("{root}/{}", self.mapper.map(name))
    }
}
