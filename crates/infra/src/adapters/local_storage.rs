//! Filesystem-backed [`Storage`].

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use shelfkeep_core::{ItemId, WorkspaceId};

use crate::processors::{ByteStream, PortError, Storage};

/// Stores objects under `root/<workspace>/<item>/<filename>`. Returned paths
/// are relative to `root`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a stored path, refusing anything that escapes the root.
    fn resolve(&self, relative: &str) -> Result<PathBuf, PortError> {
        let rel = Path::new(relative);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(PortError::NotFound(relative.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn save(
        &self,
        workspace_id: WorkspaceId,
        item_id: ItemId,
        filename: &str,
        mut body: ByteStream,
    ) -> Result<String, PortError> {
        let relative = format!("{workspace_id}/{item_id}/{filename}");
        let dest = self.resolve(&relative)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&dest).await?;
        tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        Ok(relative)
    }

    async fn get(&self, path: &str) -> Result<ByteStream, PortError> {
        let full = self.resolve(path)?;
        match tokio::fs::File::open(&full).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PortError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn saved_objects_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let (ws, item) = (WorkspaceId::new(), ItemId::new());

        let path = storage
            .save(ws, item, "a_small.jpg", Box::new(&b"pixels"[..]))
            .await
            .unwrap();
        assert_eq!(path, format!("{ws}/{item}/a_small.jpg"));

        let mut body = storage.get(&path).await.unwrap();
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"pixels");
    }

    #[tokio::test]
    async fn paths_outside_the_root_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        assert!(matches!(storage.get("../etc/passwd").await, Err(PortError::NotFound(_))));
        assert!(matches!(storage.get("/etc/passwd").await, Err(PortError::NotFound(_))));
        assert!(matches!(storage.get("missing.jpg").await, Err(PortError::NotFound(_))));
    }
}
