//! Project-scoped file store used by checkpoint capture and rollback replay.

use ::async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use vigil_core::{ProjectId, StorageError, VigilResult};

/// Read/write/delete access to files by path within one project.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Current content of `path`, or `None` when the file does not exist.
    async fn read(&self, project_id: ProjectId, path: &str) -> VigilResult<Option<Vec<u8>>>;

    async fn write(&self, project_id: ProjectId, path: &str, content: &[u8]) -> VigilResult<()>;

    /// Remove `path`. Removing a missing file succeeds.
    async fn delete(&self, project_id: ProjectId, path: &str) -> VigilResult<()>;
}

/// In-memory file store. Cloning shares the underlying files.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFileStore {
    files: Arc<RwLock<HashMap<(ProjectId, String), Vec<u8>>>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths present in a project, sorted.
    pub fn paths(&self, project_id: ProjectId) -> VigilResult<Vec<String>> {
        let files = self.files.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut paths: Vec<String> = files
            .keys()
            .filter(|(p, _)| *p == project_id)
            .map(|(_, path)| path.clone())
            .collect();
        paths.sort();
        Ok(paths)
    }
}

fn validate_path(path: &str) -> VigilResult<()> {
    if path.trim().is_empty() {
        return Err(StorageError::FileOperation {
            path: path.to_string(),
            reason: "path must not be empty".to_string(),
        }
        .into());
    }
    Ok(())
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn read(&self, project_id: ProjectId, path: &str) -> VigilResult<Option<Vec<u8>>> {
        let files = self.files.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(files.get(&(project_id, path.to_string())).cloned())
    }

    async fn write(&self, project_id: ProjectId, path: &str, content: &[u8]) -> VigilResult<()> {
        validate_path(path)?;
        let mut files = self.files.write().map_err(|_| StorageError::LockPoisoned)?;
        files.insert((project_id, path.to_string()), content.to_vec());
        Ok(())
    }

    async fn delete(&self, project_id: ProjectId, path: &str) -> VigilResult<()> {
        validate_path(path)?;
        let mut files = self.files.write().map_err(|_| StorageError::LockPoisoned)?;
        files.remove(&(project_id, path.to_string()));
        Ok(())
    }
}
