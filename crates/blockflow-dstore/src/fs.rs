//! Directory-backed object store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::{ObjectStore, StoreError};

/// Object store rooted at a directory. Object names map to relative file
/// paths; writes land atomically via a temp file and rename.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(FsStore { root })
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn collect(&self, prefix: &str, max: usize) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        collect_files(&self.root, &self.root, &mut names)?;
        names.sort();
        names.retain(|name| name.starts_with(prefix));
        names.truncate(max);
        Ok(names)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn open(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, name: &str, content: Vec<u8>) -> Result<(), StoreError> {
        let path = self.object_path(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Keep the original extension in the temp name so sibling objects
        // sharing a stem never collide mid-write.
        let tmp = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
        ));
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.object_path(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_files(&self, prefix: &str, max: usize) -> Result<Vec<String>, StoreError> {
        self.collect(prefix, max)
    }

    async fn walk(
        &self,
        prefix: &str,
        visitor: &mut (dyn for<'r> FnMut(&'r str) -> Result<(), StoreError> + Send),
    ) -> Result<(), StoreError> {
        for name in self.collect(prefix, usize::MAX)? {
            visitor(&name)?;
        }
        Ok(())
    }

    fn object_url(&self, name: &str) -> String {
        format!("file://{}", self.object_path(name).display())
    }

    fn sub_store(&self, segment: &str) -> Arc<dyn ObjectStore> {
        Arc::new(FsStore {
            root: self.root.join(segment),
        })
    }
}
