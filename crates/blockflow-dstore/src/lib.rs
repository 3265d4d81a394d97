//! Provider-agnostic object-store abstraction.
//!
//! Stores expose a flat keyed blob namespace. Within a store, names are
//! unique by full path and overwrites are last-write-wins. Two
//! implementations are provided:
//!
//! - [`FsStore`]: directory-backed, with atomic tempfile-and-rename writes
//! - [`MemStore`]: in-memory, for tests and dry runs
//!
//! The [`retry`] module wraps any transient-failure-prone operation with
//! bounded exponential backoff.

pub mod fs;
pub mod mem;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;

pub use fs::FsStore;
pub use mem::MemStore;
pub use retry::with_retries;

/// Object-store failures. `NotFound` is a distinct, non-retryable case so
/// callers can probe for optional objects; everything else is treated as
/// transient by [`retry::with_retries`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {0:?} not found")]
    NotFound(String),
    #[error("store i/o: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_not_found()
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// A keyed blob namespace.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object's full contents.
    async fn open(&self, name: &str) -> Result<Vec<u8>, StoreError>;

    /// Write (or overwrite) an object.
    async fn write(&self, name: &str, content: Vec<u8>) -> Result<(), StoreError>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// List up to `max` object names starting with `prefix`, in
    /// lexicographic order.
    async fn list_files(&self, prefix: &str, max: usize) -> Result<Vec<String>, StoreError>;

    /// Visit every object name starting with `prefix`, in lexicographic
    /// order. The visitor returning an error stops the walk.
    async fn walk(
        &self,
        prefix: &str,
        visitor: &mut (dyn for<'r> FnMut(&'r str) -> Result<(), StoreError> + Send),
    ) -> Result<(), StoreError>;

    /// A printable locator for an object (diagnostics only).
    fn object_url(&self, name: &str) -> String;

    /// A store scoped under `segment` within this one.
    fn sub_store(&self, segment: &str) -> Arc<dyn ObjectStore>;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: Arc<dyn ObjectStore>) {
        store.write("a/one", b"1".to_vec()).await.unwrap();
        store.write("a/two", b"2".to_vec()).await.unwrap();
        store.write("b/one", b"3".to_vec()).await.unwrap();

        assert_eq!(store.open("a/one").await.unwrap(), b"1");
        assert!(store.open("a/missing").await.unwrap_err().is_not_found());

        let listed = store.list_files("a/", 10).await.unwrap();
        assert_eq!(listed, vec!["a/one".to_string(), "a/two".to_string()]);

        let mut walked = Vec::new();
        store
            .walk("", &mut |name| {
                walked.push(name.to_string());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(walked, vec!["a/one", "a/two", "b/one"]);

        // Overwrite is last-write-wins.
        store.write("a/one", b"1b".to_vec()).await.unwrap();
        assert_eq!(store.open("a/one").await.unwrap(), b"1b");

        store.delete("a/one").await.unwrap();
        assert!(store.open("a/one").await.unwrap_err().is_not_found());
        // Deleting again is fine.
        store.delete("a/one").await.unwrap();
    }

    #[tokio::test]
    async fn mem_store_contract() {
        exercise(Arc::new(MemStore::new())).await;
    }

    #[tokio::test]
    async fn fs_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(Arc::new(FsStore::new(dir.path()).unwrap())).await;
    }

    #[tokio::test]
    async fn sub_store_scopes_names() {
        let root: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let sub = root.sub_store("mod-ab12");
        sub.write("0000000100-0000000200.output", b"x".to_vec())
            .await
            .unwrap();

        assert_eq!(
            root.open("mod-ab12/0000000100-0000000200.output")
                .await
                .unwrap(),
            b"x"
        );
        assert_eq!(
            sub.list_files("", 10).await.unwrap(),
            vec!["0000000100-0000000200.output".to_string()]
        );
    }
}
