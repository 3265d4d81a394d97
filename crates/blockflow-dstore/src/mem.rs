//! In-memory object store for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{ObjectStore, StoreError};

/// An in-memory store. Cloning shares the underlying map, and
/// [`ObjectStore::sub_store`] returns a prefix-scoped view onto it.
#[derive(Clone, Default)]
pub struct MemStore {
    objects: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    prefix: String,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    fn full_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Number of objects visible through this view.
    pub fn len(&self) -> usize {
        let scope = self.full_name("");
        self.objects
            .read()
            .keys()
            .filter(|k| k.starts_with(&scope))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn open(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .get(&self.full_name(name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn write(&self, name: &str, content: Vec<u8>) -> Result<(), StoreError> {
        self.objects.write().insert(self.full_name(name), content);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.objects.write().remove(&self.full_name(name));
        Ok(())
    }

    async fn list_files(&self, prefix: &str, max: usize) -> Result<Vec<String>, StoreError> {
        let scope = self.full_name("");
        let full_prefix = self.full_name(prefix);
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(&full_prefix))
            .map(|k| k[scope.len()..].to_string())
            .take(max)
            .collect())
    }

    async fn walk(
        &self,
        prefix: &str,
        visitor: &mut (dyn for<'r> FnMut(&'r str) -> Result<(), StoreError> + Send),
    ) -> Result<(), StoreError> {
        for name in self.list_files(prefix, usize::MAX).await? {
            visitor(&name)?;
        }
        Ok(())
    }

    fn object_url(&self, name: &str) -> String {
        format!("mem://{}", self.full_name(name))
    }

    fn sub_store(&self, segment: &str) -> Arc<dyn ObjectStore> {
        Arc::new(MemStore {
            objects: Arc::clone(&self.objects),
            prefix: self.full_name(segment),
        })
    }
}
