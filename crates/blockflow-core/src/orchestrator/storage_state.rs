//! Bulk snapshot discovery across every store module of a request.

use std::collections::HashMap;
use std::sync::Arc;

use blockflow_dstore::ObjectStore;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::Error;
use crate::orchestrator::snapshots::{list_snapshots, Snapshots};

/// Concurrent snapshot listings per fetch.
const FETCH_CONCURRENCY: usize = 10;

/// The on-disk segment state of every store module.
#[derive(Debug, Default)]
pub struct StorageState {
    pub snapshots: HashMap<String, Snapshots>,
}

impl StorageState {
    pub fn get(&self, module_name: &str) -> Option<&Snapshots> {
        self.snapshots.get(module_name)
    }
}

impl std::fmt::Display for StorageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entries: Vec<String> = self
            .snapshots
            .iter()
            .map(|(name, snapshots)| format!("store={} ({})", name, snapshots))
            .collect();
        entries.sort();
        f.write_str(&entries.join(", "))
    }
}

/// List every store module's segments with bounded concurrency, failing fast
/// on the first error.
pub async fn fetch_storage_state(
    stores: Vec<(String, Arc<dyn ObjectStore>)>,
) -> Result<StorageState, Error> {
    let out = Arc::new(Mutex::new(StorageState::default()));
    let semaphore = Arc::new(Semaphore::new(FETCH_CONCURRENCY));
    let mut join_set: JoinSet<Result<(), Error>> = JoinSet::new();

    for (name, objects) in stores {
        let out = Arc::clone(&out);
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::Canceled)?;
            let snapshots = list_snapshots(&objects).await?;
            out.lock().snapshots.insert(name, snapshots);
            Ok(())
        });
    }

    while let Some(joined) = join_set.join_next().await {
        let result = joined.map_err(|e| Error::protocol(format!("snapshot task: {}", e)))?;
        if let Err(err) = result {
            join_set.abort_all();
            return Err(err);
        }
    }

    let state = Arc::try_unwrap(out)
        .map_err(|_| Error::protocol("storage state still shared after fetch"))?
        .into_inner();
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_dstore::MemStore;

    #[tokio::test]
    async fn fetches_all_modules() {
        let root: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let a = root.sub_store("hash-a/states");
        let b = root.sub_store("hash-b/states");
        a.write("0000000100-0000000000.kv", b"{}".to_vec())
            .await
            .unwrap();
        b.write("0000000200-0000000100.partial", b"{}".to_vec())
            .await
            .unwrap();

        let state = fetch_storage_state(vec![
            ("store_a".to_string(), a),
            ("store_b".to_string(), b),
        ])
        .await
        .unwrap();

        assert_eq!(state.get("store_a").unwrap().last_completed_block(), 100);
        assert_eq!(state.get("store_b").unwrap().partials.len(), 1);
    }

    #[tokio::test]
    async fn fails_fast_on_bad_listing() {
        let root: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let bad = root.sub_store("bad/states");
        bad.write("not-a-segment.txt", vec![1]).await.unwrap();

        let result = fetch_storage_state(vec![("store_bad".to_string(), bad)]).await;
        assert!(result.is_err());
    }
}
