//! Initial store-snapshot streaming.

use blockflow_types::{
    InitialSnapshotData, Operation, Response, StoreDelta, StoreDeltas,
};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::store::StoreMap;

/// Keys per snapshot batch.
const SNAPSHOT_BATCH_SIZE: u64 = 100;

/// Stream the current contents of the requested stores as batches of CREATE
/// deltas, closing with a completion marker.
pub async fn send_snapshots(
    stores: &StoreMap,
    requested: &[String],
    resp_tx: &mpsc::Sender<Response>,
) -> Result<(), Error> {
    if requested.is_empty() {
        return Ok(());
    }

    for module_name in requested {
        let handle = stores.get(module_name).ok_or_else(|| {
            Error::invalid_request(format!("snapshot store {:?} not found", module_name))
        })?;

        let base = handle.base();
        let total = base.length() as u64;
        let mut sent = 0u64;
        let mut batch: Vec<StoreDelta> = Vec::new();

        let mut entries: Vec<(String, Vec<u8>)> = Vec::with_capacity(base.length());
        base.iter(|key, value| {
            entries.push((key.to_string(), value.to_vec()));
            Ok(())
        })
        .map_err(|e| Error::protocol(format!("{:#}", e)))?;
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (key, value) in entries {
            sent += 1;
            batch.push(StoreDelta {
                operation: Operation::Create,
                ordinal: 0,
                key,
                old_value: Vec::new(),
                new_value: value,
            });
            if sent % SNAPSHOT_BATCH_SIZE == 0 {
                send_batch(resp_tx, module_name, std::mem::take(&mut batch), sent, total).await?;
            }
        }
        if !batch.is_empty() {
            send_batch(resp_tx, module_name, batch, sent, total).await?;
        }
    }

    resp_tx
        .send(Response::SnapshotComplete)
        .await
        .map_err(|_| Error::Canceled)
}

async fn send_batch(
    resp_tx: &mpsc::Sender<Response>,
    module_name: &str,
    deltas: Vec<StoreDelta>,
    sent_keys: u64,
    total_keys: u64,
) -> Result<(), Error> {
    resp_tx
        .send(Response::SnapshotData(InitialSnapshotData {
            module_name: module_name.to_string(),
            deltas: StoreDeltas { deltas },
            sent_keys,
            total_keys,
        }))
        .await
        .map_err(|_| Error::Canceled)
}
