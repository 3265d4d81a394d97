//! Buffering of reversible per-block effects, replayed on undo and dropped
//! on finality.

use std::collections::HashMap;

use blockflow_types::{Clock, Cursor, ModuleOutput, Response, Step, StoreDelta};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Error;
use crate::store::StoreMap;

/// Everything recorded for one reversible block: the outputs that were
/// emitted, and each participating store's deltas.
#[derive(Debug, Default, Clone)]
pub struct ReversibleSegment {
    pub outputs: Vec<ModuleOutput>,
    pub store_deltas: HashMap<String, Vec<StoreDelta>>,
}

/// Tracks reversible outputs by block number so chain reorganizations can be
/// unwound, and drops entries once blocks become final or stalled.
#[derive(Default)]
pub struct ForkHandler {
    reversible_outputs: HashMap<u64, ReversibleSegment>,
}

impl ForkHandler {
    pub fn new() -> Self {
        ForkHandler::default()
    }

    /// Record a reversible block's effects.
    pub fn record_reversible(
        &mut self,
        block_num: u64,
        outputs: Vec<ModuleOutput>,
        store_deltas: HashMap<String, Vec<StoreDelta>>,
    ) {
        self.reversible_outputs.insert(
            block_num,
            ReversibleSegment {
                outputs,
                store_deltas,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.reversible_outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reversible_outputs.is_empty()
    }

    pub fn contains(&self, block_num: u64) -> bool {
        self.reversible_outputs.contains_key(&block_num)
    }

    /// Undo one block: revert every participating store by replaying its
    /// recorded deltas in reverse, forward the reversed outputs to the
    /// response stream, and drop the entry.
    pub async fn handle_undo(
        &mut self,
        clock: &Clock,
        cursor: &Cursor,
        stores: &mut StoreMap,
        resp_tx: &mpsc::Sender<Response>,
    ) -> Result<(), Error> {
        let Some(segment) = self.reversible_outputs.remove(&clock.number) else {
            debug!(block_num = clock.number, "no reversible outputs to undo");
            return Ok(());
        };

        for (store_name, deltas) in &segment.store_deltas {
            let handle = stores.get_mut(store_name).ok_or_else(|| {
                Error::protocol(format!(
                    "undo for block {} names unknown store {:?}",
                    clock.number, store_name
                ))
            })?;
            handle.base_mut().apply_deltas_reverse(deltas);
        }

        resp_tx
            .send(Response::BlockScopedData {
                clock: clock.clone(),
                cursor: cursor.clone(),
                step: Step::UNDO,
                outputs: segment.outputs,
            })
            .await
            .map_err(|_| Error::Canceled)?;
        Ok(())
    }

    /// Drop one block's entry (irreversible or stalled).
    pub fn remove_reversible_output(&mut self, block_num: u64) {
        self.reversible_outputs.remove(&block_num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BaseStore, FullKV, StoreHandle};
    use blockflow_dstore::MemStore;
    use blockflow_types::{OutputData, UpdatePolicy};
    use std::sync::Arc;

    fn outputs_for(names: &[&str]) -> Vec<ModuleOutput> {
        names
            .iter()
            .map(|name| ModuleOutput {
                name: name.to_string(),
                data: OutputData::MapOutput(Vec::new()),
                logs: Vec::new(),
                logs_truncated: false,
            })
            .collect()
    }

    #[test]
    fn irreversibility_pruning_is_per_block() {
        let mut handler = ForkHandler::new();
        for block_num in [10, 20, 30, 40, 50] {
            handler.record_reversible(
                block_num,
                outputs_for(&["module_1", "module_2", "module_3"]),
                HashMap::new(),
            );
        }

        handler.remove_reversible_output(20);
        handler.remove_reversible_output(30);

        assert_eq!(handler.len(), 3);
        for kept in [10, 40, 50] {
            assert!(handler.contains(kept));
        }
        for dropped in [20, 30] {
            assert!(!handler.contains(dropped));
        }
    }

    #[tokio::test]
    async fn undo_reverts_stores_and_forwards_outputs() {
        let mut handler = ForkHandler::new();
        let mut stores = StoreMap::new();
        let mut base = BaseStore::new(
            "balances",
            0,
            "hash",
            UpdatePolicy::Set,
            "string",
            Arc::new(MemStore::new()),
        )
        .unwrap();
        base.set(0, "alice", b"10".to_vec());
        base.reset();
        base.set(0, "alice", b"20".to_vec());
        let deltas = base.deltas().to_vec();
        base.reset();
        stores.insert(StoreHandle::Full(FullKV::new(base)));

        handler.record_reversible(
            7,
            outputs_for(&["balances"]),
            HashMap::from([("balances".to_string(), deltas)]),
        );

        let (resp_tx, mut resp_rx) = mpsc::channel(4);
        let clock = Clock {
            number: 7,
            id: "b7".to_string(),
            timestamp: 0,
        };
        handler
            .handle_undo(&clock, &Cursor::empty(), &mut stores, &resp_tx)
            .await
            .unwrap();

        // Store reverted to its pre-block value.
        let handle = stores.get("balances").unwrap();
        assert_eq!(handle.base().get_last("alice").unwrap(), b"10");

        // The undo message carries the recorded outputs.
        match resp_rx.recv().await.unwrap() {
            Response::BlockScopedData { step, outputs, .. } => {
                assert_eq!(step, Step::UNDO);
                assert_eq!(outputs.len(), 1);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert!(handler.is_empty());

        // Undoing an unknown block is a no-op.
        handler
            .handle_undo(&clock, &Cursor::empty(), &mut stores, &resp_tx)
            .await
            .unwrap();
    }
}
