//! End-to-end runs: parallel backfill into checkpoints, then streaming on
//! top of the resumed state.

mod common;

use std::sync::Arc;

use blockflow::service::{LocalJobRunner, Service};
use blockflow_core::error::Error;
use blockflow_core::graph::ModuleGraph;
use blockflow_dstore::{MemStore, ObjectStore};
use blockflow_types::{Cursor, Request, Response, Step};
use tokio_util::sync::CancellationToken;

use common::{delivery, test_modules, RangeSourceFactory, ScriptedSource, TestRuntime, BLOCK_TYPE};

const SAVE_INTERVAL: u64 = 100;

fn service(objects: &Arc<dyn ObjectStore>) -> Service {
    Service::new(Arc::clone(objects), BLOCK_TYPE)
        .with_stores_save_interval(SAVE_INTERVAL)
        .with_output_cache_save_interval(SAVE_INTERVAL)
        .with_backfill_concurrency(4)
}

fn request(start: i64, stop: u64) -> Request {
    Request {
        start_block_num: start,
        stop_block_num: stop,
        start_cursor: Cursor::empty(),
        modules: test_modules(),
        output_modules: vec!["block_meta".to_string(), "running_total".to_string()],
        initial_store_snapshot_for_modules: Vec::new(),
    }
}

#[tokio::test]
async fn backfill_then_stream() {
    let objects: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
    let service = service(&objects);
    let graph = Arc::new(ModuleGraph::new(test_modules()).unwrap());
    let runtime = TestRuntime::with_test_modules();
    let runner = Arc::new(
        LocalJobRunner::new(
            Arc::clone(&objects),
            Arc::clone(&graph),
            runtime.clone(),
            Arc::new(RangeSourceFactory),
            BLOCK_TYPE,
            SAVE_INTERVAL,
            SAVE_INTERVAL,
            service.metrics(),
        )
        .unwrap(),
    );

    // Backfill both stores to block 200 (2 segments each).
    let stores = service
        .backfill(&graph, 200, runner, CancellationToken::new())
        .await
        .unwrap();

    let count = stores.get("block_count").unwrap();
    assert_eq!(count.exclusive_end_block(), 200);
    assert_eq!(count.base.get_last("blocks").unwrap(), b"200");

    let total = stores.get("running_total").unwrap();
    // 0 + 1 + ... + 199
    assert_eq!(total.base.get_last("sum").unwrap(), b"19900");

    // Checkpoints exist at both boundaries and no partial remains.
    let files = objects.list_files("", usize::MAX).await.unwrap();
    assert!(!files.iter().any(|f| f.ends_with(".partial")));
    assert_eq!(
        files
            .iter()
            .filter(|f| f.ends_with("0000000200-0000000000.kv"))
            .count(),
        2,
        "one 200-block checkpoint per store: {:?}",
        files
    );

    // Stream on top of the backfilled state.
    let (mut resp_rx, handle) = service
        .blocks(
            request(200, 203),
            runtime,
            Box::new(ScriptedSource::new(
                (200..=203)
                    .map(|n| delivery(n, Step::NEW | Step::IRREVERSIBLE))
                    .collect(),
            )),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut data_blocks = Vec::new();
    while let Some(response) = resp_rx.recv().await {
        if let Response::BlockScopedData { clock, outputs, .. } = response {
            assert_eq!(outputs.len(), 2);
            data_blocks.push(clock.number);
        }
    }
    handle.await.unwrap().unwrap();
    assert_eq!(data_blocks, vec![200, 201, 202]);
}

#[tokio::test]
async fn stream_serves_initial_snapshots() {
    let objects: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
    let service = service(&objects);
    let runtime = TestRuntime::with_test_modules();

    let mut req = request(0, 2);
    req.initial_store_snapshot_for_modules = vec!["block_count".to_string()];

    let (mut resp_rx, handle) = service
        .blocks(
            req,
            runtime,
            Box::new(ScriptedSource::new(
                (0..=2)
                    .map(|n| delivery(n, Step::NEW | Step::IRREVERSIBLE))
                    .collect(),
            )),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut saw_complete = false;
    while let Some(response) = resp_rx.recv().await {
        if matches!(response, Response::SnapshotComplete) {
            saw_complete = true;
        }
    }
    handle.await.unwrap().unwrap();
    assert!(saw_complete);
}

#[tokio::test]
async fn invalid_requests_fail_fast() {
    let objects: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
    let service = service(&objects);
    let runtime = TestRuntime::with_test_modules();
    let token = CancellationToken::new();

    // Unknown output module.
    let mut bad = request(0, 10);
    bad.output_modules = vec!["nope".to_string()];
    let err = service
        .blocks(
            bad,
            runtime.clone(),
            Box::new(ScriptedSource::new(Vec::new())),
            token.clone(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    // Stop block at or below start.
    let err = service
        .blocks(
            request(50, 10),
            runtime.clone(),
            Box::new(ScriptedSource::new(Vec::new())),
            token.clone(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    // Malformed cursor.
    let mut bad = request(0, 10);
    bad.start_cursor = Cursor::from_opaque("").unwrap();
    // Build an invalid cursor by deserializing a raw string.
    bad.start_cursor = serde_json::from_str::<Cursor>("\"garbage\"").unwrap();
    let err = service
        .blocks(
            bad,
            runtime.clone(),
            Box::new(ScriptedSource::new(Vec::new())),
            token.clone(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    // Head-relative start without a chain head.
    let err = service
        .blocks(
            request(-10, 0),
            runtime,
            Box::new(ScriptedSource::new(Vec::new())),
            token,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}
