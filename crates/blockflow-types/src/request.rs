//! Request and streaming-response payloads.

use serde::{Deserialize, Serialize};

use crate::block::{Clock, Cursor, Step};
use crate::delta::StoreDeltas;
use crate::manifest::Module;

/// A streaming request: process `[start_block_num, stop_block_num)` through
/// the given modules, emitting data for the requested output modules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// Negative values are relative to the chain head.
    pub start_block_num: i64,
    pub stop_block_num: u64,
    #[serde(default)]
    pub start_cursor: Cursor,
    pub modules: Vec<Module>,
    pub output_modules: Vec<String>,
    #[serde(default)]
    pub initial_store_snapshot_for_modules: Vec<String>,
}

/// A single module's output for one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleOutput {
    pub name: String,
    pub data: OutputData,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub logs_truncated: bool,
}

/// Typed payload of a module output: map bytes or store deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputData {
    MapOutput(#[serde(with = "crate::b64")] Vec<u8>),
    StoreDeltas(Vec<crate::delta::StoreDelta>),
}

/// Progress report for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleProgress {
    pub name: String,
    pub kind: ProgressKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    /// Contiguous `[start, end)` ranges fully processed so far.
    ProcessedRanges(Vec<(u64, u64)>),
    /// The module resumed from a stored state ending at this block.
    InitialState { available_up_to_block: u64 },
    ProcessedBytes { total_bytes_read: u64 },
    Failed { reason: String },
}

/// One batch of a store's initial snapshot dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialSnapshotData {
    pub module_name: String,
    pub deltas: StoreDeltas,
    pub sent_keys: u64,
    pub total_keys: u64,
}

/// Messages of the server-streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Progress(Vec<ModuleProgress>),
    BlockScopedData {
        clock: Clock,
        cursor: Cursor,
        step: Step,
        outputs: Vec<ModuleOutput>,
    },
    SnapshotData(InitialSnapshotData),
    SnapshotComplete,
}
