//! Protocol data model for the blockflow runtime.
//!
//! This crate holds the wire-level and manifest-level types shared by every
//! other crate:
//!
//! - `block`: blocks, clocks, cursors and the fork-step bitmask
//! - `delta`: keyed store mutations recorded per block
//! - `manifest`: package/module declarations and the manifest reader
//! - `request`: request and streaming-response payloads

pub mod block;
pub mod delta;
pub mod manifest;
pub mod request;

pub use block::{Block, BlockRef, Clock, Cursor, Step};
pub use delta::{Operation, StoreDelta, StoreDeltas};
pub use manifest::{
    read_package, Input, Module, ModuleKind, Package, PackageMeta, StoreMode, UpdatePolicy,
};
pub use request::{
    InitialSnapshotData, ModuleOutput, ModuleProgress, OutputData, ProgressKind, Request, Response,
};

/// Serde adapter encoding `Vec<u8>` fields as standard base64 strings, so the
/// JSON artifacts stay compact and byte-exact.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
