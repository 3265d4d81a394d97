//! Keyed store mutations recorded while processing a block.

use serde::{Deserialize, Serialize};

/// The kind of mutation a delta records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    #[default]
    Unset,
    Create,
    Update,
    Delete,
}

/// One recorded mutation: enough to re-apply it authoritatively or to revert
/// it (old values are carried for `Update` and `Delete`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDelta {
    pub operation: Operation,
    pub ordinal: u64,
    pub key: String,
    #[serde(with = "crate::b64")]
    pub old_value: Vec<u8>,
    #[serde(with = "crate::b64")]
    pub new_value: Vec<u8>,
}

/// The ordered set of deltas a store produced within one block, as exposed to
/// downstream modules subscribing to the store in `deltas` mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDeltas {
    pub deltas: Vec<StoreDelta>,
}
