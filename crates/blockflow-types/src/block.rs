//! Blocks, clocks, cursors and fork steps.

use anyhow::{anyhow, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// A block as delivered by the block source: identity plus an opaque,
/// chain-specific payload that module code decodes on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub num: u64,
    pub id: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    #[serde(with = "crate::b64")]
    pub payload: Vec<u8>,
}

impl Block {
    pub fn as_block_ref(&self) -> BlockRef {
        BlockRef {
            num: self.num,
            id: self.id.clone(),
        }
    }

    pub fn clock(&self) -> Clock {
        Clock {
            number: self.num,
            id: self.id.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Lightweight block identity (number + content id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub num: u64,
    pub id: String,
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.num, self.id)
    }
}

/// The `(number, id, timestamp)` tuple handed to module executions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    pub number: u64,
    pub id: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

bitflags! {
    /// Fork-step bitmask attached to every sourced block.
    ///
    /// `NEW | IRREVERSIBLE` is delivered as a single step for blocks that are
    /// final the moment they are seen.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Step: u8 {
        const NEW          = 0b0001;
        const UNDO         = 0b0010;
        const IRREVERSIBLE = 0b0100;
        const STALLED      = 0b1000;
    }
}

impl Step {
    /// True when any bit of `other` is set on `self`.
    pub fn matches(self, other: Step) -> bool {
        self.intersects(other)
    }
}

impl Serialize for Step {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Step::from_bits(bits).ok_or_else(|| serde::de::Error::custom("unknown step bits"))
    }
}

/// Opaque resume token issued by the block source. Passing a cursor back on
/// resume yields the block immediately following the one it was issued for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn empty() -> Self {
        Cursor(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_opaque(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Ok(Cursor::empty());
        }
        let cursor = Cursor(value);
        cursor.block_ref()?;
        Ok(cursor)
    }

    pub fn for_block(block_ref: &BlockRef) -> Self {
        Cursor(format!("c1:{}:{}", block_ref.num, block_ref.id))
    }

    /// Decode the block this cursor was issued for.
    pub fn block_ref(&self) -> Result<BlockRef> {
        let mut parts = self.0.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("c1"), Some(num), Some(id)) if !id.is_empty() => Ok(BlockRef {
                num: num
                    .parse::<u64>()
                    .map_err(|_| anyhow!("invalid cursor block number {:?}", num))?,
                id: id.to_string(),
            }),
            _ => Err(anyhow!("invalid cursor {:?}", self.0)),
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
