//! The in-memory keyed store shared by full and partial segments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use blockflow_dstore::ObjectStore;
use blockflow_types::{Operation, StoreDelta, UpdatePolicy};
use tracing::debug;

use crate::store::value;

/// Keyed state for one store module: the key/value map, plus the ordered
/// deltas produced within the current block. Deltas are reset between blocks
/// and exposed downstream to modules consuming this store in `deltas` mode.
pub struct BaseStore {
    name: String,
    module_hash: String,
    module_initial_block: u64,
    update_policy: UpdatePolicy,
    value_type: String,
    objects: Arc<dyn ObjectStore>,

    pub(crate) kv: HashMap<String, Vec<u8>>,
    pub(crate) deltas: Vec<StoreDelta>,
    last_ordinal: u64,
}

impl BaseStore {
    pub fn new(
        name: impl Into<String>,
        module_initial_block: u64,
        module_hash: impl Into<String>,
        update_policy: UpdatePolicy,
        value_type: impl Into<String>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(anyhow!("store name cannot be empty"));
        }
        Ok(BaseStore {
            name,
            module_hash: module_hash.into(),
            module_initial_block,
            update_policy,
            value_type: value_type.into(),
            objects,
            kv: HashMap::new(),
            deltas: Vec::new(),
            last_ordinal: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_hash(&self) -> &str {
        &self.module_hash
    }

    pub fn initial_block(&self) -> u64 {
        self.module_initial_block
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        self.update_policy
    }

    pub fn value_type(&self) -> &str {
        &self.value_type
    }

    pub(crate) fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    /// A fresh, empty store with the same module configuration.
    pub fn clone_config(&self) -> BaseStore {
        BaseStore {
            name: self.name.clone(),
            module_hash: self.module_hash.clone(),
            module_initial_block: self.module_initial_block,
            update_policy: self.update_policy,
            value_type: self.value_type.clone(),
            objects: Arc::clone(&self.objects),
            kv: HashMap::new(),
            deltas: Vec::new(),
            last_ordinal: 0,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The value after every mutation of the current block.
    pub fn get_last(&self, key: &str) -> Option<Vec<u8>> {
        self.kv.get(key).cloned()
    }

    /// The value as observed at ordinal 0 of the current block, before any
    /// of this block's mutations.
    pub fn get_first(&self, key: &str) -> Option<Vec<u8>> {
        let mut out = self.get_last(key);
        for delta in self.deltas.iter().rev() {
            if delta.key != key {
                continue;
            }
            out = match delta.operation {
                Operation::Create => None,
                Operation::Update | Operation::Delete => Some(delta.old_value.clone()),
                Operation::Unset => out,
            };
        }
        out
    }

    /// The value as observed just before `ordinal`, respecting every delta
    /// issued at or below it.
    pub fn get_at(&self, ordinal: u64, key: &str) -> Option<Vec<u8>> {
        let mut out = self.get_last(key);
        for delta in self.deltas.iter().rev() {
            if delta.ordinal <= ordinal {
                break;
            }
            if delta.key != key {
                continue;
            }
            out = match delta.operation {
                Operation::Create => None,
                Operation::Update | Operation::Delete => Some(delta.old_value.clone()),
                Operation::Unset => out,
            };
        }
        out
    }

    pub fn length(&self) -> usize {
        self.kv.len()
    }

    pub fn iter(&self, mut f: impl FnMut(&str, &[u8]) -> Result<()>) -> Result<()> {
        for (key, val) in &self.kv {
            f(key, val)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn bump_ordinal(&mut self, ordinal: u64) {
        if ordinal < self.last_ordinal {
            debug!(
                store = %self.name,
                ordinal,
                last_ordinal = self.last_ordinal,
                "ordinal going backwards within a block"
            );
        }
        self.last_ordinal = ordinal;
    }

    fn set_raw(&mut self, ordinal: u64, key: &str, new_value: Vec<u8>) {
        self.bump_ordinal(ordinal);
        let delta = match self.kv.get(key) {
            Some(old) => StoreDelta {
                operation: Operation::Update,
                ordinal,
                key: key.to_string(),
                old_value: old.clone(),
                new_value,
            },
            None => StoreDelta {
                operation: Operation::Create,
                ordinal,
                key: key.to_string(),
                old_value: Vec::new(),
                new_value,
            },
        };
        self.apply_delta(&delta);
        self.deltas.push(delta);
    }

    pub fn set(&mut self, ordinal: u64, key: &str, value: Vec<u8>) {
        self.set_raw(ordinal, key, value);
    }

    pub fn set_if_not_exists(&mut self, ordinal: u64, key: &str, value: Vec<u8>) {
        if self.get_at(ordinal, key).is_some() {
            return;
        }
        self.set_raw(ordinal, key, value);
    }

    pub fn append(&mut self, ordinal: u64, key: &str, value: &[u8]) {
        let mut new_value = self.get_at(ordinal, key).unwrap_or_default();
        new_value.extend_from_slice(value);
        self.set_raw(ordinal, key, new_value);
    }

    pub fn delete(&mut self, ordinal: u64, key: &str) {
        let Some(old) = self.get_at(ordinal, key) else {
            return;
        };
        self.bump_ordinal(ordinal);
        let delta = StoreDelta {
            operation: Operation::Delete,
            ordinal,
            key: key.to_string(),
            old_value: old,
            new_value: Vec::new(),
        };
        self.apply_delta(&delta);
        self.deltas.push(delta);
    }

    fn combine_and_set(
        &mut self,
        ordinal: u64,
        key: &str,
        value: &[u8],
        combine: impl Fn(&str, &[u8], &[u8]) -> Result<Vec<u8>>,
    ) -> Result<()> {
        let new_value = match self.get_at(ordinal, key) {
            Some(old) => combine(&self.value_type, &old, value)
                .with_context(|| format!("store {:?} key {:?}", self.name, key))?,
            None => value.to_vec(),
        };
        self.set_raw(ordinal, key, new_value);
        Ok(())
    }

    /// Numeric addition per the store's value type.
    pub fn add(&mut self, ordinal: u64, key: &str, value: &[u8]) -> Result<()> {
        self.combine_and_set(ordinal, key, value, value::combine_add)
    }

    /// Keep the smaller of the existing and given value.
    pub fn set_min(&mut self, ordinal: u64, key: &str, value: &[u8]) -> Result<()> {
        self.combine_and_set(ordinal, key, value, value::combine_min)
    }

    /// Keep the larger of the existing and given value.
    pub fn set_max(&mut self, ordinal: u64, key: &str, value: &[u8]) -> Result<()> {
        self.combine_and_set(ordinal, key, value, value::combine_max)
    }

    // ------------------------------------------------------------------
    // Deltas
    // ------------------------------------------------------------------

    /// Apply one delta authoritatively (replaying a recorded mutation).
    pub fn apply_delta(&mut self, delta: &StoreDelta) {
        match delta.operation {
            Operation::Create | Operation::Update => {
                self.kv.insert(delta.key.clone(), delta.new_value.clone());
            }
            Operation::Delete => {
                self.kv.remove(&delta.key);
            }
            Operation::Unset => {}
        }
    }

    pub fn apply_deltas(&mut self, deltas: &[StoreDelta]) {
        for delta in deltas {
            self.apply_delta(delta);
        }
    }

    /// Revert a sequence of deltas, newest first: creates are deleted,
    /// updates and deletes restore their old value.
    pub fn apply_deltas_reverse(&mut self, deltas: &[StoreDelta]) {
        for delta in deltas.iter().rev() {
            match delta.operation {
                Operation::Create => {
                    self.kv.remove(&delta.key);
                }
                Operation::Update | Operation::Delete => {
                    self.kv.insert(delta.key.clone(), delta.old_value.clone());
                }
                Operation::Unset => {}
            }
        }
    }

    /// The deltas produced within the current block, in ordinal order.
    pub fn deltas(&self) -> &[StoreDelta] {
        &self.deltas
    }

    /// Clear the per-block delta buffer (called between blocks).
    pub fn reset(&mut self) {
        self.deltas.clear();
        self.last_ordinal = 0;
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    pub(crate) fn marshal_kv(&self) -> Result<Vec<u8>> {
        let encoded: BTreeMap<&str, String> = self
            .kv
            .iter()
            .map(|(k, v)| (k.as_str(), BASE64.encode(v)))
            .collect();
        serde_json::to_vec(&encoded).context("serialize store state")
    }

    pub(crate) fn unmarshal_kv(&mut self, content: &[u8]) -> Result<()> {
        let encoded: BTreeMap<String, String> =
            serde_json::from_slice(content).context("parse store state")?;
        self.kv = encoded
            .into_iter()
            .map(|(k, v)| Ok((k, BASE64.decode(v.as_bytes()).context("decode store value")?)))
            .collect::<Result<_>>()?;
        Ok(())
    }
}

impl std::fmt::Debug for BaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseStore")
            .field("name", &self.name)
            .field("module_hash", &self.module_hash)
            .field("keys", &self.kv.len())
            .field("deltas", &self.deltas.len())
            .finish()
    }
}
