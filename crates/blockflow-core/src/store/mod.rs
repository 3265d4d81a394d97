//! Keyed module stores: an in-memory KV with ordered per-block deltas,
//! persisted as full (`.kv`) or partial (`.partial`) segments.

mod base;
mod full;
mod partial;
pub mod value;

use std::collections::HashMap;

pub use base::BaseStore;
pub use full::FullKV;
pub use partial::PartialKV;

/// A store as held by the pipeline: full state in stream mode, partial state
/// while a backfill worker owns it.
pub enum StoreHandle {
    Full(FullKV),
    Partial(PartialKV),
}

impl StoreHandle {
    pub fn base(&self) -> &BaseStore {
        match self {
            StoreHandle::Full(s) => &s.base,
            StoreHandle::Partial(s) => &s.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseStore {
        match self {
            StoreHandle::Full(s) => &mut s.base,
            StoreHandle::Partial(s) => &mut s.base,
        }
    }

    pub fn name(&self) -> &str {
        self.base().name()
    }
}

/// All stores of a request, keyed by module name. Mutated only by the thread
/// driving block processing.
#[derive(Default)]
pub struct StoreMap {
    stores: HashMap<String, StoreHandle>,
}

impl StoreMap {
    pub fn new() -> Self {
        StoreMap::default()
    }

    pub fn insert(&mut self, handle: StoreHandle) {
        self.stores.insert(handle.name().to_string(), handle);
    }

    pub fn get(&self, name: &str) -> Option<&StoreHandle> {
        self.stores.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut StoreHandle> {
        self.stores.get_mut(name)
    }

    /// Temporarily take a store out of the map (so it can be mutated while
    /// the rest of the map is read).
    pub fn take(&mut self, name: &str) -> Option<StoreHandle> {
        self.stores.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StoreHandle)> {
        self.stores.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut StoreHandle)> {
        self.stores.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Clear every store's per-block delta buffer.
    pub fn reset_deltas(&mut self) {
        for handle in self.stores.values_mut() {
            handle.base_mut().reset();
        }
    }
}
