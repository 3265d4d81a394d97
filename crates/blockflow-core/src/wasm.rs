//! Interface to the WASM module host.
//!
//! The host itself lives outside this crate; the pipeline only needs to
//! materialize a module's declared inputs into arguments, run the named
//! entrypoint, and read back logs and (for maps) the output bytes.

use std::collections::HashMap;

use anyhow::Result;
use blockflow_types::Clock;

use crate::store::BaseStore;

/// One argument bound to a module execution, mirroring the module's declared
/// inputs plus, for store modules, the writable output store.
pub enum Argument<'a> {
    /// The raw chain block.
    Block { name: String, value: &'a [u8] },
    /// An upstream map module's output for this block.
    MapOutput { name: String, value: Vec<u8> },
    /// An upstream store's deltas for this block, serialized.
    StoreDeltas { name: String, value: Vec<u8> },
    /// An upstream store in read-only (`get`) mode.
    StoreReader { name: String, store: &'a BaseStore },
    /// The executing store module's own state, writable through the host's
    /// policy-specific mutators.
    StoreWriter { name: String, store: &'a mut BaseStore },
}

impl Argument<'_> {
    pub fn name(&self) -> &str {
        match self {
            Argument::Block { name, .. }
            | Argument::MapOutput { name, .. }
            | Argument::StoreDeltas { name, .. }
            | Argument::StoreReader { name, .. }
            | Argument::StoreWriter { name, .. } => name,
        }
    }
}

/// A handler resolving one host extension call.
pub type ExtensionHandler =
    Box<dyn Fn(&Clock, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Registered host extensions: `namespace -> name -> handler`.
pub type Extensions = HashMap<String, HashMap<String, ExtensionHandler>>;

/// A compiled module host. One runtime serves all modules of a request; each
/// block execution gets a fresh instance. Instances are single-threaded and
/// must not be shared across threads concurrently.
pub trait ModuleRuntime: Send + Sync {
    fn new_instance<'a>(
        &self,
        clock: &Clock,
        entrypoint: &str,
        arguments: Vec<Argument<'a>>,
    ) -> Result<Box<dyn Instance + 'a>>;
}

/// A single module execution.
pub trait Instance {
    /// Run the entrypoint to completion.
    fn execute(&mut self) -> Result<()>;

    /// The output byte string, for map modules.
    fn output(&self) -> Option<Vec<u8>>;

    fn logs(&self) -> Vec<String>;

    fn logs_truncated(&self) -> bool {
        false
    }
}
