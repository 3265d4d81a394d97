//! blockflow: a parallelizable block-data-processing runtime.
//!
//! Operators declare a DAG of WASM modules (`map` and `store`) in a package
//! manifest; the runtime streams chain blocks through the DAG, caches module
//! outputs, checkpoints store state at fixed intervals, and backfills
//! historical ranges by computing partial store segments in parallel and
//! squashing them in block order.
//!
//! The heavy lifting lives in the workspace crates
//! (`blockflow-core`, `blockflow-dstore`, `blockflow-types`); this crate adds
//! the service glue (request wiring, in-process backfill workers) and the
//! `blockflow` CLI.

pub mod args;
pub mod commands;
pub mod service;
