//! Shared fixtures: a deterministic in-process module host and a scripted
//! block source.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use blockflow_core::block::Range;
use blockflow_core::source::{BlockSource, SourcedBlock};
use blockflow_core::wasm::{Argument, Instance, ModuleRuntime};
use blockflow_types::{Block, Clock, Cursor, Input, Module, ModuleKind, Step, StoreMode, UpdatePolicy};

use blockflow::service::BlockSourceFactory;

pub const BLOCK_TYPE: &str = "test.Block";

pub fn block_at(num: u64) -> Block {
    Block {
        num,
        id: format!("b{}", num),
        timestamp: 1_700_000_000_000 + num as i64,
        payload: num.to_string().into_bytes(),
    }
}

pub fn delivery(num: u64, step: Step) -> SourcedBlock {
    let block = block_at(num);
    let cursor = Cursor::for_block(&block.as_block_ref());
    SourcedBlock { block, cursor, step }
}

/// Emits `[start, end]` inclusive as irreversible new blocks, so stop blocks
/// always arrive.
pub struct RangeSourceFactory;

impl BlockSourceFactory for RangeSourceFactory {
    fn source_for(&self, range: Range) -> Box<dyn BlockSource> {
        let deliveries = (range.start_block..=range.exclusive_end_block)
            .map(|num| delivery(num, Step::NEW | Step::IRREVERSIBLE))
            .collect();
        Box::new(ScriptedSource::new(deliveries))
    }
}

pub struct ScriptedSource {
    deliveries: std::vec::IntoIter<SourcedBlock>,
}

impl ScriptedSource {
    pub fn new(deliveries: Vec<SourcedBlock>) -> Self {
        ScriptedSource {
            deliveries: deliveries.into_iter(),
        }
    }
}

#[async_trait]
impl BlockSource for ScriptedSource {
    async fn next_block(
        &mut self,
    ) -> Result<Option<SourcedBlock>, blockflow_core::error::Error> {
        Ok(self.deliveries.next())
    }
}

/// Module set: a map extracting the block number, a store counting blocks,
/// and a store summing block numbers while reading the counter.
pub fn test_modules() -> Vec<Module> {
    vec![
        Module {
            name: "block_meta".to_string(),
            initial_block: 0,
            kind: ModuleKind::Map {
                output_type: "proto:test.BlockMeta".to_string(),
            },
            inputs: vec![Input::Source {
                kind: BLOCK_TYPE.to_string(),
            }],
            binary_entrypoint: "block_meta".to_string(),
        },
        Module {
            name: "block_count".to_string(),
            initial_block: 0,
            kind: ModuleKind::Store {
                value_type: "int64".to_string(),
                update_policy: UpdatePolicy::Add,
            },
            inputs: vec![Input::Map {
                module_name: "block_meta".to_string(),
            }],
            binary_entrypoint: "block_count".to_string(),
        },
        Module {
            name: "running_total".to_string(),
            initial_block: 0,
            kind: ModuleKind::Store {
                value_type: "int64".to_string(),
                update_policy: UpdatePolicy::Add,
            },
            inputs: vec![
                Input::Map {
                    module_name: "block_meta".to_string(),
                },
                Input::Store {
                    module_name: "block_count".to_string(),
                    mode: StoreMode::Get,
                },
            ],
            binary_entrypoint: "running_total".to_string(),
        },
    ]
}

type Handler =
    Arc<dyn Fn(&Clock, &mut Vec<Argument<'_>>) -> Result<Option<Vec<u8>>> + Send + Sync>;

#[derive(Default)]
pub struct TestRuntime {
    handlers: HashMap<String, Handler>,
}

impl TestRuntime {
    pub fn with_test_modules() -> Arc<Self> {
        let mut runtime = TestRuntime::default();
        runtime.register("block_meta", |_clock, arguments| {
            let Argument::Block { value, .. } = &arguments[0] else {
                return Err(anyhow!("expected block input"));
            };
            Ok(Some(value.to_vec()))
        });
        runtime.register("block_count", |_clock, arguments| {
            for argument in arguments.iter_mut() {
                if let Argument::StoreWriter { store, .. } = argument {
                    store.add(0, "blocks", b"1")?;
                }
            }
            Ok(None)
        });
        runtime.register("running_total", |_clock, arguments| {
            let mut number: Option<i64> = None;
            let mut counter_present = false;
            for argument in arguments.iter() {
                match argument {
                    Argument::MapOutput { value, .. } => {
                        number = Some(std::str::from_utf8(value)?.parse()?);
                    }
                    Argument::StoreReader { store, .. } => {
                        counter_present = store.get_last("blocks").is_some();
                    }
                    _ => {}
                }
            }
            let number = number.ok_or_else(|| anyhow!("missing map input"))?;
            if !counter_present {
                return Err(anyhow!("counter store not visible"));
            }
            for argument in arguments.iter_mut() {
                if let Argument::StoreWriter { store, .. } = argument {
                    store.add(1, "sum", number.to_string().as_bytes())?;
                }
            }
            Ok(None)
        });
        Arc::new(runtime)
    }

    pub fn register(
        &mut self,
        entrypoint: &str,
        handler: impl Fn(&Clock, &mut Vec<Argument<'_>>) -> Result<Option<Vec<u8>>>
            + Send
            + Sync
            + 'static,
    ) {
        self.handlers
            .insert(entrypoint.to_string(), Arc::new(handler));
    }
}

struct TestInstance<'a> {
    clock: Clock,
    handler: Handler,
    arguments: Vec<Argument<'a>>,
    output: Option<Vec<u8>>,
}

impl ModuleRuntime for TestRuntime {
    fn new_instance<'a>(
        &self,
        clock: &Clock,
        entrypoint: &str,
        arguments: Vec<Argument<'a>>,
    ) -> Result<Box<dyn Instance + 'a>> {
        let handler = self
            .handlers
            .get(entrypoint)
            .cloned()
            .ok_or_else(|| anyhow!("unknown entrypoint {:?}", entrypoint))?;
        Ok(Box::new(TestInstance {
            clock: clock.clone(),
            handler,
            arguments,
            output: None,
        }))
    }
}

impl Instance for TestInstance<'_> {
    fn execute(&mut self) -> Result<()> {
        self.output = (self.handler)(&self.clock, &mut self.arguments)?;
        Ok(())
    }

    fn output(&self) -> Option<Vec<u8>> {
        self.output.clone()
    }

    fn logs(&self) -> Vec<String> {
        Vec::new()
    }
}
