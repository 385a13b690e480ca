//! Real-time flow-graph engine for software-defined radio signal processing.
//!
//! A user declares a directed acyclic flow graph of processing blocks
//! (sources, transforms, sinks), connects typed ports between them, and
//! runs it; the engine propagates typed sample buffers from sources
//! through transforms to sinks, exploiting multi-core parallelism.
//!
//! Module map, mirroring the components named in the engine's own design
//! notes:
//!
//! - [`types`] -- primitive sample types and the typed `Vector` buffer (C1).
//! - [`block`] -- the `Block` trait, type signatures, and type matching (C2).
//! - [`graph`] -- block/composite registries, graph descriptions, composite
//!   flattening, and type/rate inference (C3).
//! - [`pipe`] -- typed inter-worker byte pipes with back-pressure (C4).
//! - [`scheduler`] -- one worker per block, the read/process/write loop (C5).
//! - [`control`] -- `Context`, the start/status/wait/stop state machine (C6).
//! - [`blocks`] -- fixture source/sink blocks exercising the model above.
//! - [`config`] -- runtime configuration knobs.
//! - [`logging`] -- structured logging shared across worker threads.
//! - [`errors`] -- the engine's error taxonomy.

pub mod block;
pub mod blocks;
pub mod config;
pub mod control;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod pipe;
pub mod scheduler;
pub mod types;

pub use block::{Block, PortIn, PortOut, TypeMatcher, TypeProducer, TypeSignature};
pub use config::EngineConfig;
pub use control::{Context, State};
pub use errors::{EngineError, ErrorKind, Result};
pub use graph::{BlockFactory, BlockRegistry, CompositeDesc, CompositeRegistry, EdgeDesc, GraphDesc, NodeDesc};
pub use logging::{LogConfig, LogLevel, SignalLogger};
pub use types::{SampleType, Vector};
