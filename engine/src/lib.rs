//! Procedural terrain generation runtime.
//!
//! A declarative node graph describes the terrain; this crate plans buffer
//! layout for it, then drives it to completion with a cooperative, pollable
//! scheduler. One generation request produces one [`tree::ContextTree`] whose
//! contexts hold all working state, so requests at different seeds, origins
//! and resolutions run against the same immutable graph concurrently.

pub mod asyncop;
pub mod builtin;
pub mod context;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod model;
pub mod operator;
pub mod plan;
pub mod pool;
pub mod schedule;
pub mod task;
pub mod tree;
pub mod util;

pub use engine::{Engine, EngineConfig, OutputValue};
pub use error::EngineError;
pub use model::{Graph, GraphNode, ParamMap, ParamValue, PortId, Vec2};
pub use plan::Resolution;
