//! Embedded reason/act loop

mod engine;

pub use engine::{AgentEngine, EngineConfig, LoopOutcome};
