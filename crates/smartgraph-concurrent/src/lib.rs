//! Concurrency primitives for SmartGraph
//!
//! - `task`: completable task handles with continuations
//! - `sequencer`: groups in-flight tasks into awaitable generations

pub mod sequencer;
pub mod task;

pub use sequencer::*;
pub use task::*;
