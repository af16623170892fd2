//! Business rules for SmartGraph objects.
//!
//! - `rule`: synchronous and asynchronous rule traits plus a closure builder
//! - `engine`: trigger-path index, ordering and message write-back
//! - `entity`: a registry, engine and task sequencer glued into one object
//!
//! Synchronous rules run inline on the thread that changed a property.
//! Asynchronous rules are spawned onto the tokio runtime and tracked by the
//! entity's [`TaskSequencer`](smartgraph_concurrent::TaskSequencer); await
//! [`Entity::wait_for_tasks`] to observe their faults.

pub mod engine;
pub mod entity;
pub mod rule;

pub use engine::*;
pub use entity::*;
pub use rule::*;
