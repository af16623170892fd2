//! Property cells and the registry that owns them.
//!
//! - `cell`: one named value with busy, validity and modification state
//! - `registry`: lazily materialized cells with cached aggregates and pause/resume
//! - `snapshot`: pure-data cell form for serialization layers

pub mod cell;
pub mod registry;
pub mod snapshot;

pub use cell::*;
pub use registry::*;
pub use snapshot::*;
