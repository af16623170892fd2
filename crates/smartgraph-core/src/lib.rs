//! Core types shared by every SmartGraph crate: values and their declared
//! kinds, capability traits for nested graphs, chained change events, the
//! notification fan-out, descriptor tables, configuration and error kinds.

pub mod change;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod fault;
pub mod notify;
pub mod telemetry;
pub mod traits;
pub mod value;

pub use change::*;
pub use config::*;
pub use descriptor::*;
pub use error::*;
pub use fault::*;
pub use notify::*;
pub use traits::*;
pub use value::*;
