use crate::{AggregateError, Notifier};
use futures::future::{self, BoxFuture, FutureExt};

/// Anything that carries rule-derived validity.
pub trait Validatable {
    fn is_valid(&self) -> bool;
    fn is_self_valid(&self) -> bool;
    fn clear_self_messages(&self);
    fn clear_all_messages(&self);
}

/// Anything that tracks unsaved modifications.
pub trait Modifiable {
    fn is_modified(&self) -> bool;
    fn is_self_modified(&self) -> bool;
}

pub trait Busyable {
    fn is_busy(&self) -> bool;
}

/// A value that is itself an object graph.
///
/// Capabilities are discovered through the `as_*` accessors rather than by
/// inspecting the concrete type; a graph that does not validate simply
/// returns `None` from `as_validatable`.
pub trait NestedGraph: Send + Sync {
    fn type_name(&self) -> &str;

    /// Where the graph publishes its own notifications. Holders subscribe here
    /// to bubble the graph's chained events upward.
    fn notifier(&self) -> &Notifier;

    fn as_validatable(&self) -> Option<&dyn Validatable> {
        None
    }

    fn as_modifiable(&self) -> Option<&dyn Modifiable> {
        None
    }

    fn as_busyable(&self) -> Option<&dyn Busyable> {
        None
    }

    /// Resolves once the graph's own asynchronous work has drained.
    fn wait_for_tasks(&self) -> BoxFuture<'static, Result<(), AggregateError>> {
        future::ready(Ok(())).boxed()
    }
}
