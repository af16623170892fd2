use crate::entity::Entity;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use smartgraph_core::{Result, SmartGraphError};
use std::future::Future;
use std::sync::Arc;

/// A validation message a rule wants recorded against a local property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMessage {
    pub property: String,
    pub message: String,
}

impl RuleMessage {
    pub fn new(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            message: message.into(),
        }
    }
}

/// What a rule run produces. An empty list means "valid": every message the
/// rule previously recorded is cleared.
pub type RuleOutcome = anyhow::Result<Vec<RuleMessage>>;

/// A rule that runs inline on the mutating thread.
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    /// Dotted property paths that activate the rule.
    fn trigger_properties(&self) -> Vec<String>;

    /// Lower runs first among rules triggered by the same change.
    fn order(&self) -> i32 {
        0
    }

    fn execute(&self, entity: &Entity) -> RuleOutcome;
}

/// A rule tracked by the entity's task sequencer.
#[async_trait]
pub trait AsyncRule: Send + Sync {
    fn name(&self) -> &str;

    fn trigger_properties(&self) -> Vec<String>;

    fn order(&self) -> i32 {
        0
    }

    async fn execute(&self, entity: Arc<Entity>) -> RuleOutcome;
}

#[derive(Clone)]
pub enum RuleKind {
    Sync(Arc<dyn Rule>),
    Async(Arc<dyn AsyncRule>),
}

impl RuleKind {
    pub fn sync(rule: impl Rule + 'static) -> Self {
        Self::Sync(Arc::new(rule))
    }

    pub fn asynchronous(rule: impl AsyncRule + 'static) -> Self {
        Self::Async(Arc::new(rule))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Sync(r) => r.name(),
            Self::Async(r) => r.name(),
        }
    }

    pub fn trigger_properties(&self) -> Vec<String> {
        match self {
            Self::Sync(r) => r.trigger_properties(),
            Self::Async(r) => r.trigger_properties(),
        }
    }

    pub fn order(&self) -> i32 {
        match self {
            Self::Sync(r) => r.order(),
            Self::Async(r) => r.order(),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl std::fmt::Debug for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleKind")
            .field("name", &self.name())
            .field("async", &self.is_async())
            .field("order", &self.order())
            .finish()
    }
}

type SyncHandler = Arc<dyn Fn(&Entity) -> RuleOutcome + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Arc<Entity>) -> BoxFuture<'static, RuleOutcome> + Send + Sync>;

enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Builds closure-backed rules.
///
/// ```ignore
/// let rule = RuleBuilder::new("name-required")
///     .trigger("Name")
///     .handler(|entity| { /* ... */ Ok(vec![]) })
///     .build()?;
/// ```
pub struct RuleBuilder {
    name: String,
    triggers: Vec<String>,
    order: i32,
    handlers: Vec<Handler>,
}

impl RuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            order: 0,
            handlers: Vec::new(),
        }
    }

    pub fn trigger(mut self, path: impl Into<String>) -> Self {
        self.triggers.push(path.into());
        self
    }

    pub fn triggers<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Entity) -> RuleOutcome + Send + Sync + 'static,
    {
        self.handlers.push(Handler::Sync(Arc::new(f)));
        self
    }

    pub fn async_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Entity>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RuleOutcome> + Send + 'static,
    {
        self.handlers
            .push(Handler::Async(Arc::new(move |entity| f(entity).boxed())));
        self
    }

    /// Exactly one handler must be supplied.
    pub fn build(mut self) -> Result<RuleKind> {
        if self.handlers.len() != 1 {
            return Err(SmartGraphError::InvalidRuleType(format!(
                "rule '{}' needs exactly one handler, found {}",
                self.name,
                self.handlers.len()
            )));
        }
        let handler = self.handlers.remove(0);
        let meta = FnMeta {
            name: self.name,
            triggers: self.triggers,
            order: self.order,
        };
        Ok(match handler {
            Handler::Sync(f) => RuleKind::Sync(Arc::new(FnRule { meta, f })),
            Handler::Async(f) => RuleKind::Async(Arc::new(AsyncFnRule { meta, f })),
        })
    }
}

struct FnMeta {
    name: String,
    triggers: Vec<String>,
    order: i32,
}

struct FnRule {
    meta: FnMeta,
    f: SyncHandler,
}

impl Rule for FnRule {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn trigger_properties(&self) -> Vec<String> {
        self.meta.triggers.clone()
    }

    fn order(&self) -> i32 {
        self.meta.order
    }

    fn execute(&self, entity: &Entity) -> RuleOutcome {
        (self.f)(entity)
    }
}

struct AsyncFnRule {
    meta: FnMeta,
    f: AsyncHandler,
}

#[async_trait]
impl AsyncRule for AsyncFnRule {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn trigger_properties(&self) -> Vec<String> {
        self.meta.triggers.clone()
    }

    fn order(&self) -> i32 {
        self.meta.order
    }

    async fn execute(&self, entity: Arc<Entity>) -> RuleOutcome {
        (self.f)(entity).await
    }
}
