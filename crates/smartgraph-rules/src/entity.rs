use crate::engine::{RegisteredRule, RuleEngine};
use crate::rule::{AsyncRule, Rule, RuleKind};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use smartgraph_concurrent::{TaskSequencer, WaitError};
use smartgraph_core::{
    names, AggregateError, Busyable, ChangeEvent, ChangeListener, DescriptorTable, ListenerId,
    Modifiable, NestedGraph, Notifier, Result, RuntimeConfig, TaskFault, Validatable, Value,
};
use smartgraph_graph::{CellMessage, CellSnapshot, PropertyCell, PropertyRegistry, RuleId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A business object: a property registry whose changes drive a rule engine,
/// with asynchronous rule work tracked by a task sequencer.
///
/// Entities are always handled through `Arc`; asynchronous rules receive a
/// strong handle for the duration of their run. An entity can be stored as a
/// `Child` value of another registry or entity, in which case its chained
/// events bubble to the holder and its validity, modification and busy state
/// fold into the holder's aggregates.
pub struct Entity {
    registry: Arc<PropertyRegistry>,
    registry_listener: ListenerId,
    engine: RuleEngine,
    sequencer: TaskSequencer,
    notifier: Notifier,
    busy: Mutex<bool>,
    busy_marks: AtomicU64,
    sync_faults: Mutex<Vec<TaskFault>>,
    trace_execution: bool,
    this: Weak<Entity>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("type", &self.registry.descriptors().type_name())
            .field("rules", &self.engine.len())
            .field("busy", &*self.busy.lock())
            .finish()
    }
}

impl Entity {
    pub fn new(descriptors: Arc<DescriptorTable>) -> Arc<Self> {
        Self::with_config(descriptors, &RuntimeConfig::default())
    }

    pub fn with_config(descriptors: Arc<DescriptorTable>, config: &RuntimeConfig) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Entity>| {
            let registry = PropertyRegistry::with_config(descriptors, config);
            let registry_listener = registry
                .notifier()
                .add_listener(Arc::new(RegistryListener {
                    entity: this.clone(),
                }));

            let sequencer = TaskSequencer::new();
            let weak = this.clone();
            sequencer.on_generation_complete(move || {
                if let Some(entity) = weak.upgrade() {
                    entity.refresh_busy();
                }
                future::ready(Ok(()))
            });

            Self {
                registry,
                registry_listener,
                engine: RuleEngine::new(),
                sequencer,
                notifier: Notifier::new(config.notifications.capacity),
                busy: Mutex::new(false),
                busy_marks: AtomicU64::new(1),
                sync_faults: Mutex::new(Vec::new()),
                trace_execution: config.rules.trace_execution,
                this: this.clone(),
            }
        })
    }

    pub fn registry(&self) -> &Arc<PropertyRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    pub fn sequencer(&self) -> &TaskSequencer {
        &self.sequencer
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // ---- rules --------------------------------------------------------------

    pub fn add_rule(&self, rule: RuleKind) -> Result<RuleId> {
        self.engine.register(self.registry.descriptors(), rule)
    }

    pub fn add_sync_rule(&self, rule: impl Rule + 'static) -> Result<RuleId> {
        self.add_rule(RuleKind::sync(rule))
    }

    pub fn add_async_rule(&self, rule: impl AsyncRule + 'static) -> Result<RuleId> {
        self.add_rule(RuleKind::asynchronous(rule))
    }

    /// Run the rules triggered by `path` as if that property had changed.
    /// Returns the number of rules started.
    pub fn run_rules_for(&self, path: &str) -> usize {
        let rules = self.engine.triggered(path);
        let count = rules.len();
        for rule in rules {
            self.execute(rule, path);
        }
        count
    }

    /// Run every registered rule once, in rule order.
    pub fn run_all_rules(&self) -> usize {
        let rules = self.engine.all();
        let count = rules.len();
        for rule in rules {
            self.execute(rule, "*");
        }
        count
    }

    fn execute(&self, rule: Arc<RegisteredRule>, path: &str) {
        if self.trace_execution {
            debug!(
                entity = self.registry.descriptors().type_name(),
                rule = rule.name(),
                path,
                "running rule"
            );
        }
        match rule.kind().clone() {
            RuleKind::Sync(handler) => {
                let outcome = handler.execute(self).and_then(|messages| {
                    self.engine
                        .apply(&self.registry, &rule, messages)
                        .map_err(anyhow::Error::from)
                });
                if let Err(err) = outcome {
                    self.record_faults(rule.name(), TaskFault::flatten(err));
                }
            }
            RuleKind::Async(handler) => self.spawn_async(rule, handler),
        }
    }

    fn spawn_async(&self, rule: Arc<RegisteredRule>, handler: Arc<dyn AsyncRule>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let busy = BusyMark::acquire(
            self.busy_marks.fetch_add(1, Ordering::SeqCst),
            rule.local_triggers()
                .filter_map(|p| self.registry.get(p).ok())
                .collect(),
        );

        let name = rule.name().to_string();
        // Marks are released when `busy` drops, even if the future never runs.
        let work = async move {
            let outcome = handler.execute(this.clone()).await;
            drop(busy);
            let messages = outcome?;
            this.engine.apply(&this.registry, &rule, messages)?;
            if this.trace_execution {
                debug!(rule = rule.name(), "async rule finished");
            }
            Ok::<(), anyhow::Error>(())
        };

        if let Err(faults) = self.sequencer.add_future(work) {
            self.record_faults(&name, faults.into_faults());
        }
        self.refresh_busy();
    }

    fn record_faults(&self, rule: &str, faults: Vec<TaskFault>) {
        for fault in &faults {
            warn!(rule, error = %fault, "rule faulted");
        }
        self.sync_faults.lock().extend(faults);
    }

    /// Await the entity's rule cascade and that of every nested graph.
    ///
    /// Faults from asynchronous rules are reported by the generation that ran
    /// them; faults from synchronous rules are held by the entity until the
    /// next call. Both are returned together, once.
    pub async fn wait_for_tasks(&self) -> std::result::Result<(), AggregateError> {
        let mut faults = Vec::new();
        loop {
            if let Err(err) = self.sequencer.all_done().await {
                faults.extend(err.into_faults());
            }
            for child in self.child_graphs() {
                if let Err(err) = child.wait_for_tasks().await {
                    faults.extend(err.into_faults());
                }
            }
            if !self.sequencer.is_running() {
                break;
            }
        }
        faults.extend(self.sync_faults.lock().drain(..));
        if faults.is_empty() {
            Ok(())
        } else {
            Err(AggregateError::new(faults))
        }
    }

    /// Like [`wait_for_tasks`](Self::wait_for_tasks) but gives up when
    /// `token` fires. Running rules are unaffected.
    pub async fn wait_for_tasks_with(
        &self,
        token: &CancellationToken,
    ) -> std::result::Result<(), WaitError> {
        if token.is_cancelled() {
            return Err(WaitError::Canceled);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(WaitError::Canceled),
            result = self.wait_for_tasks() => result.map_err(WaitError::Faulted),
        }
    }

    fn child_graphs(&self) -> Vec<Arc<dyn NestedGraph>> {
        self.registry
            .cells()
            .into_iter()
            .filter_map(|cell| cell.value().as_child().cloned())
            .collect()
    }

    // ---- properties ---------------------------------------------------------

    pub fn cell(&self, name: &str) -> Result<Arc<PropertyCell>> {
        self.registry.get(name)
    }

    pub fn get(&self, name: &str) -> Result<Value> {
        self.registry.value(name)
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.registry.set_value(name, value)
    }

    /// Hydrate a property without marking it modified or running rules.
    pub fn load(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.registry.load_value(name, value)
    }

    pub fn rule_messages(&self) -> Vec<(String, CellMessage)> {
        self.registry.rule_messages()
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock()
    }

    pub fn mark_self_unmodified(&self) {
        self.registry.mark_self_unmodified();
    }

    pub fn clear_all_messages(&self) {
        self.engine.forget_targets();
        self.registry.clear_all_messages();
    }

    pub fn pause_all_actions(&self) {
        self.registry.pause_all_actions();
    }

    pub fn resume_all_actions(&self) {
        self.registry.resume_all_actions();
    }

    pub fn snapshot(&self) -> Vec<CellSnapshot> {
        self.registry.snapshot()
    }

    /// Rebuild scalar cells from `snapshots` without running rules, then
    /// recompute aggregates once.
    pub fn restore(&self, snapshots: Vec<CellSnapshot>) -> Result<()> {
        self.registry.on_deserializing();
        let restored = self.registry.restore(snapshots);
        self.registry.on_deserialized();
        restored
    }

    fn refresh_busy(&self) {
        let changed = {
            let mut busy = self.busy.lock();
            let now = self.registry.aggregates().is_busy || self.sequencer.is_running();
            std::mem::replace(&mut *busy, now) != now
        };
        if changed {
            self.notifier.property_changed(names::IS_BUSY);
        }
    }

    fn registry_property_changed(&self, property: &str) {
        if property == names::IS_BUSY {
            self.refresh_busy();
        } else {
            self.notifier.property_changed(property);
        }
    }

    fn registry_chained_changed(&self, event: &ChangeEvent) {
        self.run_rules_for(&event.full_path());
        self.notifier.chained_changed(event);
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        self.registry
            .notifier()
            .remove_listener(self.registry_listener);
    }
}

/// Busy markers an async rule holds on its local trigger cells.
struct BusyMark {
    id: u64,
    cells: Vec<Arc<PropertyCell>>,
}

impl BusyMark {
    fn acquire(id: u64, cells: Vec<Arc<PropertyCell>>) -> Self {
        for cell in &cells {
            cell.add_marked_busy(id);
        }
        Self { id, cells }
    }
}

impl Drop for BusyMark {
    fn drop(&mut self) {
        for cell in &self.cells {
            cell.remove_marked_busy(self.id);
        }
    }
}

struct RegistryListener {
    entity: Weak<Entity>,
}

impl ChangeListener for RegistryListener {
    fn property_changed(&self, property: &str) {
        if let Some(entity) = self.entity.upgrade() {
            entity.registry_property_changed(property);
        }
    }

    fn chained_changed(&self, event: &ChangeEvent) {
        if let Some(entity) = self.entity.upgrade() {
            entity.registry_chained_changed(event);
        }
    }
}

impl Validatable for Entity {
    fn is_valid(&self) -> bool {
        self.registry.aggregates().is_valid
    }

    fn is_self_valid(&self) -> bool {
        self.registry.aggregates().is_self_valid
    }

    fn clear_self_messages(&self) {
        self.registry.clear_self_messages();
    }

    fn clear_all_messages(&self) {
        Entity::clear_all_messages(self);
    }
}

impl Modifiable for Entity {
    fn is_modified(&self) -> bool {
        self.registry.aggregates().is_modified
    }

    fn is_self_modified(&self) -> bool {
        self.registry.aggregates().is_self_modified
    }
}

impl Busyable for Entity {
    fn is_busy(&self) -> bool {
        Entity::is_busy(self)
    }
}

impl NestedGraph for Entity {
    fn type_name(&self) -> &str {
        self.registry.descriptors().type_name()
    }

    fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn as_validatable(&self) -> Option<&dyn Validatable> {
        Some(self)
    }

    fn as_modifiable(&self) -> Option<&dyn Modifiable> {
        Some(self)
    }

    fn as_busyable(&self) -> Option<&dyn Busyable> {
        Some(self)
    }

    fn wait_for_tasks(&self) -> BoxFuture<'static, std::result::Result<(), AggregateError>> {
        match self.this.upgrade() {
            Some(this) => async move { this.wait_for_tasks().await }.boxed(),
            None => future::ready(Ok(())).boxed(),
        }
    }
}
