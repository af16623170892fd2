use crate::cell::{CellMessage, PropertyCell};
use crate::snapshot::{CellSnapshot, ScalarValue};
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use smartgraph_core::{
    names, Busyable, ChangeEvent, ChangeListener, DescriptorTable, ListenerId, Modifiable,
    NestedGraph, Notifier, Result, RuntimeConfig, SmartGraphError, SourceId, Validatable, Value,
    DEFAULT_NOTIFICATION_CAPACITY,
};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Cached registry-level flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregates {
    pub is_valid: bool,
    pub is_self_valid: bool,
    pub is_modified: bool,
    pub is_self_modified: bool,
    pub is_busy: bool,
}

impl Default for Aggregates {
    fn default() -> Self {
        Self {
            is_valid: true,
            is_self_valid: true,
            is_modified: false,
            is_self_modified: false,
            is_busy: false,
        }
    }
}

impl Aggregates {
    fn changed(&self, fresh: &Aggregates) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.is_valid != fresh.is_valid {
            out.push(names::IS_VALID);
        }
        if self.is_self_valid != fresh.is_self_valid {
            out.push(names::IS_SELF_VALID);
        }
        if self.is_modified != fresh.is_modified {
            out.push(names::IS_MODIFIED);
        }
        if self.is_self_modified != fresh.is_self_modified {
            out.push(names::IS_SELF_MODIFIED);
        }
        if self.is_busy != fresh.is_busy {
            out.push(names::IS_BUSY);
        }
        out
    }
}

struct Slot {
    cell: Arc<PropertyCell>,
    listener: ListenerId,
}

#[derive(Default)]
struct Gate {
    paused: bool,
}

/// Owns the named cells of one business object and caches their aggregate
/// state.
///
/// Cells are materialized lazily from the descriptor table. Every cell
/// notification that can move an aggregate triggers a recompute under the
/// registry gate; only true edge transitions are re-raised. While paused,
/// cell traffic is dropped and the cache is frozen until
/// [`resume_all_actions`](Self::resume_all_actions).
pub struct PropertyRegistry {
    id: SourceId,
    descriptors: Arc<DescriptorTable>,
    cells: DashMap<String, Slot>,
    cache: ArcSwap<Aggregates>,
    gate: Mutex<Gate>,
    notifier: Notifier,
    capacity: usize,
    this: Weak<PropertyRegistry>,
}

impl std::fmt::Debug for PropertyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyRegistry")
            .field("type", &self.descriptors.type_name())
            .field("cells", &self.cells.len())
            .field("aggregates", &**self.cache.load())
            .finish()
    }
}

impl PropertyRegistry {
    pub fn new(descriptors: Arc<DescriptorTable>) -> Arc<Self> {
        Self::build(descriptors, DEFAULT_NOTIFICATION_CAPACITY)
    }

    pub fn with_config(descriptors: Arc<DescriptorTable>, config: &RuntimeConfig) -> Arc<Self> {
        Self::build(descriptors, config.notifications.capacity)
    }

    fn build(descriptors: Arc<DescriptorTable>, capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: SourceId::next(),
            descriptors,
            cells: DashMap::new(),
            cache: ArcSwap::from_pointee(Aggregates::default()),
            gate: Mutex::new(Gate::default()),
            notifier: Notifier::new(capacity),
            capacity,
            this: this.clone(),
        })
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn descriptors(&self) -> &Arc<DescriptorTable> {
        &self.descriptors
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // ---- cells --------------------------------------------------------------

    /// The cell for `name`, created on first access.
    pub fn get(&self, name: &str) -> Result<Arc<PropertyCell>> {
        if let Some(slot) = self.cells.get(name) {
            return Ok(slot.cell.clone());
        }
        let descriptor = self.descriptors.get(name).ok_or_else(|| {
            SmartGraphError::PropertyNotFound(format!(
                "{}.{}",
                self.descriptors.type_name(),
                name
            ))
        })?;

        match self.cells.entry(name.to_string()) {
            Entry::Occupied(o) => Ok(o.get().cell.clone()),
            Entry::Vacant(v) => {
                let cell = PropertyCell::with_capacity(descriptor, self.capacity);
                let listener = self.attach(&cell);
                v.insert(Slot {
                    cell: cell.clone(),
                    listener,
                });
                debug!(
                    registry = %self.id,
                    property = name,
                    "property cell materialized"
                );
                Ok(cell)
            }
        }
    }

    /// Whether the type declares `name`; does not materialize a cell.
    pub fn has_property(&self, name: &str) -> bool {
        self.descriptors.contains(name)
    }

    pub fn is_materialized(&self, name: &str) -> bool {
        self.cells.contains_key(name)
    }

    /// Point-in-time snapshot of the materialized cells.
    pub fn cells(&self) -> Vec<Arc<PropertyCell>> {
        self.cells.iter().map(|e| e.value().cell.clone()).collect()
    }

    pub fn property_names(&self) -> Vec<String> {
        self.cells.iter().map(|e| e.key().clone()).collect()
    }

    pub fn value(&self, name: &str) -> Result<Value> {
        Ok(self.get(name)?.value())
    }

    pub fn set_value(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.get(name)?.set_value(value)
    }

    pub fn load_value(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.get(name)?.load_value(value)
    }

    /// Every rule message across all cells, keyed by property name.
    pub fn rule_messages(&self) -> Vec<(String, CellMessage)> {
        self.cells()
            .into_iter()
            .flat_map(|cell| {
                let name = cell.name().to_string();
                cell.rule_messages()
                    .into_iter()
                    .map(move |m| (name.clone(), m))
            })
            .collect()
    }

    /// Names of the cells whose own value was changed since the last
    /// `mark_self_unmodified`.
    pub fn modified_properties(&self) -> impl Iterator<Item = String> {
        self.cells()
            .into_iter()
            .filter(|c| c.is_self_modified())
            .map(|c| c.name().to_string())
    }

    fn attach(&self, cell: &Arc<PropertyCell>) -> ListenerId {
        cell.notifier().add_listener(Arc::new(CellListener {
            registry: self.this.clone(),
            property: cell.name().to_string(),
            cell: Arc::downgrade(cell),
        }))
    }

    fn insert_cell(&self, cell: Arc<PropertyCell>) {
        let listener = self.attach(&cell);
        let name = cell.name().to_string();
        if let Some(old) = self.cells.insert(name, Slot { cell, listener }) {
            old.cell.notifier().remove_listener(old.listener);
        }
    }

    // ---- aggregates ---------------------------------------------------------

    pub fn aggregates(&self) -> Aggregates {
        **self.cache.load()
    }

    /// Fold every cell, including nested graphs held as values.
    pub fn compute(&self) -> Aggregates {
        let mut agg = Aggregates::default();
        for cell in self.cells() {
            agg.is_valid &= cell.is_valid();
            agg.is_self_valid &= cell.is_self_valid();
            agg.is_modified |= cell.is_modified();
            agg.is_self_modified |= cell.is_self_modified();
            agg.is_busy |= cell.is_busy();
        }
        agg
    }

    fn refresh_with(&self, gate: &Gate) -> Vec<&'static str> {
        if gate.paused {
            return Vec::new();
        }
        let fresh = self.compute();
        let previous = self.cache.swap(Arc::new(fresh));
        previous.changed(&fresh)
    }

    /// Recompute and raise a notification per aggregate that moved.
    pub fn refresh(&self) {
        let changed = {
            let gate = self.gate.lock();
            self.refresh_with(&gate)
        };
        self.raise(changed);
    }

    fn raise(&self, changed: Vec<&'static str>) {
        for name in changed {
            self.notifier.property_changed(name);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.gate.lock().paused
    }

    pub fn pause_all_actions(&self) {
        let mut gate = self.gate.lock();
        if !gate.paused {
            gate.paused = true;
            debug!(registry = %self.id, "registry paused");
        }
    }

    /// Leave paused mode with one recompute; aggregates that differ from the
    /// last raised value notify exactly once.
    pub fn resume_all_actions(&self) {
        let changed = {
            let mut gate = self.gate.lock();
            if !gate.paused {
                return;
            }
            gate.paused = false;
            debug!(registry = %self.id, "registry resumed");
            self.refresh_with(&gate)
        };
        self.raise(changed);
    }

    pub fn mark_self_unmodified(&self) {
        for cell in self.cells() {
            cell.mark_self_unmodified();
        }
        self.refresh();
    }

    pub fn clear_self_messages(&self) {
        for cell in self.cells() {
            cell.clear_self();
        }
        self.refresh();
    }

    pub fn clear_all_messages(&self) {
        for cell in self.cells() {
            cell.clear_all();
        }
        self.refresh();
    }

    // ---- serialization ------------------------------------------------------

    /// Scalar cells in their pure-data form. Cells holding nested graphs are
    /// left to the caller.
    pub fn snapshot(&self) -> Vec<CellSnapshot> {
        self.cells()
            .into_iter()
            .filter_map(|cell| {
                let value = ScalarValue::try_from(&cell.value()).ok()?;
                Some(CellSnapshot {
                    name: cell.name().to_string(),
                    value,
                    rule_messages: cell.rule_messages(),
                    is_read_only: cell.is_read_only(),
                })
            })
            .collect()
    }

    pub fn on_deserializing(&self) {
        self.pause_all_actions();
    }

    pub fn on_deserialized(&self) {
        self.resume_all_actions();
    }

    /// Rebuild cells from snapshots through the pure-data constructor. Outside
    /// a paused window the aggregates are recomputed once at the end.
    pub fn restore(&self, snapshots: Vec<CellSnapshot>) -> Result<()> {
        let restored = self.insert_snapshots(snapshots);
        // No-op while paused; `on_deserialized` recomputes then.
        self.refresh();
        restored
    }

    fn insert_snapshots(&self, snapshots: Vec<CellSnapshot>) -> Result<()> {
        for snap in snapshots {
            let descriptor = self.descriptors.get(&snap.name).ok_or_else(|| {
                SmartGraphError::PropertyNotFound(format!(
                    "{}.{}",
                    self.descriptors.type_name(),
                    snap.name
                ))
            })?;
            let cell = PropertyCell::from_parts(
                snap.name,
                descriptor.kind,
                snap.value.into(),
                snap.rule_messages,
                snap.is_read_only,
                self.capacity,
            )?;
            self.insert_cell(cell);
        }
        info!(
            registry = %self.id,
            cells = self.cells.len(),
            "registry restored from snapshot"
        );
        Ok(())
    }

    fn cell_property_changed(&self, property: &str, cell_property: &str) {
        if self.is_paused() {
            return;
        }
        if cell_property == names::VALUE {
            self.notifier.property_changed(property);
        } else {
            self.refresh();
        }
    }

    fn cell_chained_changed(&self, event: &ChangeEvent) {
        if self.is_paused() {
            return;
        }
        self.refresh();
        self.notifier.chained_changed(event);
    }
}

struct CellListener {
    registry: Weak<PropertyRegistry>,
    property: String,
    cell: Weak<PropertyCell>,
}

impl CellListener {
    fn target(&self) -> Option<Arc<PropertyRegistry>> {
        let registry = self.registry.upgrade()?;
        // Replaced cells stay silent.
        let current = registry
            .cells
            .get(&self.property)
            .map(|slot| Arc::downgrade(&slot.cell))?;
        Weak::ptr_eq(&current, &self.cell).then_some(registry)
    }
}

impl ChangeListener for CellListener {
    fn property_changed(&self, property: &str) {
        if let Some(registry) = self.target() {
            registry.cell_property_changed(&self.property, property);
        }
    }

    fn chained_changed(&self, event: &ChangeEvent) {
        if let Some(registry) = self.target() {
            registry.cell_chained_changed(event);
        }
    }
}

impl Validatable for PropertyRegistry {
    fn is_valid(&self) -> bool {
        self.cache.load().is_valid
    }

    fn is_self_valid(&self) -> bool {
        self.cache.load().is_self_valid
    }

    fn clear_self_messages(&self) {
        PropertyRegistry::clear_self_messages(self);
    }

    fn clear_all_messages(&self) {
        PropertyRegistry::clear_all_messages(self);
    }
}

impl Modifiable for PropertyRegistry {
    fn is_modified(&self) -> bool {
        self.cache.load().is_modified
    }

    fn is_self_modified(&self) -> bool {
        self.cache.load().is_self_modified
    }
}

impl Busyable for PropertyRegistry {
    fn is_busy(&self) -> bool {
        self.cache.load().is_busy
    }
}

impl NestedGraph for PropertyRegistry {
    fn type_name(&self) -> &str {
        self.descriptors.type_name()
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
}
