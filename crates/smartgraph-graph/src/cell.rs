use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smartgraph_core::{
    names, ChangeEvent, ChangeListener, ListenerId, NestedGraph, Notifier, PropertyDescriptor,
    Result, SmartGraphError, SourceId, Value, ValueKind, DEFAULT_NOTIFICATION_CAPACITY,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Identity of the rule that produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u32);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule:{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellMessage {
    pub rule_id: RuleId,
    pub message: String,
}

impl CellMessage {
    pub fn new(rule_id: RuleId, message: impl Into<String>) -> Self {
        Self {
            rule_id,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CellFlags {
    pub valid: bool,
    pub self_valid: bool,
    pub modified: bool,
    pub self_modified: bool,
    pub busy: bool,
}

impl CellFlags {
    fn changed(&self, after: &CellFlags) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.valid != after.valid {
            out.push(names::IS_VALID);
        }
        if self.self_valid != after.self_valid {
            out.push(names::IS_SELF_VALID);
        }
        if self.modified != after.modified {
            out.push(names::IS_MODIFIED);
        }
        if self.self_modified != after.self_modified {
            out.push(names::IS_SELF_MODIFIED);
        }
        if self.busy != after.busy {
            out.push(names::IS_BUSY);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Set,
    Quiet,
    Load,
}

struct ChildLink {
    child: Arc<dyn NestedGraph>,
    listener: ListenerId,
}

/// One named property slot.
///
/// A cell carries its value plus three independent state axes: busy marks,
/// rule messages and the self-modified flag. When the value is a nested graph
/// the cell also folds that graph's validity, modification and busy state
/// into its own and re-raises the graph's chained events under its name.
pub struct PropertyCell {
    id: SourceId,
    name: String,
    kind: ValueKind,
    is_read_only: bool,
    value: RwLock<Value>,
    busy_marks: DashSet<u64>,
    messages: Mutex<Vec<CellMessage>>,
    self_modified: AtomicBool,
    child: Mutex<Option<ChildLink>>,
    notifier: Notifier,
    this: Weak<PropertyCell>,
}

impl fmt::Debug for PropertyCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyCell")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &*self.value.read())
            .field("busy", &self.busy_marks.len())
            .field("messages", &self.messages.lock().len())
            .field("self_modified", &self.is_self_modified())
            .finish()
    }
}

impl PropertyCell {
    pub fn new(descriptor: &PropertyDescriptor) -> Arc<Self> {
        Self::with_capacity(descriptor, DEFAULT_NOTIFICATION_CAPACITY)
    }

    pub fn with_capacity(descriptor: &PropertyDescriptor, capacity: usize) -> Arc<Self> {
        Self::build(
            descriptor.name.clone(),
            descriptor.kind,
            descriptor.is_read_only,
            Value::Null,
            Vec::new(),
            capacity,
        )
    }

    /// Pure-data constructor used when reconstructing state. Raises nothing
    /// and leaves the cell unmodified.
    pub fn from_parts(
        name: impl Into<String>,
        kind: ValueKind,
        value: Value,
        messages: Vec<CellMessage>,
        is_read_only: bool,
        capacity: usize,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if !kind.accepts(&value) {
            return Err(SmartGraphError::TypeMismatch {
                property: name,
                expected: kind,
                actual: value.kind().unwrap_or(ValueKind::Any),
            });
        }
        let cell = Self::build(
            name,
            kind,
            is_read_only,
            Value::Null,
            messages,
            capacity,
        );
        cell.relink(&value);
        *cell.value.write() = value;
        Ok(cell)
    }

    fn build(
        name: String,
        kind: ValueKind,
        is_read_only: bool,
        value: Value,
        messages: Vec<CellMessage>,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: SourceId::next(),
            name,
            kind,
            is_read_only,
            value: RwLock::new(value),
            busy_marks: DashSet::new(),
            messages: Mutex::new(messages),
            self_modified: AtomicBool::new(false),
            child: Mutex::new(None),
            notifier: Notifier::new(capacity),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn value(&self) -> Value {
        self.value.read().clone()
    }

    fn child_graph(&self) -> Option<Arc<dyn NestedGraph>> {
        self.value.read().as_child().cloned()
    }

    // ---- writes -------------------------------------------------------------

    pub fn set_value(&self, value: impl Into<Value>) -> Result<()> {
        self.write(value.into(), WriteMode::Set)
    }

    /// Like `set_value`; `quietly` suppresses only the plain `Value`
    /// notification.
    pub fn set_quietly(&self, value: impl Into<Value>, quietly: bool) -> Result<()> {
        let mode = if quietly { WriteMode::Quiet } else { WriteMode::Set };
        self.write(value.into(), mode)
    }

    /// Hydration path: never marks the cell modified and raises neither the
    /// value notification nor a chained event. Read-only cells accept loads.
    pub fn load_value(&self, value: impl Into<Value>) -> Result<()> {
        self.write(value.into(), WriteMode::Load)
    }

    fn write(&self, value: Value, mode: WriteMode) -> Result<()> {
        if self.is_read_only && mode != WriteMode::Load {
            return Err(SmartGraphError::ReadOnly {
                property: self.name.clone(),
            });
        }
        if !self.kind.accepts(&value) {
            return Err(SmartGraphError::TypeMismatch {
                property: self.name.clone(),
                expected: self.kind,
                actual: value.kind().unwrap_or(ValueKind::Any),
            });
        }

        let before = self.flags();
        {
            let mut current = self.value.write();
            if current.is_same_as(&value) {
                return Ok(());
            }
            *current = value.clone();
        }
        self.relink(&value);

        // Child references only become modified through their own contents.
        let holds_graph = self.kind == ValueKind::Child || value.as_child().is_some();
        if mode != WriteMode::Load && !holds_graph {
            self.self_modified.store(true, Ordering::SeqCst);
        }

        if mode == WriteMode::Set {
            self.notifier.property_changed(names::VALUE);
        }
        self.raise_edges(before);
        if mode != WriteMode::Load {
            self.notifier
                .chained_changed(&ChangeEvent::new(self.name.clone(), self.id));
        }
        Ok(())
    }

    fn relink(&self, value: &Value) {
        let mut link = self.child.lock();
        if let Some(old) = link.take() {
            old.child.notifier().remove_listener(old.listener);
        }
        if let Value::Child(child) = value {
            let listener = Arc::new(ChildListener {
                cell: self.this.clone(),
            });
            let id = child.notifier().add_listener(listener);
            *link = Some(ChildLink {
                child: child.clone(),
                listener: id,
            });
        }
    }

    // ---- busy ---------------------------------------------------------------

    pub fn add_marked_busy(&self, id: u64) {
        let before = self.flags();
        if self.busy_marks.insert(id) {
            self.notifier.property_changed(names::MARKED_BUSY);
            self.notifier.property_changed(names::IS_BUSY);
            self.raise_edges_except(before, names::IS_BUSY);
        }
    }

    pub fn remove_marked_busy(&self, id: u64) {
        let before = self.flags();
        if self.busy_marks.remove(&id).is_some() {
            self.notifier.property_changed(names::MARKED_BUSY);
            self.notifier.property_changed(names::IS_BUSY);
            self.raise_edges_except(before, names::IS_BUSY);
        }
    }

    /// Point-in-time copy of the busy markers.
    pub fn marked_busy(&self) -> Vec<u64> {
        self.busy_marks.iter().map(|id| *id).collect()
    }

    pub fn is_self_busy(&self) -> bool {
        !self.busy_marks.is_empty()
    }

    pub fn is_busy(&self) -> bool {
        self.is_self_busy()
            || self
                .child_graph()
                .and_then(|c| c.as_busyable().map(|b| b.is_busy()))
                .unwrap_or(false)
    }

    // ---- validity -----------------------------------------------------------

    pub fn rule_messages(&self) -> Vec<CellMessage> {
        self.messages.lock().clone()
    }

    pub fn is_self_valid(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.is_self_valid()
            && self
                .child_graph()
                .and_then(|c| c.as_validatable().map(|v| v.is_valid()))
                .unwrap_or(true)
    }

    /// Replace every message of `rule_id`. An empty list clears the rule.
    pub fn set_messages_for_rule(&self, rule_id: RuleId, messages: Vec<String>) {
        self.mutate_messages(|list| {
            list.retain(|m| m.rule_id != rule_id);
            list.extend(messages.into_iter().map(|m| CellMessage::new(rule_id, m)));
        });
    }

    pub fn clear_messages_for_rule(&self, rule_id: RuleId) {
        self.mutate_messages(|list| list.retain(|m| m.rule_id != rule_id));
    }

    pub fn clear_self(&self) {
        self.mutate_messages(Vec::clear);
    }

    /// Clear own messages and, transitively, those of a nested graph.
    pub fn clear_all(&self) {
        self.clear_self();
        if let Some(child) = self.child_graph() {
            if let Some(v) = child.as_validatable() {
                v.clear_all_messages();
            }
        }
    }

    fn mutate_messages(&self, f: impl FnOnce(&mut Vec<CellMessage>)) {
        let before = self.flags();
        let changed = {
            let mut list = self.messages.lock();
            let previous = list.clone();
            f(&mut list);
            *list != previous
        };
        if changed {
            self.notifier.property_changed(names::RULE_MESSAGES);
            self.raise_edges(before);
        }
    }

    // ---- modification -------------------------------------------------------

    pub fn is_self_modified(&self) -> bool {
        self.self_modified.load(Ordering::SeqCst)
    }

    pub fn is_modified(&self) -> bool {
        self.is_self_modified()
            || self
                .child_graph()
                .and_then(|c| c.as_modifiable().map(|m| m.is_modified()))
                .unwrap_or(false)
    }

    pub fn mark_self_unmodified(&self) {
        let before = self.flags();
        if self.self_modified.swap(false, Ordering::SeqCst) {
            self.raise_edges(before);
        }
    }

    // ---- notifications ------------------------------------------------------

    pub(crate) fn flags(&self) -> CellFlags {
        CellFlags {
            valid: self.is_valid(),
            self_valid: self.is_self_valid(),
            modified: self.is_modified(),
            self_modified: self.is_self_modified(),
            busy: self.is_busy(),
        }
    }

    fn raise_edges(&self, before: CellFlags) {
        for name in before.changed(&self.flags()) {
            self.notifier.property_changed(name);
        }
    }

    fn raise_edges_except(&self, before: CellFlags, skip: &str) {
        for name in before.changed(&self.flags()) {
            if name != skip {
                self.notifier.property_changed(name);
            }
        }
    }

    fn child_property_changed(&self, property: &str) {
        match property {
            names::IS_VALID | names::IS_MODIFIED | names::IS_BUSY => {
                self.notifier.property_changed(property)
            }
            _ => {}
        }
    }

    fn child_chained_changed(&self, event: &ChangeEvent) {
        let wrapped = ChangeEvent::wrap(self.name.clone(), self.id, event.clone());
        self.notifier.chained_changed(&wrapped);
    }
}

impl Drop for PropertyCell {
    fn drop(&mut self) {
        if let Some(link) = self.child.get_mut().take() {
            link.child.notifier().remove_listener(link.listener);
        }
    }
}

/// Routes a nested graph's notifications back to the holding cell. Holds the
/// cell weakly so a child never keeps its parent alive.
struct ChildListener {
    cell: Weak<PropertyCell>,
}

impl ChangeListener for ChildListener {
    fn property_changed(&self, property: &str) {
        if let Some(cell) = self.cell.upgrade() {
            cell.child_property_changed(property);
        }
    }

    fn chained_changed(&self, event: &ChangeEvent) {
        if let Some(cell) = self.cell.upgrade() {
            cell.child_chained_changed(event);
        }
    }
}
