use crate::rule::{RuleKind, RuleMessage};
use parking_lot::{Mutex, RwLock};
use smartgraph_core::{DescriptorTable, Result, SmartGraphError, ValueKind};
use smartgraph_graph::{PropertyRegistry, RuleId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A rule as stored by the engine.
#[derive(Debug)]
pub struct RegisteredRule {
    id: RuleId,
    kind: RuleKind,
    triggers: Vec<String>,
}

impl RegisteredRule {
    pub fn id(&self) -> RuleId {
        self.id
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        self.kind.name()
    }

    pub fn order(&self) -> i32 {
        self.kind.order()
    }

    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    /// Triggers naming a property of the owning object itself.
    pub fn local_triggers(&self) -> impl Iterator<Item = &str> {
        self.triggers
            .iter()
            .map(String::as_str)
            .filter(|t| !t.contains('.'))
    }

    fn sort_key(&self) -> (i32, u32) {
        (self.order(), self.id.0)
    }
}

/// Maps trigger paths to rules and writes rule output back into cells.
///
/// Trigger resolution is an exact match on the dotted path of the incoming
/// change; `"Child.Field"` fires only for `Field` changes bubbled through the
/// `Child` property.
#[derive(Default)]
pub struct RuleEngine {
    rules: RwLock<HashMap<RuleId, Arc<RegisteredRule>>>,
    triggers: RwLock<HashMap<String, Vec<RuleId>>>,
    last_targets: Mutex<HashMap<RuleId, HashSet<String>>>,
    next_id: AtomicU32,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rules.read().len())
            .field("triggers", &self.triggers.read().len())
            .finish()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `rule`'s triggers against `descriptors` and index it.
    pub fn register(&self, descriptors: &DescriptorTable, rule: RuleKind) -> Result<RuleId> {
        let triggers = rule.trigger_properties();
        Self::validate_triggers(descriptors, rule.name(), &triggers)?;

        let id = RuleId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let registered = Arc::new(RegisteredRule {
            id,
            kind: rule,
            triggers,
        });

        {
            let mut index = self.triggers.write();
            for path in &registered.triggers {
                let ids = index.entry(path.clone()).or_default();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        info!(
            rule = registered.name(),
            %id,
            triggers = ?registered.triggers,
            asynchronous = registered.kind.is_async(),
            "rule registered"
        );
        self.rules.write().insert(id, registered);
        Ok(id)
    }

    fn validate_triggers(
        descriptors: &DescriptorTable,
        rule: &str,
        triggers: &[String],
    ) -> Result<()> {
        if triggers.is_empty() {
            return Err(SmartGraphError::TargetIsNull(format!(
                "rule '{rule}' declares no trigger properties"
            )));
        }
        for path in triggers {
            if path.split('.').any(str::is_empty) {
                return Err(SmartGraphError::TargetIsNull(format!(
                    "rule '{rule}' has an empty segment in trigger '{path}'"
                )));
            }
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path.as_str(), None),
            };
            let descriptor = descriptors.get(head).ok_or_else(|| {
                SmartGraphError::PropertyNotFound(format!("{}.{}", descriptors.type_name(), head))
            })?;
            if rest.is_some() && !matches!(descriptor.kind, ValueKind::Child | ValueKind::Any) {
                return Err(SmartGraphError::InvalidTargetType(format!(
                    "rule '{rule}' trigger '{path}' descends into '{head}', which holds {}",
                    descriptor.kind
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    pub fn rule(&self, id: RuleId) -> Option<Arc<RegisteredRule>> {
        self.rules.read().get(&id).cloned()
    }

    /// Rules fired by a change at `path`, in execution order.
    pub fn triggered(&self, path: &str) -> Vec<Arc<RegisteredRule>> {
        let ids = match self.triggers.read().get(path) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        let rules = self.rules.read();
        let mut out: Vec<_> = ids.iter().filter_map(|id| rules.get(id).cloned()).collect();
        out.sort_by_key(|r| r.sort_key());
        out
    }

    /// Every registered rule, in execution order.
    pub fn all(&self) -> Vec<Arc<RegisteredRule>> {
        let mut out: Vec<_> = self.rules.read().values().cloned().collect();
        out.sort_by_key(|r| r.sort_key());
        out
    }

    /// Record `messages` for `rule` on `registry`.
    ///
    /// Each targeted cell gets its entry for the rule replaced; cells the rule
    /// wrote to on its previous run but not this one are cleared. A message
    /// naming a property the object does not declare fails the whole write.
    pub fn apply(
        &self,
        registry: &PropertyRegistry,
        rule: &RegisteredRule,
        messages: Vec<RuleMessage>,
    ) -> Result<()> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for m in messages {
            if m.property.contains('.') || !registry.has_property(&m.property) {
                return Err(SmartGraphError::TargetRulePropertyChange(format!(
                    "rule '{}' cannot record a message on '{}.{}'",
                    rule.name(),
                    registry.descriptors().type_name(),
                    m.property
                )));
            }
            grouped.entry(m.property).or_default().push(m.message);
        }

        let targets: HashSet<String> = grouped.keys().cloned().collect();
        let stale: Vec<String> = {
            let mut last = self.last_targets.lock();
            let previous = last.insert(rule.id, targets.clone()).unwrap_or_default();
            previous.difference(&targets).cloned().collect()
        };

        for property in stale {
            debug!(rule = rule.name(), property, "clearing stale rule messages");
            registry.get(&property)?.clear_messages_for_rule(rule.id);
        }
        for (property, list) in grouped {
            registry.get(&property)?.set_messages_for_rule(rule.id, list);
        }
        Ok(())
    }

    /// Forget the cells `rule` wrote to; used when an object's messages are
    /// cleared from outside the engine.
    pub fn forget_targets(&self) {
        self.last_targets.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleBuilder;

    fn table() -> DescriptorTable {
        DescriptorTable::builder("Person")
            .property("Name", ValueKind::Text)
            .property("Age", ValueKind::Int)
            .property("Child", ValueKind::Child)
            .build()
            .unwrap()
    }

    fn noop(name: &str, triggers: &[&str], order: i32) -> RuleKind {
        RuleBuilder::new(name)
            .triggers(triggers.iter().copied())
            .order(order)
            .handler(|_| Ok(vec![]))
            .build()
            .unwrap()
    }

    #[test]
    fn registration_validates_triggers() {
        let engine = RuleEngine::new();
        let t = table();

        let err = engine.register(&t, noop("none", &[], 0)).unwrap_err();
        assert!(matches!(err, SmartGraphError::TargetIsNull(_)));

        let err = engine.register(&t, noop("blank", &["Child..X"], 0)).unwrap_err();
        assert!(matches!(err, SmartGraphError::TargetIsNull(_)));

        let err = engine.register(&t, noop("ghost", &["Ghost"], 0)).unwrap_err();
        assert!(matches!(err, SmartGraphError::PropertyNotFound(ref p) if p == "Person.Ghost"));

        let err = engine.register(&t, noop("scalar", &["Age.Value"], 0)).unwrap_err();
        assert!(matches!(err, SmartGraphError::InvalidTargetType(_)));

        assert!(engine.is_empty());
        engine.register(&t, noop("ok", &["Name", "Child.Field"], 0)).unwrap();
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn triggered_is_exact_and_ordered() {
        let engine = RuleEngine::new();
        let t = table();
        let late = engine.register(&t, noop("late", &["Name"], 5)).unwrap();
        let first = engine.register(&t, noop("first", &["Name"], 0)).unwrap();
        let second = engine.register(&t, noop("second", &["Name", "Age"], 0)).unwrap();
        let nested = engine.register(&t, noop("nested", &["Child.Name"], 0)).unwrap();

        let ids: Vec<_> = engine.triggered("Name").iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![first, second, late]);

        let ids: Vec<_> = engine.triggered("Child.Name").iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![nested]);

        assert!(engine.triggered("Nam").is_empty());
        assert!(engine.triggered("Child").is_empty());
        assert_eq!(engine.all().len(), 4);
    }

    #[test]
    fn local_triggers_skip_paths() {
        let engine = RuleEngine::new();
        let id = engine
            .register(&table(), noop("mixed", &["Name", "Child.Field"], 0))
            .unwrap();
        let rule = engine.rule(id).unwrap();
        assert_eq!(rule.local_triggers().collect::<Vec<_>>(), vec!["Name"]);
    }

    #[test]
    fn apply_replaces_and_clears_stale_targets() {
        let engine = RuleEngine::new();
        let t = Arc::new(table());
        let registry = PropertyRegistry::new(t.clone());
        let id = engine.register(&t, noop("both", &["Name"], 0)).unwrap();
        let rule = engine.rule(id).unwrap();

        engine
            .apply(
                &registry,
                &rule,
                vec![
                    RuleMessage::new("Name", "too short"),
                    RuleMessage::new("Name", "no digits"),
                    RuleMessage::new("Age", "required"),
                ],
            )
            .unwrap();
        assert_eq!(registry.rule_messages().len(), 3);

        engine
            .apply(&registry, &rule, vec![RuleMessage::new("Name", "too short")])
            .unwrap();
        let messages = registry.rule_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "Name");
        assert!(registry.get("Age").unwrap().is_self_valid());

        engine.apply(&registry, &rule, vec![]).unwrap();
        assert!(registry.aggregates().is_valid);
    }

    #[test]
    fn apply_rejects_unknown_targets() {
        let engine = RuleEngine::new();
        let t = Arc::new(table());
        let registry = PropertyRegistry::new(t.clone());
        let id = engine.register(&t, noop("bad", &["Name"], 0)).unwrap();
        let rule = engine.rule(id).unwrap();

        for target in ["Ghost", "Child.Field"] {
            let err = engine
                .apply(&registry, &rule, vec![RuleMessage::new(target, "x")])
                .unwrap_err();
            assert!(matches!(err, SmartGraphError::TargetRulePropertyChange(_)));
        }
        assert!(registry.aggregates().is_valid);
    }
}
