use smartgraph_core::{
    ChangeEvent, ChangeListener, DescriptorTable, Notification, RuntimeConfig, SmartGraphError,
    Value, ValueKind,
};
use smartgraph_graph::{CellMessage, CellSnapshot, PropertyRegistry, RuleId, ScalarValue};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::broadcast::Receiver;

fn child_table() -> Arc<DescriptorTable> {
    Arc::new(
        DescriptorTable::builder("Child")
            .property("Field", ValueKind::Text)
            .build()
            .unwrap(),
    )
}

fn parent_table() -> Arc<DescriptorTable> {
    Arc::new(
        DescriptorTable::builder("Parent")
            .property("Name", ValueKind::Text)
            .property("Age", ValueKind::Int)
            .read_only("Id", ValueKind::Int)
            .property("Child", ValueKind::Child)
            .property("A", ValueKind::Child)
            .property("B", ValueKind::Child)
            .build()
            .unwrap(),
    )
}

fn property_changes(rx: &mut Receiver<Notification>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        if let Notification::PropertyChanged(p) = n {
            out.push(p);
        }
    }
    out
}

fn count(changes: &[String], name: &str) -> usize {
    changes.iter().filter(|c| c.as_str() == name).count()
}

fn invalid_child() -> Arc<PropertyRegistry> {
    let child = PropertyRegistry::new(child_table());
    child
        .get("Field")
        .unwrap()
        .set_messages_for_rule(RuleId(1), vec!["bad".into()]);
    child
}

#[test]
fn cells_are_lazy_and_stable() {
    let reg = PropertyRegistry::new(parent_table());
    assert!(reg.has_property("Name"));
    assert!(!reg.is_materialized("Name"));

    let a = reg.get("Name").unwrap();
    let b = reg.get("Name").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(reg.is_materialized("Name"));
}

#[test]
fn unknown_property_is_not_found() {
    let reg = PropertyRegistry::new(parent_table());
    assert!(!reg.has_property("Nope"));
    let err = reg.get("Nope").unwrap_err();
    assert!(matches!(err, SmartGraphError::PropertyNotFound(ref p) if p == "Parent.Nope"));
}

#[test]
fn read_only_and_type_errors_surface_through_registry() {
    let reg = PropertyRegistry::new(parent_table());
    assert!(matches!(
        reg.set_value("Id", 3i64),
        Err(SmartGraphError::ReadOnly { .. })
    ));
    assert!(matches!(
        reg.set_value("Age", "old"),
        Err(SmartGraphError::TypeMismatch { .. })
    ));
}

#[test]
fn validity_aggregates_and_notifies_edges() {
    let reg = PropertyRegistry::new(parent_table());
    let mut rx = reg.notifier().subscribe();
    let name = reg.get("Name").unwrap();

    name.set_messages_for_rule(RuleId(1), vec!["required".into()]);
    assert!(!reg.aggregates().is_valid);
    name.set_messages_for_rule(RuleId(2), vec!["short".into()]);
    let changes = property_changes(&mut rx);
    assert_eq!(count(&changes, "IsValid"), 1);
    assert_eq!(count(&changes, "IsSelfValid"), 1);

    reg.clear_all_messages();
    assert!(reg.aggregates().is_valid);
    assert_eq!(count(&property_changes(&mut rx), "IsValid"), 1);
}

#[test]
fn edge_only_notification_with_two_invalid_children() {
    let reg = PropertyRegistry::new(parent_table());
    let a = invalid_child();
    let b = invalid_child();
    reg.load_value("A", a.clone()).unwrap();
    reg.load_value("B", b.clone()).unwrap();
    assert!(!reg.aggregates().is_valid);
    assert!(reg.aggregates().is_self_valid);

    let mut rx = reg.notifier().subscribe();
    a.clear_all_messages();
    assert!(!reg.aggregates().is_valid);
    assert_eq!(count(&property_changes(&mut rx), "IsValid"), 0);

    b.clear_all_messages();
    assert!(reg.aggregates().is_valid);
    assert_eq!(count(&property_changes(&mut rx), "IsValid"), 1);
}

#[test]
fn toggling_back_to_same_aggregate_does_not_refire() {
    let reg = PropertyRegistry::new(parent_table());
    let a = invalid_child();
    let b = invalid_child();
    reg.load_value("A", a.clone()).unwrap();
    reg.load_value("B", b.clone()).unwrap();
    let mut rx = reg.notifier().subscribe();

    a.clear_all_messages();
    a.get("Field")
        .unwrap()
        .set_messages_for_rule(RuleId(1), vec!["again".into()]);
    assert_eq!(count(&property_changes(&mut rx), "IsValid"), 0);
}

#[test]
fn child_reference_is_not_self_modification() {
    let reg = PropertyRegistry::new(parent_table());
    let child = PropertyRegistry::new(child_table());
    reg.set_value("Child", child.clone()).unwrap();
    assert!(!reg.aggregates().is_self_modified);
    assert!(!reg.aggregates().is_modified);

    child.set_value("Field", "x").unwrap();
    assert!(reg.aggregates().is_modified);
    assert!(!reg.aggregates().is_self_modified);
    assert!(reg.modified_properties().next().is_none());

    reg.set_value("Name", "n").unwrap();
    assert!(reg.aggregates().is_self_modified);
    assert_eq!(reg.modified_properties().collect::<Vec<_>>(), vec!["Name"]);
}

#[test]
fn mark_self_unmodified_leaves_children() {
    let reg = PropertyRegistry::new(parent_table());
    let child = PropertyRegistry::new(child_table());
    reg.load_value("Child", child.clone()).unwrap();
    reg.set_value("Name", "n").unwrap();
    child.set_value("Field", "f").unwrap();

    reg.mark_self_unmodified();
    assert!(!reg.aggregates().is_self_modified);
    assert!(reg.aggregates().is_modified);

    child.mark_self_unmodified();
    assert!(!reg.aggregates().is_modified);
}

#[test]
fn clear_self_keeps_child_messages() {
    let reg = PropertyRegistry::new(parent_table());
    let child = invalid_child();
    reg.load_value("Child", child.clone()).unwrap();
    reg.get("Name")
        .unwrap()
        .set_messages_for_rule(RuleId(4), vec!["x".into()]);

    reg.clear_self_messages();
    assert!(reg.aggregates().is_self_valid);
    assert!(!reg.aggregates().is_valid);

    reg.clear_all_messages();
    assert!(reg.aggregates().is_valid);
    assert!(child.aggregates().is_valid);
}

#[test]
fn busy_aggregates_across_children() {
    let reg = PropertyRegistry::new(parent_table());
    let child = PropertyRegistry::new(child_table());
    reg.load_value("Child", child.clone()).unwrap();
    let mut rx = reg.notifier().subscribe();

    let field = child.get("Field").unwrap();
    field.add_marked_busy(1);
    field.add_marked_busy(2);
    assert!(reg.aggregates().is_busy);
    field.remove_marked_busy(1);
    assert!(reg.aggregates().is_busy);
    field.remove_marked_busy(2);
    assert!(!reg.aggregates().is_busy);
    assert_eq!(count(&property_changes(&mut rx), "IsBusy"), 2);
}

#[test]
fn paused_registry_freezes_and_resumes_once() {
    let reg = PropertyRegistry::new(parent_table());
    let mut rx = reg.notifier().subscribe();
    reg.pause_all_actions();
    assert!(reg.is_paused());

    reg.set_value("Name", "bulk").unwrap();
    reg.get("Age")
        .unwrap()
        .set_messages_for_rule(RuleId(9), vec!["bad".into()]);
    assert!(reg.aggregates().is_valid);
    assert!(!reg.aggregates().is_modified);
    assert!(property_changes(&mut rx).is_empty());

    reg.resume_all_actions();
    let changes = property_changes(&mut rx);
    assert_eq!(count(&changes, "IsValid"), 1);
    assert_eq!(count(&changes, "IsModified"), 1);
    assert_eq!(count(&changes, "IsBusy"), 0);
    assert!(!reg.aggregates().is_valid);

    reg.resume_all_actions();
    assert!(property_changes(&mut rx).is_empty());
}

#[test]
fn pause_with_net_zero_change_is_silent() {
    let reg = PropertyRegistry::new(parent_table());
    let mut rx = reg.notifier().subscribe();
    reg.pause_all_actions();
    let name = reg.get("Name").unwrap();
    name.set_messages_for_rule(RuleId(1), vec!["x".into()]);
    name.clear_messages_for_rule(RuleId(1));
    reg.resume_all_actions();
    assert!(property_changes(&mut rx).is_empty());
}

#[derive(Default)]
struct ChainRecorder {
    events: Mutex<Vec<ChangeEvent>>,
}

impl ChangeListener for ChainRecorder {
    fn chained_changed(&self, event: &ChangeEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[test]
fn child_events_bubble_with_full_path() {
    let parent = PropertyRegistry::new(parent_table());
    let child = PropertyRegistry::new(child_table());
    parent.set_value("Child", child.clone()).unwrap();

    let parent_rec = Arc::new(ChainRecorder::default());
    let child_rec = Arc::new(ChainRecorder::default());
    parent.notifier().add_listener(parent_rec.clone());
    child.notifier().add_listener(child_rec.clone());

    child.set_value("Field", "v").unwrap();

    let parent_events = parent_rec.events.lock().unwrap();
    let child_events = child_rec.events.lock().unwrap();
    assert_eq!(parent_events.len(), 1);
    assert_eq!(parent_events[0].full_path(), "Child.Field");
    assert!(parent_events[0]
        .original_event()
        .ptr_eq(&child_events[0]));
}

#[test]
fn replaced_child_stops_bubbling() {
    let parent = PropertyRegistry::new(parent_table());
    let first = PropertyRegistry::new(child_table());
    let second = PropertyRegistry::new(child_table());
    parent.set_value("Child", first.clone()).unwrap();
    parent.set_value("Child", second.clone()).unwrap();

    let rec = Arc::new(ChainRecorder::default());
    parent.notifier().add_listener(rec.clone());
    first.set_value("Field", "old").unwrap();
    assert!(rec.events.lock().unwrap().is_empty());
    second.set_value("Field", "new").unwrap();
    assert_eq!(rec.events.lock().unwrap().len(), 1);
}

#[test]
fn concurrent_access_keeps_cache_consistent() {
    let reg = PropertyRegistry::new(parent_table());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let reg = reg.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let name = reg.get("Name").unwrap();
                    name.set_messages_for_rule(RuleId(t), vec![format!("m{i}")]);
                    let _ = reg.rule_messages();
                    name.add_marked_busy(u64::from(t) * 1000 + i);
                    name.remove_marked_busy(u64::from(t) * 1000 + i);
                    name.clear_messages_for_rule(RuleId(t));
                    let _ = reg.set_value("Age", i as i64);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(reg.aggregates(), reg.compute());
    assert!(reg.aggregates().is_valid);
    assert!(!reg.aggregates().is_busy);
}

#[test]
fn snapshot_restore_round_trip() {
    let source = PropertyRegistry::new(parent_table());
    source.set_value("Name", "Ada").unwrap();
    source.load_value("Id", 7i64).unwrap();
    source
        .get("Age")
        .unwrap()
        .set_messages_for_rule(RuleId(2), vec!["required".into()]);
    source.load_value("Child", PropertyRegistry::new(child_table())).unwrap();

    let snaps = source.snapshot();
    assert_eq!(snaps.len(), 3);
    let json = serde_json::to_string(&snaps).unwrap();

    let target = PropertyRegistry::new(parent_table());
    let mut rx = target.notifier().subscribe();
    target.on_deserializing();
    target.restore(serde_json::from_str(&json).unwrap()).unwrap();
    assert!(target.aggregates().is_valid);
    target.on_deserialized();

    assert!(!target.aggregates().is_valid);
    assert_eq!(count(&property_changes(&mut rx), "IsValid"), 1);
    assert_eq!(target.value("Name").unwrap().as_text(), Some("Ada"));
    assert!(target.get("Id").unwrap().is_read_only());
    assert!(!target.aggregates().is_self_modified);
    assert!(matches!(target.value("Child").unwrap(), Value::Null));
}

#[test]
fn restore_rejects_unknown_property() {
    let target = PropertyRegistry::new(parent_table());
    let snaps = vec![CellSnapshot {
        name: "Ghost".into(),
        value: ScalarValue::Null,
        rule_messages: vec![],
        is_read_only: false,
    }];
    assert!(matches!(
        target.restore(snaps),
        Err(SmartGraphError::PropertyNotFound(_))
    ));
}

fn invalid_age_snapshot() -> Vec<CellSnapshot> {
    vec![CellSnapshot {
        name: "Age".into(),
        value: ScalarValue::Int(3),
        rule_messages: vec![CellMessage::new(RuleId(1), "bad")],
        is_read_only: false,
    }]
}

#[test]
fn unpaused_restore_recomputes_aggregates() {
    let reg = PropertyRegistry::new(parent_table());
    let mut rx = reg.notifier().subscribe();

    reg.restore(invalid_age_snapshot()).unwrap();
    assert_eq!(reg.aggregates(), reg.compute());
    assert!(!reg.aggregates().is_valid);
    assert_eq!(count(&property_changes(&mut rx), "IsValid"), 1);
}

#[test]
fn restored_cells_use_configured_capacity() {
    let mut config = RuntimeConfig::default();
    config.notifications.capacity = 1;
    let reg = PropertyRegistry::with_config(parent_table(), &config);
    reg.restore(invalid_age_snapshot()).unwrap();

    let age = reg.get("Age").unwrap();
    let mut rx = age.notifier().subscribe();
    age.clear_self();
    // RuleMessages, IsValid and IsSelfValid overflow a one-slot channel.
    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_))
    ));
}
