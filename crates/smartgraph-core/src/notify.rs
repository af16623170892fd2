use crate::ChangeEvent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Well-known names used in plain property-changed notifications.
pub mod names {
    pub const VALUE: &str = "Value";
    pub const IS_VALID: &str = "IsValid";
    pub const IS_SELF_VALID: &str = "IsSelfValid";
    pub const IS_MODIFIED: &str = "IsModified";
    pub const IS_SELF_MODIFIED: &str = "IsSelfModified";
    pub const IS_BUSY: &str = "IsBusy";
    pub const MARKED_BUSY: &str = "MarkedBusy";
    pub const RULE_MESSAGES: &str = "RuleMessages";
}

pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Payload delivered to broadcast subscribers.
#[derive(Debug, Clone)]
pub enum Notification {
    PropertyChanged(String),
    Chained(ChangeEvent),
}

impl Notification {
    pub fn property_name(&self) -> Option<&str> {
        match self {
            Notification::PropertyChanged(name) => Some(name),
            Notification::Chained(_) => None,
        }
    }
}

/// Synchronous observer invoked on the mutating thread.
pub trait ChangeListener: Send + Sync {
    fn property_changed(&self, _property: &str) {}

    fn chained_changed(&self, _event: &ChangeEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out point for change notifications.
///
/// Listeners are snapshotted before dispatch so a listener may add or remove
/// listeners (or trigger further notifications) without deadlocking.
pub struct Notifier {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ChangeListener>)>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAPACITY)
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("listeners", &self.listeners.read().len())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    /// Subscribe to the broadcast side, for layers that consume notifications
    /// asynchronously.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn property_changed(&self, property: &str) {
        for listener in self.snapshot() {
            listener.property_changed(property);
        }
        let _ = self
            .tx
            .send(Notification::PropertyChanged(property.to_string()));
    }

    pub fn chained_changed(&self, event: &ChangeEvent) {
        for listener in self.snapshot() {
            listener.chained_changed(event);
        }
        let _ = self.tx.send(Notification::Chained(event.clone()));
    }

    fn snapshot(&self) -> Vec<Arc<dyn ChangeListener>> {
        self.listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl ChangeListener for Recorder {
        fn property_changed(&self, property: &str) {
            self.seen.lock().push(property.to_string());
        }

        fn chained_changed(&self, event: &ChangeEvent) {
            self.seen.lock().push(format!("chain:{}", event.full_path()));
        }
    }

    #[test]
    fn listeners_receive_both_kinds() {
        let notifier = Notifier::default();
        let rec = Arc::new(Recorder::default());
        notifier.add_listener(rec.clone());

        notifier.property_changed(names::IS_VALID);
        notifier.chained_changed(&ChangeEvent::new("Name", SourceId::next()));

        assert_eq!(*rec.seen.lock(), vec!["IsValid", "chain:Name"]);
    }

    #[test]
    fn removed_listener_is_silent() {
        let notifier = Notifier::default();
        let rec = Arc::new(Recorder::default());
        let id = notifier.add_listener(rec.clone());
        assert!(notifier.remove_listener(id));
        assert!(!notifier.remove_listener(id));

        notifier.property_changed(names::IS_BUSY);
        assert!(rec.seen.lock().is_empty());
    }

    #[test]
    fn broadcast_subscribers_see_notifications() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.property_changed(names::IS_MODIFIED);
        let got = rx.try_recv().expect("notification");
        assert_eq!(got.property_name(), Some("IsModified"));
    }
}
