use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, error};

/// Reason carried by `*-failed` events when the user cancelled.
pub const CANCELLED_REASON: &str = "Cancelled by user";

/// Kinds of events carried by the [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ScanStarted,
    ScanProgress,
    ScanCompleted,
    ScanFailed,
    CleanStarted,
    CleanProgress,
    CleanCompleted,
    CleanFailed,
    AnalysisStarted,
    AnalysisProgress,
    AnalysisCompleted,
    AnalysisFailed,
    StateChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ScanStarted => "scan-started",
            EventKind::ScanProgress => "scan-progress",
            EventKind::ScanCompleted => "scan-completed",
            EventKind::ScanFailed => "scan-failed",
            EventKind::CleanStarted => "clean-started",
            EventKind::CleanProgress => "clean-progress",
            EventKind::CleanCompleted => "clean-completed",
            EventKind::CleanFailed => "clean-failed",
            EventKind::AnalysisStarted => "analysis-started",
            EventKind::AnalysisProgress => "analysis-progress",
            EventKind::AnalysisCompleted => "analysis-completed",
            EventKind::AnalysisFailed => "analysis-failed",
            EventKind::StateChanged => "state-changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged payload delivered through the bus. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub data: Map<String, Value>,
    pub timestamp: SystemTime,
}

impl DomainEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            data: Map::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Attach a key/value pair to the payload.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

/// Synchronous publish/subscribe channel keyed by [`EventKind`].
///
/// Subscribers run on the publisher's thread, in subscription order. The
/// subscriber list is snapshotted under the lock and callbacks run outside
/// it, so a callback may itself subscribe or publish. A panicking subscriber
/// is logged and the remaining subscribers still receive the event.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Callback)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(SubscriptionId, Callback)>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        debug!("Subscribed {:?} to {}", id, kind);
        id
    }

    /// Returns `false` if the subscription was not registered for `kind`.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    pub fn publish(&self, event: DomainEvent) {
        let callbacks: Vec<Callback> = self
            .lock()
            .get(&event.kind)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        debug!(
            "Publishing {} to {} subscriber(s)",
            event.kind,
            callbacks.len()
        );

        for callback in callbacks {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&event)));
            if let Err(payload) = outcome {
                error!(
                    "Subscriber for {} panicked: {}",
                    event.kind,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Drop the subscribers of one kind, or of every kind when `None`.
    pub fn clear(&self, kind: Option<EventKind>) {
        let mut subscribers = self.lock();
        match kind {
            Some(kind) => {
                subscribers.remove(&kind);
            }
            None => subscribers.clear(),
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<EventKind, usize> = self
            .lock()
            .iter()
            .map(|(kind, list)| (*kind, list.len()))
            .collect();
        f.debug_struct("EventBus")
            .field("subscribers", &counts)
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
