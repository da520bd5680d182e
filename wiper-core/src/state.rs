use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Result, WiperError};
use crate::events::{DomainEvent, EventBus, EventKind};

/// Which major operation, if any, currently owns the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    #[default]
    Idle,
    Scanning,
    Cleaning,
    Analyzing,
}

impl SystemState {
    /// States reachable from `self` in one step.
    pub fn valid_transitions(self) -> &'static [SystemState] {
        use SystemState::*;
        match self {
            Idle => &[Scanning, Analyzing, Cleaning],
            Scanning => &[Idle, Cleaning],
            Analyzing => &[Idle],
            Cleaning => &[Idle],
        }
    }

    pub fn can_transition_to(self, to: SystemState) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Idle => "idle",
            SystemState::Scanning => "scanning",
            SystemState::Cleaning => "cleaning",
            SystemState::Analyzing => "analyzing",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: SystemState,
    cancel_requested: bool,
}

/// Finite-state machine plus cooperative cancellation flag.
///
/// This is the only arbiter of "one major operation at a time". Cancellation
/// never preempts anything: workers poll [`is_cancel_requested`] between
/// files, directory entries and targets, so a single slow filesystem call
/// delays how quickly a cancel is observed.
///
/// [`is_cancel_requested`]: StateCoordinator::is_cancel_requested
#[derive(Debug, Default)]
pub struct StateCoordinator {
    inner: Mutex<Inner>,
    bus: Option<Arc<EventBus>>,
}

impl StateCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator that announces every transition as `state-changed`.
    pub fn with_event_bus(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::default(),
            bus: Some(bus),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `to`, clearing any pending cancellation. Returns the previous
    /// state.
    pub fn transition(&self, to: SystemState) -> Result<SystemState> {
        let from = {
            let mut inner = self.lock();
            let from = inner.state;
            if !from.can_transition_to(to) {
                warn!("Rejected state transition: {} -> {}", from, to);
                return Err(WiperError::InvalidTransition { from, to });
            }
            inner.state = to;
            inner.cancel_requested = false;
            from
        };

        info!("State transition: {} -> {}", from, to);
        self.announce(from, to);
        Ok(from)
    }

    /// Return to Idle, but only if `owner` still holds the state.
    ///
    /// Workers call this when they finish. After a Scanning -> Cleaning
    /// hand-off the scan worker no longer owns the state and must not end
    /// the clean that replaced it.
    pub fn release(&self, owner: SystemState) -> bool {
        let released = {
            let mut inner = self.lock();
            if inner.state != owner || owner == SystemState::Idle {
                false
            } else {
                inner.state = SystemState::Idle;
                inner.cancel_requested = false;
                true
            }
        };

        if released {
            info!("State transition: {} -> idle", owner);
            self.announce(owner, SystemState::Idle);
        } else {
            debug!("{} no longer owns the state, leaving it unchanged", owner);
        }
        released
    }

    fn announce(&self, from: SystemState, to: SystemState) {
        if let Some(bus) = &self.bus {
            bus.publish(
                DomainEvent::new(EventKind::StateChanged)
                    .with("from", from.as_str())
                    .with("to", to.as_str()),
            );
        }
    }

    pub fn current(&self) -> SystemState {
        self.lock().state
    }

    pub fn request_cancel(&self) {
        let mut inner = self.lock();
        inner.cancel_requested = true;
        info!("Cancellation requested while {}", inner.state);
    }

    /// Request cancellation only while `owner` holds the state. Returns
    /// false, leaving the flag alone, when another operation has taken over.
    pub fn request_cancel_for(&self, owner: SystemState) -> bool {
        let mut inner = self.lock();
        if inner.state != owner || owner == SystemState::Idle {
            return false;
        }
        inner.cancel_requested = true;
        info!("Cancellation requested while {}", inner.state);
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    pub fn reset_cancel(&self) {
        self.lock().cancel_requested = false;
    }

    pub fn is_idle(&self) -> bool {
        self.current() == SystemState::Idle
    }

    pub fn is_scanning(&self) -> bool {
        self.current() == SystemState::Scanning
    }

    pub fn is_cleaning(&self) -> bool {
        self.current() == SystemState::Cleaning
    }

    pub fn is_analyzing(&self) -> bool {
        self.current() == SystemState::Analyzing
    }

    /// States reachable from the current state.
    pub fn valid_transitions(&self) -> &'static [SystemState] {
        self.current().valid_transitions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SystemState::*;

    #[test]
    fn test_transition_table() {
        let cases = [
            (Idle, Scanning, true),
            (Idle, Analyzing, true),
            (Idle, Cleaning, true),
            (Idle, Idle, false),
            (Scanning, Idle, true),
            (Scanning, Cleaning, true),
            (Scanning, Analyzing, false),
            (Analyzing, Idle, true),
            (Analyzing, Scanning, false),
            (Analyzing, Cleaning, false),
            (Cleaning, Idle, true),
            (Cleaning, Scanning, false),
        ];
        for (from, to, allowed) in cases {
            assert_eq!(from.can_transition_to(to), allowed, "{from} -> {to}");
        }
    }

    #[test]
    fn test_invalid_transition_is_surfaced() {
        let coordinator = StateCoordinator::new();
        coordinator.transition(Analyzing).unwrap();

        let err = coordinator.transition(Cleaning).unwrap_err();
        match err {
            WiperError::InvalidTransition { from, to } => {
                assert_eq!(from, Analyzing);
                assert_eq!(to, Cleaning);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(coordinator.current(), Analyzing);
    }

    #[test]
    fn test_transition_resets_cancel() {
        let coordinator = StateCoordinator::new();
        coordinator.transition(Scanning).unwrap();
        coordinator.request_cancel();
        assert!(coordinator.is_cancel_requested());

        coordinator.transition(Cleaning).unwrap();
        assert!(!coordinator.is_cancel_requested());
        assert!(coordinator.is_cleaning());
    }

    #[test]
    fn test_release_respects_ownership() {
        let coordinator = StateCoordinator::new();
        coordinator.transition(Scanning).unwrap();
        coordinator.transition(Cleaning).unwrap();

        assert!(!coordinator.release(Scanning));
        assert!(coordinator.is_cleaning());

        assert!(coordinator.release(Cleaning));
        assert!(coordinator.is_idle());
        assert!(!coordinator.release(Idle));
    }

    #[test]
    fn test_state_changed_events() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(EventKind::StateChanged, move |event| {
            let to = event.get_str("to").unwrap_or_default().to_string();
            sink.lock().unwrap().push(to);
        });

        let coordinator = StateCoordinator::with_event_bus(bus);
        coordinator.transition(Scanning).unwrap();
        coordinator.release(Scanning);
        let _ = coordinator.transition(Idle);

        assert_eq!(*seen.lock().unwrap(), vec!["scanning", "idle"]);
    }

    #[test]
    fn test_cancel_only_reaches_the_owner() {
        let coordinator = StateCoordinator::new();
        assert!(!coordinator.request_cancel_for(Idle));
        assert!(!coordinator.request_cancel_for(Scanning));

        coordinator.transition(Scanning).unwrap();
        coordinator.transition(Cleaning).unwrap();
        assert!(!coordinator.request_cancel_for(Scanning));
        assert!(!coordinator.is_cancel_requested());

        assert!(coordinator.request_cancel_for(Cleaning));
        assert!(coordinator.is_cancel_requested());
    }
}
