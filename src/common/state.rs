//! Shared lifecycle state
//!
//! Holds the current lifecycle state and the last recorded failure, and
//! implements the validate/commit steps every transition goes through.
//! The resource work between those two steps belongs to the driver.

use super::command::{LifecycleState, Transition};
use super::error::DriverError;
use tokio::sync::watch;
use tracing::info;

/// Lifecycle state shared between the processing task and request handlers
#[derive(Debug, Clone, Default)]
pub struct LifecycleSharedState {
    /// Current lifecycle state
    pub state: LifecycleState,
    /// Reason for the most recent transition into ErrorProcessing
    pub last_error: Option<String>,
    /// Number of committed transitions
    pub transitions: u64,
}

impl LifecycleSharedState {
    /// Create a new shared state in Unconfigured
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a transition against the current state
    ///
    /// Returns the target state on success. Nothing is modified.
    pub fn begin(&self, transition: Transition) -> Result<LifecycleState, DriverError> {
        if self.state.allows(transition) {
            Ok(transition.target())
        } else {
            Err(DriverError::InvalidTransition {
                transition,
                state: self.state,
            })
        }
    }

    /// Commit a state change and broadcast it
    pub fn commit(&mut self, state_tx: &watch::Sender<LifecycleState>, target: LifecycleState) {
        let from = self.state;
        self.state = target;
        self.transitions += 1;
        if target != LifecycleState::ErrorProcessing {
            self.last_error = None;
        }
        state_tx.send_replace(target);
        info!(from = %from, to = %target, "Lifecycle transition");
    }

    /// Commit a transition into ErrorProcessing, recording the reason
    pub fn commit_error(
        &mut self,
        state_tx: &watch::Sender<LifecycleState>,
        reason: impl Into<String>,
    ) {
        self.commit(state_tx, LifecycleState::ErrorProcessing);
        self.last_error = Some(reason.into());
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut shared = LifecycleSharedState::new();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Unconfigured);

        for transition in [
            Transition::Configure,
            Transition::Activate,
            Transition::Deactivate,
            Transition::Cleanup,
        ] {
            let target = shared.begin(transition).unwrap();
            shared.commit(&state_tx, target);
            assert_eq!(*state_rx.borrow(), target);
        }

        assert_eq!(shared.state, LifecycleState::Unconfigured);
        assert_eq!(shared.transitions, 4);
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let shared = LifecycleSharedState::new();
        let err = shared.begin(Transition::Activate).unwrap_err();
        assert!(matches!(
            err,
            DriverError::InvalidTransition {
                transition: Transition::Activate,
                state: LifecycleState::Unconfigured
            }
        ));
        assert_eq!(shared.state, LifecycleState::Unconfigured);
    }

    #[test]
    fn test_error_records_reason_until_cleared() {
        let mut shared = LifecycleSharedState::new();
        let (state_tx, _state_rx) = watch::channel(LifecycleState::Unconfigured);

        shared.commit_error(&state_tx, "socket closed");
        assert_eq!(shared.state, LifecycleState::ErrorProcessing);
        assert_eq!(shared.last_error.as_deref(), Some("socket closed"));

        let target = shared.begin(Transition::ClearError).unwrap();
        shared.commit(&state_tx, target);
        assert_eq!(shared.state, LifecycleState::Unconfigured);
        assert!(shared.last_error.is_none());
    }

    #[test]
    fn test_finalized_is_terminal() {
        let mut shared = LifecycleSharedState::new();
        let (state_tx, _state_rx) = watch::channel(LifecycleState::Unconfigured);

        let target = shared.begin(Transition::Shutdown).unwrap();
        shared.commit(&state_tx, target);

        assert!(shared.begin(Transition::Shutdown).is_err());
        assert!(shared.begin(Transition::Error).is_err());
        assert!(shared.begin(Transition::Configure).is_err());
    }
}
