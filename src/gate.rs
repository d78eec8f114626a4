use tokio::sync::watch;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GateState {
    /// Not waiting for the user, confirmations are ignored
    Idle,
    /// Waiting for the user to confirm
    Armed,
    Confirmed,
}

/// A user confirmation awaited at one point of a session.
///
/// Only a confirmation made while the gate is armed counts; once confirmed
/// the gate stays confirmed.
#[derive(Debug)]
pub struct ConfirmationGate {
    state: watch::Sender<GateState>,
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationGate {
    pub fn new() -> Self {
        ConfirmationGate { state: watch::channel(GateState::Idle).0 }
    }

    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    pub fn arm(&self) {
        self.transition(GateState::Idle, GateState::Armed);
    }

    pub fn disarm(&self) {
        self.transition(GateState::Armed, GateState::Idle);
    }

    /// Returns whether this call confirmed the gate
    pub fn confirm(&self) -> bool {
        self.transition(GateState::Armed, GateState::Confirmed)
    }

    /// Resolves once the gate has been confirmed
    pub async fn confirmed(&self) {
        let mut rx = self.state.subscribe();
        // the sender lives in `self`, so the channel cannot close while waiting
        let _ = rx.wait_for(|state| *state == GateState::Confirmed).await;
    }

    fn transition(&self, from: GateState, to: GateState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}
