//! Observable progress of a DFU session.

use std::sync::Mutex;
use tokio::sync::mpsc;

/// Charge state reported by the ring
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BatteryState {
    NotCharging,
    Charging,
    Charged,
    Error,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PhoneInChargerState {
    /// The phone is not charging and its battery is low
    Waiting,
    /// The phone is charging, the user has to confirm
    InCharger,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ActivityReason {
    Downloading,
    WaitingForWriteStart,
    WriteCompleted,
    ForgettingDevice,
    WaitingForRequiredPair,
}

/// Progress of one write within the write sequence
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WriteProgress {
    /// 0 to 100
    pub progress: u8,
    pub index: usize,
    pub count: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// The user should place the ring in its charger
    PeripheralInCharger(Option<BatteryState>),
    /// The user should place the phone in its charger
    PhoneInCharger(PhoneInChargerState),
    /// The user should remove the ring from the system's Bluetooth settings
    WaitingForForgetThisDevice { initial: bool },
    /// The user should turn Bluetooth off, then back on
    WaitingForBluetoothToggle { have_toggled_off: bool },
    Activity(ActivityReason),
    Writing(WriteProgress),
    Completed,
}

/// Sending half of a session's state stream.
///
/// Consecutive identical states are coalesced. Sending after the receiver
/// has gone away is not an error; the session keeps running.
#[derive(Debug)]
pub struct StateSender {
    tx: mpsc::UnboundedSender<State>,
    last: Mutex<Option<State>>,
}

impl StateSender {
    pub fn send(&self, state: State) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if *last == Some(state) {
            return;
        }
        log::debug!("DFU state {:?}", state);
        *last = Some(state);
        let _ = self.tx.send(state);
    }
}

pub type StateReceiver = mpsc::UnboundedReceiver<State>;

pub fn state_channel() -> (StateSender, StateReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StateSender { tx, last: Mutex::new(None) }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_states_are_emitted_once() {
        let (tx, mut rx) = state_channel();
        tx.send(State::Activity(ActivityReason::Downloading));
        tx.send(State::Activity(ActivityReason::Downloading));
        tx.send(State::Completed);
        drop(tx);

        assert_eq!(rx.try_recv().unwrap(), State::Activity(ActivityReason::Downloading));
        assert_eq!(rx.try_recv().unwrap(), State::Completed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn only_consecutive_states_are_coalesced() {
        let (tx, mut rx) = state_channel();
        let writing = State::Writing(WriteProgress { progress: 5, index: 0, count: 1 });
        tx.send(writing);
        tx.send(State::Activity(ActivityReason::WriteCompleted));
        tx.send(writing);
        drop(tx);

        let mut received = Vec::new();
        while let Ok(state) = rx.try_recv() {
            received.push(state);
        }
        assert_eq!(received.len(), 3);
    }

    #[test]
    fn closed_receiver_is_ignored() {
        let (tx, rx) = state_channel();
        drop(rx);
        tx.send(State::Completed);
    }
}
