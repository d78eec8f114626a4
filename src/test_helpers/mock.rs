//! In-memory Bluetooth stack, transfer engine and host delegate.

use crate::host::{DfuDelegate, ForgetThisDeviceUpdate};
use crate::state::BatteryState;
use crate::transport::{
    AdapterState, Advertisement, Central, CentralEvent, CentralManager, ConnectionState, DeviceInformation,
    Peripheral, PeripheralCommand, PeripheralId, TransferEngine, TransferEvent, TransferHandle, TransferRequest,
    TransferState,
};

use anyhow::{Result, bail};
use futures::channel::mpsc as event_channel;
use futures::stream::{BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("mock state poisoned")
}

/// Pops scripted values, repeating the last one forever
fn next_scripted<T: Copy>(script: &mut VecDeque<T>, default: T) -> T {
    if script.len() > 1 {
        script.pop_front().unwrap_or(default)
    } else {
        script.front().copied().unwrap_or(default)
    }
}

#[derive(Default)]
struct ManagerState {
    next_session: usize,
    live_sessions: usize,
    subscribers: Vec<(usize, event_channel::UnboundedSender<CentralEvent>)>,
    /// Delivered to the next stream opened
    pending: Vec<CentralEvent>,
    scan_advertisements: Vec<Advertisement>,
    adapter_states: VecDeque<AdapterState>,
    peripherals: Vec<MockPeripheral>,
    connects: Vec<PeripheralId>,
    cancelled: Vec<PeripheralId>,
}

#[derive(Clone, Default)]
pub struct MockManager {
    state: Arc<Mutex<ManagerState>>,
}

impl MockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peripheral` known to every session
    pub fn register(&self, peripheral: MockPeripheral) {
        lock(&self.state).peripherals.push(peripheral);
    }

    /// Queue an event for the next event stream to be opened
    pub fn push_event(&self, event: CentralEvent) {
        lock(&self.state).pending.push(event);
    }

    /// Send an event to every open event stream
    pub fn emit(&self, event: CentralEvent) {
        let state = lock(&self.state);
        for (_, subscriber) in &state.subscribers {
            let _ = subscriber.unbounded_send(event.clone());
        }
    }

    /// Discover `advertisement` every time a session starts scanning
    pub fn advertise_on_scan(&self, advertisement: Advertisement) {
        lock(&self.state).scan_advertisements.push(advertisement);
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.script_adapter_states([state]);
    }

    pub fn script_adapter_states(&self, states: impl IntoIterator<Item = AdapterState>) {
        lock(&self.state).adapter_states = states.into_iter().collect();
    }

    pub fn connects(&self) -> Vec<PeripheralId> {
        lock(&self.state).connects.clone()
    }

    pub fn cancelled_connections(&self) -> Vec<PeripheralId> {
        lock(&self.state).cancelled.clone()
    }

    pub fn live_sessions(&self) -> usize {
        lock(&self.state).live_sessions
    }
}

impl CentralManager for MockManager {
    type Central = MockCentral;

    async fn session(&self) -> Result<MockCentral> {
        let mut state = lock(&self.state);
        state.next_session += 1;
        state.live_sessions += 1;
        Ok(MockCentral {
            id: state.next_session,
            manager: self.state.clone(),
            scanning: AtomicBool::new(false),
        })
    }
}

pub struct MockCentral {
    id: usize,
    manager: Arc<Mutex<ManagerState>>,
    scanning: AtomicBool,
}

impl MockCentral {
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}

impl Drop for MockCentral {
    fn drop(&mut self) {
        let mut state = lock(&self.manager);
        state.subscribers.retain(|(session, _)| *session != self.id);
        state.live_sessions -= 1;
    }
}

impl Central for MockCentral {
    type Peripheral = MockPeripheral;

    async fn state(&self) -> Result<AdapterState> {
        let mut state = lock(&self.manager);
        Ok(next_scripted(&mut state.adapter_states, AdapterState::PoweredOn))
    }

    async fn events(&self) -> Result<BoxStream<'static, CentralEvent>> {
        let (tx, rx) = event_channel::unbounded();
        let mut state = lock(&self.manager);
        for event in state.pending.drain(..) {
            let _ = tx.unbounded_send(event);
        }
        state.subscribers.push((self.id, tx));
        Ok(rx.boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        self.scanning.store(true, Ordering::SeqCst);
        let state = lock(&self.manager);
        for advertisement in &state.scan_advertisements {
            for (_, subscriber) in state.subscribers.iter().filter(|(session, _)| *session == self.id) {
                let _ = subscriber.unbounded_send(CentralEvent::Discovered(advertisement.clone()));
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<MockPeripheral> {
        let state = lock(&self.manager);
        Ok(state
            .peripherals
            .iter()
            .find(|p| p.id() == *id)
            .cloned()
            .unwrap_or_else(|| MockPeripheral::new(id.as_str())))
    }

    async fn connected_peripherals(&self) -> Result<Vec<MockPeripheral>> {
        let peripherals = lock(&self.manager).peripherals.clone();
        Ok(peripherals.into_iter().filter(|p| p.poll_connected()).collect())
    }

    async fn connect(&self, peripheral: &MockPeripheral) -> Result<()> {
        lock(&self.manager).connects.push(peripheral.id());
        Ok(())
    }

    async fn cancel_connection(&self, peripheral: &MockPeripheral) -> Result<()> {
        lock(&self.manager).cancelled.push(peripheral.id());
        Ok(())
    }
}

#[derive(Default)]
struct PeripheralState {
    appear_after_polls: usize,
    appearance_polls: usize,
    pair_after_polls: usize,
    pair_polls: usize,
    connection_states: VecDeque<ConnectionState>,
    commands: Vec<PeripheralCommand>,
    fail_writes: bool,
    information: DeviceInformation,
    invalidations: usize,
    battery: Option<watch::Sender<Option<BatteryState>>>,
}

#[derive(Clone)]
pub struct MockPeripheral {
    id: PeripheralId,
    state: Arc<Mutex<PeripheralState>>,
}

impl MockPeripheral {
    pub fn new(id: &str) -> Self {
        MockPeripheral { id: id.into(), state: Arc::default() }
    }

    /// Left out of the connected peripherals for the first `polls` polls
    pub fn appear_after_polls(&self, polls: usize) {
        lock(&self.state).appear_after_polls = polls;
    }

    /// Reported unpaired for the first `polls` polls
    pub fn pair_after_polls(&self, polls: usize) {
        lock(&self.state).pair_after_polls = polls;
    }

    /// Connection states to report, the last one repeating
    pub fn script_connection_states(&self, states: impl IntoIterator<Item = ConnectionState>) {
        lock(&self.state).connection_states = states.into_iter().collect();
    }

    pub fn fail_writes(&self) {
        lock(&self.state).fail_writes = true;
    }

    pub fn set_device_information(&self, information: DeviceInformation) {
        lock(&self.state).information = information;
    }

    /// Make the charge state observable and set it
    pub fn set_battery_state(&self, battery: Option<BatteryState>) {
        let mut state = lock(&self.state);
        match &state.battery {
            Some(tx) => {
                tx.send_replace(battery);
            }
            None => state.battery = Some(watch::channel(battery).0),
        }
    }

    pub fn commands(&self) -> Vec<PeripheralCommand> {
        lock(&self.state).commands.clone()
    }

    pub fn invalidations(&self) -> usize {
        lock(&self.state).invalidations
    }

    fn poll_connected(&self) -> bool {
        let mut state = lock(&self.state);
        state.appearance_polls += 1;
        state.appearance_polls > state.appear_after_polls
    }
}

impl Peripheral for MockPeripheral {
    fn id(&self) -> PeripheralId {
        self.id.clone()
    }

    async fn connection_state(&self) -> Result<ConnectionState> {
        let mut state = lock(&self.state);
        Ok(next_scripted(&mut state.connection_states, ConnectionState::Connected))
    }

    async fn is_paired(&self) -> Result<bool> {
        let mut state = lock(&self.state);
        state.pair_polls += 1;
        Ok(state.pair_polls > state.pair_after_polls)
    }

    async fn write_command(&self, command: PeripheralCommand) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            bail!("write to {} failed", self.id);
        }
        state.commands.push(command);
        Ok(())
    }

    async fn device_information(&self) -> Result<DeviceInformation> {
        Ok(lock(&self.state).information.clone())
    }

    fn invalidate_device_information(&self) {
        lock(&self.state).invalidations += 1;
    }

    fn battery_state(&self) -> Option<watch::Receiver<Option<BatteryState>>> {
        lock(&self.state).battery.as_ref().map(watch::Sender::subscribe)
    }
}

#[derive(Default)]
struct EngineState {
    scripts: VecDeque<Vec<TransferEvent>>,
    started_with: Vec<PeripheralId>,
    requests: Vec<TransferRequest>,
}

/// Plays back scripted transfers, one per start. Unscripted transfers succeed.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, events: impl IntoIterator<Item = TransferEvent>) {
        lock(&self.state).scripts.push_back(events.into_iter().collect());
    }

    pub fn started_with(&self) -> Vec<PeripheralId> {
        lock(&self.state).started_with.clone()
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        lock(&self.state).requests.clone()
    }
}

impl<C: Central> TransferEngine<C> for MockEngine {
    fn start(&self, _central: &C, peripheral: &C::Peripheral, request: TransferRequest) -> Result<TransferHandle> {
        let mut state = lock(&self.state);
        state.started_with.push(peripheral.id());
        state.requests.push(request);
        let events = state.scripts.pop_front().unwrap_or_else(|| {
            vec![
                TransferEvent::StateChanged(TransferState::Uploading),
                TransferEvent::Progress(0),
                TransferEvent::Progress(50),
                TransferEvent::Progress(100),
                TransferEvent::Completed,
            ]
        });

        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            let _ = tx.send(event);
        }
        Ok(TransferHandle::new(rx, None))
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DelegateCall {
    AllowInteraction(bool, PeripheralId),
    StartForget(PeripheralId),
    StopForget(PeripheralId),
}

#[derive(Debug, Copy, Clone)]
enum ForgetBehaviour {
    Complete,
    Abandon,
    Ignore,
}

pub struct RecordingDelegate {
    behaviour: ForgetBehaviour,
    calls: Mutex<Vec<DelegateCall>>,
    held: Mutex<Vec<mpsc::UnboundedSender<ForgetThisDeviceUpdate>>>,
}

impl RecordingDelegate {
    fn with(behaviour: ForgetBehaviour) -> Self {
        RecordingDelegate { behaviour, calls: Mutex::default(), held: Mutex::default() }
    }

    /// The user forgets the device as soon as asked
    pub fn completing() -> Self {
        Self::with(ForgetBehaviour::Complete)
    }

    /// The forget flow is torn down without completing
    pub fn abandoning() -> Self {
        Self::with(ForgetBehaviour::Abandon)
    }

    /// The user never acts
    pub fn silent() -> Self {
        Self::with(ForgetBehaviour::Ignore)
    }

    pub fn calls(&self) -> Vec<DelegateCall> {
        lock(&self.calls).clone()
    }
}

impl DfuDelegate for RecordingDelegate {
    fn set_interaction_allowed(&self, allowed: bool, peripheral: &PeripheralId) {
        lock(&self.calls).push(DelegateCall::AllowInteraction(allowed, peripheral.clone()));
    }

    fn start_forget_this_device(&self, peripheral: &PeripheralId, updates: mpsc::UnboundedSender<ForgetThisDeviceUpdate>) {
        lock(&self.calls).push(DelegateCall::StartForget(peripheral.clone()));
        match self.behaviour {
            ForgetBehaviour::Complete => {
                let _ = updates.send(ForgetThisDeviceUpdate::Started);
                let _ = updates.send(ForgetThisDeviceUpdate::Completed);
            }
            ForgetBehaviour::Abandon => {
                let _ = updates.send(ForgetThisDeviceUpdate::Started);
            }
            ForgetBehaviour::Ignore => lock(&self.held).push(updates),
        }
    }

    fn stop_forget_this_device(&self, peripheral: &PeripheralId) {
        lock(&self.calls).push(DelegateCall::StopForget(peripheral.clone()));
    }
}
