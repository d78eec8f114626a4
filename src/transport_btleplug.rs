use crate::hardware::HardwareVersion;
use crate::protocol::LegacyDfuEngine;
use crate::transport::{
    AdapterState, Advertisement, Central, CentralEvent, CentralManager, ConnectionState, DeviceInformation,
    DfuTransport, Peripheral, PeripheralCommand, PeripheralId, TransferEngine, TransferEvent, TransferHandle,
    TransferRequest, TransferState,
};

use anyhow::{Context, Result, anyhow};
use btleplug::api::{
    BDAddr, Central as _, CentralEvent as AdapterEvent, CentralState, Characteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as BlePeripheral, PeripheralId as BleId};
use futures::stream::{self, BoxStream, StreamExt};
use indicatif::ProgressBar;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Device Information Service characteristics
mod dis_uuids {
    use uuid::Uuid;
    /// Firmware Revision String, the application version
    pub const FIRMWARE_REVISION: Uuid = Uuid::from_u128(0x00002A26_0000_1000_8000_00805F9B34FB);
    /// Hardware Revision String
    pub const HARDWARE_REVISION: Uuid = Uuid::from_u128(0x00002A27_0000_1000_8000_00805F9B34FB);
    /// Software Revision String, the bootloader version
    pub const SOFTWARE_REVISION: Uuid = Uuid::from_u128(0x00002A28_0000_1000_8000_00805F9B34FB);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared by every handle to the same peripheral
#[derive(Default)]
struct PeripheralShared {
    connecting: AtomicBool,
    information: Mutex<Option<DeviceInformation>>,
}

type Registry = Arc<Mutex<HashMap<PeripheralId, Arc<PeripheralShared>>>>;

pub struct BtleplugManager {
    adapter: Adapter,
    registry: Registry,
    forgotten: broadcast::Sender<PeripheralId>,
    command_characteristic: Option<Uuid>,
}

impl BtleplugManager {
    /// Use the adapter at `index`, writing ring commands to `command_characteristic`
    pub async fn new(index: usize, command_characteristic: Option<Uuid>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow!("No Bluetooth adapter found at index {}", index))?;
        log::debug!("Using adapter {}", adapter.adapter_info().await?);
        let (forgotten, _) = broadcast::channel(8);
        Ok(BtleplugManager { adapter, registry: Registry::default(), forgotten, command_characteristic })
    }

    /// Bond removal is not observable through btleplug, the host reports it
    /// through this sender instead
    pub fn forgotten_sender(&self) -> broadcast::Sender<PeripheralId> {
        self.forgotten.clone()
    }
}

impl CentralManager for BtleplugManager {
    type Central = BtleplugCentral;

    async fn session(&self) -> Result<BtleplugCentral> {
        Ok(BtleplugCentral {
            adapter: self.adapter.clone(),
            registry: self.registry.clone(),
            forgotten: self.forgotten.clone(),
            command_characteristic: self.command_characteristic,
            scanning: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        })
    }
}

struct PendingConnect {
    id: PeripheralId,
    task: AbortHandle,
    shared: Arc<PeripheralShared>,
}

impl PendingConnect {
    fn cancel(self) {
        self.task.abort();
        self.shared.connecting.store(false, Ordering::SeqCst);
    }
}

pub struct BtleplugCentral {
    adapter: Adapter,
    registry: Registry,
    forgotten: broadcast::Sender<PeripheralId>,
    command_characteristic: Option<Uuid>,
    scanning: AtomicBool,
    pending: Mutex<Vec<PendingConnect>>,
}

impl BtleplugCentral {
    /// Scan for a peripheral by identifier, address or advertised name
    pub async fn find(&self, target: &str, pb: &ProgressBar) -> Result<BtleplugPeripheral> {
        let address = BDAddr::from_str(target).ok();
        let matches = |id: &BleId, props: &PeripheralProperties| {
            id.to_string() == target
                || address.is_some_and(|addr| addr == props.address)
                || props.local_name.as_deref() == Some(target)
        };

        for peripheral in self.adapter.peripherals().await? {
            if let Some(properties) = peripheral.properties().await? {
                if matches(&peripheral.id(), &properties) {
                    return Ok(self.wrap(peripheral));
                }
            }
        }

        let mut events = self.adapter.events().await?;
        self.start_scan().await?;
        while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceDiscovered(id) = event {
                let peripheral = self.adapter.peripheral(&id).await?;
                if let Some(properties) = peripheral.properties().await? {
                    pb.set_message(format_peripheral_properties(&properties));
                    if matches(&id, &properties) {
                        self.stop_scan().await?;
                        return Ok(self.wrap(peripheral));
                    }
                }
            }
        }
        Err(anyhow!("Scanning stopped unexpectedly"))
    }

    fn wrap(&self, peripheral: BlePeripheral) -> BtleplugPeripheral {
        let id = PeripheralId::from(peripheral.id().to_string());
        let shared = lock(&self.registry).entry(id.clone()).or_default().clone();
        BtleplugPeripheral { id, peripheral, shared, command_characteristic: self.command_characteristic }
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        for pending in lock(&self.pending).drain(..) {
            pending.cancel();
        }
        if self.scanning.load(Ordering::SeqCst) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let adapter = self.adapter.clone();
                runtime.spawn(async move {
                    if let Err(err) = adapter.stop_scan().await {
                        log::warn!("Failed to stop scan: {}", err);
                    }
                });
            }
        }
    }
}

fn format_peripheral_properties(properties: &PeripheralProperties) -> String {
    let name = properties.local_name.as_deref().unwrap_or("None");
    let addr = properties.address;
    let rssi = properties.rssi.unwrap_or(-99);
    format!("rssi: {}, address: {}, name: {}", rssi, addr, name)
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::Unknown => AdapterState::Unknown,
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
    }
}

impl Central for BtleplugCentral {
    type Peripheral = BtleplugPeripheral;

    async fn state(&self) -> Result<AdapterState> {
        Ok(adapter_state(self.adapter.adapter_state().await?))
    }

    async fn events(&self) -> Result<BoxStream<'static, CentralEvent>> {
        let adapter = self.adapter.clone();
        let adapter_events = self.adapter.events().await?.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    AdapterEvent::StateUpdate(state) => Some(CentralEvent::StateChanged(adapter_state(state))),
                    // btleplug does not expose solicited service UUIDs, advertised
                    // services stand in for them
                    AdapterEvent::ServicesAdvertisement { id, services } => {
                        Some(CentralEvent::Discovered(Advertisement { id: id.to_string().into(), solicited_services: services }))
                    }
                    AdapterEvent::DeviceDiscovered(id) => {
                        let properties = adapter.peripheral(&id).await.ok()?.properties().await.ok()??;
                        Some(CentralEvent::Discovered(Advertisement {
                            id: id.to_string().into(),
                            solicited_services: properties.services,
                        }))
                    }
                    _ => None,
                }
            }
        });

        let forgotten = stream::unfold(self.forgotten.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(id) => return Some((CentralEvent::PeripheralForgotten(id), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::select(adapter_events, forgotten).boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<BtleplugPeripheral> {
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| anyhow!("Unknown peripheral {}", id))?;
        Ok(self.wrap(peripheral))
    }

    async fn connected_peripherals(&self) -> Result<Vec<BtleplugPeripheral>> {
        let mut connected = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.is_connected().await? {
                connected.push(self.wrap(peripheral));
            }
        }
        Ok(connected)
    }

    async fn connect(&self, peripheral: &BtleplugPeripheral) -> Result<()> {
        let shared = peripheral.shared.clone();
        shared.connecting.store(true, Ordering::SeqCst);
        let target = peripheral.peripheral.clone();
        let id = peripheral.id.clone();
        let task = tokio::spawn({
            let shared = shared.clone();
            let id = id.clone();
            async move {
                let result = async {
                    target.connect().await?;
                    target.discover_services().await
                }
                .await;
                shared.connecting.store(false, Ordering::SeqCst);
                if let Err(err) = result {
                    log::warn!("Connecting to {} failed: {}", id, err);
                }
            }
        });

        let mut pending = lock(&self.pending);
        pending.retain(|p| !p.task.is_finished());
        pending.push(PendingConnect { id, task: task.abort_handle(), shared });
        Ok(())
    }

    async fn cancel_connection(&self, peripheral: &BtleplugPeripheral) -> Result<()> {
        let cancelled: Vec<PendingConnect> = {
            let mut pending = lock(&self.pending);
            let (cancelled, kept) = pending.drain(..).partition(|p| p.id == peripheral.id);
            *pending = kept;
            cancelled
        };
        cancelled.into_iter().for_each(PendingConnect::cancel);
        peripheral.peripheral.disconnect().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct BtleplugPeripheral {
    id: PeripheralId,
    peripheral: BlePeripheral,
    shared: Arc<PeripheralShared>,
    command_characteristic: Option<Uuid>,
}

impl BtleplugPeripheral {
    fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
    }

    async fn read_string(&self, uuid: Uuid) -> Result<Option<String>> {
        let Some(char) = self.characteristic(uuid) else {
            return Ok(None);
        };
        let value = self.peripheral.read(&char).await?;
        Ok(Some(String::from_utf8_lossy(&value).trim_end_matches('\0').trim().to_string()))
    }
}

impl Peripheral for BtleplugPeripheral {
    fn id(&self) -> PeripheralId {
        self.id.clone()
    }

    async fn connection_state(&self) -> Result<ConnectionState> {
        if self.shared.connecting.load(Ordering::SeqCst) {
            return Ok(ConnectionState::Connecting);
        }
        Ok(if self.peripheral.is_connected().await? {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        })
    }

    /// Bonding is handled by the system, a connection with a discovered
    /// GATT table is the closest observable state
    async fn is_paired(&self) -> Result<bool> {
        Ok(self.peripheral.is_connected().await? && !self.peripheral.characteristics().is_empty())
    }

    async fn write_command(&self, command: PeripheralCommand) -> Result<()> {
        let uuid = self
            .command_characteristic
            .ok_or_else(|| anyhow!("No command characteristic configured"))?;
        let char = self
            .characteristic(uuid)
            .ok_or_else(|| anyhow!("{} has no command characteristic {}", self.id, uuid))?;
        log::debug!("Writing {:?} to {}", command, self.id);
        self.peripheral.write(&char, &command.encode(), WriteType::WithResponse).await?;
        Ok(())
    }

    async fn device_information(&self) -> Result<DeviceInformation> {
        if let Some(information) = lock(&self.shared.information).clone() {
            return Ok(information);
        }
        if self.peripheral.characteristics().is_empty() {
            self.peripheral.discover_services().await?;
        }
        let hardware = self.read_string(dis_uuids::HARDWARE_REVISION).await?;
        let information = DeviceInformation {
            application_version: self.read_string(dis_uuids::FIRMWARE_REVISION).await?,
            bootloader_version: self.read_string(dis_uuids::SOFTWARE_REVISION).await?,
            hardware_version: hardware.as_deref().and_then(HardwareVersion::from_revision),
        };
        log::debug!("{} device information: {:?}", self.id, information);
        *lock(&self.shared.information) = Some(information.clone());
        Ok(information)
    }

    fn invalidate_device_information(&self) {
        lock(&self.shared.information).take();
    }
}

pub struct BtleplugDfuTransport {
    peripheral: BlePeripheral,
    notifications: tokio::sync::Mutex<BoxStream<'static, ValueNotification>>,
}

impl BtleplugDfuTransport {
    /// Connect to a bootloader and check it offers `service`
    async fn connect(peripheral: &BlePeripheral, service: Uuid) -> Result<Self> {
        if !peripheral.is_connected().await? {
            peripheral.connect().await.context("Failed to establish a connection")?;
        }
        peripheral.discover_services().await.context("Service discovery failed")?;
        anyhow::ensure!(
            peripheral.services().iter().any(|s| s.uuid == service),
            "bootloader does not offer service {}",
            service
        );
        let notifications = peripheral.notifications().await?;
        Ok(BtleplugDfuTransport { peripheral: peripheral.clone(), notifications: tokio::sync::Mutex::new(notifications) })
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        for char in self.peripheral.characteristics() {
            if uuid == char.uuid {
                return Ok(char);
            }
        }
        Err(anyhow!("characteristic {} not found", uuid))
    }
}

impl DfuTransport for BtleplugDfuTransport {
    async fn write(&self, char: Uuid, bytes: &[u8]) -> Result<()> {
        let char = self.characteristic(char)?;
        self.peripheral.write(&char, bytes, WriteType::WithoutResponse).await?;
        Ok(())
    }

    async fn command(&self, char: Uuid, bytes: &[u8]) -> Result<()> {
        let char = self.characteristic(char)?;
        self.peripheral.write(&char, bytes, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn subscribe(&self, char: Uuid) -> Result<()> {
        let char = self.characteristic(char)?;
        self.peripheral.subscribe(&char).await?;
        Ok(())
    }

    async fn notification(&self, char: Uuid) -> Result<Vec<u8>> {
        let mut notifications = self.notifications.lock().await;
        while let Some(ntf) = notifications.next().await {
            if ntf.uuid == char {
                return Ok(ntf.value);
            }
        }
        Err(anyhow!("Notifications stopped unexpectedly"))
    }
}

impl TransferEngine<BtleplugCentral> for LegacyDfuEngine {
    fn start(
        &self,
        _central: &BtleplugCentral,
        peripheral: &BtleplugPeripheral,
        request: TransferRequest,
    ) -> Result<TransferHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = *self;
        let target = peripheral.peripheral.clone();
        let task = tokio::spawn(async move {
            let _ = tx.send(TransferEvent::StateChanged(TransferState::Connecting));
            match BtleplugDfuTransport::connect(&target, request.service).await {
                Ok(transport) => engine.run(&transport, &request, &tx).await,
                Err(err) => {
                    let _ = tx.send(TransferEvent::Failed { code: -1, message: format!("{:#}", err) });
                }
            }
            if let Err(err) = target.disconnect().await {
                log::debug!("Disconnect after DFU: {}", err);
            }
        });
        Ok(TransferHandle::new(rx, Some(task.abort_handle())))
    }
}
