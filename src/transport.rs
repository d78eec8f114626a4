//! Interfaces to the Bluetooth stack and the firmware transfer engine.

use crate::hardware::HardwareVersion;
use crate::package::PackageComponent;
use crate::state::BatteryState;

use anyhow::Result;
use futures::stream::BoxStream;
use std::fmt;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Platform identifier of a peripheral
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        PeripheralId(id)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        PeripheralId(id.to_owned())
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Advertisement {
    pub id: PeripheralId,
    pub solicited_services: Vec<Uuid>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CentralEvent {
    StateChanged(AdapterState),
    Discovered(Advertisement),
    /// The user removed the peripheral's bond from the system settings
    PeripheralForgotten(PeripheralId),
}

/// Versions read from a peripheral's device information
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DeviceInformation {
    pub application_version: Option<String>,
    pub bootloader_version: Option<String>,
    pub hardware_version: Option<HardwareVersion>,
}

/// How long a ring stays in bootloader mode waiting for a transfer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum BootloaderTimeout {
    Seconds5 = 1,
    Seconds10 = 2,
    Seconds15 = 3,
    Seconds20 = 4,
    Seconds25 = 5,
    Seconds30 = 0,
    Seconds35 = 6,
    Seconds40 = 7,
}

impl BootloaderTimeout {
    pub fn from_seconds(seconds: u64) -> Option<Self> {
        Some(match seconds {
            5 => BootloaderTimeout::Seconds5,
            10 => BootloaderTimeout::Seconds10,
            15 => BootloaderTimeout::Seconds15,
            20 => BootloaderTimeout::Seconds20,
            25 => BootloaderTimeout::Seconds25,
            30 => BootloaderTimeout::Seconds30,
            35 => BootloaderTimeout::Seconds35,
            40 => BootloaderTimeout::Seconds40,
            _ => return None,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeripheralCommand {
    /// Reboot into bootloader mode
    EnterBootloader { timeout: BootloaderTimeout },
    /// Drop the ring's stored bonds
    ClearBond,
}

impl PeripheralCommand {
    /// Command characteristic payload: type, payload length, payload
    pub fn encode(self) -> Vec<u8> {
        match self {
            PeripheralCommand::EnterBootloader { timeout } => vec![0x03, 0x01, timeout as u8],
            PeripheralCommand::ClearBond => vec![0x05, 0x00],
        }
    }
}

/// A session with the Bluetooth adapter.
///
/// Dropping a session stops any scan it started and cancels its pending
/// connection attempts.
pub trait Central {
    type Peripheral: Peripheral;
    /// Current power state of the adapter
    async fn state(&self) -> Result<AdapterState>;
    /// Adapter events, starting from now
    async fn events(&self) -> Result<BoxStream<'static, CentralEvent>>;
    async fn start_scan(&self) -> Result<()>;
    async fn stop_scan(&self) -> Result<()>;
    async fn peripheral(&self, id: &PeripheralId) -> Result<Self::Peripheral>;
    /// Peripherals currently connected to the system
    async fn connected_peripherals(&self) -> Result<Vec<Self::Peripheral>>;
    /// Begin connecting, without waiting for the connection to complete
    async fn connect(&self, peripheral: &Self::Peripheral) -> Result<()>;
    async fn cancel_connection(&self, peripheral: &Self::Peripheral) -> Result<()>;
}

/// Creates independent adapter sessions
pub trait CentralManager {
    type Central: Central;
    async fn session(&self) -> Result<Self::Central>;
}

pub type PeripheralOf<M> = <<M as CentralManager>::Central as Central>::Peripheral;

pub trait Peripheral: Clone {
    fn id(&self) -> PeripheralId;
    async fn connection_state(&self) -> Result<ConnectionState>;
    async fn is_paired(&self) -> Result<bool>;
    async fn write_command(&self, command: PeripheralCommand) -> Result<()>;
    async fn device_information(&self) -> Result<DeviceInformation>;
    /// Forget cached device information, the versions change across an update
    fn invalidate_device_information(&self) {}
    /// Charge state of the ring, `None` if it cannot be observed
    fn battery_state(&self) -> Option<watch::Receiver<Option<BatteryState>>> {
        None
    }
}

/// GATT access used by the transfer engine
pub trait DfuTransport {
    /// Write without response
    async fn write(&self, char: Uuid, bytes: &[u8]) -> Result<()>;
    /// Write with response
    async fn command(&self, char: Uuid, bytes: &[u8]) -> Result<()>;
    /// Subscribe to the given characteristic
    async fn subscribe(&self, char: Uuid) -> Result<()>;
    /// Wait for the next notification on the given characteristic.
    ///
    /// Notifications received since subscribing are not lost.
    async fn notification(&self, char: Uuid) -> Result<Vec<u8>>;
    /// Write with response then wait for notification response
    async fn request(&self, char: Uuid, bytes: &[u8]) -> Result<Vec<u8>> {
        self.command(char, bytes).await?;
        self.notification(char).await
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InitPacketMode {
    /// Send the init packet without checking the bootloader's DFU version
    WithoutVersion,
    /// Proceed without an init packet if the component has none
    Optional,
}

/// Parameters for writing one package component
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub component: PackageComponent,
    /// Solicited service used to pick the target
    pub service: Uuid,
    /// `None` selects the engine's default characteristic
    pub control_point: Option<Uuid>,
    pub packet: Option<Uuid>,
    pub packet_receipt_notification_interval: u16,
    pub init_packet: InitPacketMode,
    /// Ask the bootloader for its DFU version before writing
    pub read_dfu_version: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferState {
    Connecting,
    Starting,
    EnablingDfuMode,
    Uploading,
    Validating,
    Disconnecting,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransferEvent {
    StateChanged(TransferState),
    /// Upload progress, 0 to 100
    Progress(u8),
    Completed,
    Failed { code: i32, message: String },
}

/// A running transfer. Dropping the handle releases the engine.
#[derive(Debug)]
pub struct TransferHandle {
    events: mpsc::UnboundedReceiver<TransferEvent>,
    task: Option<AbortHandle>,
}

impl TransferHandle {
    pub fn new(events: mpsc::UnboundedReceiver<TransferEvent>, task: Option<AbortHandle>) -> Self {
        TransferHandle { events, task }
    }

    /// `None` once the engine has gone away
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Black-box firmware transfer engine
pub trait TransferEngine<C: Central> {
    fn start(&self, central: &C, peripheral: &C::Peripheral, request: TransferRequest) -> Result<TransferHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootloader_timeouts_use_device_encoding() {
        assert_eq!(BootloaderTimeout::from_seconds(30), Some(BootloaderTimeout::Seconds30));
        assert_eq!(BootloaderTimeout::from_seconds(35), Some(BootloaderTimeout::Seconds35));
        assert_eq!(BootloaderTimeout::from_seconds(12), None);

        let command = PeripheralCommand::EnterBootloader { timeout: BootloaderTimeout::Seconds30 };
        assert_eq!(command.encode(), vec![0x03, 0x01, 0x00]);
        let command = PeripheralCommand::EnterBootloader { timeout: BootloaderTimeout::Seconds5 };
        assert_eq!(command.encode(), vec![0x03, 0x01, 0x01]);
        assert_eq!(PeripheralCommand::ClearBond.encode(), vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn dropping_a_transfer_handle_aborts_the_engine() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(std::future::pending::<()>());
        let handle = TransferHandle::new(rx, Some(task.abort_handle()));

        drop(handle);
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
