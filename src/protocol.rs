//! Nordic legacy DFU, as spoken by the ring bootloaders.

use crate::package::{ComponentKind, PackageComponent};
use crate::transport::{DfuTransport, InitPacketMode, TransferEvent, TransferRequest, TransferState};

use anyhow::{Context, Result, anyhow};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

// As defined in nRF51_SDK_10.0.0/components/libraries/bootloader_dfu/ble_dfu.h

const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// DFU image types, as a bit field
#[derive(Debug, Copy, Clone, IntoPrimitive)]
#[repr(u8)]
enum ImageType {
    Softdevice = 0x01,
    Bootloader = 0x02,
    Application = 0x04,
}

impl ImageType {
    /// Position of this image's size in the start packet
    fn size_slot(self) -> usize {
        match self {
            ImageType::Softdevice => 0,
            ImageType::Bootloader => 1,
            ImageType::Application => 2,
        }
    }
}

impl From<ComponentKind> for ImageType {
    fn from(kind: ComponentKind) -> Self {
        match kind {
            ComponentKind::Application => ImageType::Application,
            ComponentKind::Bootloader => ImageType::Bootloader,
            ComponentKind::Softdevice => ImageType::Softdevice,
        }
    }
}

/// DFU Control Point opcodes
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum OpCode {
    StartDfu = 0x01,
    InitDfuParams = 0x02,
    ReceiveFirmwareImage = 0x03,
    ValidateFirmware = 0x04,
    ActivateAndReset = 0x05,
    Reset = 0x06,
    PacketReceiptNotifRequest = 0x08,
    Response = 0x10,
    PacketReceiptNotif = 0x11,
}

/// Init packet transfer steps of `InitDfuParams`
#[derive(Debug, Copy, Clone, IntoPrimitive)]
#[repr(u8)]
enum InitPacketStep {
    Receive = 0x00,
    Complete = 0x01,
}

/// DFU Response codes
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    #[error("success (not an error)")]
    Success = 0x01,
    #[error("invalid state")]
    InvalidState = 0x02,
    #[error("operation not supported")]
    NotSupported = 0x03,
    #[error("data size exceeds limit")]
    DataSizeExceedsLimit = 0x04,
    #[error("CRC error")]
    CrcError = 0x05,
    #[error("operation failed")]
    OperationFailed = 0x06,
}

/// Engine error code of a failed transfer: the bootloader's response code
/// if it rejected a request, otherwise -1
pub fn error_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ResponseCode>().map_or(-1, |code| *code as i32)
}

/// Firmware image ready to transfer
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FirmwareImage {
    pub kind: ComponentKind,
    pub data: Vec<u8>,
    pub init_packet: Option<Vec<u8>>,
}

impl FirmwareImage {
    /// Read a component's files, converting Intel HEX data to a binary image
    pub async fn load(component: &PackageComponent) -> Result<Self> {
        let raw = tokio::fs::read(&component.data)
            .await
            .with_context(|| format!("reading {}", component.data.display()))?;
        let is_hex = component
            .data
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("hex"));
        let data = if is_hex {
            hex_to_bin(std::str::from_utf8(&raw)?).with_context(|| format!("parsing {}", component.data.display()))?
        } else {
            raw
        };
        let init_packet = match &component.metadata {
            Some(path) => Some(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
            ),
            None => None,
        };
        Ok(FirmwareImage { kind: component.kind, data, init_packet })
    }
}

/// Start of the nRF51 UICR/FICR registers. Bootloader hex files carry the
/// UICR bootloader address here, it is not part of the image.
const UICR_BASE: u32 = 0x1000_0000;

/// Convert Intel HEX records to a binary image starting at the lowest
/// address, filling gaps with 0xFF. Records at or above `UICR_BASE` are
/// dropped.
pub fn hex_to_bin(text: &str) -> Result<Vec<u8>> {
    let mut base: u32 = 0;
    let mut start: Option<u32> = None;
    let mut image: Vec<u8> = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let number = index + 1;
        let record = line
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("line {}: missing start code", number))?;
        let bytes = decode_hex(record).with_context(|| format!("line {}", number))?;
        anyhow::ensure!(
            bytes.len() >= 5 && bytes.len() == bytes[0] as usize + 5,
            "line {}: invalid record length",
            number
        );
        let checksum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        anyhow::ensure!(checksum == 0, "line {}: checksum mismatch", number);

        let offset = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
        let data = &bytes[4..bytes.len() - 1];
        match bytes[3] {
            0x00 => {
                let address = base + offset;
                if address >= UICR_BASE {
                    log::debug!("Skipping {} bytes at {:#x}", data.len(), address);
                    continue;
                }
                let start = *start.get_or_insert(address);
                anyhow::ensure!(address >= start, "line {}: data below image start {:#x}", number, start);
                let at = (address - start) as usize;
                if image.len() < at + data.len() {
                    image.resize(at + data.len(), 0xFF);
                }
                image[at..at + data.len()].copy_from_slice(data);
            }
            0x01 => break,
            0x02 | 0x04 => {
                anyhow::ensure!(data.len() == 2, "line {}: invalid address record", number);
                let value = u16::from_be_bytes([data[0], data[1]]) as u32;
                base = if bytes[3] == 0x02 { value << 4 } else { value << 16 };
            }
            // start address records do not affect the image
            0x03 | 0x05 => {}
            other => anyhow::bail!("line {}: unknown record type {:#04x}", number, other),
        }
    }
    Ok(image)
}

fn decode_hex(record: &str) -> Result<Vec<u8>> {
    anyhow::ensure!(record.is_ascii() && record.len() % 2 == 0, "invalid hex digits");
    (0..record.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&record[i..i + 2], 16).map_err(Into::into))
        .collect()
}

struct DfuTarget<'a, T: DfuTransport> {
    transport: &'a T,
    control_point: Uuid,
    packet: Uuid,
    packet_size: usize,
    events: &'a mpsc::UnboundedSender<TransferEvent>,
}

impl<T: DfuTransport> DfuTarget<'_, T> {
    fn verify_response(req_opcode: OpCode, bytes: &[u8]) -> Result<()> {
        fn inner(req_opcode: OpCode, bytes: &[u8]) -> Result<()> {
            anyhow::ensure!(bytes.len() >= 3, "invalid response, too short ({:x?})", bytes);
            anyhow::ensure!(bytes[0] == OpCode::Response as u8, "invalid response ({:x?})", bytes);
            anyhow::ensure!(bytes[1] == req_opcode as u8, "invalid request opcode ({:x?})", bytes);
            let result = ResponseCode::try_from(bytes[2])?;
            if result != ResponseCode::Success {
                anyhow::bail!(result);
            }
            anyhow::Ok(())
        }
        inner(req_opcode, bytes).context(format!("{:?} failed", req_opcode))
    }

    fn report(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    fn state(&self, state: TransferState) {
        log::debug!("DFU state {:?}", state);
        self.report(TransferEvent::StateChanged(state));
    }

    async fn write_data(&self, bytes: &[u8]) -> Result<()> {
        let write = self.transport.write(self.packet, bytes);
        timeout(WRITE_TIMEOUT, write).await?
    }

    async fn send_ctrl(&self, bytes: &[u8]) -> Result<()> {
        let command = self.transport.command(self.control_point, bytes);
        timeout(WRITE_TIMEOUT, command).await?
    }

    async fn next_notification(&self, waiting_for: OpCode) -> Result<Vec<u8>> {
        timeout(RESPONSE_TIMEOUT, self.transport.notification(self.control_point))
            .await
            .map_err(|_| anyhow!("no response to {:?}", waiting_for))?
    }

    /// Wait for the response to `opcode`, skipping packet receipts
    async fn response(&self, opcode: OpCode) -> Result<()> {
        loop {
            let bytes = self.next_notification(opcode).await?;
            if bytes.first() == Some(&(OpCode::PacketReceiptNotif as u8)) {
                continue;
            }
            return Self::verify_response(opcode, &bytes);
        }
    }

    /// Bytes received by the bootloader, from a packet receipt notification
    async fn receipt(&self) -> Result<usize> {
        let bytes = self.next_notification(OpCode::PacketReceiptNotif).await?;
        if bytes.first() == Some(&(OpCode::Response as u8)) {
            Self::verify_response(OpCode::ReceiveFirmwareImage, &bytes)?;
            anyhow::bail!("image accepted before it was sent completely");
        }
        anyhow::ensure!(
            bytes.len() >= 5 && bytes[0] == OpCode::PacketReceiptNotif as u8,
            "invalid packet receipt ({:x?})",
            bytes
        );
        Ok(u32::from_le_bytes(bytes[1..5].try_into()?) as usize)
    }

    async fn start_dfu(&self, image: &FirmwareImage) -> Result<()> {
        let image_type = ImageType::from(image.kind);
        self.send_ctrl(&[OpCode::StartDfu as u8, image_type.into()]).await?;

        let mut sizes = [0u32; 3];
        sizes[image_type.size_slot()] = image.data.len() as u32;
        let payload: Vec<u8> = sizes.iter().flat_map(|size| size.to_le_bytes()).collect();
        self.write_data(&payload).await?;
        self.response(OpCode::StartDfu).await
    }

    async fn send_init_packet(&self, init_packet: &[u8]) -> Result<()> {
        let opcode = OpCode::InitDfuParams;
        self.send_ctrl(&[opcode as u8, InitPacketStep::Receive.into()]).await?;
        for chunk in init_packet.chunks(self.packet_size) {
            self.write_data(chunk).await?;
        }
        self.send_ctrl(&[opcode as u8, InitPacketStep::Complete.into()]).await?;
        self.response(opcode).await
    }

    async fn set_prn(&self, interval: u16) -> Result<()> {
        let mut payload: Vec<u8> = vec![OpCode::PacketReceiptNotifRequest as u8];
        payload.extend_from_slice(&interval.to_le_bytes());
        self.send_ctrl(&payload).await
    }

    async fn upload(&self, data: &[u8], prn: u16) -> Result<()> {
        self.send_ctrl(&[OpCode::ReceiveFirmwareImage as u8]).await?;

        let mut sent = 0;
        let mut progress = 0;
        self.report(TransferEvent::Progress(0));
        for (index, chunk) in data.chunks(self.packet_size).enumerate() {
            self.write_data(chunk).await?;
            sent += chunk.len();
            if prn > 0 && (index + 1) % prn as usize == 0 && sent < data.len() {
                let received = self.receipt().await?;
                anyhow::ensure!(received == sent, "bootloader received {} of {} bytes", received, sent);
            }
            let current = (sent * 100 / data.len()) as u8;
            if current != progress {
                progress = current;
                self.report(TransferEvent::Progress(current));
            }
        }
        self.response(OpCode::ReceiveFirmwareImage).await
    }

    async fn validate(&self) -> Result<()> {
        self.send_ctrl(&[OpCode::ValidateFirmware as u8]).await?;
        self.response(OpCode::ValidateFirmware).await
    }
}

/// Run DFU procedure as specified in
/// [Legacy DFU Protocol](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v11.0.0/bledfu_transport_bleprofile.html)
pub async fn dfu_run<T: DfuTransport>(
    transport: &T,
    request: &TransferRequest,
    image: &FirmwareImage,
    packet_size: usize,
    events: &mpsc::UnboundedSender<TransferEvent>,
) -> Result<()> {
    anyhow::ensure!(!image.data.is_empty(), "{:?} image is empty", image.kind);
    let init_packet = match (&image.init_packet, request.init_packet) {
        (Some(init_packet), _) => Some(init_packet.as_slice()),
        (None, InitPacketMode::Optional) => None,
        (None, InitPacketMode::WithoutVersion) => anyhow::bail!("{:?} image has no init packet", image.kind),
    };
    if request.read_dfu_version {
        log::warn!("Reading the DFU version is not supported, assuming a legacy bootloader");
    }

    let target = DfuTarget {
        transport,
        control_point: request.control_point.unwrap_or(dfu_uuids::CTRL_PT),
        packet: request.packet.unwrap_or(dfu_uuids::DATA_PT),
        packet_size: packet_size.max(1),
        events,
    };
    target.state(TransferState::Starting);
    transport.subscribe(target.control_point).await?;

    let result = async {
        target.state(TransferState::EnablingDfuMode);
        target.start_dfu(image).await?;
        if let Some(init_packet) = init_packet {
            target.send_init_packet(init_packet).await?;
        }
        let prn = request.packet_receipt_notification_interval;
        if prn > 0 {
            target.set_prn(prn).await?;
        }

        target.state(TransferState::Uploading);
        target.upload(&image.data, prn).await?;
        target.state(TransferState::Validating);
        target.validate().await?;

        target.state(TransferState::Disconnecting);
        // the bootloader resets without acknowledging
        if let Err(err) = target.send_ctrl(&[OpCode::ActivateAndReset as u8]).await {
            log::debug!("Activate and reset: {:#}", err);
        }
        anyhow::Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            target.state(TransferState::Completed);
            Ok(())
        }
        Err(err) => {
            if target.send_ctrl(&[OpCode::Reset as u8]).await.is_err() {
                log::debug!("Reset after failed DFU was not acknowledged");
            }
            target.state(TransferState::Aborted);
            Err(err)
        }
    }
}

/// Legacy DFU transfer engine
#[derive(Debug, Copy, Clone)]
pub struct LegacyDfuEngine {
    packet_size: usize,
}

impl LegacyDfuEngine {
    pub fn new(packet_size: usize) -> Self {
        LegacyDfuEngine { packet_size }
    }

    /// Transfer `request`'s component over `transport`, finishing with a
    /// completed or failed event
    pub async fn run<T: DfuTransport>(
        &self,
        transport: &T,
        request: &TransferRequest,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) {
        let result = async {
            let image = FirmwareImage::load(&request.component).await?;
            log::info!("Uploading {} byte {:?} image", image.data.len(), image.kind);
            dfu_run(transport, request, &image, self.packet_size, events).await
        }
        .await;

        let event = match result {
            Ok(()) => TransferEvent::Completed,
            Err(err) => TransferEvent::Failed { code: error_code(&err), message: format!("{:#}", err) },
        };
        let _ = events.send(event);
    }
}

/// Legacy DFU characteristic UUIDs, used unless a transfer names its own
///
/// from [DFU BLE Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v11.0.0/bledfu_transport_bleservice.html)
mod dfu_uuids {
    use uuid::Uuid;
    /// DFU Control Point Characteristic
    pub const CTRL_PT: Uuid = Uuid::from_u128(0x00001531_1212_EFDE_1523_785FEABCD123);
    /// DFU Packet Characteristic
    pub const DATA_PT: Uuid = Uuid::from_u128(0x00001532_1212_EFDE_1523_785FEABCD123);
}
