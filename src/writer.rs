use crate::error::{DfuError, Result};
use crate::features::WriterNotificationMode;
use crate::hardware::HardwareVersion;
use crate::package::PackageComponent;
use crate::scanner::Scanner;
use crate::state::{ActivityReason, State, StateSender, WriteProgress};
use crate::transport::{
    CentralManager, InitPacketMode, PeripheralId, TransferEngine, TransferEvent, TransferHandle, TransferRequest,
};

use std::time::Duration;
use tokio::time::{sleep, timeout};

const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
/// Bootloaders reject transfers started immediately after they advertise
const START_DELAY: Duration = Duration::from_secs(3);

/// Writes one package component to a ring in bootloader mode
pub struct Writer<'a, M, E> {
    manager: &'a M,
    engine: &'a E,
    component: &'a PackageComponent,
    notification_mode: WriterNotificationMode,
    hardware_version: HardwareVersion,
}

/// Adapter session and engine of a running transfer. Both are released
/// when the session drops.
struct WriteSession<C> {
    _central: C,
    transfer: TransferHandle,
}

impl<'a, M, E> Writer<'a, M, E>
where
    M: CentralManager,
    E: TransferEngine<M::Central>,
{
    pub fn new(
        manager: &'a M,
        engine: &'a E,
        component: &'a PackageComponent,
        notification_mode: WriterNotificationMode,
        hardware_version: HardwareVersion,
    ) -> Self {
        Writer { manager, engine, component, notification_mode, hardware_version }
    }

    /// Transfer settings for this component and hardware.
    ///
    /// The rings cannot report their DFU version, so instead of asking the
    /// init packet handling is picked from the notification mode.
    pub fn request(&self) -> TransferRequest {
        TransferRequest {
            component: self.component.clone(),
            service: self.hardware_version.bootloader_service(),
            control_point: self.hardware_version.control_point(),
            packet: self.hardware_version.packet(),
            packet_receipt_notification_interval: self.notification_mode.packets_notification_interval(),
            init_packet: match self.notification_mode {
                WriterNotificationMode::Fast => InitPacketMode::WithoutVersion,
                WriterNotificationMode::Safe => InitPacketMode::Optional,
            },
            read_dfu_version: false,
        }
    }

    /// Find the bootloader and run the transfer, reporting progress as write
    /// `index` of `count`
    pub async fn write(
        &self,
        bootloader_identifier: Option<&PeripheralId>,
        index: usize,
        count: usize,
        states: &StateSender,
    ) -> Result<()> {
        states.send(State::Activity(ActivityReason::WaitingForWriteStart));

        let scanner = Scanner::new(bootloader_identifier.cloned());
        let (central, peripheral) = timeout(SCAN_TIMEOUT, scanner.scan(self.manager))
            .await
            .map_err(|_| DfuError::ScanningTimeout)??;
        sleep(START_DELAY).await;

        let request = self.request();
        log::info!(
            "Writing {:?} {} with service {}, control point {:?}, packet {:?}, notification interval {}",
            self.component.kind,
            self.component.version,
            request.service,
            request.control_point,
            request.packet,
            request.packet_receipt_notification_interval
        );
        let transfer = self.engine.start(&central, &peripheral, request)?;
        let mut session = WriteSession { _central: central, transfer };

        while let Some(event) = session.transfer.next_event().await {
            match event {
                TransferEvent::StateChanged(state) => log::debug!("Writer state changed to {:?}", state),
                TransferEvent::Progress(progress) => states.send(progress_state(progress, index, count)),
                TransferEvent::Completed => {
                    log::info!("Completed DFU write of {:?}", self.component.kind);
                    return Ok(());
                }
                TransferEvent::Failed { code, message } => return Err(DfuError::Transfer { code, message }),
            }
        }
        Err(DfuError::Transfer { code: -1, message: "transfer engine stopped unexpectedly".into() })
    }
}

fn progress_state(progress: u8, index: usize, count: usize) -> State {
    if progress > 99 {
        State::Activity(ActivityReason::WriteCompleted)
    } else {
        State::Writing(WriteProgress { progress, index, count })
    }
}
