//! Turns a package and a ring into the ordered phases of an update, and runs them.

use crate::central::{
    RepeatedWrite, forget_this_device, reconnect, repeatedly_write, scan_and_pair, wait_for_bluetooth_toggle,
};
use crate::error::{DfuError, Result};
use crate::features::FirmwareFeatures;
use crate::hardware::HardwareVersion;
use crate::host::DfuDelegate;
use crate::package::{Package, PackageComponent};
use crate::sender::{BootloaderSender, ForgetThisDeviceSender, WriteSender};
use crate::state::StateSender;
use crate::transport::{CentralManager, Peripheral, PeripheralId, PeripheralOf, TransferEngine};
use crate::version::implied_bootloader_version;
use crate::writer::Writer;

use anyhow::anyhow;

/// What a DFU session updates
#[derive(Debug, Clone)]
pub enum DfuMode<P> {
    /// A ring running its application firmware
    Peripheral(P),
    /// A ring stuck in bootloader mode, known only by identifier
    Recovery { identifier: PeripheralId, hardware_version: HardwareVersion },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendStrategy {
    /// Write the enter-bootloader command
    Write,
    /// Have the user forget the ring
    ForgetThisDevice,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReconnectStrategy {
    /// Wait for the bonded ring to reconnect, then write until it reboots
    RepeatedWrite,
    /// Pair again, then have the user forget the ring
    PairAndForget,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WriteStep {
    pub component: PackageComponent,
    pub index: usize,
    pub count: usize,
    /// Additional attempts after a failed write
    pub retries: u32,
    /// Only accept a bootloader advertising with this identifier
    pub bootloader_identifier: Option<PeripheralId>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Phase {
    SendToBootloader(SendStrategy),
    Write(WriteStep),
    /// Bring the ring back into bootloader mode after its bootloader was replaced
    Reconnect(ReconnectStrategy),
    /// Wait for the user to power cycle Bluetooth
    ToggleBluetooth,
}

impl<P: Peripheral> DfuMode<P> {
    pub fn peripheral(&self) -> Option<&P> {
        match self {
            DfuMode::Peripheral(peripheral) => Some(peripheral),
            DfuMode::Recovery { .. } => None,
        }
    }

    pub fn peripheral_identifier(&self) -> Option<PeripheralId> {
        self.peripheral().map(Peripheral::id)
    }

    /// Identifier the bootloader is expected to advertise under, if known
    pub fn bootloader_identifier(&self) -> Option<&PeripheralId> {
        match self {
            DfuMode::Peripheral(_) => None,
            DfuMode::Recovery { identifier, .. } => Some(identifier),
        }
    }

    pub async fn firmware_features(&self) -> Result<FirmwareFeatures> {
        match self {
            DfuMode::Peripheral(peripheral) => {
                let info = peripheral.device_information().await?;
                let application = info.application_version.ok_or(DfuError::UnknownApplicationVersion)?;
                let bootloader = match info.bootloader_version {
                    Some(bootloader) => bootloader,
                    None => implied_bootloader_version(&application)?.to_owned(),
                };
                log::info!("Peripheral versions: application {}, bootloader {}", application, bootloader);
                Ok(FirmwareFeatures::new(&application, &bootloader))
            }
            DfuMode::Recovery { hardware_version, .. } => Ok(FirmwareFeatures::recovery(*hardware_version)),
        }
    }

    pub async fn hardware_version(&self) -> Result<HardwareVersion> {
        match self {
            DfuMode::Peripheral(peripheral) => {
                let info = peripheral.device_information().await?;
                info.hardware_version.ok_or_else(|| DfuError::UnknownHardwareVersion {
                    application: info.application_version.unwrap_or_else(|| "Empty".into()),
                })
            }
            DfuMode::Recovery { hardware_version, .. } => Ok(*hardware_version),
        }
    }

    /// Phases, in order, to write `package`
    pub fn phases(&self, package: &Package, features: &FirmwareFeatures, hardware: HardwareVersion) -> Vec<Phase> {
        let count = package.write_count();
        let recovery = matches!(self, DfuMode::Recovery { .. });
        let mut phases = Vec::new();

        if !recovery {
            phases.push(Phase::SendToBootloader(if features.maintains_bond_data {
                SendStrategy::Write
            } else {
                SendStrategy::ForgetThisDevice
            }));
        }

        if let Some(bootloader) = &package.bootloader {
            phases.push(Phase::Write(WriteStep {
                component: bootloader.clone(),
                index: 0,
                count,
                retries: 0,
                bootloader_identifier: self.bootloader_identifier().cloned(),
            }));
            if !recovery {
                if features.maintains_bond_data {
                    phases.push(Phase::Reconnect(ReconnectStrategy::RepeatedWrite));
                } else {
                    // the identifier does not change, so the system's cache has to be cleared by hand
                    if !features.changes_identifier_in_bootloader_mode {
                        phases.push(Phase::ToggleBluetooth);
                    }
                    phases.push(Phase::Reconnect(ReconnectStrategy::PairAndForget));
                }
            }
        }

        phases.push(Phase::Write(WriteStep {
            component: package.application.clone(),
            index: count - 1,
            count,
            retries: hardware.write_retries(),
            bootloader_identifier: None,
        }));

        if features.modifies_services {
            phases.push(Phase::ToggleBluetooth);
        }
        phases
    }
}

/// Everything a plan needs from outside
pub struct DfuContext<'a, M, E, D> {
    pub manager: &'a M,
    pub engine: &'a E,
    pub delegate: &'a D,
}

impl<M, E, D> DfuContext<'_, M, E, D>
where
    M: CentralManager,
    E: TransferEngine<M::Central>,
    D: DfuDelegate,
{
    /// Derive the phases for `package` and run them in order, stopping at the first failure
    pub async fn perform(&self, mode: &DfuMode<PeripheralOf<M>>, package: &Package, states: &StateSender) -> Result<()> {
        let features = mode.firmware_features().await?;
        let hardware = mode.hardware_version().await?;
        let phases = mode.phases(package, &features, hardware);
        log::info!("Performing DFU on {} hardware with {} phases", hardware, phases.len());

        let mut interaction = InteractionGuard::new(self.delegate, mode.peripheral_identifier());
        for phase in &phases {
            log::debug!("Starting phase {:?}", phase);
            let result = self.run_phase(mode, phase, &features, hardware, states).await;
            if let Phase::SendToBootloader(_) = phase {
                interaction.disallow();
                if let Some(peripheral) = mode.peripheral() {
                    peripheral.invalidate_device_information();
                }
            }
            result?;
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        mode: &DfuMode<PeripheralOf<M>>,
        phase: &Phase,
        features: &FirmwareFeatures,
        hardware: HardwareVersion,
        states: &StateSender,
    ) -> Result<()> {
        match phase {
            Phase::SendToBootloader(strategy) => {
                let peripheral = require_peripheral(mode)?;
                match strategy {
                    SendStrategy::Write => WriteSender::new(peripheral).send(states).await,
                    SendStrategy::ForgetThisDevice => {
                        ForgetThisDeviceSender::new(true, peripheral, self.delegate).send(states).await
                    }
                }
            }
            Phase::Write(step) => self.write(step, features, hardware, states).await,
            Phase::Reconnect(strategy) => {
                let identifier = require_peripheral(mode)?.id();
                let central = self.manager.session().await?;
                match strategy {
                    ReconnectStrategy::RepeatedWrite => {
                        let peripheral = reconnect(&central, &identifier).await?;
                        repeatedly_write(&central, &peripheral, RepeatedWrite::default(), states).await
                    }
                    ReconnectStrategy::PairAndForget => {
                        let peripheral = scan_and_pair(&central, &identifier, states).await?;
                        forget_this_device(&central, &peripheral, states).await
                    }
                }
            }
            Phase::ToggleBluetooth => wait_for_bluetooth_toggle(self.manager, states).await,
        }
    }

    async fn write(
        &self,
        step: &WriteStep,
        features: &FirmwareFeatures,
        hardware: HardwareVersion,
        states: &StateSender,
    ) -> Result<()> {
        let writer = Writer::new(
            self.manager,
            self.engine,
            &step.component,
            features.writer_notification_mode,
            hardware,
        );
        let mut attempt = 0;
        loop {
            match writer.write(step.bootloader_identifier.as_ref(), step.index, step.count, states).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < step.retries => {
                    attempt += 1;
                    log::warn!("Write {} failed: {}, retrying ({}/{})", step.index, err, attempt, step.retries);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn require_peripheral<P: Peripheral>(mode: &DfuMode<P>) -> Result<&P> {
    mode.peripheral()
        .ok_or_else(|| anyhow!("phase requires a peripheral running its application").into())
}

/// Re-allows interaction with the ring when the plan ends, however it ends
struct InteractionGuard<'a, D: DfuDelegate> {
    delegate: &'a D,
    peripheral: Option<PeripheralId>,
    disallowed: bool,
}

impl<'a, D: DfuDelegate> InteractionGuard<'a, D> {
    fn new(delegate: &'a D, peripheral: Option<PeripheralId>) -> Self {
        InteractionGuard { delegate, peripheral, disallowed: false }
    }

    fn disallow(&mut self) {
        if let (Some(peripheral), false) = (&self.peripheral, self.disallowed) {
            self.delegate.set_interaction_allowed(false, peripheral);
            self.disallowed = true;
        }
    }
}

impl<D: DfuDelegate> Drop for InteractionGuard<'_, D> {
    fn drop(&mut self) {
        if let (Some(peripheral), true) = (&self.peripheral, self.disallowed) {
            self.delegate.set_interaction_allowed(true, peripheral);
        }
    }
}
