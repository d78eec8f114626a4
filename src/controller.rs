//! Top level of a DFU session.

use crate::error::{DfuError, Result};
use crate::gate::ConfirmationGate;
use crate::host::{DfuDelegate, PhoneBatteryStatus};
use crate::package::PackageSource;
use crate::planner::{DfuContext, DfuMode};
use crate::state::{ActivityReason, BatteryState, PhoneInChargerState, State, StateSender};
use crate::transport::{CentralManager, Peripheral, PeripheralOf, TransferEngine};

use std::sync::Mutex;
use tokio::sync::watch;

/// Runs one firmware update, from downloading the package to the last write.
///
/// A controller can be started once. The two charger confirmations are
/// made by the user while the session waits for them.
pub struct DfuController<M: CentralManager, E, D, S> {
    manager: M,
    engine: E,
    delegate: D,
    source: S,
    mode: Mutex<Option<DfuMode<PeripheralOf<M>>>>,
    phone_battery: Option<watch::Receiver<PhoneBatteryStatus>>,
    phone_gate: ConfirmationGate,
    peripheral_gate: ConfirmationGate,
}

impl<M, E, D, S> DfuController<M, E, D, S>
where
    M: CentralManager,
    E: TransferEngine<M::Central>,
    D: DfuDelegate,
    S: PackageSource,
{
    pub fn new(manager: M, engine: E, delegate: D, source: S, mode: DfuMode<PeripheralOf<M>>) -> Self {
        DfuController {
            manager,
            engine,
            delegate,
            source,
            mode: Mutex::new(Some(mode)),
            phone_battery: None,
            phone_gate: ConfirmationGate::new(),
            peripheral_gate: ConfirmationGate::new(),
        }
    }

    /// Wait for the phone to be charging before writing if its battery is low
    pub fn with_phone_battery(mut self, battery: watch::Receiver<PhoneBatteryStatus>) -> Self {
        self.phone_battery = Some(battery);
        self
    }

    /// Returns whether the session was waiting for this confirmation
    pub fn confirm_phone_in_charger(&self) -> bool {
        let confirmed = self.phone_gate.confirm();
        log::debug!("Phone in charger confirmation, effective: {}", confirmed);
        confirmed
    }

    /// Returns whether the session was waiting for this confirmation
    pub fn confirm_peripheral_in_charger(&self) -> bool {
        let confirmed = self.peripheral_gate.confirm();
        log::debug!("Peripheral in charger confirmation, effective: {}", confirmed);
        confirmed
    }

    pub async fn start(&self, states: &StateSender) -> Result<()> {
        let mode = self
            .mode
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(DfuError::OnlyWriteOnce)?;

        states.send(State::Activity(ActivityReason::Downloading));
        let package = self.source.resolve_package().await?;
        log::info!(
            "Resolved package: application {}, bootloader {:?}",
            package.application.version,
            package.bootloader.as_ref().map(|b| &b.version)
        );

        self.wait_for_phone(states).await;
        if let Some(peripheral) = mode.peripheral() {
            self.wait_for_peripheral(peripheral, states).await;
        }

        let context = DfuContext { manager: &self.manager, engine: &self.engine, delegate: &self.delegate };
        context.perform(&mode, &package, states).await?;

        log::info!("DFU completed");
        states.send(State::Completed);
        Ok(())
    }

    async fn wait_for_phone(&self, states: &StateSender) {
        let Some(mut battery) = self.phone_battery.clone() else {
            return;
        };
        if battery.borrow_and_update().is_sufficient() {
            return;
        }

        states.send(State::PhoneInCharger(PhoneInChargerState::Waiting));
        if battery.wait_for(PhoneBatteryStatus::is_sufficient).await.is_err() {
            log::warn!("Phone battery status is no longer reported, continuing without the charger");
            return;
        }
        states.send(State::PhoneInCharger(PhoneInChargerState::InCharger));
        self.phone_gate.arm();
        self.phone_gate.confirmed().await;
    }

    async fn wait_for_peripheral(&self, peripheral: &PeripheralOf<M>, states: &StateSender) {
        let Some(mut battery) = peripheral.battery_state() else {
            log::debug!("{} does not report its charge state", peripheral.id());
            return;
        };

        loop {
            let state = *battery.borrow_and_update();
            states.send(State::PeripheralInCharger(state));
            if matches!(state, Some(BatteryState::Charging | BatteryState::Charged)) {
                self.peripheral_gate.arm();
            } else {
                self.peripheral_gate.disarm();
            }

            tokio::select! {
                _ = self.peripheral_gate.confirmed() => return,
                changed = battery.changed() => {
                    if changed.is_err() {
                        log::warn!("{} stopped reporting its charge state", peripheral.id());
                        self.peripheral_gate.confirmed().await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareVersion, ring_uuids};
    use crate::package::{DirectoryPackageSource, Package};
    use crate::state::state_channel;
    use crate::test_helpers::{
        DelegateCall, MockEngine, MockManager, MockPeripheral, RecordingDelegate, TestContext, advertisement,
        application_component, drain,
    };
    use crate::transport::DeviceInformation;
    use std::time::Duration;
    use tokio::time::sleep;

    struct FixedPackage(Package);

    impl PackageSource for FixedPackage {
        async fn resolve_package(&self) -> Result<Package> {
            Ok(self.0.clone())
        }
    }

    fn application_only() -> FixedPackage {
        FixedPackage(Package { application: application_component("2.2.0"), bootloader: None })
    }

    fn recovery() -> DfuMode<MockPeripheral> {
        DfuMode::Recovery { identifier: "boot".into(), hardware_version: HardwareVersion::Version1 }
    }

    fn manager_with_bootloader() -> MockManager {
        let manager = MockManager::new();
        manager.advertise_on_scan(advertisement("boot", ring_uuids::VERSION1_BOOTLOADER));
        manager
    }

    #[tokio::test(start_paused = true)]
    async fn starts_only_once() {
        let delegate = RecordingDelegate::completing();
        let engine = MockEngine::new();
        let controller =
            DfuController::new(manager_with_bootloader(), engine.clone(), &delegate, application_only(), recovery());
        let (tx, rx) = state_channel();

        controller.start(&tx).await.unwrap();
        let err = controller.start(&tx).await.unwrap_err();
        assert!(matches!(err, DfuError::OnlyWriteOnce));
        assert_eq!(engine.started_with().len(), 1);

        drop(tx);
        let states = drain(rx).await;
        assert_eq!(states.first(), Some(&State::Activity(ActivityReason::Downloading)));
        assert_eq!(states.last(), Some(&State::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn low_phone_battery_waits_for_charger_and_confirmation() {
        let delegate = RecordingDelegate::completing();
        let (battery_tx, battery_rx) = watch::channel(PhoneBatteryStatus { level: 0.05, charging: false });
        let controller =
            DfuController::new(manager_with_bootloader(), MockEngine::new(), &delegate, application_only(), recovery())
                .with_phone_battery(battery_rx);
        let (tx, rx) = state_channel();

        let user = async {
            sleep(Duration::from_secs(1)).await;
            assert!(!controller.confirm_phone_in_charger());
            battery_tx.send_replace(PhoneBatteryStatus { level: 0.05, charging: true });
            sleep(Duration::from_secs(1)).await;
            assert!(controller.confirm_phone_in_charger());
            assert!(!controller.confirm_phone_in_charger());
        };
        let (result, ()) = tokio::join!(controller.start(&tx), user);
        result.unwrap();

        drop(tx);
        let states = drain(rx).await;
        assert_eq!(
            &states[..3],
            &[
                State::Activity(ActivityReason::Downloading),
                State::PhoneInCharger(PhoneInChargerState::Waiting),
                State::PhoneInCharger(PhoneInChargerState::InCharger),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lost_phone_battery_reports_end_the_wait() {
        let delegate = RecordingDelegate::completing();
        let (battery_tx, battery_rx) = watch::channel(PhoneBatteryStatus { level: 0.05, charging: false });
        let controller =
            DfuController::new(manager_with_bootloader(), MockEngine::new(), &delegate, application_only(), recovery())
                .with_phone_battery(battery_rx);
        let (tx, rx) = state_channel();

        let host = async {
            sleep(Duration::from_secs(1)).await;
            drop(battery_tx);
        };
        let (result, ()) = tokio::join!(controller.start(&tx), host);
        result.unwrap();

        drop(tx);
        let states = drain(rx).await;
        assert!(states.contains(&State::PhoneInCharger(PhoneInChargerState::Waiting)));
        assert!(!states.contains(&State::PhoneInCharger(PhoneInChargerState::InCharger)));
        assert_eq!(states.last(), Some(&State::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn charged_phone_skips_its_gate() {
        let delegate = RecordingDelegate::completing();
        let (_battery_tx, battery_rx) = watch::channel(PhoneBatteryStatus { level: 0.8, charging: false });
        let controller =
            DfuController::new(manager_with_bootloader(), MockEngine::new(), &delegate, application_only(), recovery())
                .with_phone_battery(battery_rx);
        let (tx, rx) = state_channel();

        controller.start(&tx).await.unwrap();
        drop(tx);
        assert!(!drain(rx).await.iter().any(|s| matches!(s, State::PhoneInCharger(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn peripheral_gate_is_armed_only_while_charging() {
        let ring = MockPeripheral::new("ring");
        ring.set_device_information(DeviceInformation {
            application_version: Some("1.4.0".into()),
            bootloader_version: Some("1.1".into()),
            hardware_version: Some(HardwareVersion::Version1),
        });
        ring.set_battery_state(Some(BatteryState::NotCharging));
        let delegate = RecordingDelegate::completing();
        let controller = DfuController::new(
            manager_with_bootloader(),
            MockEngine::new(),
            &delegate,
            application_only(),
            DfuMode::Peripheral(ring.clone()),
        );
        let (tx, rx) = state_channel();

        let user = async {
            sleep(Duration::from_secs(1)).await;
            assert!(!controller.confirm_peripheral_in_charger());
            ring.set_battery_state(Some(BatteryState::Charging));
            sleep(Duration::from_secs(1)).await;
            assert!(controller.confirm_peripheral_in_charger());
        };
        let (result, ()) = tokio::join!(controller.start(&tx), user);
        result.unwrap();

        assert_eq!(
            delegate.calls(),
            vec![DelegateCall::AllowInteraction(false, ring.id()), DelegateCall::AllowInteraction(true, ring.id())]
        );
        drop(tx);
        let states = drain(rx).await;
        assert_eq!(
            &states[..3],
            &[
                State::Activity(ActivityReason::Downloading),
                State::PeripheralInCharger(Some(BatteryState::NotCharging)),
                State::PeripheralInCharger(Some(BatteryState::Charging)),
            ]
        );
        assert_eq!(states.last(), Some(&State::Completed));
    }

    #[tokio::test]
    async fn package_errors_end_the_session() {
        let ctx = TestContext::new();
        let source = DirectoryPackageSource { application: (ctx.path("missing"), "2.0".into()), bootloader: None };
        let delegate = RecordingDelegate::completing();
        let engine = MockEngine::new();
        let controller = DfuController::new(MockManager::new(), engine.clone(), &delegate, source, recovery());
        let (tx, rx) = state_channel();

        let err = controller.start(&tx).await.unwrap_err();
        assert!(matches!(err, DfuError::MissingDataFile(_)));
        assert!(engine.started_with().is_empty());
        drop(tx);
        assert_eq!(drain(rx).await, vec![State::Activity(ActivityReason::Downloading)]);
    }
}
