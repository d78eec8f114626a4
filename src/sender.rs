//! Ways of getting a ring into bootloader mode.

use crate::central::ENTER_BOOTLOADER;
use crate::error::Result;
use crate::host::{DfuDelegate, ForgetThisDeviceUpdate};
use crate::state::{ActivityReason, State, StateSender};
use crate::transport::{Peripheral, PeripheralId};

use anyhow::anyhow;
use std::time::Duration;
use tokio::sync::mpsc;

/// Time the ring needs to reboot into its bootloader
const REBOOT_DELAY: Duration = Duration::from_secs(1);

pub trait BootloaderSender {
    async fn send(&self, states: &StateSender) -> Result<()>;
}

/// Writes the enter-bootloader command directly
pub struct WriteSender<'a, P> {
    peripheral: &'a P,
}

impl<'a, P: Peripheral> WriteSender<'a, P> {
    pub fn new(peripheral: &'a P) -> Self {
        WriteSender { peripheral }
    }
}

impl<P: Peripheral> BootloaderSender for WriteSender<'_, P> {
    async fn send(&self, states: &StateSender) -> Result<()> {
        self.peripheral.write_command(ENTER_BOOTLOADER).await?;
        states.send(State::Activity(ActivityReason::WaitingForWriteStart));
        tokio::time::sleep(REBOOT_DELAY).await;
        Ok(())
    }
}

/// Has the host walk the user through forgetting the ring, which drops the
/// ring into bootloader mode
pub struct ForgetThisDeviceSender<'a, P, D> {
    initial: bool,
    peripheral: &'a P,
    delegate: &'a D,
}

impl<'a, P: Peripheral, D: DfuDelegate> ForgetThisDeviceSender<'a, P, D> {
    pub fn new(initial: bool, peripheral: &'a P, delegate: &'a D) -> Self {
        ForgetThisDeviceSender { initial, peripheral, delegate }
    }
}

impl<P: Peripheral, D: DfuDelegate> BootloaderSender for ForgetThisDeviceSender<'_, P, D> {
    async fn send(&self, states: &StateSender) -> Result<()> {
        states.send(State::WaitingForForgetThisDevice { initial: self.initial });

        let (tx, mut updates) = mpsc::unbounded_channel();
        let _registration = Registration::start(self.delegate, self.peripheral.id(), tx);
        while let Some(update) = updates.recv().await {
            match update {
                ForgetThisDeviceUpdate::Started => states.send(State::Activity(ActivityReason::ForgettingDevice)),
                ForgetThisDeviceUpdate::Completed => return Ok(()),
            }
        }
        Err(anyhow!("forget-this-device ended without completing").into())
    }
}

/// Keeps the delegate's forget-this-device flow running until dropped
struct Registration<'a, D: DfuDelegate> {
    delegate: &'a D,
    peripheral: PeripheralId,
}

impl<'a, D: DfuDelegate> Registration<'a, D> {
    fn start(delegate: &'a D, peripheral: PeripheralId, updates: mpsc::UnboundedSender<ForgetThisDeviceUpdate>) -> Self {
        delegate.start_forget_this_device(&peripheral, updates);
        Registration { delegate, peripheral }
    }
}

impl<D: DfuDelegate> Drop for Registration<'_, D> {
    fn drop(&mut self) {
        self.delegate.stop_forget_this_device(&self.peripheral);
    }
}
