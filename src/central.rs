//! Connection choreography around a ring that is rebooting into its bootloader.

use crate::error::{DfuError, Result};
use crate::state::{ActivityReason, State, StateSender};
use crate::transport::{
    AdapterState, BootloaderTimeout, Central, CentralEvent, CentralManager, ConnectionState, Peripheral,
    PeripheralCommand, PeripheralId,
};

use anyhow::anyhow;
use futures::stream::StreamExt;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{Instant, interval_at, sleep, timeout};

const RECONNECT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PAIR_POLL_INTERVAL: Duration = Duration::from_millis(250);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ADAPTER_POLL_INTERVAL: Duration = Duration::from_millis(50);
const POST_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const ENTER_BOOTLOADER: PeripheralCommand =
    PeripheralCommand::EnterBootloader { timeout: BootloaderTimeout::Seconds30 };

/// Wait until the system reports the peripheral as connected again
pub async fn reconnect<C: Central>(central: &C, identifier: &PeripheralId) -> Result<C::Peripheral> {
    let mut ticks = interval_at(Instant::now() + RECONNECT_POLL_INTERVAL, RECONNECT_POLL_INTERVAL);
    loop {
        ticks.tick().await;
        let connected = central.connected_peripherals().await?;
        if let Some(peripheral) = connected.into_iter().find(|p| p.id() == *identifier) {
            log::info!("Reconnected to {}", identifier);
            return Ok(peripheral);
        }
    }
}

/// Discover the peripheral, connect and wait for the system to pair with it
pub async fn scan_and_pair<C: Central>(
    central: &C,
    identifier: &PeripheralId,
    states: &StateSender,
) -> Result<C::Peripheral> {
    let mut events = central.events().await?;
    central.start_scan().await?;

    let paired = async {
        loop {
            match events.next().await {
                Some(CentralEvent::Discovered(advertisement)) if advertisement.id == *identifier => break,
                Some(_) => continue,
                None => return Err(anyhow!("Scanning stopped unexpectedly").into()),
            }
        }
        let peripheral = central.peripheral(identifier).await?;
        central.connect(&peripheral).await?;
        states.send(State::Activity(ActivityReason::WaitingForRequiredPair));
        while !peripheral.is_paired().await? {
            sleep(PAIR_POLL_INTERVAL).await;
        }
        log::info!("Paired with {}", identifier);
        Ok::<_, DfuError>(peripheral)
    }
    .await;

    match paired {
        Ok(peripheral) => {
            central.stop_scan().await?;
            Ok(peripheral)
        }
        Err(err) => {
            if let Err(stop) = central.stop_scan().await {
                log::warn!("Failed to stop scan: {}", stop);
            }
            Err(err)
        }
    }
}

/// Wait for the user to forget the peripheral, then send it back into
/// bootloader mode once it has dropped its bond
pub async fn forget_this_device<C: Central>(central: &C, peripheral: &C::Peripheral, states: &StateSender) -> Result<()> {
    let identifier = peripheral.id();
    let mut events = central.events().await?;
    states.send(State::WaitingForForgetThisDevice { initial: false });

    loop {
        match events.next().await {
            Some(CentralEvent::PeripheralForgotten(id)) if id == identifier => break,
            Some(_) => continue,
            None => return Err(anyhow!("Adapter events stopped unexpectedly").into()),
        }
    }

    states.send(State::Activity(ActivityReason::ForgettingDevice));
    post_disconnect(central, peripheral, PostDisconnectMode::Dfu).await;
    Ok(())
}

/// What to do with a peripheral after the system dropped it
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PostDisconnectMode {
    ClearBonds,
    Dfu,
}

impl PostDisconnectMode {
    fn settle_delay(self) -> Duration {
        match self {
            PostDisconnectMode::ClearBonds => Duration::from_secs(3),
            PostDisconnectMode::Dfu => Duration::from_secs(1),
        }
    }

    fn command(self) -> PeripheralCommand {
        match self {
            PostDisconnectMode::ClearBonds => PeripheralCommand::ClearBond,
            PostDisconnectMode::Dfu => ENTER_BOOTLOADER,
        }
    }
}

/// Reconnect, write the mode's command and disconnect again.
///
/// Best effort: failures are logged, and a cleanup that does not finish
/// within ten seconds is abandoned.
pub async fn post_disconnect<C: Central>(central: &C, peripheral: &C::Peripheral, mode: PostDisconnectMode) {
    let cleanup = async {
        sleep(Duration::from_millis(1)).await;
        central.connect(peripheral).await?;
        while peripheral.connection_state().await? != ConnectionState::Connected {
            sleep(CONNECT_POLL_INTERVAL).await;
        }
        sleep(mode.settle_delay()).await;
        peripheral.write_command(mode.command()).await?;
        sleep(Duration::from_secs(1)).await;
        central.cancel_connection(peripheral).await?;
        anyhow::Ok(())
    };

    match timeout(POST_DISCONNECT_TIMEOUT, cleanup).await {
        Ok(Ok(())) => log::debug!("Post-disconnect {:?} of {} done", mode, peripheral.id()),
        Ok(Err(err)) => log::warn!("Post-disconnect {:?} of {} failed, continuing: {:#}", mode, peripheral.id(), err),
        Err(_) => log::warn!("Post-disconnect {:?} of {} timed out, continuing", mode, peripheral.id()),
    }
}

/// Parameters of [`repeatedly_write`]
#[derive(Debug, Copy, Clone)]
pub struct RepeatedWrite {
    pub poll_interval: Duration,
    /// Consecutive `Connecting` polls that mean the ring is cycling into its bootloader
    pub required_connecting_states: usize,
    pub timeout: Duration,
}

impl Default for RepeatedWrite {
    fn default() -> Self {
        RepeatedWrite {
            poll_interval: Duration::from_secs(2),
            required_connecting_states: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Keep sending the enter-bootloader command until the ring is seen
/// cycling into bootloader mode.
///
/// Some application versions do not re-enter bootloader mode reliably right
/// after an update, so a single write is not enough.
pub async fn repeatedly_write<C: Central>(
    central: &C,
    peripheral: &C::Peripheral,
    params: RepeatedWrite,
    states: &StateSender,
) -> Result<()> {
    states.send(State::Activity(ActivityReason::WaitingForWriteStart));
    log::info!("Starting repeated write to {}", peripheral.id());

    let required = params.required_connecting_states.max(1);
    let poll = async {
        let mut ticks = interval_at(Instant::now() + params.poll_interval, params.poll_interval);
        let mut recent: VecDeque<ConnectionState> = VecDeque::with_capacity(required + 1);
        loop {
            ticks.tick().await;
            let state = peripheral.connection_state().await?;
            match state {
                ConnectionState::Disconnected => central.connect(peripheral).await?,
                ConnectionState::Connected => {
                    if let Err(err) = peripheral.write_command(ENTER_BOOTLOADER).await {
                        log::warn!("Enter bootloader write failed: {}", err);
                    }
                }
                ConnectionState::Connecting | ConnectionState::Disconnecting => {}
            }

            recent.push_front(state);
            recent.truncate(required);
            log::debug!("Current peripheral states are {:?}", recent);
            if recent.len() == required && recent.iter().all(|s| *s == ConnectionState::Connecting) {
                return Ok::<_, DfuError>(());
            }
        }
    };

    match timeout(params.timeout, poll).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("Failed repeated write to {}", peripheral.id());
            Err(DfuError::RepeatedWriteTimeout)
        }
    }
}

/// Wait for the user to turn Bluetooth off and back on, which flushes the
/// system's GATT cache
pub async fn wait_for_bluetooth_toggle<M: CentralManager>(manager: &M, states: &StateSender) -> Result<()> {
    let central = manager.session().await?;

    states.send(State::WaitingForBluetoothToggle { have_toggled_off: false });
    wait_for_adapter_state(&central, AdapterState::PoweredOff).await?;
    states.send(State::WaitingForBluetoothToggle { have_toggled_off: true });
    wait_for_adapter_state(&central, AdapterState::PoweredOn).await
}

async fn wait_for_adapter_state<C: Central>(central: &C, wanted: AdapterState) -> Result<()> {
    while central.state().await? != wanted {
        sleep(ADAPTER_POLL_INTERVAL).await;
    }
    Ok(())
}
