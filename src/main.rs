use ringdfu::central::{PostDisconnectMode, post_disconnect};
use ringdfu::config::Config;
use ringdfu::hardware::HardwareVersion;
use ringdfu::host::{DfuDelegate, ForgetThisDeviceUpdate};
use ringdfu::package::{ArchivePackageSource, ComponentKind, FileFetcher, Firmware, FirmwareResult};
use ringdfu::protocol::LegacyDfuEngine;
use ringdfu::scanner::Scanner;
use ringdfu::state::{ActivityReason, BatteryState, PhoneInChargerState};
use ringdfu::transport::{Central, CentralEvent, CentralManager, ConnectionState, Peripheral, PeripheralId};
use ringdfu::transport_btleplug::{BtleplugManager, BtleplugPeripheral};
use ringdfu::{DfuController, DfuMode, State, StateReceiver, state_channel};

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Update firmware on Bluetooth LE rings
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    /// Confirm charger prompts without waiting for input
    #[arg(short, long)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List rings in bootloader mode
    Scan {
        /// How long to scan for
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Update a ring running its application
    Update {
        /// Ring identifier, address or name
        target: String,
        #[command(flatten)]
        package: PackageArgs,
    },
    /// Clear a ring's bonds after removing it from the system's Bluetooth devices
    Forget {
        /// Ring identifier, address or name
        target: String,
    },
    /// Update a ring stuck in bootloader mode
    Recover {
        /// Identifier the bootloader advertises under
        identifier: String,
        /// Hardware generation of the ring (v1, v2)
        #[arg(long)]
        hardware: HardwareVersion,
        #[command(flatten)]
        package: PackageArgs,
    },
}

#[derive(clap::Args)]
struct PackageArgs {
    /// Application DFU archive
    #[arg(long)]
    application: PathBuf,
    /// Version of the application archive
    #[arg(long)]
    application_version: String,
    /// Bootloader DFU archive
    #[arg(long, requires = "bootloader_version")]
    bootloader: Option<PathBuf>,
    /// Version of the bootloader archive
    #[arg(long, requires = "bootloader")]
    bootloader_version: Option<String>,
}

impl PackageArgs {
    fn firmware_result(&self) -> FirmwareResult {
        let firmware = |kind, path: &PathBuf, version: &str| Firmware {
            kind,
            version: version.to_string(),
            location: path.display().to_string(),
        };
        FirmwareResult {
            applications: vec![firmware(ComponentKind::Application, &self.application, &self.application_version)],
            bootloaders: match (&self.bootloader, &self.bootloader_version) {
                (Some(path), Some(version)) => vec![firmware(ComponentKind::Bootloader, path, version)],
                _ => Vec::new(),
            },
        }
    }
}

type Controller = DfuController<BtleplugManager, LegacyDfuEngine, ConsoleDelegate, ArchivePackageSource<FileFetcher>>;

/// Answers the delegate callbacks on the terminal
struct ConsoleDelegate {
    forgotten: broadcast::Sender<PeripheralId>,
    forgetting: Mutex<Option<JoinHandle<()>>>,
}

impl DfuDelegate for ConsoleDelegate {
    fn set_interaction_allowed(&self, allowed: bool, peripheral: &PeripheralId) {
        log::info!("Interaction with {} {}", peripheral, if allowed { "allowed" } else { "suspended" });
    }

    fn start_forget_this_device(&self, peripheral: &PeripheralId, updates: mpsc::UnboundedSender<ForgetThisDeviceUpdate>) {
        let forgotten = self.forgotten.clone();
        let peripheral = peripheral.clone();
        let task = tokio::spawn(async move {
            let _ = updates.send(ForgetThisDeviceUpdate::Started);
            wait_for_enter(&format!("Remove {} from the system's Bluetooth devices", peripheral)).await;
            let _ = forgotten.send(peripheral);
            let _ = updates.send(ForgetThisDeviceUpdate::Completed);
        });
        if let Some(previous) = self.forgetting.lock().unwrap_or_else(|e| e.into_inner()).replace(task) {
            previous.abort();
        }
    }

    fn stop_forget_this_device(&self, _peripheral: &PeripheralId) {
        if let Some(task) = self.forgetting.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

async fn wait_for_enter(prompt: &str) {
    println!("{}, then press enter", prompt);
    let _ = tokio::task::spawn_blocking(|| std::io::stdin().read_line(&mut String::new())).await;
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("{msg:20} [{bar:40}] {pos:>3}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

/// Print session states until the session ends, answering the prompts it raises
async fn render(
    mut states: StateReceiver,
    controller: &Controller,
    forgotten: broadcast::Sender<PeripheralId>,
    target: Option<PeripheralId>,
    yes: bool,
) {
    let pb = progress_bar();
    while let Some(state) = states.recv().await {
        match state {
            State::Writing(progress) => {
                pb.set_message(format!("Writing {}/{}", progress.index + 1, progress.count));
                pb.set_position(progress.progress.into());
            }
            State::Activity(reason) => {
                let message = match reason {
                    ActivityReason::Downloading => "Preparing firmware package",
                    ActivityReason::WaitingForWriteStart => "Waiting for the bootloader",
                    ActivityReason::WriteCompleted => "Write completed",
                    ActivityReason::ForgettingDevice => "Forgetting the ring",
                    ActivityReason::WaitingForRequiredPair => "Accept the pairing request",
                };
                pb.println(message);
            }
            State::PhoneInCharger(PhoneInChargerState::Waiting) => pb.println("Battery low, connect a charger"),
            State::PhoneInCharger(PhoneInChargerState::InCharger) => {
                if !yes {
                    wait_for_enter("Leave the charger connected").await;
                }
                controller.confirm_phone_in_charger();
            }
            State::PeripheralInCharger(Some(BatteryState::Charging | BatteryState::Charged)) => {
                if !yes {
                    wait_for_enter("Keep the ring in its charger").await;
                }
                controller.confirm_peripheral_in_charger();
            }
            State::PeripheralInCharger(_) => pb.println("Place the ring in its charger"),
            State::WaitingForForgetThisDevice { initial: true } => {}
            State::WaitingForForgetThisDevice { initial: false } => {
                wait_for_enter("Remove the ring from the system's Bluetooth devices again").await;
                match &target {
                    Some(target) => {
                        let _ = forgotten.send(target.clone());
                    }
                    None => log::warn!("No ring identifier to report as forgotten"),
                }
            }
            State::WaitingForBluetoothToggle { have_toggled_off: false } => pb.println("Turn Bluetooth off"),
            State::WaitingForBluetoothToggle { have_toggled_off: true } => pb.println("Turn Bluetooth back on"),
            State::Completed => pb.finish_with_message("Completed"),
        }
    }
    if !pb.is_finished() {
        pb.abandon();
    }
}

async fn connect_ring(manager: &BtleplugManager, target: &str) -> anyhow::Result<BtleplugPeripheral> {
    let central = manager.session().await?;
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(64));
    pb.println(format!("Searching for `{}`...", target));
    let ring = tokio::time::timeout(SEARCH_TIMEOUT, central.find(target, &pb))
        .await
        .with_context(|| format!("`{}` not found", target))??;

    if ring.connection_state().await? != ConnectionState::Connected {
        pb.set_message(format!("Connecting to {}", ring.id()));
        central.connect(&ring).await?;
        tokio::time::timeout(CONNECT_TIMEOUT, async {
            while ring.connection_state().await? != ConnectionState::Connected {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            anyhow::Ok(())
        })
        .await
        .context("Timed out connecting")??;
    }
    pb.finish_with_message(format!("Connected to {}", ring.id()));
    Ok(ring)
}

async fn scan(manager: &BtleplugManager, duration: Duration) -> anyhow::Result<()> {
    let central = manager.session().await?;
    let mut events = central.events().await?;
    central.start_scan().await?;

    let scanner = Scanner::new(None);
    let mut seen = HashSet::new();
    let listing = async {
        while let Some(event) = events.next().await {
            if let CentralEvent::Discovered(advertisement) = event {
                if scanner.accepts(&advertisement) && seen.insert(advertisement.id.clone()) {
                    println!("{}", advertisement.id);
                }
            }
        }
    };
    let _ = tokio::time::timeout(duration, listing).await;
    central.stop_scan().await?;
    Ok(())
}

async fn forget(manager: &BtleplugManager, target: &str) -> anyhow::Result<()> {
    let ring = connect_ring(manager, target).await?;
    wait_for_enter(&format!("Remove {} from the system's Bluetooth devices", ring.id())).await;
    let central = manager.session().await?;
    post_disconnect(&central, &ring, PostDisconnectMode::ClearBonds).await;
    println!("Finished bond cleanup of {}", ring.id());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };
    let level = if args.verbose { "debug" } else { config.log_level.as_str() };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let manager = BtleplugManager::new(config.adapter, config.command_characteristic).await?;
    let (mode, package) = match &args.command {
        Commands::Scan { seconds } => return scan(&manager, Duration::from_secs(*seconds)).await,
        Commands::Forget { target } => return forget(&manager, target).await,
        Commands::Update { target, package } => (DfuMode::Peripheral(connect_ring(&manager, target).await?), package),
        Commands::Recover { identifier, hardware, package } => {
            (DfuMode::Recovery { identifier: identifier.as_str().into(), hardware_version: *hardware }, package)
        }
    };

    let target = mode.peripheral_identifier();
    let forgotten = manager.forgotten_sender();
    let delegate = ConsoleDelegate { forgotten: forgotten.clone(), forgetting: Mutex::new(None) };
    let source = ArchivePackageSource::new(package.firmware_result(), FileFetcher);
    let controller: Controller =
        DfuController::new(manager, LegacyDfuEngine::new(config.mtu), delegate, source, mode);

    let (tx, rx) = state_channel();
    let controller = &controller;
    let run = async move {
        let result = controller.start(&tx).await;
        drop(tx);
        result
    };
    let (result, ()) = tokio::join!(run, render(rx, controller, forgotten, target, args.yes));
    if let Err(err) = result {
        log::error!("Update failed [{}]: {}", err.code(), err);
        return Err(err.into());
    }
    Ok(())
}
