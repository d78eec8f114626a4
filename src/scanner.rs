use crate::error::{DfuError, Result};
use crate::hardware::BOOTLOADER_SERVICES;
use crate::transport::{AdapterState, Advertisement, Central, CentralEvent, CentralManager, PeripheralId, PeripheralOf};

use anyhow::anyhow;
use futures::stream::StreamExt;
use std::time::Duration;

/// Delay between finding a peripheral and handing it out, peripherals that
/// were just discovered do not always have their GATT table ready
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Finds one peripheral in bootloader mode
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    identifier: Option<PeripheralId>,
}

impl Scanner {
    /// Scan for any bootloader, or only the one with `identifier`
    pub fn new(identifier: Option<PeripheralId>) -> Self {
        Scanner { identifier }
    }

    pub fn accepts(&self, advertisement: &Advertisement) -> bool {
        if let Some(identifier) = &self.identifier {
            if *identifier != advertisement.id {
                return false;
            }
        }
        advertisement
            .solicited_services
            .iter()
            .any(|uuid| BOOTLOADER_SERVICES.contains(uuid))
    }

    /// Scan on a new adapter session, yielding the session and the first
    /// matching peripheral
    pub async fn scan<M: CentralManager>(&self, manager: &M) -> Result<(M::Central, PeripheralOf<M>)> {
        let central = manager.session().await?;
        let mut events = central.events().await?;

        let mut scanning = false;
        if adapter_ready(central.state().await?)? {
            log::debug!("Starting scan for DFU peripherals");
            central.start_scan().await?;
            scanning = true;
        }

        while let Some(event) = events.next().await {
            match event {
                CentralEvent::StateChanged(state) => {
                    let ready = adapter_ready(state)?;
                    if ready && !scanning {
                        log::debug!("Starting scan for DFU peripherals");
                        central.start_scan().await?;
                        scanning = true;
                    } else if !ready && scanning {
                        central.stop_scan().await?;
                        scanning = false;
                    }
                }
                CentralEvent::Discovered(advertisement) if scanning && self.accepts(&advertisement) => {
                    log::info!("Found DFU peripheral {}", advertisement.id);
                    central.stop_scan().await?;
                    let peripheral = central.peripheral(&advertisement.id).await?;
                    tokio::time::sleep(SETTLE_DELAY).await;
                    return Ok((central, peripheral));
                }
                _ => {}
            }
        }
        Err(anyhow!("Scanning stopped unexpectedly").into())
    }
}

/// `Ok(true)` once the adapter can scan, `Ok(false)` while its state is settling
fn adapter_ready(state: AdapterState) -> Result<bool> {
    match state {
        AdapterState::PoweredOn => Ok(true),
        AdapterState::Unknown | AdapterState::Resetting => Ok(false),
        AdapterState::PoweredOff => Err(DfuError::AdapterPoweredOff),
        AdapterState::Unsupported => Err(DfuError::AdapterUnsupported),
        AdapterState::Unauthorized => Err(DfuError::AdapterUnauthorized),
    }
}
