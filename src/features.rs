use crate::hardware::HardwareVersion;
use crate::version::{is_at_least, is_before};

/// How often the bootloader acknowledges received packets
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriterNotificationMode {
    Fast,
    Safe,
}

impl WriterNotificationMode {
    /// Packet receipt notification interval
    pub fn packets_notification_interval(self) -> u16 {
        match self {
            WriterNotificationMode::Fast => 10,
            WriterNotificationMode::Safe => 1,
        }
    }
}

/// Version-dependent DFU behaviour of a peripheral
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FirmwareFeatures {
    /// The peripheral advertises under a new identifier in bootloader mode
    pub changes_identifier_in_bootloader_mode: bool,
    /// Bonds survive the update, so no forget-this-device is needed
    pub maintains_bond_data: bool,
    pub writer_notification_mode: WriterNotificationMode,
    /// The update changes the GATT table, requiring a Bluetooth power cycle
    /// to flush the system's service cache
    pub modifies_services: bool,
}

impl FirmwareFeatures {
    pub fn new(application: &str, bootloader: &str) -> Self {
        let fast = is_at_least(bootloader, "1");
        FirmwareFeatures {
            changes_identifier_in_bootloader_mode: is_at_least(bootloader, "1"),
            maintains_bond_data: is_at_least(bootloader, "1.0.0.3") && is_at_least(application, "1.3.1.1"),
            writer_notification_mode: if fast { WriterNotificationMode::Fast } else { WriterNotificationMode::Safe },
            modifies_services: is_at_least(application, "2") && is_before(application, "2.2"),
        }
    }

    /// Fixed features for a device that never reported its versions
    pub fn recovery(hardware: HardwareVersion) -> Self {
        FirmwareFeatures {
            changes_identifier_in_bootloader_mode: false,
            maintains_bond_data: false,
            writer_notification_mode: match hardware {
                HardwareVersion::Version2 => WriterNotificationMode::Fast,
                HardwareVersion::Version1 => WriterNotificationMode::Safe,
            },
            modifies_services: false,
        }
    }
}
