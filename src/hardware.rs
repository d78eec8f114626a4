use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Ring hardware generations that can be updated
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HardwareVersion {
    Version1,
    Version2,
}

impl HardwareVersion {
    /// Solicited service advertised while in bootloader mode
    pub fn bootloader_service(self) -> Uuid {
        match self {
            HardwareVersion::Version1 => ring_uuids::VERSION1_BOOTLOADER,
            HardwareVersion::Version2 => ring_uuids::VERSION2_BOOTLOADER,
        }
    }

    /// Control point characteristic, `None` to use the transfer engine's default
    pub fn control_point(self) -> Option<Uuid> {
        match self {
            HardwareVersion::Version1 => None,
            HardwareVersion::Version2 => Some(ring_uuids::VERSION2_CONTROL_POINT),
        }
    }

    /// Packet characteristic, `None` to use the transfer engine's default
    pub fn packet(self) -> Option<Uuid> {
        match self {
            HardwareVersion::Version1 => None,
            HardwareVersion::Version2 => Some(ring_uuids::VERSION2_PACKET),
        }
    }

    /// Additional attempts made when an application write fails
    pub fn write_retries(self) -> u32 {
        match self {
            HardwareVersion::Version1 => 0,
            HardwareVersion::Version2 => 2,
        }
    }

    /// Parse a hardware revision string as reported by the device (`V00`, `v2`, `2`...)
    pub fn from_revision(revision: &str) -> Option<Self> {
        let digits: String = revision
            .trim()
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        match digits.parse::<u32>().ok()? {
            0 | 1 => Some(HardwareVersion::Version1),
            2 => Some(HardwareVersion::Version2),
            _ => None,
        }
    }
}

impl FromStr for HardwareVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "v1" | "version1" => Ok(HardwareVersion::Version1),
            "2" | "v2" | "version2" => Ok(HardwareVersion::Version2),
            _ => Err(format!("unknown hardware version `{}`", s)),
        }
    }
}

impl fmt::Display for HardwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareVersion::Version1 => f.write_str("version1"),
            HardwareVersion::Version2 => f.write_str("version2"),
        }
    }
}

/// Services advertised by rings in bootloader mode, one per hardware generation
pub const BOOTLOADER_SERVICES: [Uuid; 2] = [ring_uuids::VERSION1_BOOTLOADER, ring_uuids::VERSION2_BOOTLOADER];

/// Ring DFU service & characteristic UUIDs
pub mod ring_uuids {
    use uuid::Uuid;
    /// Legacy DFU service, used by version1 bootloaders
    pub const VERSION1_BOOTLOADER: Uuid = Uuid::from_u128(0x00001530_1212_EFDE_1523_785FEABCD123);
    /// Version2 bootloader service
    pub const VERSION2_BOOTLOADER: Uuid = Uuid::from_u128(0xA01F1540_70DB_4CE5_952B_873759F85C44);
    /// Version2 control point characteristic
    pub const VERSION2_CONTROL_POINT: Uuid = Uuid::from_u128(0xA01F1541_70DB_4CE5_952B_873759F85C44);
    /// Version2 packet characteristic
    pub const VERSION2_PACKET: Uuid = Uuid::from_u128(0xA01F1542_70DB_4CE5_952B_873759F85C44);
}
