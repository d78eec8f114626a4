use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DfuError>;

/// Errors surfaced by a DFU session
#[derive(Error, Debug)]
pub enum DfuError {
    #[error("a DFU controller can only be started once")]
    OnlyWriteOnce,
    #[error("timed out scanning for a peripheral in bootloader mode")]
    ScanningTimeout,
    #[error("Bluetooth is powered off")]
    AdapterPoweredOff,
    #[error("Bluetooth is not supported on this system")]
    AdapterUnsupported,
    #[error("Bluetooth use is not authorized")]
    AdapterUnauthorized,
    #[error("firmware package is missing data file `{}`", .0.display())]
    MissingDataFile(PathBuf),
    #[error("firmware result has no application component")]
    NoApplicationComponent,
    #[error("unknown hardware version for application `{application}`")]
    UnknownHardwareVersion { application: String },
    #[error("the peripheral did not report an application version")]
    UnknownApplicationVersion,
    #[error("the bootloader version must be read from the peripheral")]
    UnknownBootloaderVersion,
    #[error("timed out waiting for the peripheral to enter bootloader mode")]
    RepeatedWriteTimeout,
    /// Reported by the firmware transfer engine
    #[error("write error {code}: {message}")]
    Transfer { code: i32, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl DfuError {
    /// Short stable identifier, for support logs
    pub fn code(&self) -> &'static str {
        match self {
            DfuError::OnlyWriteOnce => "DFU-001",
            DfuError::ScanningTimeout => "DFU-010",
            DfuError::AdapterPoweredOff => "DFU-011",
            DfuError::AdapterUnsupported => "DFU-012",
            DfuError::AdapterUnauthorized => "DFU-013",
            DfuError::MissingDataFile(_) => "DFU-020",
            DfuError::NoApplicationComponent => "DFU-021",
            DfuError::UnknownHardwareVersion { .. } => "DFU-030",
            DfuError::UnknownApplicationVersion => "DFU-031",
            DfuError::UnknownBootloaderVersion => "DFU-032",
            DfuError::RepeatedWriteTimeout => "DFU-040",
            DfuError::Transfer { .. } => "DFU-050",
            DfuError::Io(_) => "DFU-060",
            DfuError::Zip(_) => "DFU-061",
            DfuError::Json(_) => "DFU-062",
            DfuError::Backend(_) => "DFU-070",
        }
    }
}
