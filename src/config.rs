use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Settings of the command line tool, read from a JSON file.
///
/// Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Index of the Bluetooth adapter to use
    pub adapter: usize,
    /// Bytes per packet characteristic write
    pub mtu: usize,
    /// Characteristic taking ring commands, required to enter the bootloader
    /// or clear bonds from application mode
    pub command_characteristic: Option<Uuid>,
    /// Default log filter, `RUST_LOG` takes precedence
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config { adapter: 0, mtu: 20, command_characteristic: None, log_level: "info".to_string() }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }
}
