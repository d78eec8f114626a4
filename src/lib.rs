//! Firmware updates for Bluetooth LE rings.
//!
//! A [`DfuController`] drives one update: it resolves the firmware package,
//! waits for the phone and ring to be charging when needed, then runs the
//! phases planned for the ring's hardware and firmware version.

pub mod central;
pub mod config;
pub mod controller;
pub mod error;
pub mod features;
pub mod gate;
pub mod hardware;
pub mod host;
pub mod package;
pub mod planner;
pub mod protocol;
pub mod scanner;
pub mod sender;
pub mod state;
pub mod transport;
pub mod transport_btleplug;
pub mod version;
pub mod writer;

#[cfg(test)]
mod test_helpers;

pub use controller::DfuController;
pub use error::{DfuError, Result};
pub use planner::DfuMode;
pub use state::{State, StateReceiver, StateSender, state_channel};
