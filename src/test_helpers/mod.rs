mod mock;
mod temp;

pub use mock::*;
pub use temp::*;

use crate::package::{ComponentKind, PackageComponent};
use crate::state::{State, StateReceiver};
use crate::transport::Advertisement;

use uuid::Uuid;

/// Advertisement of `id` soliciting `service`
pub fn advertisement(id: &str, service: Uuid) -> Advertisement {
    Advertisement { id: id.into(), solicited_services: vec![service] }
}

pub fn application_component(version: &str) -> PackageComponent {
    PackageComponent {
        kind: ComponentKind::Application,
        data: "application.hex".into(),
        metadata: Some("application.dat".into()),
        version: version.to_string(),
    }
}

pub fn bootloader_component(version: &str) -> PackageComponent {
    PackageComponent {
        kind: ComponentKind::Bootloader,
        data: "bootloader.hex".into(),
        metadata: None,
        version: version.to_string(),
    }
}

/// Every state sent until all senders are dropped
pub async fn drain(mut rx: StateReceiver) -> Vec<State> {
    let mut states = Vec::new();
    while let Some(state) = rx.recv().await {
        states.push(state);
    }
    states
}
