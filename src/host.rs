use crate::transport::PeripheralId;
use tokio::sync::mpsc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ForgetThisDeviceUpdate {
    Started,
    Completed,
}

/// Callbacks into the host application
pub trait DfuDelegate {
    /// Allow or prevent the host from using the peripheral while it reboots
    fn set_interaction_allowed(&self, allowed: bool, peripheral: &PeripheralId);
    /// Guide the user through removing the peripheral's bond, reporting on `updates`
    fn start_forget_this_device(&self, peripheral: &PeripheralId, updates: mpsc::UnboundedSender<ForgetThisDeviceUpdate>);
    fn stop_forget_this_device(&self, peripheral: &PeripheralId);
}

impl<D: DfuDelegate> DfuDelegate for &D {
    fn set_interaction_allowed(&self, allowed: bool, peripheral: &PeripheralId) {
        (**self).set_interaction_allowed(allowed, peripheral)
    }

    fn start_forget_this_device(&self, peripheral: &PeripheralId, updates: mpsc::UnboundedSender<ForgetThisDeviceUpdate>) {
        (**self).start_forget_this_device(peripheral, updates)
    }

    fn stop_forget_this_device(&self, peripheral: &PeripheralId) {
        (**self).stop_forget_this_device(peripheral)
    }
}

/// Battery reading of the phone running the update
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PhoneBatteryStatus {
    /// 0.0 to 1.0
    pub level: f32,
    pub charging: bool,
}

impl PhoneBatteryStatus {
    pub const REQUIRED_LEVEL: f32 = 0.1;

    /// Enough charge to run an update without the charger
    pub fn is_sufficient(&self) -> bool {
        self.level > Self::REQUIRED_LEVEL || self.charging
    }
}
