// Simulated hardware - radio chip, WiFi stack and an AT-speaking modem
// Each simulator comes with a handle for injecting events and inspecting traffic

mod modem;
mod radio;
mod wifi;

pub use modem::{SimModem, SimModemControl, SimModemHandle};
pub use radio::{SimRadio, SimRadioHandle};
pub use wifi::{SimWifi, SimWifiHandle};

use std::sync::{Mutex, MutexGuard};

/// Simulator state survives a panicking test thread
fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
