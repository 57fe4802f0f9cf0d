// HAL module - THE BOARD
// Simulated hardware behind the transport driver traits

pub mod sim;

pub use sim::{
    SimModem, SimModemControl, SimModemHandle, SimRadio, SimRadioHandle, SimWifi, SimWifiHandle,
};
