// Simulated Radio
// In-memory radio chip raising completion interrupts through the attached handle

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::trace;

use super::lock;
use crate::transport::{RadioFault, RadioFrame, RadioHardware, RadioIrq, RadioParam};

#[derive(Default)]
struct SimRadioState {
    irq: Option<RadioIrq>,
    frequency_mhz: f32,
    applied: Vec<RadioParam>,
    rejected: Vec<RadioParam>,
    frames: VecDeque<Result<RadioFrame, RadioFault>>,
    transmitted: Vec<Vec<u8>>,
    auto_complete: bool,
    refuse_next: Option<RadioFault>,
    fail_next: Option<RadioFault>,
    receiving: bool,
    sleeping: bool,
    transmitting: bool,
    frequency_error: f32,
}

/// Radio chip that completes transmissions instantly unless told otherwise
pub struct SimRadio {
    shared: Arc<Mutex<SimRadioState>>,
}

/// Test-side control of a [`SimRadio`]
#[derive(Clone)]
pub struct SimRadioHandle {
    shared: Arc<Mutex<SimRadioState>>,
}

impl SimRadio {
    pub fn new() -> (Self, SimRadioHandle) {
        let shared = Arc::new(Mutex::new(SimRadioState {
            auto_complete: true,
            ..SimRadioState::default()
        }));
        (
            Self {
                shared: shared.clone(),
            },
            SimRadioHandle { shared },
        )
    }
}

impl RadioHardware for SimRadio {
    fn begin(&mut self, frequency_mhz: f32) -> Result<(), RadioFault> {
        lock(&self.shared).frequency_mhz = frequency_mhz;
        Ok(())
    }

    fn apply(&mut self, param: RadioParam) -> Result<(), RadioFault> {
        let mut state = lock(&self.shared);
        if state.rejected.contains(&param) {
            return Err(RadioFault::InvalidParameter);
        }
        if let RadioParam::Frequency(mhz) = param {
            state.frequency_mhz = mhz;
        }
        state.applied.push(param);
        Ok(())
    }

    fn attach_irq(&mut self, irq: RadioIrq) {
        lock(&self.shared).irq = Some(irq);
    }

    fn start_transmit(&mut self, data: &[u8]) -> Result<(), RadioFault> {
        let mut state = lock(&self.shared);
        if let Some(fault) = state.refuse_next.take() {
            return Err(fault);
        }
        state.receiving = false;
        state.transmitting = true;
        state.transmitted.push(data.to_vec());
        trace!(len = data.len(), "sim radio transmitting");
        if state.auto_complete {
            if let Some(irq) = &state.irq {
                irq.transmit_done();
            }
        }
        Ok(())
    }

    fn finish_transmit(&mut self) -> Result<(), RadioFault> {
        let mut state = lock(&self.shared);
        state.transmitting = false;
        match state.fail_next.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn start_receive(&mut self) -> Result<(), RadioFault> {
        let mut state = lock(&self.shared);
        state.receiving = true;
        state.sleeping = false;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RadioFrame, RadioFault> {
        lock(&self.shared).frames.pop_front().unwrap_or(Err(RadioFault::Code(-1)))
    }

    fn standby(&mut self) -> Result<(), RadioFault> {
        let mut state = lock(&self.shared);
        state.receiving = false;
        state.sleeping = false;
        state.transmitting = false;
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), RadioFault> {
        let mut state = lock(&self.shared);
        state.receiving = false;
        state.sleeping = true;
        Ok(())
    }

    fn frequency_error(&self) -> f32 {
        lock(&self.shared).frequency_error
    }

    fn is_busy(&self) -> bool {
        lock(&self.shared).transmitting
    }
}

impl SimRadioHandle {
    /// Queue a frame and raise the receive interrupt
    pub fn deliver_frame(&self, data: &[u8], rssi: i16, snr: f32) -> bool {
        let mut state = lock(&self.shared);
        let frequency_error = state.frequency_error;
        state.frames.push_back(Ok(RadioFrame {
            data: data.to_vec(),
            rssi,
            snr,
            frequency_error,
        }));
        raise_receive(&state)
    }

    /// Raise a receive interrupt for a frame that fails its CRC
    pub fn deliver_corrupt_frame(&self) -> bool {
        let mut state = lock(&self.shared);
        state.frames.push_back(Err(RadioFault::CrcMismatch));
        raise_receive(&state)
    }

    /// Raise the transmit-complete interrupt by hand
    pub fn complete_transmit(&self) -> bool {
        lock(&self.shared)
            .irq
            .as_ref()
            .map(|irq| irq.transmit_done())
            .unwrap_or(false)
    }

    /// When disabled, transmissions stay in flight until `complete_transmit`
    pub fn set_auto_complete(&self, enabled: bool) {
        lock(&self.shared).auto_complete = enabled;
    }

    /// Refuse the next `start_transmit`
    pub fn refuse_next_transmit(&self, fault: RadioFault) {
        lock(&self.shared).refuse_next = Some(fault);
    }

    /// Report `fault` when the next transmission completes
    pub fn fail_next_transmit(&self, fault: RadioFault) {
        lock(&self.shared).fail_next = Some(fault);
    }

    pub fn reject_param(&self, param: RadioParam) {
        lock(&self.shared).rejected.push(param);
    }

    pub fn set_frequency_error(&self, hz: f32) {
        lock(&self.shared).frequency_error = hz;
    }

    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        lock(&self.shared).transmitted.clone()
    }

    pub fn applied(&self) -> Vec<RadioParam> {
        lock(&self.shared).applied.clone()
    }

    pub fn frequency_mhz(&self) -> f32 {
        lock(&self.shared).frequency_mhz
    }

    pub fn is_receiving(&self) -> bool {
        lock(&self.shared).receiving
    }

    pub fn is_sleeping(&self) -> bool {
        lock(&self.shared).sleeping
    }
}

fn raise_receive(state: &SimRadioState) -> bool {
    state
        .irq
        .as_ref()
        .map(|irq| irq.receive_done())
        .unwrap_or(false)
}
