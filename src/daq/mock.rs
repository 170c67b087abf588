//! Recording counter backend for tests.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{CounterBackend, PulseTiming};
use crate::error::DaqError;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateTask(String),
    CreatePulseChannel(String),
    ConfigureTiming(PulseTiming),
    ConfigureTrigger(String, String),
    Start,
    Stop,
    Clear,
}

struct MockState {
    devices: Vec<String>,
    calls: Vec<Call>,
    running: bool,
}

/// Clones share state.
#[derive(Clone)]
pub struct MockCounter {
    state: Arc<Mutex<MockState>>,
}

impl MockCounter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                devices: vec!["Dev1".into()],
                calls: Vec::new(),
                running: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_devices(&self, devices: Vec<String>) {
        self.state().devices = devices;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

impl CounterBackend for MockCounter {
    fn device_names(&mut self) -> Result<Vec<String>, DaqError> {
        Ok(self.state().devices.clone())
    }

    fn terminals(&mut self, device: &str) -> Result<Vec<String>, DaqError> {
        Ok((0..8).map(|n| format!("/{device}/PFI{n}")).collect())
    }

    fn co_channels(&mut self, device: &str) -> Result<Vec<String>, DaqError> {
        Ok((0..4).map(|n| format!("{device}/ctr{n}")).collect())
    }

    fn create_task(&mut self, name: &str) -> Result<(), DaqError> {
        self.record(Call::CreateTask(name.to_string()));
        Ok(())
    }

    fn create_pulse_channel(&mut self, counter: &str, _timing: &PulseTiming) -> Result<(), DaqError> {
        self.record(Call::CreatePulseChannel(counter.to_string()));
        Ok(())
    }

    fn configure_timing(&mut self, timing: &PulseTiming) -> Result<(), DaqError> {
        self.record(Call::ConfigureTiming(*timing));
        Ok(())
    }

    fn configure_trigger(&mut self, input: &str, output: &str) -> Result<(), DaqError> {
        self.record(Call::ConfigureTrigger(input.to_string(), output.to_string()));
        Ok(())
    }

    fn start(&mut self) -> Result<(), DaqError> {
        let mut state = self.state();
        state.running = true;
        state.calls.push(Call::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        let mut state = self.state();
        state.running = false;
        state.calls.push(Call::Stop);
        Ok(())
    }

    fn is_done(&mut self) -> Result<bool, DaqError> {
        Ok(!self.state().running)
    }

    fn clear(&mut self) -> Result<(), DaqError> {
        let mut state = self.state();
        state.running = false;
        state.calls.push(Call::Clear);
        Ok(())
    }
}
