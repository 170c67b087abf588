//! Retriggerable counter-output pulse trains on NI-DAQ devices.
//!
//! A [`PulseTrainGenerator`] emits `npulses` pulses on an output PFI line
//! each time a digital edge arrives on its input PFI line, e.g. to fire a
//! stimulus at a fixed delay after an acquisition starts.

use std::fmt;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::DaqSettings;
use crate::error::DaqError;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;

pub const TASK_NAME: &str = "PulseTrainGenerator";
/// Pulse width of [`trigger_train`] (s).
pub const TRIGGER_PULSE_WIDTH: f64 = 5e-3;
pub const TRIGGER_TRAIN_DEVICE: &str = "PXI1Slot6";

/// Counter pulse timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseTiming {
    /// Hz.
    pub freq: f64,
    /// Pulse width over period.
    pub duty_cycle: f64,
    /// Delay of the first pulse after each trigger (s).
    pub initial_delay: f64,
    pub npulses: u64,
}

impl Default for PulseTiming {
    fn default() -> Self {
        Self {
            freq: 1.0,
            duty_cycle: 0.5,
            initial_delay: 0.0,
            npulses: 1,
        }
    }
}

/// Blocking access to a DAQmx-like driver holding a single task.
pub trait CounterBackend: Send {
    fn device_names(&mut self) -> Result<Vec<String>, DaqError>;

    fn terminals(&mut self, device: &str) -> Result<Vec<String>, DaqError>;

    /// Physical counter output channels of `device`.
    fn co_channels(&mut self, device: &str) -> Result<Vec<String>, DaqError>;

    fn create_task(&mut self, name: &str) -> Result<(), DaqError>;

    fn create_pulse_channel(&mut self, counter: &str, timing: &PulseTiming) -> Result<(), DaqError>;

    /// Apply `timing`, keeping the initial delay on every retrigger.
    fn configure_timing(&mut self, timing: &PulseTiming) -> Result<(), DaqError>;

    /// Start on rising edges of `input`, retriggerable, pulsing on `output`.
    fn configure_trigger(&mut self, input: &str, output: &str) -> Result<(), DaqError>;

    fn start(&mut self) -> Result<(), DaqError>;

    fn stop(&mut self) -> Result<(), DaqError>;

    fn is_done(&mut self) -> Result<bool, DaqError>;

    fn clear(&mut self) -> Result<(), DaqError>;
}

/// Backend compiled into this build.
pub fn default_backend() -> Result<Box<dyn CounterBackend>, DaqError> {
    #[cfg(feature = "nidaqmx")]
    {
        Ok(Box::new(nidaqmx::NiDaqmxBackend::new()))
    }
    #[cfg(not(feature = "nidaqmx"))]
    {
        Err(DaqError::BackendUnavailable)
    }
}

impl<B: CounterBackend + ?Sized> CounterBackend for Box<B> {
    fn device_names(&mut self) -> Result<Vec<String>, DaqError> {
        (**self).device_names()
    }

    fn terminals(&mut self, device: &str) -> Result<Vec<String>, DaqError> {
        (**self).terminals(device)
    }

    fn co_channels(&mut self, device: &str) -> Result<Vec<String>, DaqError> {
        (**self).co_channels(device)
    }

    fn create_task(&mut self, name: &str) -> Result<(), DaqError> {
        (**self).create_task(name)
    }

    fn create_pulse_channel(&mut self, counter: &str, timing: &PulseTiming) -> Result<(), DaqError> {
        (**self).create_pulse_channel(counter, timing)
    }

    fn configure_timing(&mut self, timing: &PulseTiming) -> Result<(), DaqError> {
        (**self).configure_timing(timing)
    }

    fn configure_trigger(&mut self, input: &str, output: &str) -> Result<(), DaqError> {
        (**self).configure_trigger(input, output)
    }

    fn start(&mut self) -> Result<(), DaqError> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        (**self).stop()
    }

    fn is_done(&mut self) -> Result<bool, DaqError> {
        (**self).is_done()
    }

    fn clear(&mut self) -> Result<(), DaqError> {
        (**self).clear()
    }
}

/// Construction parameters of a [`PulseTrainGenerator`].
///
/// `None` lines and counters fall back to the first ones the device
/// reports; a `None` device to the first device found.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseTrainConfig {
    pub device: Option<String>,
    pub input_pfi: Option<u32>,
    pub output_pfi: Option<u32>,
    pub counter: Option<u32>,
    pub timing: PulseTiming,
}

impl Default for PulseTrainConfig {
    fn default() -> Self {
        Self {
            device: None,
            input_pfi: Some(0),
            output_pfi: Some(1),
            counter: Some(0),
            timing: PulseTiming::default(),
        }
    }
}

impl From<&DaqSettings> for PulseTrainConfig {
    fn from(settings: &DaqSettings) -> Self {
        Self {
            device: Some(settings.device.clone()),
            input_pfi: Some(settings.input_pfi),
            output_pfi: Some(settings.output_pfi),
            counter: Some(settings.counter),
            timing: PulseTiming::default(),
        }
    }
}

fn validate(key: &str, value: f64) -> Result<(), DaqError> {
    if !value.is_finite() || value < 0.0 {
        return Err(DaqError::InvalidSetting(format!(
            "{key} must be a positive finite scalar (got {value})"
        )));
    }
    Ok(())
}

fn validate_timing(timing: &PulseTiming) -> Result<(), DaqError> {
    validate("freq", timing.freq)?;
    validate("duty_cycle", timing.duty_cycle)?;
    validate("initial_delay", timing.initial_delay)
}

pub struct PulseTrainGenerator<B: CounterBackend = Box<dyn CounterBackend>> {
    backend: B,
    device: String,
    input_pfi: Option<u32>,
    output_pfi: Option<u32>,
    counter: Option<u32>,
    timing: PulseTiming,
}

impl<B: CounterBackend> PulseTrainGenerator<B> {
    /// Create the underlying task and configure it.
    pub fn new(mut backend: B, config: PulseTrainConfig) -> Result<Self> {
        validate_timing(&config.timing)?;
        let device = match config.device {
            Some(device) => device,
            None => backend
                .device_names()?
                .into_iter()
                .next()
                .ok_or(DaqError::NoDevice)?,
        };
        let mut ptg = Self {
            backend,
            device,
            input_pfi: config.input_pfi,
            output_pfi: config.output_pfi,
            counter: config.counter,
            timing: config.timing,
        };
        ptg.create_task()?;
        info!("created {ptg}");
        Ok(ptg)
    }

    fn create_task(&mut self) -> Result<()> {
        let channel = self.output_channel()?;
        self.backend.create_task(TASK_NAME)?;
        self.backend.create_pulse_channel(&channel, &self.timing)?;
        self.update_timer_props("init")?;
        self.update_trigger_props("init")
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn input_pfi(&self) -> Option<u32> {
        self.input_pfi
    }

    pub fn output_pfi(&self) -> Option<u32> {
        self.output_pfi
    }

    pub fn counter(&self) -> Option<u32> {
        self.counter
    }

    pub fn timing(&self) -> &PulseTiming {
        &self.timing
    }

    pub fn input_terminal(&mut self) -> Result<String> {
        match self.input_pfi {
            Some(n) => Ok(format!("/{}/PFI{n}", self.device)),
            None => self.nth_terminal(0),
        }
    }

    pub fn output_terminal(&mut self) -> Result<String> {
        match self.output_pfi {
            Some(n) => Ok(format!("/{}/PFI{n}", self.device)),
            None => self.nth_terminal(1),
        }
    }

    pub fn output_channel(&mut self) -> Result<String> {
        match self.counter {
            Some(n) => Ok(format!("{}/ctr{n}", self.device)),
            None => self
                .backend
                .co_channels(&self.device)?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    DaqError::InvalidSetting(format!("{} has no counter output channel", self.device)).into()
                }),
        }
    }

    fn nth_terminal(&mut self, n: usize) -> Result<String> {
        self.backend
            .terminals(&self.device)?
            .into_iter()
            .nth(n)
            .ok_or_else(|| DaqError::InvalidSetting(format!("{} has fewer than {} terminals", self.device, n + 1)).into())
    }

    fn check_task_disabled(&mut self, prop: &str) -> Result<()> {
        if !self.backend.is_done()? {
            return Err(DaqError::TaskRunning(prop.to_string()).into());
        }
        Ok(())
    }

    fn update_timer_props(&mut self, prop: &str) -> Result<()> {
        self.check_task_disabled(prop)?;
        Ok(self.backend.configure_timing(&self.timing)?)
    }

    fn update_trigger_props(&mut self, prop: &str) -> Result<()> {
        self.check_task_disabled(prop)?;
        let input = self.input_terminal()?;
        let output = self.output_terminal()?;
        Ok(self.backend.configure_trigger(&input, &output)?)
    }

    fn set_timing_field(&mut self, prop: &str, update: impl FnOnce(&mut PulseTiming)) -> Result<()> {
        let mut timing = self.timing;
        update(&mut timing);
        validate_timing(&timing)?;
        self.check_task_disabled(prop)?;
        self.timing = timing;
        self.update_timer_props(prop)
    }

    pub fn set_freq(&mut self, freq: f64) -> Result<()> {
        self.set_timing_field("freq", |t| t.freq = freq)
    }

    pub fn set_duty_cycle(&mut self, duty_cycle: f64) -> Result<()> {
        self.set_timing_field("duty_cycle", |t| t.duty_cycle = duty_cycle)
    }

    pub fn set_initial_delay(&mut self, delay: f64) -> Result<()> {
        self.set_timing_field("initial_delay", |t| t.initial_delay = delay)
    }

    pub fn set_npulses(&mut self, npulses: u64) -> Result<()> {
        self.set_timing_field("npulses", |t| t.npulses = npulses)
    }

    pub fn set_input_pfi(&mut self, pfi: Option<u32>) -> Result<()> {
        self.check_task_disabled("input_PFI")?;
        self.input_pfi = pfi;
        self.update_trigger_props("input_PFI")
    }

    pub fn set_output_pfi(&mut self, pfi: Option<u32>) -> Result<()> {
        self.check_task_disabled("output_PFI")?;
        self.output_pfi = pfi;
        self.update_trigger_props("output_PFI")
    }

    /// The counter is bound when the channel is created, so changing it
    /// rebuilds the task.
    pub fn set_counter(&mut self, counter: Option<u32>) -> Result<()> {
        self.check_task_disabled("output_co")?;
        self.counter = counter;
        self.backend.clear()?;
        self.create_task()
    }

    pub fn is_enabled(&mut self) -> Result<bool> {
        Ok(!self.backend.is_done()?)
    }

    pub fn enable(&mut self) -> Result<()> {
        if self.is_enabled()? {
            return Err(DaqError::InvalidSetting("pulse train generator is already enabled".into()).into());
        }
        info!("starting task...");
        Ok(self.backend.start()?)
    }

    pub fn disable(&mut self) -> Result<()> {
        info!("stopping task...");
        Ok(self.backend.stop()?)
    }
}

impl<B: CounterBackend> fmt::Display for PulseTrainGenerator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt = |v: Option<u32>| v.map_or_else(|| "None".to_string(), |v| v.to_string());
        write!(
            f,
            "{TASK_NAME}({}, PFI_in={}, PFI_out={}, CO_out={}, freq={:.2}Hz, delay={:.2}s, npulses={})",
            self.device,
            opt(self.input_pfi),
            opt(self.output_pfi),
            opt(self.counter),
            self.timing.freq,
            self.timing.initial_delay,
            self.timing.npulses
        )
    }
}

impl<B: CounterBackend> Drop for PulseTrainGenerator<B> {
    fn drop(&mut self) {
        info!("closing task ...");
        if let Err(e) = self.backend.clear() {
            warn!("failed to clear task: {e}");
        }
    }
}

/// Arm a train of `npulses` 5 ms TTL pulses, `interval` seconds apart,
/// starting `delay` seconds after each acquisition trigger.
pub fn trigger_train<B: CounterBackend>(
    backend: B,
    delay: f64,
    interval: f64,
    npulses: u64,
) -> Result<PulseTrainGenerator<B>> {
    if !interval.is_finite() || interval <= 0.0 {
        return Err(DaqError::InvalidSetting(format!("interval must be strictly positive (got {interval})")).into());
    }
    let config = PulseTrainConfig {
        device: Some(TRIGGER_TRAIN_DEVICE.to_string()),
        input_pfi: Some(0),
        output_pfi: Some(1),
        counter: Some(0),
        timing: PulseTiming {
            freq: 1.0 / interval,
            duty_cycle: TRIGGER_PULSE_WIDTH / interval,
            initial_delay: delay,
            npulses,
        },
    };
    let mut ptg = PulseTrainGenerator::new(backend, config)?;
    ptg.enable()?;
    Ok(ptg)
}

#[cfg(test)]
mod tests {
    use super::mock::{Call, MockCounter};
    use super::*;

    #[test]
    fn creation_configures_channel_timing_and_trigger() {
        let mock = MockCounter::new();
        let ptg = PulseTrainGenerator::new(mock.clone(), PulseTrainConfig::default()).unwrap();
        assert_eq!(ptg.device(), "Dev1");
        let calls = mock.calls();
        assert_eq!(calls[0], Call::CreateTask(TASK_NAME.into()));
        assert_eq!(calls[1], Call::CreatePulseChannel("Dev1/ctr0".into()));
        assert_eq!(calls[2], Call::ConfigureTiming(PulseTiming::default()));
        assert_eq!(
            calls[3],
            Call::ConfigureTrigger("/Dev1/PFI0".into(), "/Dev1/PFI1".into())
        );
        assert_eq!(
            ptg.to_string(),
            "PulseTrainGenerator(Dev1, PFI_in=0, PFI_out=1, CO_out=0, freq=1.00Hz, delay=0.00s, npulses=1)"
        );
    }

    #[test]
    fn unset_lines_fall_back_to_device_lists() {
        let mock = MockCounter::new();
        let config = PulseTrainConfig {
            device: Some("Dev2".into()),
            input_pfi: None,
            output_pfi: None,
            counter: None,
            ..Default::default()
        };
        let mut ptg = PulseTrainGenerator::new(mock.clone(), config).unwrap();
        assert_eq!(ptg.input_terminal().unwrap(), "/Dev2/PFI0");
        assert_eq!(ptg.output_terminal().unwrap(), "/Dev2/PFI1");
        assert_eq!(ptg.output_channel().unwrap(), "Dev2/ctr0");
        assert!(ptg.to_string().contains("PFI_in=None"));
    }

    #[test]
    fn invalid_values_are_refused() {
        let mock = MockCounter::new();
        let mut ptg = PulseTrainGenerator::new(mock.clone(), PulseTrainConfig::default()).unwrap();
        assert!(ptg.set_freq(-1.0).is_err());
        assert!(ptg.set_initial_delay(f64::INFINITY).is_err());
        assert_eq!(ptg.timing().freq, 1.0);
        ptg.set_freq(20.0).unwrap();
        assert_eq!(
            mock.calls().last().unwrap(),
            &Call::ConfigureTiming(PulseTiming {
                freq: 20.0,
                ..Default::default()
            })
        );
    }

    #[test]
    fn settings_are_locked_while_running() {
        let mock = MockCounter::new();
        let mut ptg = PulseTrainGenerator::new(mock.clone(), PulseTrainConfig::default()).unwrap();
        ptg.enable().unwrap();
        assert!(ptg.is_enabled().unwrap());
        assert!(ptg.enable().is_err());
        let err = ptg.set_npulses(5).unwrap_err();
        assert!(matches!(err.downcast_ref::<DaqError>(), Some(DaqError::TaskRunning(_))));
        assert_eq!(ptg.timing().npulses, 1);
        assert!(ptg.set_output_pfi(Some(3)).is_err());
        ptg.disable().unwrap();
        ptg.set_output_pfi(Some(3)).unwrap();
        assert_eq!(
            mock.calls().last().unwrap(),
            &Call::ConfigureTrigger("/Dev1/PFI0".into(), "/Dev1/PFI3".into())
        );
    }

    #[test]
    fn changing_counter_rebuilds_task() {
        let mock = MockCounter::new();
        let mut ptg = PulseTrainGenerator::new(mock.clone(), PulseTrainConfig::default()).unwrap();
        ptg.set_counter(Some(2)).unwrap();
        assert!(mock.calls().contains(&Call::CreatePulseChannel("Dev1/ctr2".into())));
    }

    #[test]
    fn dropping_clears_the_task() {
        let mock = MockCounter::new();
        drop(PulseTrainGenerator::new(mock.clone(), PulseTrainConfig::default()).unwrap());
        assert_eq!(mock.calls().last().unwrap(), &Call::Clear);
    }

    #[test]
    fn trigger_train_uses_5ms_pulses() {
        let mock = MockCounter::new();
        let ptg = trigger_train(mock.clone(), 0.1, 0.5, 10).unwrap();
        assert_eq!(ptg.device(), TRIGGER_TRAIN_DEVICE);
        assert_eq!(ptg.timing().freq, 2.0);
        assert!((ptg.timing().duty_cycle - 0.01).abs() < 1e-12);
        assert_eq!(ptg.timing().npulses, 10);
        assert!(mock.calls().contains(&Call::Start));
        assert!(trigger_train(MockCounter::new(), 0.0, 0.0, 1).is_err());
    }

    #[test]
    fn no_device_found() {
        let mock = MockCounter::new();
        mock.set_devices(Vec::new());
        let err = PulseTrainGenerator::new(mock, PulseTrainConfig::default()).err().unwrap();
        assert!(matches!(err.downcast_ref::<DaqError>(), Some(DaqError::NoDevice)));
    }
}
