//! Waveform generators.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::VisaError;
use crate::si::si_format;

pub mod keysight_33500b;
pub mod rigol_dg1022z;

pub use keysight_33500b::Keysight33500b;
pub use rigol_dg1022z::{ArbUpload, RigolDg1022z, SineBurstTrain};

/// Width of a nominal TTL pulse (s).
pub const TTL_PWIDTH: f64 = 1e-5;
/// Amplitude of a nominal TTL pulse (V).
pub const TTL_PAMP: f64 = 10.0;

scpi_enum! {
    pub enum WaveformType {
        Sine => "SIN",
        Square => "SQU",
        Ramp => "RAMP",
        Pulse => "PULS",
        Noise => "NOIS",
        Dc => "DC",
        User => "USER",
    }
}

scpi_enum! {
    pub enum Slope {
        Positive => "POS",
        Negative => "NEG",
    }
}

scpi_enum! {
    pub enum Polarity {
        Normal => "NORM",
        Inverted => "INV",
    }
}

scpi_enum! {
    pub enum VoltageUnit {
        Vpp => "VPP",
        Vrms => "VRMS",
        Dbm => "DBM",
    }
}

scpi_enum! {
    pub enum BurstMode {
        Triggered => "TRIG",
        Infinite => "INF",
        Gated => "GAT",
    }
}

scpi_enum! {
    pub enum BurstIdleLevel {
        FirstPoint => "FPT",
        Top => "TOP",
        Center => "CENTER",
        Bottom => "BOTTOM",
    }
}

scpi_enum! {
    pub enum PulseHold {
        Width => "WIDT",
        Duty => "DUTY",
    }
}

scpi_enum! {
    pub enum ModulationMode {
        Am => "AM",
        Fm => "FM",
        Pm => "PM",
        Ask => "ASK",
        Fsk => "FSK",
        Psk => "PSK",
        Pwm => "PWM",
    }
}

scpi_enum! {
    pub enum ModulationSource {
        Internal => "INT",
        External => "EXT",
    }
}

scpi_enum! {
    pub enum TriggerSource {
        Internal => "INT",
        External => "EXT",
        Manual => "MAN",
    }
}

scpi_enum! {
    pub enum CouplingMode {
        Offset => "OFFS",
        Ratio => "RAT",
    }
}

scpi_enum! {
    pub enum ArbOutputMode {
        Frequency => "FREQ",
        SampleRate => "SRATE",
    }
}

/// How an arbitrary waveform is transferred to the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ArbDataType {
    /// Text floats in `[-1, 1]`.
    Float,
    /// Text integers in the DAC range.
    Dac,
    /// Binary little-endian u16 in the DAC range.
    #[default]
    Dac16,
}

/// How a carrier channel is gated by a second channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum GateType {
    /// The gating channel triggers fixed-length bursts on the carrier.
    #[default]
    Trigger,
    /// The gating channel amplitude-modulates the carrier.
    Modulation,
}

/// Per-axis coupling state across channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CouplingState {
    pub frequency: bool,
    pub phase: bool,
    pub amplitude: bool,
}

pub fn check_freq(freq: f64, fmax: f64) -> Result<(), VisaError> {
    if freq > fmax {
        return Err(VisaError::OutOfRange(format!(
            "frequency must be lower than {}Hz",
            si_format(fmax, 1)
        )));
    }
    Ok(())
}

pub fn check_amp(amp: f64, vmax: f64) -> Result<(), VisaError> {
    if amp / 2.0 > vmax {
        return Err(VisaError::OutOfRange(format!("VPP exceeds {vmax} V")));
    }
    Ok(())
}

/// Offset must keep the waveform within `±vmax` given its amplitude.
pub fn check_offset(offset: f64, amp: f64, vmax: f64) -> Result<(), VisaError> {
    if offset.abs() > vmax - amp / 2.0 {
        return Err(VisaError::OutOfRange(format!(
            "|VPP/2| + |Voffset| exceeds {vmax} V"
        )));
    }
    Ok(())
}

pub fn check_phase(phase: f64) -> Result<(), VisaError> {
    if !(0.0..=360.0).contains(&phase) {
        return Err(VisaError::OutOfRange(format!(
            "phase out of range: {phase} (must be within [0, 360] deg)"
        )));
    }
    Ok(())
}

pub fn check_duty_cycle(dc: f64) -> Result<(), VisaError> {
    if dc <= 0.0 || dc >= 100.0 {
        return Err(VisaError::OutOfRange(format!(
            "duty cycle out of range: {dc} (must be within ]0, 100[ %)"
        )));
    }
    Ok(())
}

/// Number of carrier cycles fitting in a burst of duration `t` (s) for a
/// carrier period `period` (s).
pub fn burst_cycles(t: f64, period: f64, max_duration: f64) -> Result<u32, VisaError> {
    if t < period && period - t > 1e-8 {
        return Err(VisaError::OutOfRange(format!(
            "burst duration ({}s) shorter than stimulus periodicity ({}s)",
            si_format(t, 2),
            si_format(period, 2)
        )));
    }
    if t > max_duration {
        return Err(VisaError::OutOfRange(format!(
            "burst duration ({t:.2e} s) above max value ({max_duration:.2e} s)"
        )));
    }
    Ok((t / period).round() as u32)
}

/// Operations shared by every waveform generator.
#[async_trait]
pub trait WaveformGenerator: Send {
    fn channels(&self) -> &'static [u8];

    async fn idn(&mut self) -> Result<String>;

    /// Issue a single beep.
    async fn beep(&mut self) -> Result<()>;

    async fn enable_output_channel(&mut self, ich: u8) -> Result<()>;

    async fn disable_output_channel(&mut self, ich: u8) -> Result<()>;

    async fn output_state(&mut self, ich: u8) -> Result<bool>;

    async fn enable_output(&mut self) -> Result<()> {
        for &ich in self.channels() {
            self.enable_output_channel(ich).await?;
        }
        Ok(())
    }

    async fn disable_output(&mut self) -> Result<()> {
        for &ich in self.channels() {
            self.disable_output_channel(ich).await?;
        }
        Ok(())
    }

    async fn apply_waveform(
        &mut self,
        wtype: WaveformType,
        ich: u8,
        freq: f64,
        amp: f64,
        offset: f64,
        phase: f64,
    ) -> Result<()>;

    async fn apply_sine(&mut self, ich: u8, freq: f64, amp: f64, offset: f64) -> Result<()> {
        self.apply_waveform(WaveformType::Sine, ich, freq, amp, offset, 0.0)
            .await
    }

    async fn apply_pulse(&mut self, ich: u8, freq: f64, amp: f64, offset: f64) -> Result<()> {
        self.apply_waveform(WaveformType::Pulse, ich, freq, amp, offset, 0.0)
            .await
    }

    async fn apply_square(&mut self, ich: u8, freq: f64, amp: f64, offset: f64) -> Result<()> {
        self.apply_waveform(WaveformType::Square, ich, freq, amp, offset, 0.0)
            .await
    }

    async fn set_waveform_freq(&mut self, ich: u8, freq: f64) -> Result<()>;

    async fn waveform_freq(&mut self, ich: u8) -> Result<f64>;

    async fn set_waveform_amp(&mut self, ich: u8, amp: f64) -> Result<()>;

    async fn waveform_amp(&mut self, ich: u8) -> Result<f64>;

    async fn set_waveform_offset(&mut self, ich: u8, offset: f64) -> Result<()>;

    async fn waveform_offset(&mut self, ich: u8) -> Result<f64>;

    async fn enable_burst(&mut self, ich: u8) -> Result<()>;

    async fn disable_burst(&mut self, ich: u8) -> Result<()>;

    async fn set_burst_ncycles(&mut self, ich: u8, n: u32) -> Result<()>;

    async fn set_trigger_source(&mut self, ich: u8, source: TriggerSource) -> Result<()>;

    /// Trigger a channel programmatically.
    async fn trigger_channel(&mut self, ich: u8) -> Result<()>;

    /// Unlock the front panel and release the link.
    async fn disconnect(&mut self) -> Result<()>;
}
