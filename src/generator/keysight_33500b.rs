//! Keysight (Agilent) 33500B two-channel function/arbitrary waveform generator.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    burst_cycles, check_amp, check_duty_cycle, check_freq, check_offset, check_phase, BurstMode,
    ModulationSource, Polarity, Slope, TriggerSource, VoltageUnit, WaveformGenerator,
    WaveformType,
};
use crate::error::VisaError;
use crate::resource::ResourceManager;
use crate::si::si_format;
use crate::transport::Transport;
use crate::visa::{check_channel, check_option, ModelInfo, VisaInstrument};

pub const MODEL: ModelInfo = ModelInfo {
    name: "Keysight33500B",
    id_pattern: r"MY5\d+",
    prefix: "",
    no_error: "+0,\"No error\"",
    timeout: None,
};

pub const CHANNELS: &[u8] = &[1, 2];
/// Max frequency (Hz).
pub const FMAX: f64 = 10e6;
/// Max voltage (V).
pub const VMAX: f64 = 10.0;
pub const MAX_LEN_TEXT: usize = 40;
/// Max burst duration, also used as the internal period of single pulses (s).
pub const MAX_BURST_PERIOD: f64 = 10.0;
pub const BURST_MODES: &[BurstMode] = &[BurstMode::Triggered, BurstMode::Gated];

scpi_enum! {
    pub enum AngleUnit {
        Degree => "DEG",
        Radian => "RAD",
    }
}

scpi_enum! {
    pub enum SweepScale {
        Linear => "LIN",
        Logarithmic => "LOG",
    }
}

scpi_enum! {
    pub enum ModulationFunction {
        Sine => "SIN",
        Square => "SQU",
        Ramp => "RAMP",
        NegativeRamp => "NRAM",
        Triangle => "TRI",
        Noise => "NOIS",
        User => "USER",
    }
}

scpi_enum! {
    /// Mutually exclusive modulation subsystems; burst counts as one.
    pub enum Modulation {
        Am => "AM",
        Fm => "FM",
        Pm => "PM",
        Fsk => "FSK",
        Pwm => "PWM",
        Burst => "BURS",
    }
}

scpi_enum! {
    pub enum KeysightTrigger {
        Immediate => "IMM",
        External => "EXT",
        Bus => "BUS",
    }
}

impl From<TriggerSource> for KeysightTrigger {
    fn from(source: TriggerSource) -> Self {
        match source {
            TriggerSource::Internal => KeysightTrigger::Immediate,
            TriggerSource::External => KeysightTrigger::External,
            TriggerSource::Manual => KeysightTrigger::Bus,
        }
    }
}

impl From<KeysightTrigger> for TriggerSource {
    fn from(source: KeysightTrigger) -> Self {
        match source {
            KeysightTrigger::Immediate => TriggerSource::Internal,
            KeysightTrigger::External => TriggerSource::External,
            KeysightTrigger::Bus => TriggerSource::Manual,
        }
    }
}

pub struct Keysight33500b {
    inst: VisaInstrument,
    /// Active modulation of each channel, as last set through this driver.
    modulation: [Option<Modulation>; 2],
}

impl Keysight33500b {
    pub async fn connect(rm: &ResourceManager) -> Result<Self> {
        let inst = VisaInstrument::open(rm, MODEL).await?;
        Self::init(inst).await
    }

    /// Drive an instrument over an already open link.
    pub async fn with_transport(link: Box<dyn Transport>) -> Result<Self> {
        let inst = VisaInstrument::from_transport(link, MODEL).await?;
        Self::init(inst).await
    }

    async fn init(inst: VisaInstrument) -> Result<Self> {
        let mut fg = Self {
            inst,
            modulation: [None; 2],
        };
        fg.disable_output().await?;
        fg.beep().await?;
        Ok(fg)
    }

    pub fn instrument(&mut self) -> &mut VisaInstrument {
        &mut self.inst
    }

    // --------------------- miscellaneous ---------------------

    pub async fn idn(&mut self) -> Result<String> {
        self.inst.idn().await
    }

    pub async fn beep(&mut self) -> Result<()> {
        self.inst.write("SYST:BEEP").await
    }

    pub async fn display_text(&mut self, text: &str) -> Result<()> {
        if text.chars().count() > MAX_LEN_TEXT {
            return Err(VisaError::OutOfRange(format!(
                "maximum text length ({MAX_LEN_TEXT} chars) exceeded"
            ))
            .into());
        }
        self.inst.write(&format!("DISP:TEXT \"{text}\"")).await
    }

    pub async fn erase_text(&mut self) -> Result<()> {
        self.inst.write("DISP:TEXT:CLE").await
    }

    pub async fn check_error(&mut self) -> Result<()> {
        self.inst.check_error("SYST:ERR?").await
    }

    // --------------------- units ---------------------

    pub async fn set_angle_unit(&mut self, unit: AngleUnit) -> Result<()> {
        self.inst.write(&format!("UNIT:ANGL {unit}")).await
    }

    pub async fn angle_unit(&mut self) -> Result<AngleUnit> {
        Ok(self.inst.query("UNIT:ANGL?").await?.parse()?)
    }

    pub async fn set_voltage_unit(&mut self, ich: u8, unit: VoltageUnit) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:VOLT:UNIT {unit}")).await
    }

    pub async fn voltage_unit(&mut self, ich: u8) -> Result<VoltageUnit> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("SOUR{ich}:VOLT:UNIT?")).await?.parse()?)
    }

    // --------------------- output ---------------------

    pub async fn enable_output_channel(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("OUTP{ich} ON")).await
    }

    pub async fn disable_output_channel(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("OUTP{ich} OFF")).await
    }

    pub async fn enable_output(&mut self) -> Result<()> {
        for &ich in CHANNELS {
            self.enable_output_channel(ich).await?;
        }
        Ok(())
    }

    pub async fn disable_output(&mut self) -> Result<()> {
        for &ich in CHANNELS {
            self.disable_output_channel(ich).await?;
        }
        Ok(())
    }

    pub async fn output_state(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_bool(&format!("OUTP{ich}?")).await
    }

    // --------------------- basic waveform ---------------------

    /// The instrument applies waveforms without a phase argument, so a
    /// non-zero `phase` (deg) is set in a second command.
    pub async fn apply_waveform(
        &mut self,
        wtype: WaveformType,
        ich: u8,
        freq: f64,
        amp: f64,
        offset: f64,
        phase: f64,
    ) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        check_freq(freq, FMAX)?;
        check_amp(amp, VMAX)?;
        check_offset(offset, amp, VMAX)?;
        check_phase(phase)?;
        self.inst
            .write(&format!("SOUR{ich}:APPL:{wtype} {freq}, {amp}, {offset}"))
            .await?;
        if phase != 0.0 {
            self.set_waveform_phase(ich, phase).await?;
        }
        Ok(())
    }

    pub async fn set_waveform_type(&mut self, ich: u8, wtype: WaveformType) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:FUNC {wtype}")).await
    }

    pub async fn waveform_type(&mut self, ich: u8) -> Result<WaveformType> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("SOUR{ich}:FUNC?")).await?.parse()?)
    }

    pub async fn set_waveform_freq(&mut self, ich: u8, freq: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        check_freq(freq, FMAX)?;
        self.inst.write(&format!("SOUR{ich}:FREQ {freq}")).await
    }

    pub async fn waveform_freq(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:FREQ?")).await
    }

    pub async fn set_waveform_amp(&mut self, ich: u8, amp: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        check_amp(amp, VMAX)?;
        self.inst.write(&format!("SOUR{ich}:VOLT {amp}")).await
    }

    pub async fn waveform_amp(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:VOLT?")).await
    }

    pub async fn set_waveform_offset(&mut self, ich: u8, offset: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        let amp = self.waveform_amp(ich).await?;
        check_offset(offset, amp, VMAX)?;
        self.inst.write(&format!("SOUR{ich}:VOLT:OFFS {offset}")).await
    }

    pub async fn waveform_offset(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:VOLT:OFFS?")).await
    }

    /// Phase in the current angle unit.
    pub async fn set_waveform_phase(&mut self, ich: u8, phase: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:PHAS {phase}")).await
    }

    pub async fn waveform_phase(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:PHAS?")).await
    }

    pub async fn set_square_duty_cycle(&mut self, ich: u8, dc: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        check_duty_cycle(dc)?;
        self.inst
            .write(&format!("SOUR{ich}:FUNC:SQU:DCYC {dc}"))
            .await
    }

    pub async fn square_duty_cycle(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .query_f64(&format!("SOUR{ich}:FUNC:SQU:DCYC?"))
            .await
    }

    // --------------------- pulse ---------------------

    pub async fn set_pulse_mode(&mut self, ich: u8) -> Result<()> {
        self.set_waveform_type(ich, WaveformType::Pulse).await
    }

    /// Pulse period (s).
    pub async fn set_pulse_period(&mut self, ich: u8, period: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:PULS:PER {period}")).await
    }

    pub async fn pulse_period(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:PULS:PER?")).await
    }

    // --------------------- modulation ---------------------

    /// Enable `key` on `ich`, switching off whichever other modulation this
    /// driver enabled there before.
    pub async fn enable_modulation(&mut self, ich: u8, key: Modulation) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        let slot = usize::from(ich - 1);
        if let Some(active) = self.modulation[slot].filter(|&m| m != key) {
            self.disable_modulation(ich, active).await?;
        }
        self.inst.write(&format!("SOUR{ich}:{key}:STAT ON")).await?;
        self.modulation[slot] = Some(key);
        Ok(())
    }

    pub async fn disable_modulation(&mut self, ich: u8, key: Modulation) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:{key}:STAT OFF")).await?;
        self.modulation[usize::from(ich - 1)] = None;
        Ok(())
    }

    /// Modulation currently enabled on `ich`, confirmed with the instrument.
    pub async fn modulation(&mut self, ich: u8) -> Result<Option<Modulation>> {
        check_channel(ich, CHANNELS)?;
        let Some(key) = self.modulation[usize::from(ich - 1)] else {
            return Ok(None);
        };
        let command = format!("SOUR{ich}:{key}:STAT?");
        if !self.inst.query_bool(&command).await? {
            return Err(VisaError::Response {
                command,
                response: format!("{key} reported off"),
            }
            .into());
        }
        Ok(Some(key))
    }

    fn active_modulation(&self, ich: u8) -> Result<Modulation> {
        check_channel(ich, CHANNELS)?;
        self.modulation[usize::from(ich - 1)]
            .ok_or_else(|| VisaError::Instrument(format!("no modulation enabled on channel {ich}")).into())
    }

    pub async fn set_modulation_source(&mut self, ich: u8, source: ModulationSource) -> Result<()> {
        let key = self.active_modulation(ich)?;
        self.inst.write(&format!("SOUR{ich}:{key}:SOUR {source}")).await
    }

    pub async fn modulation_source(&mut self, ich: u8) -> Result<ModulationSource> {
        let key = self.active_modulation(ich)?;
        Ok(self.inst.query(&format!("SOUR{ich}:{key}:SOUR?")).await?.parse()?)
    }

    pub async fn set_modulation_function(&mut self, ich: u8, func: ModulationFunction) -> Result<()> {
        let key = self.active_modulation(ich)?;
        self.inst
            .write(&format!("SOUR{ich}:{key}:INT:FUNC {func}"))
            .await
    }

    pub async fn modulation_function(&mut self, ich: u8) -> Result<ModulationFunction> {
        let key = self.active_modulation(ich)?;
        Ok(self
            .inst
            .query(&format!("SOUR{ich}:{key}:INT:FUNC?"))
            .await?
            .parse()?)
    }

    /// Frequency of the internal modulating function (Hz).
    pub async fn set_modulation_freq(&mut self, ich: u8, freq: f64) -> Result<()> {
        let key = self.active_modulation(ich)?;
        self.inst
            .write(&format!("SOUR{ich}:{key}:INT:FREQ {freq}"))
            .await
    }

    pub async fn modulation_freq(&mut self, ich: u8) -> Result<f64> {
        let key = self.active_modulation(ich)?;
        self.inst
            .query_f64(&format!("SOUR{ich}:{key}:INT:FREQ?"))
            .await
    }

    /// AM depth (%).
    pub async fn set_am_depth(&mut self, ich: u8, depth: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        if !(0.0..=120.0).contains(&depth) {
            return Err(VisaError::OutOfRange(format!(
                "AM depth out of range: {depth} (must be within [0, 120] %)"
            ))
            .into());
        }
        self.inst.write(&format!("SOUR{ich}:AM:DEPT {depth}")).await
    }

    pub async fn am_depth(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:AM:DEPT?")).await
    }

    // --------------------- burst ---------------------

    pub async fn enable_burst(&mut self, ich: u8) -> Result<()> {
        self.enable_modulation(ich, Modulation::Burst).await
    }

    pub async fn disable_burst(&mut self, ich: u8) -> Result<()> {
        self.disable_modulation(ich, Modulation::Burst).await
    }

    /// Triggered or gated; the instrument has no infinite burst.
    pub async fn set_burst_mode(&mut self, ich: u8, mode: BurstMode) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        check_option(&mode, BURST_MODES, "burst mode")?;
        self.inst.write(&format!("SOUR{ich}:BURS:MODE {mode}")).await
    }

    pub async fn burst_mode(&mut self, ich: u8) -> Result<BurstMode> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("SOUR{ich}:BURS:MODE?")).await?.parse()?)
    }

    pub async fn set_burst_ncycles(&mut self, ich: u8, n: u32) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:BURS:NCYC {n}")).await
    }

    pub async fn burst_ncycles(&mut self, ich: u8) -> Result<u32> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query_i64(&format!("SOUR{ich}:BURS:NCYC?")).await? as u32)
    }

    /// Burst repetition period (s) for immediate triggering.
    pub async fn set_burst_internal_period(&mut self, ich: u8, period: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .write(&format!("SOUR{ich}:BURS:INT:PER {period}"))
            .await
    }

    pub async fn burst_internal_period(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .query_f64(&format!("SOUR{ich}:BURS:INT:PER?"))
            .await
    }

    /// Burst duration (s), converted to cycles of the current carrier.
    pub async fn set_burst_duration(&mut self, ich: u8, t: f64) -> Result<()> {
        let period = 1.0 / self.waveform_freq(ich).await?;
        let ncycles = burst_cycles(t, period, MAX_BURST_PERIOD)?;
        self.set_burst_ncycles(ich, ncycles).await
    }

    pub async fn burst_duration(&mut self, ich: u8) -> Result<f64> {
        let ncycles = self.burst_ncycles(ich).await?;
        Ok(f64::from(ncycles) / self.waveform_freq(ich).await?)
    }

    /// Burst start phase (deg).
    pub async fn set_burst_phase(&mut self, ich: u8, phase: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        check_phase(phase)?;
        self.inst.write(&format!("SOUR{ich}:BURS:PHAS {phase}")).await
    }

    pub async fn burst_phase(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:BURS:PHAS?")).await
    }

    pub async fn set_burst_gated_polarity(&mut self, ich: u8, pol: Polarity) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .write(&format!("SOUR{ich}:BURS:GATE:POL {pol}"))
            .await
    }

    pub async fn burst_gated_polarity(&mut self, ich: u8) -> Result<Polarity> {
        check_channel(ich, CHANNELS)?;
        Ok(self
            .inst
            .query(&format!("SOUR{ich}:BURS:GATE:POL?"))
            .await?
            .parse()?)
    }

    /// Sine burst of duration `t` (s) starting at `phase` (deg), repeated
    /// every [`MAX_BURST_PERIOD`] when triggered internally.
    pub async fn set_sine_pulse(&mut self, ich: u8, freq: f64, amp: f64, phase: f64, t: f64) -> Result<()> {
        info!(
            "setting channel {ich} to {}s long ({}Hz, {}Vpp) sine pulse",
            si_format(t, 2),
            si_format(freq, 2),
            si_format(amp, 2)
        );
        self.enable_burst(ich).await?;
        self.set_burst_internal_period(ich, MAX_BURST_PERIOD).await?;
        self.set_waveform_freq(ich, freq).await?;
        self.set_waveform_amp(ich, amp).await?;
        if self.angle_unit().await? != AngleUnit::Degree {
            self.set_angle_unit(AngleUnit::Degree).await?;
        }
        self.set_burst_phase(ich, phase).await?;
        self.set_burst_duration(ich, t).await
    }

    // --------------------- trigger ---------------------

    pub async fn set_trigger_source(&mut self, ich: u8, source: TriggerSource) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        let source = KeysightTrigger::from(source);
        self.inst.write(&format!("TRIG{ich}:SOUR {source}")).await
    }

    pub async fn trigger_source(&mut self, ich: u8) -> Result<TriggerSource> {
        check_channel(ich, CHANNELS)?;
        let source: KeysightTrigger = self.inst.query(&format!("TRIG{ich}:SOUR?")).await?.parse()?;
        Ok(source.into())
    }

    pub async fn set_trigger_slope(&mut self, ich: u8, slope: Slope) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("TRIG{ich}:SLOP {slope}")).await
    }

    pub async fn trigger_slope(&mut self, ich: u8) -> Result<Slope> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("TRIG{ich}:SLOP?")).await?.parse()?)
    }

    pub async fn set_external_trigger(&mut self, ich: u8) -> Result<()> {
        self.set_trigger_source(ich, TriggerSource::External).await?;
        self.set_trigger_slope(ich, Slope::Positive).await
    }

    /// Bus triggering, for software triggers.
    pub async fn set_internal_trigger(&mut self, ich: u8) -> Result<()> {
        self.set_trigger_source(ich, TriggerSource::Manual).await?;
        self.set_trigger_slope(ich, Slope::Positive).await
    }

    /// Fire a bus trigger and wait for the instrument to complete it.
    pub async fn trigger_channel(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("triggering channel {ich} programmatically");
        self.inst.trigger().await?;
        self.inst.wait().await
    }

    pub async fn single_pulse(&mut self, ich: u8) -> Result<()> {
        info!("sending single pulse on channel {ich}");
        self.set_trigger_source(ich, TriggerSource::Manual).await?;
        self.enable_output_channel(ich).await?;
        self.trigger_channel(ich).await
    }

    pub async fn wait_for_external_trigger(&mut self, ich: u8) -> Result<()> {
        info!("channel {ich} waiting for external trigger");
        self.set_trigger_source(ich, TriggerSource::External).await?;
        self.enable_output_channel(ich).await
    }

    // --------------------- trigger output ---------------------

    pub async fn enable_trigger_output(&mut self) -> Result<()> {
        self.inst.write("OUTP:TRIG ON").await
    }

    pub async fn disable_trigger_output(&mut self) -> Result<()> {
        self.inst.write("OUTP:TRIG OFF").await
    }

    pub async fn set_trigger_output_slope(&mut self, slope: Slope) -> Result<()> {
        self.inst.write(&format!("OUTP:TRIG:SLOP {slope}")).await
    }

    pub async fn trigger_output_slope(&mut self) -> Result<Slope> {
        Ok(self.inst.query("OUTP:TRIG:SLOP?").await?.parse()?)
    }

    // --------------------- sweep ---------------------

    pub async fn set_sweep_scale(&mut self, ich: u8, scale: SweepScale) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:SWE:SPAC {scale}")).await
    }

    pub async fn sweep_scale(&mut self, ich: u8) -> Result<SweepScale> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("SOUR{ich}:SWE:SPAC?")).await?.parse()?)
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        debug!("returning {} to local control", MODEL.name);
        self.inst.write("SYST:LOC").await?;
        self.inst.close().await
    }
}

#[async_trait]
impl WaveformGenerator for Keysight33500b {
    fn channels(&self) -> &'static [u8] {
        CHANNELS
    }

    async fn idn(&mut self) -> Result<String> {
        Keysight33500b::idn(self).await
    }

    async fn beep(&mut self) -> Result<()> {
        Keysight33500b::beep(self).await
    }

    async fn enable_output_channel(&mut self, ich: u8) -> Result<()> {
        Keysight33500b::enable_output_channel(self, ich).await
    }

    async fn disable_output_channel(&mut self, ich: u8) -> Result<()> {
        Keysight33500b::disable_output_channel(self, ich).await
    }

    async fn output_state(&mut self, ich: u8) -> Result<bool> {
        Keysight33500b::output_state(self, ich).await
    }

    async fn apply_waveform(
        &mut self,
        wtype: WaveformType,
        ich: u8,
        freq: f64,
        amp: f64,
        offset: f64,
        phase: f64,
    ) -> Result<()> {
        Keysight33500b::apply_waveform(self, wtype, ich, freq, amp, offset, phase).await
    }

    async fn set_waveform_freq(&mut self, ich: u8, freq: f64) -> Result<()> {
        Keysight33500b::set_waveform_freq(self, ich, freq).await
    }

    async fn waveform_freq(&mut self, ich: u8) -> Result<f64> {
        Keysight33500b::waveform_freq(self, ich).await
    }

    async fn set_waveform_amp(&mut self, ich: u8, amp: f64) -> Result<()> {
        Keysight33500b::set_waveform_amp(self, ich, amp).await
    }

    async fn waveform_amp(&mut self, ich: u8) -> Result<f64> {
        Keysight33500b::waveform_amp(self, ich).await
    }

    async fn set_waveform_offset(&mut self, ich: u8, offset: f64) -> Result<()> {
        Keysight33500b::set_waveform_offset(self, ich, offset).await
    }

    async fn waveform_offset(&mut self, ich: u8) -> Result<f64> {
        Keysight33500b::waveform_offset(self, ich).await
    }

    async fn enable_burst(&mut self, ich: u8) -> Result<()> {
        Keysight33500b::enable_burst(self, ich).await
    }

    async fn disable_burst(&mut self, ich: u8) -> Result<()> {
        Keysight33500b::disable_burst(self, ich).await
    }

    async fn set_burst_ncycles(&mut self, ich: u8, n: u32) -> Result<()> {
        Keysight33500b::set_burst_ncycles(self, ich, n).await
    }

    async fn set_trigger_source(&mut self, ich: u8, source: TriggerSource) -> Result<()> {
        Keysight33500b::set_trigger_source(self, ich, source).await
    }

    async fn trigger_channel(&mut self, ich: u8) -> Result<()> {
        Keysight33500b::trigger_channel(self, ich).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        Keysight33500b::disconnect(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    async fn connected(mock: &MockTransport) -> Keysight33500b {
        mock.reply("*IDN?", "Agilent Technologies,33522B,MY52301234,3.05-1.19-2.00-52-00\n");
        mock.reply("SYST:ERR?", "+0,\"No error\"\n");
        Keysight33500b::with_transport(mock.boxed()).await.unwrap()
    }

    fn writes_after(mock: &MockTransport, n: usize) -> Vec<String> {
        mock.writes().into_iter().skip(n).collect()
    }

    #[tokio::test]
    async fn connect_disables_outputs_and_beeps() {
        let mock = MockTransport::new();
        connected(&mock).await;
        assert_eq!(
            mock.writes(),
            vec!["*RST", "*CLS", "*IDN?", "OUTP1 OFF", "OUTP2 OFF", "SYST:BEEP"]
        );
    }

    #[tokio::test]
    async fn apply_waveform_sets_phase_separately() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        let n0 = mock.writes().len();
        fg.apply_sine(1, 1e3, 2.0, 0.5).await.unwrap();
        fg.apply_waveform(WaveformType::Square, 2, 5e3, 1.0, 0.0, 90.0)
            .await
            .unwrap();
        assert_eq!(
            writes_after(&mock, n0),
            vec![
                "SOUR1:APPL:SIN 1000, 2, 0.5",
                "SOUR2:APPL:SQU 5000, 1, 0",
                "SOUR2:PHAS 90",
            ]
        );
    }

    #[tokio::test]
    async fn limits_are_checked_before_writing() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        let n0 = mock.writes().len();
        assert!(fg.set_waveform_freq(1, 20e6).await.is_err());
        assert!(fg.apply_sine(1, 1e3, 25.0, 0.0).await.is_err());
        let err = fg.enable_output_channel(3).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisaError>(),
            Some(VisaError::InvalidChannel(3, _))
        ));
        assert_eq!(mock.writes().len(), n0);
    }

    #[tokio::test]
    async fn trigger_sources_map_to_keysight_keywords() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        let n0 = mock.writes().len();
        fg.set_trigger_source(1, TriggerSource::Internal).await.unwrap();
        fg.set_trigger_source(2, TriggerSource::Manual).await.unwrap();
        assert_eq!(
            writes_after(&mock, n0),
            vec!["TRIG1:SOUR IMM", "TRIG2:SOUR BUS"]
        );
        mock.reply("TRIG1:SOUR?", "EXT\n");
        assert_eq!(fg.trigger_source(1).await.unwrap(), TriggerSource::External);
    }

    #[tokio::test]
    async fn enabling_a_modulation_turns_the_previous_one_off() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        let n0 = mock.writes().len();
        fg.enable_modulation(1, Modulation::Am).await.unwrap();
        fg.set_modulation_function(1, ModulationFunction::Triangle)
            .await
            .unwrap();
        fg.enable_burst(1).await.unwrap();
        fg.enable_burst(1).await.unwrap();
        assert_eq!(
            writes_after(&mock, n0),
            vec![
                "SOUR1:AM:STAT ON",
                "SOUR1:AM:INT:FUNC TRI",
                "SOUR1:AM:STAT OFF",
                "SOUR1:BURS:STAT ON",
                "SOUR1:BURS:STAT ON",
            ]
        );
        mock.reply("SOUR1:BURS:STAT?", "1\n");
        assert_eq!(fg.modulation(1).await.unwrap(), Some(Modulation::Burst));
        assert_eq!(fg.modulation(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn modulation_settings_need_an_active_modulation() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        assert!(fg.set_modulation_freq(2, 10.0).await.is_err());
        fg.enable_modulation(2, Modulation::Fm).await.unwrap();
        fg.set_modulation_source(2, ModulationSource::External)
            .await
            .unwrap();
        assert_eq!(mock.writes().last().unwrap(), "SOUR2:FM:SOUR EXT");
    }

    #[tokio::test]
    async fn infinite_burst_is_rejected() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        let err = fg.set_burst_mode(1, BurstMode::Infinite).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisaError>(),
            Some(VisaError::InvalidOption { .. })
        ));
        fg.set_burst_mode(1, BurstMode::Gated).await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), "SOUR1:BURS:MODE GAT");
    }

    #[tokio::test]
    async fn sine_pulse_converts_duration_to_cycles() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        mock.reply("UNIT:ANGL?", "RAD\n");
        mock.reply("SOUR1:FREQ?", "+5.000000000000000E+05\n");
        let n0 = mock.writes().len();
        fg.set_sine_pulse(1, 500e3, 0.2, 90.0, 1e-3).await.unwrap();
        assert_eq!(
            writes_after(&mock, n0),
            vec![
                "SOUR1:BURS:STAT ON",
                "SOUR1:BURS:INT:PER 10",
                "SOUR1:FREQ 500000",
                "SOUR1:VOLT 0.2",
                "UNIT:ANGL?",
                "UNIT:ANGL DEG",
                "SOUR1:BURS:PHAS 90",
                "SOUR1:FREQ?",
                "SOUR1:BURS:NCYC 500",
            ]
        );
    }

    #[tokio::test]
    async fn single_pulse_fires_a_bus_trigger() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        let n0 = mock.writes().len();
        fg.single_pulse(2).await.unwrap();
        assert_eq!(
            writes_after(&mock, n0),
            vec!["TRIG2:SOUR BUS", "OUTP2 ON", "*TRG", "*WAI"]
        );
    }

    #[tokio::test]
    async fn disconnect_returns_to_local() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        WaveformGenerator::disconnect(&mut fg).await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), "SYST:LOC");
        assert!(mock.is_closed());
    }
}
