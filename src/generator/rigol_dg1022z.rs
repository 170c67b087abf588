//! Rigol DG1022Z two-channel function/arbitrary waveform generator.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{
    burst_cycles, check_amp, check_duty_cycle, check_freq, check_offset, check_phase,
    ArbDataType, ArbOutputMode, BurstIdleLevel, BurstMode, CouplingMode, CouplingState, GateType,
    ModulationMode, ModulationSource, Polarity, PulseHold, Slope, TriggerSource, VoltageUnit,
    WaveformGenerator, WaveformType, TTL_PAMP, TTL_PWIDTH,
};
use crate::error::VisaError;
use crate::resource::ResourceManager;
use crate::si::{is_within, si_format};
use crate::transport::Transport;
use crate::visa::{self, check_channel, parse_on_off, ModelInfo, VisaInstrument};
use crate::waveform::{duty_cycle_pulse_envelope, normalize, resample, RampKind};

pub const MODEL: ModelInfo = ModelInfo {
    name: "RigolDG1022Z",
    id_pattern: r"DG1ZA\d+",
    prefix: ":",
    no_error: "0,\"No error\"",
    timeout: None,
};

pub const CHANNELS: &[u8] = &[1, 2];
/// Max frequency (Hz).
pub const FMAX: f64 = 25e6;
/// Max voltage (V).
pub const VMAX: f64 = 20.0;
pub const ANTIPHASE: f64 = 180.0;
pub const MAX_LEN_TEXT: usize = 40;
/// Max burst duration (s).
pub const MAX_BURST_PERIOD: f64 = 500.0;

/// Voltage range of the external modulation input (V).
pub const MOD_VOLT_RANGE: (f64, f64) = (-5.0, 5.0);
/// Extra swing on each side of the modulation range (V).
pub const MOD_VOLT_MARGIN: f64 = 0.05;
pub const AM_DEPTH_RANGE: (f64, f64) = (0.0, 120.0);
pub const AM_FREQ_RANGE: (f64, f64) = (2e-3, 1e6);

pub const ARB_SRATE_BOUNDS: (f64, f64) = (1e-6, 60e6);
pub const ARB_WF_NPTS_BOUNDS: (usize, usize) = (8, 16384);
pub const ARB_WF_MAXNPTS_PER_PACKET: usize = 8192;
pub const ARB_WF_DAC_RANGE: (f64, f64) = (0.0, 16383.0);
pub const ARB_WF_FLOAT_RANGE: (f64, f64) = (-1.0, 1.0);

const COUPLING_PATTERN: &str = r"^FREQ:(ON|OFF),PHASE:(ON|OFF),AMPL:(ON|OFF)$";
const WAVEFORM_FILE_PATTERN: &str = r"^(ARB)(10?|[2-9])$";

/// Quantity coupled across both channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coupling {
    Amplitude,
    Frequency,
    Phase,
}

impl Coupling {
    fn as_scpi(self) -> &'static str {
        match self {
            Coupling::Amplitude => "AMPL",
            Coupling::Frequency => "FREQ",
            Coupling::Phase => "PHAS",
        }
    }

    fn ratio_bounds(self) -> (f64, f64) {
        match self {
            Coupling::Amplitude => (1e-3, 1e3),
            Coupling::Frequency => (1e-6, 1e6),
            Coupling::Phase => (1e-2, 1e2),
        }
    }

    fn deviation_bounds(self) -> (f64, f64) {
        match self {
            Coupling::Amplitude => (-19.998, 19.998),
            Coupling::Frequency => (-0.99 * FMAX, 0.99 * FMAX),
            Coupling::Phase => (-360.0, 360.0),
        }
    }
}

/// Options of [`RigolDg1022z::upload_arbitrary_waveform`].
#[derive(Debug, Clone, Copy)]
pub struct ArbUpload {
    pub dtype: ArbDataType,
    /// Decimal digits per sample, for [`ArbDataType::Float`] only.
    pub precision: usize,
    /// Resample to the native packet size before upload.
    pub adapt_npoints: bool,
    /// Switch the channel to the user waveform afterwards.
    pub activate: bool,
}

impl Default for ArbUpload {
    fn default() -> Self {
        Self {
            dtype: ArbDataType::Dac16,
            precision: 2,
            adapt_npoints: true,
            activate: false,
        }
    }
}

/// A train of sine bursts gated by a second channel.
#[derive(Debug, Clone, Copy)]
pub struct SineBurstTrain {
    /// Carrier frequency (Hz).
    pub fdrive: f64,
    /// Carrier amplitude (Vpp).
    pub vpp: f64,
    /// Total stimulus duration (s).
    pub tstim: f64,
    /// Pulse repetition frequency (Hz).
    pub prf: f64,
    /// Duty cycle (%).
    pub duty_cycle: f64,
    /// Repetition period of the whole train (s), when looping.
    pub period: Option<f64>,
    pub trigger_source: TriggerSource,
}

pub struct RigolDg1022z {
    inst: VisaInstrument,
}

impl RigolDg1022z {
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
        let mut fg = Self { inst };
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

    pub async fn version(&mut self) -> Result<f64> {
        self.inst.query_f64("SYST:VERS?").await
    }

    pub async fn nchannels(&mut self) -> Result<u8> {
        Ok(self.inst.query_i64("SYST:CHAN:NUM?").await? as u8)
    }

    pub async fn beep(&mut self) -> Result<()> {
        self.inst.write("SYST:BEEP:IMM").await
    }

    pub async fn lock_front_panel(&mut self) -> Result<()> {
        self.inst.write("SYST:KLOC:STAT ON").await
    }

    pub async fn unlock_front_panel(&mut self) -> Result<()> {
        self.inst.write("SYST:KLOC:STAT OFF").await
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
        self.inst.write("DISP:TEXT:CLEAR").await
    }

    /// Show `text` on the screen for `duration`, then clear it.
    pub async fn display_for(&mut self, text: &str, duration: Duration) -> Result<()> {
        let text = text.to_string();
        visa::chain(
            self,
            move |g| Box::pin(async move { g.display_text(&text).await }),
            |g| Box::pin(g.erase_text()),
            duration,
        )
        .await
    }

    pub async fn last_error(&mut self) -> Result<String> {
        self.inst.query("SYST:ERR?").await
    }

    pub async fn check_error(&mut self) -> Result<()> {
        self.inst.check_error("SYST:ERR?").await
    }

    pub async fn enable_beep_on_error(&mut self) -> Result<()> {
        self.inst.write("SYST:BEEP:STAT ON").await
    }

    pub async fn disable_beep_on_error(&mut self) -> Result<()> {
        self.inst.write("SYST:BEEP:STAT OFF").await
    }

    pub async fn beeps_on_error(&mut self) -> Result<bool> {
        self.inst.query_bool("SYST:BEEP:STAT?").await
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

    // --------------------- sync ---------------------

    pub async fn enable_output_sync(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("OUTP{ich}:SYNC ON")).await
    }

    pub async fn disable_output_sync(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("OUTP{ich}:SYNC OFF")).await
    }

    pub async fn is_output_sync_on(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_bool(&format!("OUTP{ich}:SYNC?")).await
    }

    /// Sync delay (s), within one period of the channel waveform.
    pub async fn set_output_sync_delay(&mut self, ich: u8, delay: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        let period = 1.0 / self.waveform_freq(ich).await?;
        if !is_within(delay, (0.0, period)) {
            return Err(VisaError::OutOfRange(format!(
                "invalid delay: {delay} (must be within [0, 1/f = {}s])",
                si_format(period, 2)
            ))
            .into());
        }
        self.inst.write(&format!("OUTP{ich}:SYNC:DEL {delay}")).await
    }

    pub async fn output_sync_delay(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("OUTP{ich}:SYNC:DEL?")).await
    }

    pub async fn set_output_sync_polarity(&mut self, ich: u8, pol: Slope) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("OUTP{ich}:SYNC:POL {pol}")).await
    }

    pub async fn output_sync_polarity(&mut self, ich: u8) -> Result<Slope> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("OUTP{ich}:SYNC:POL?")).await?.parse()?)
    }

    // --------------------- coupling ---------------------

    pub async fn enable_all_coupling(&mut self) -> Result<()> {
        self.inst.write("COUP ON").await
    }

    pub async fn disable_all_coupling(&mut self) -> Result<()> {
        self.inst.write("COUP OFF").await
    }

    pub async fn coupling_state(&mut self) -> Result<CouplingState> {
        let out = self.inst.query("COUP?").await?;
        parse_coupling_state(&out)
    }

    pub async fn enable_coupling(&mut self, what: Coupling) -> Result<()> {
        self.inst.write(&format!("COUP:{} ON", what.as_scpi())).await
    }

    pub async fn disable_coupling(&mut self, what: Coupling) -> Result<()> {
        self.inst.write(&format!("COUP:{} OFF", what.as_scpi())).await
    }

    pub async fn is_coupling_on(&mut self, what: Coupling) -> Result<bool> {
        self.inst.query_bool(&format!("COUP:{}?", what.as_scpi())).await
    }

    pub async fn set_coupling_mode(&mut self, what: Coupling, mode: CouplingMode) -> Result<()> {
        self.inst
            .write(&format!("COUP:{}:MODE {mode}", what.as_scpi()))
            .await
    }

    pub async fn coupling_mode(&mut self, what: Coupling) -> Result<CouplingMode> {
        let out = self.inst.query(&format!("COUP:{}:MODE?", what.as_scpi())).await?;
        Ok(out.parse()?)
    }

    pub async fn set_coupling_ratio(&mut self, what: Coupling, ratio: f64) -> Result<()> {
        let bounds = what.ratio_bounds();
        if !is_within(ratio, bounds) {
            return Err(VisaError::OutOfRange(format!(
                "invalid {what:?} coupling ratio: {ratio} (must be within {bounds:?})"
            ))
            .into());
        }
        self.inst
            .write(&format!("COUP:{}:RAT {ratio}", what.as_scpi()))
            .await
    }

    pub async fn coupling_ratio(&mut self, what: Coupling) -> Result<f64> {
        self.inst
            .query_f64(&format!("COUP:{}:RAT?", what.as_scpi()))
            .await
    }

    pub async fn set_coupling_deviation(&mut self, what: Coupling, deviation: f64) -> Result<()> {
        let bounds = what.deviation_bounds();
        if !is_within(deviation, bounds) {
            return Err(VisaError::OutOfRange(format!(
                "invalid {what:?} coupling deviation: {deviation} (must be within {bounds:?})"
            ))
            .into());
        }
        self.inst
            .write(&format!("COUP:{}:DEV {deviation}", what.as_scpi()))
            .await
    }

    pub async fn coupling_deviation(&mut self, what: Coupling) -> Result<f64> {
        self.inst
            .query_f64(&format!("COUP:{}:DEV?", what.as_scpi()))
            .await
    }

    // --------------------- basic waveform ---------------------

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
        self.inst
            .write(&format!("SOUR{ich}:APPL:{wtype} {freq}, {amp}, {offset}, {phase}"))
            .await
    }

    pub async fn apply_sine(&mut self, ich: u8, freq: f64, amp: f64, offset: f64) -> Result<()> {
        self.apply_waveform(WaveformType::Sine, ich, freq, amp, offset, 0.0)
            .await
    }

    pub async fn apply_pulse(&mut self, ich: u8, freq: f64, amp: f64, offset: f64) -> Result<()> {
        self.apply_waveform(WaveformType::Pulse, ich, freq, amp, offset, 0.0)
            .await
    }

    /// Arbitrary waveform at sample rate `sr` (Sa/s); also selects the
    /// USER waveform and sample-rate output mode.
    pub async fn apply_arbitrary(&mut self, ich: u8, sr: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:APPL:ARB {sr}")).await
    }

    pub async fn apply_noise(&mut self, ich: u8, amp: f64, offset: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .write(&format!("SOUR{ich}:APPL:NOIS {amp}, {offset}"))
            .await
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
        self.inst.write(&format!("SOUR{ich}:FREQ:FIX {freq}")).await
    }

    pub async fn waveform_freq(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:FREQ:FIX?")).await
    }

    pub async fn set_waveform_amp(&mut self, ich: u8, amp: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        check_amp(amp, VMAX)?;
        self.inst
            .write(&format!("SOUR{ich}:VOLT:LEV:IMM:AMPL {amp}"))
            .await
    }

    pub async fn waveform_amp(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .query_f64(&format!("SOUR{ich}:VOLT:LEV:IMM:AMPL?"))
            .await
    }

    pub async fn set_waveform_offset(&mut self, ich: u8, offset: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        let amp = self.waveform_amp(ich).await?;
        check_offset(offset, amp, VMAX)?;
        self.inst
            .write(&format!("SOUR{ich}:VOLT:LEV:IMM:OFFS {offset}"))
            .await
    }

    pub async fn waveform_offset(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .query_f64(&format!("SOUR{ich}:VOLT:LEV:IMM:OFFS?"))
            .await
    }

    /// Phase in degrees.
    pub async fn set_waveform_phase(&mut self, ich: u8, phase: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        check_phase(phase)?;
        self.inst.write(&format!("SOUR{ich}:PHAS {phase}")).await
    }

    pub async fn waveform_phase(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:PHAS?")).await
    }

    pub async fn invert_waveform_phase(&mut self, ich: u8) -> Result<()> {
        self.set_waveform_phase(ich, ANTIPHASE).await
    }

    pub async fn is_waveform_phase_inverted(&mut self, ich: u8) -> Result<bool> {
        Ok(self.waveform_phase(ich).await? == ANTIPHASE)
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

    pub async fn set_pulse_hold(&mut self, ich: u8, hold: PulseHold) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:PULS:HOLD {hold}")).await
    }

    pub async fn pulse_hold(&mut self, ich: u8) -> Result<PulseHold> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("SOUR{ich}:PULS:HOLD?")).await?.parse()?)
    }

    pub async fn set_pulse_duty_cycle(&mut self, ich: u8, dc: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        check_duty_cycle(dc)?;
        self.set_pulse_hold(ich, PulseHold::Duty).await?;
        self.inst
            .write(&format!("SOUR{ich}:FUNC:PULS:DCYC {dc}"))
            .await
    }

    pub async fn pulse_duty_cycle(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .query_f64(&format!("SOUR{ich}:FUNC:PULS:DCYC?"))
            .await
    }

    /// Pulse width (s).
    pub async fn set_pulse_width(&mut self, ich: u8, width: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.set_pulse_hold(ich, PulseHold::Width).await?;
        self.inst
            .write(&format!("SOUR{ich}:FUNC:PULS:WIDT {width}"))
            .await
    }

    pub async fn pulse_width(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .query_f64(&format!("SOUR{ich}:FUNC:PULS:WIDT?"))
            .await
    }

    // --------------------- arbitrary waveform ---------------------

    pub async fn arbitrary_output_mode(&mut self, ich: u8) -> Result<ArbOutputMode> {
        check_channel(ich, CHANNELS)?;
        Ok(self
            .inst
            .query(&format!("SOUR{ich}:FUNC:ARB:MODE?"))
            .await?
            .parse()?)
    }

    pub async fn set_arbitrary_output_mode(&mut self, ich: u8, mode: ArbOutputMode) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .write(&format!("SOUR{ich}:FUNC:ARB:MODE {mode}"))
            .await
    }

    pub async fn arbitrary_sample_rate(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .query_f64(&format!("SOUR{ich}:FUNC:ARB:SRAT?"))
            .await
    }

    pub async fn set_arbitrary_sample_rate(&mut self, ich: u8, sr: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        if !is_within(sr, ARB_SRATE_BOUNDS) {
            return Err(VisaError::OutOfRange(format!(
                "invalid sample rate: {sr} (must be within {ARB_SRATE_BOUNDS:?})"
            ))
            .into());
        }
        self.inst
            .write(&format!("SOUR{ich}:FUNC:ARB:SRAT {sr}"))
            .await
    }

    /// Waveform files stored in non-volatile memory.
    pub async fn waveform_catalog(&mut self, ich: Option<u8>) -> Result<Vec<String>> {
        let command = match ich {
            Some(ich) => {
                check_channel(ich, CHANNELS)?;
                format!("SOUR{ich}:DATA:CAT?")
            }
            None => "DATA:CAT?".to_string(),
        };
        let out = self.inst.query(&command).await?;
        Ok(parse_catalog(&out))
    }

    /// Number of points of the waveform in volatile memory.
    pub async fn waveform_npoints(&mut self, ich: u8) -> Result<usize> {
        check_channel(ich, CHANNELS)?;
        Ok(self
            .inst
            .query_i64(&format!("SOUR{ich}:DATA:POIN? VOLATILE"))
            .await? as usize)
    }

    pub async fn set_waveform_npoints(&mut self, ich: u8, n: usize) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        let (lo, hi) = ARB_WF_NPTS_BOUNDS;
        if !(lo..=hi).contains(&n) {
            return Err(VisaError::OutOfRange(format!(
                "invalid number of points: {n} (must be within {ARB_WF_NPTS_BOUNDS:?})"
            ))
            .into());
        }
        self.inst
            .write(&format!("SOUR{ich}:DATA:POIN VOLATILE,{n}"))
            .await?;
        let actual = self.waveform_npoints(ich).await?;
        if actual != n {
            return Err(VisaError::Instrument(format!(
                "failed to set number of points to {n} (instrument reports {actual})"
            ))
            .into());
        }
        Ok(())
    }

    /// Upload `y` into the volatile memory of channel `ich`.
    ///
    /// The vector is linearly mapped onto the range of the selected data type
    /// before transfer, so only its shape matters.
    pub async fn upload_arbitrary_waveform(&mut self, ich: u8, y: &[f64], opts: ArbUpload) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        let y = if opts.adapt_npoints && y.len() != ARB_WF_MAXNPTS_PER_PACKET {
            resample(y, ARB_WF_MAXNPTS_PER_PACKET)
        } else {
            y.to_vec()
        };
        let (lo, hi) = ARB_WF_NPTS_BOUNDS;
        if !(lo..=hi).contains(&y.len()) {
            return Err(VisaError::OutOfRange(format!(
                "invalid waveform size: {} (must be within {ARB_WF_NPTS_BOUNDS:?})",
                y.len()
            ))
            .into());
        }
        info!("uploading {}-points arbitrary waveform into volatile memory", y.len());

        match opts.dtype {
            ArbDataType::Dac16 => {
                let (lb, ub) = ARB_WF_DAC_RANGE;
                let values: Vec<u16> = normalize(&y, lb, ub)?.iter().map(|&v| v as u16).collect();
                let npackets = values.len().div_ceil(ARB_WF_MAXNPTS_PER_PACKET);
                for (i, packet) in values.chunks(ARB_WF_MAXNPTS_PER_PACKET).enumerate() {
                    let suffix = if i + 1 < npackets { "CON" } else { "END" };
                    self.inst
                        .write_u16_block(&format!("SOUR{ich}:TRAC:DATA:DAC16 VOLATILE,{suffix},"), packet)
                        .await?;
                }
            }
            ArbDataType::Dac => {
                let (lb, ub) = ARB_WF_DAC_RANGE;
                let values = normalize(&y, lb, ub)?
                    .iter()
                    .map(|&v| (v as u16).to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                self.inst
                    .write(&format!("SOUR{ich}:DATA:DAC VOLATILE,{values}"))
                    .await?;
            }
            ArbDataType::Float => {
                let (lb, ub) = ARB_WF_FLOAT_RANGE;
                let precision = opts.precision;
                let values = normalize(&y, lb, ub)?
                    .iter()
                    .map(|v| format!("{v:.precision$}"))
                    .collect::<Vec<_>>()
                    .join(",");
                self.inst
                    .write(&format!("SOUR{ich}:DATA VOLATILE,{values}"))
                    .await?;
            }
        }

        self.check_error().await?;
        if y.len() < ARB_WF_MAXNPTS_PER_PACKET {
            self.set_waveform_npoints(ich, y.len()).await?;
        }
        // Frequency mode lets the waveform be used as a modulation envelope.
        self.set_arbitrary_output_mode(ich, ArbOutputMode::Frequency).await?;
        if opts.activate {
            self.set_waveform_type(ich, WaveformType::User).await?;
        }
        Ok(())
    }

    fn dac_max() -> f64 {
        ARB_WF_DAC_RANGE.1
    }

    async fn check_waveform_index(&mut self, ich: u8, idx: usize) -> Result<()> {
        let npts = self.waveform_npoints(ich).await?;
        if idx >= npts {
            return Err(VisaError::OutOfRange(format!(
                "invalid index: {idx} (must be between 0 and {})",
                npts.saturating_sub(1)
            ))
            .into());
        }
        Ok(())
    }

    /// Value at 0-based index `idx` of the volatile waveform, in `[0, 1]`.
    pub async fn waveform_value(&mut self, ich: u8, idx: usize) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.check_waveform_index(ich, idx).await?;
        let n = self
            .inst
            .query_i64(&format!("SOUR{ich}:DATA:VAL? VOLATILE,{}", idx + 1))
            .await?;
        Ok(n as f64 / Self::dac_max())
    }

    pub async fn set_waveform_value(&mut self, ich: u8, idx: usize, val: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.check_waveform_index(ich, idx).await?;
        if !is_within(val, (0.0, 1.0)) {
            return Err(
                VisaError::OutOfRange(format!("invalid value: {val} (must be between 0 and 1)")).into(),
            );
        }
        let dac = (val * Self::dac_max()) as u16;
        self.inst
            .write(&format!("SOUR{ich}:DATA:VAL VOLATILE,{},{dac}", idx + 1))
            .await?;
        self.check_error().await
    }

    pub async fn load_waveform_from_file(&mut self, ich: u8, name: &str) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        if !self.waveform_catalog(Some(ich)).await?.iter().any(|f| f == name) {
            return Err(VisaError::Instrument(format!(
                "{name:?} file not found in channel {ich} catalog"
            ))
            .into());
        }
        self.inst
            .write(&format!("SOUR{ich}:DATA:COPY {name},VOLATILE"))
            .await?;
        self.check_error().await
    }

    /// Store the current arbitrary waveform under `name` (`ARB1` to `ARB10`).
    pub async fn save_waveform_to_memory(&mut self, name: &str) -> Result<()> {
        check_waveform_file_name(name)?;
        self.inst.write(&format!("*SAV {name}")).await
    }

    pub async fn recall_waveform_from_memory(&mut self, name: &str) -> Result<()> {
        check_waveform_file_name(name)?;
        self.inst.write(&format!("*RCL {name}")).await
    }

    // --------------------- burst ---------------------

    pub async fn enable_burst(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:BURS ON")).await
    }

    pub async fn disable_burst(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:BURS OFF")).await
    }

    pub async fn set_burst_mode(&mut self, ich: u8, mode: BurstMode) -> Result<()> {
        check_channel(ich, CHANNELS)?;
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

    /// Burst repetition period (s) for internal triggering.
    pub async fn set_burst_internal_period(&mut self, ich: u8, period: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .write(&format!("SOUR{ich}:BURS:INT:PER {period}"))
            .await
    }

    pub async fn burst_internal_period(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:BURS:INT:PER?")).await
    }

    /// Burst duration (s), converted to a number of carrier cycles.
    pub async fn set_burst_duration(&mut self, ich: u8, t: f64) -> Result<()> {
        let period = 1.0 / self.waveform_freq(ich).await?;
        let ncycles = burst_cycles(t, period, MAX_BURST_PERIOD)?;
        self.set_burst_ncycles(ich, ncycles).await
    }

    pub async fn burst_duration(&mut self, ich: u8) -> Result<f64> {
        let ncycles = self.burst_ncycles(ich).await?;
        Ok(f64::from(ncycles) / self.waveform_freq(ich).await?)
    }

    /// Burst start phase, 0 or 180 degrees.
    pub async fn set_burst_phase(&mut self, ich: u8, phase: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        if phase != 0.0 && phase != ANTIPHASE {
            return Err(VisaError::OutOfRange(format!(
                "burst phase ({phase} DEG) is not a multiple of the half-cycle"
            ))
            .into());
        }
        self.inst.write(&format!("SOUR{ich}:BURS:PHAS {phase}")).await
    }

    pub async fn burst_phase(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:BURS:PHAS?")).await
    }

    pub async fn set_burst_gated_polarity(&mut self, ich: u8, pol: Polarity) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:BURS:GATE:POL {pol}")).await
    }

    pub async fn burst_gated_polarity(&mut self, ich: u8) -> Result<Polarity> {
        check_channel(ich, CHANNELS)?;
        Ok(self
            .inst
            .query(&format!("SOUR{ich}:BURS:GATE:POL?"))
            .await?
            .parse()?)
    }

    /// Delay (s) of the N-cycle or infinite burst.
    pub async fn set_burst_delay(&mut self, ich: u8, t: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:BURS:TDEL {t}")).await
    }

    pub async fn burst_delay(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:BURS:TDEL?")).await
    }

    pub async fn set_burst_idle_level(&mut self, ich: u8, level: BurstIdleLevel) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:BURS:IDLE {level}")).await
    }

    pub async fn burst_idle_level(&mut self, ich: u8) -> Result<BurstIdleLevel> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("SOUR{ich}:BURS:IDLE?")).await?.parse()?)
    }

    // --------------------- modulation ---------------------

    pub async fn enable_modulation(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:MOD ON")).await
    }

    pub async fn disable_modulation(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:MOD OFF")).await
    }

    pub async fn is_modulation_enabled(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_bool(&format!("SOUR{ich}:MOD?")).await
    }

    pub async fn set_modulation_mode(&mut self, ich: u8, mode: ModulationMode) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:MOD:TYP {mode}")).await
    }

    pub async fn modulation_mode(&mut self, ich: u8) -> Result<ModulationMode> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("SOUR{ich}:MOD:TYP?")).await?.parse()?)
    }

    /// Peak-to-peak span of the modulation input (V).
    pub fn mod_volt_amp() -> f64 {
        MOD_VOLT_RANGE.1 - MOD_VOLT_RANGE.0
    }

    /// AM depth (%).
    pub async fn am_depth(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:AM:DEPT?")).await
    }

    pub async fn set_am_depth(&mut self, ich: u8, depth: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        if !is_within(depth, AM_DEPTH_RANGE) {
            return Err(VisaError::OutOfRange(format!(
                "invalid AM depth: {depth} (must be within {AM_DEPTH_RANGE:?})"
            ))
            .into());
        }
        self.inst.write(&format!("SOUR{ich}:AM:DEPT {depth}")).await
    }

    /// Toggle AM carrier suppression (DSSC).
    pub async fn set_am_dssc(&mut self, ich: u8, on: bool) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        let state = if on { "ON" } else { "OFF" };
        self.inst.write(&format!("SOUR{ich}:AM:DSSC {state}")).await
    }

    pub async fn is_am_dssc_enabled(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_bool(&format!("SOUR{ich}:AM:DSSC?")).await
    }

    /// Internal AM frequency (Hz).
    pub async fn set_am_freq(&mut self, ich: u8, freq: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        if !is_within(freq, AM_FREQ_RANGE) {
            return Err(VisaError::OutOfRange(format!(
                "invalid AM frequency: {freq} (must be within {AM_FREQ_RANGE:?})"
            ))
            .into());
        }
        self.inst.write(&format!("SOUR{ich}:AM:INT:FREQ {freq}")).await
    }

    pub async fn am_freq(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("SOUR{ich}:AM:INT:FREQ?")).await
    }

    pub async fn set_am_waveform(&mut self, ich: u8, wtype: WaveformType) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:AM:INT:FUNC {wtype}")).await
    }

    pub async fn am_waveform(&mut self, ich: u8) -> Result<WaveformType> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("SOUR{ich}:AM:INT:FUNC?")).await?.parse()?)
    }

    pub async fn set_am_source(&mut self, ich: u8, source: ModulationSource) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:AM:SOUR {source}")).await
    }

    pub async fn am_source(&mut self, ich: u8) -> Result<ModulationSource> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("SOUR{ich}:AM:SOUR?")).await?.parse()?)
    }

    pub async fn enable_am(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:AM:STAT ON")).await
    }

    pub async fn disable_am(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:AM:STAT OFF")).await
    }

    pub async fn is_am_enabled(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_bool(&format!("SOUR{ich}:AM:STAT?")).await
    }

    // --------------------- trigger ---------------------

    pub async fn set_trigger_source(&mut self, ich: u8, source: TriggerSource) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .write(&format!("SOUR{ich}:BURS:TRIG:SOUR {source}"))
            .await
    }

    pub async fn trigger_source(&mut self, ich: u8) -> Result<TriggerSource> {
        check_channel(ich, CHANNELS)?;
        Ok(self
            .inst
            .query(&format!("SOUR{ich}:BURS:TRIG:SOUR?"))
            .await?
            .parse()?)
    }

    pub async fn set_trigger_slope(&mut self, ich: u8, slope: Slope) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .write(&format!("SOUR{ich}:BURS:TRIG:SLOP {slope}"))
            .await
    }

    pub async fn trigger_slope(&mut self, ich: u8) -> Result<Slope> {
        check_channel(ich, CHANNELS)?;
        Ok(self
            .inst
            .query(&format!("SOUR{ich}:BURS:TRIG:SLOP?"))
            .await?
            .parse()?)
    }

    pub async fn wait_for_external_trigger(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("waiting for external trigger on channel {ich}...");
        self.set_trigger_source(ich, TriggerSource::External).await?;
        self.enable_output_channel(ich).await
    }

    pub async fn wait_for_manual_trigger(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("waiting for manual/programmatic trigger on channel {ich}...");
        self.set_trigger_source(ich, TriggerSource::Manual).await?;
        self.enable_output_channel(ich).await
    }

    pub async fn enable_trigger_output(&mut self, ich: u8) -> Result<()> {
        self.set_trigger_output_slope(ich, Slope::Positive).await
    }

    pub async fn disable_trigger_output(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("SOUR{ich}:BURS:TRIG:TRIGO OFF")).await
    }

    pub async fn set_trigger_output_slope(&mut self, ich: u8, slope: Slope) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst
            .write(&format!("SOUR{ich}:BURS:TRIG:TRIGO {slope}"))
            .await
    }

    pub async fn trigger_output_slope(&mut self, ich: u8) -> Result<Option<Slope>> {
        check_channel(ich, CHANNELS)?;
        let out = self.inst.query(&format!("SOUR{ich}:BURS:TRIG:TRIGO?")).await?;
        if out.eq_ignore_ascii_case("OFF") {
            return Ok(None);
        }
        Ok(Some(out.parse()?))
    }

    pub async fn trigger_channel(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("triggering channel {ich} programmatically");
        self.inst.write(&format!("SOUR{ich}:BURS:TRIG:IMM")).await?;
        self.inst.wait().await
    }

    /// Switch `ich` to internal triggering, optionally with a new period (s).
    pub async fn start_trigger_loop(&mut self, ich: u8, period: Option<f64>) -> Result<()> {
        if let Some(period) = period {
            self.set_burst_internal_period(ich, period).await?;
        }
        self.set_trigger_source(ich, TriggerSource::Internal).await
    }

    // --------------------- multi-layer pulsing ---------------------

    /// Train of TTL-like pulses at `prf` (Hz) lasting `tburst` (s).
    ///
    /// `period` is the train repetition period (s); it defaults to 2 s with
    /// internal triggering.
    pub async fn set_trigger_pulse_train(
        &mut self,
        ich: u8,
        prf: f64,
        tburst: f64,
        vpp: Option<f64>,
        period: Option<f64>,
        source: TriggerSource,
    ) -> Result<()> {
        let mut msg = format!(
            "setting channel {ich} to trigger {}s long TTL pulse train with {}Hz internal PRF",
            si_format(tburst, 2),
            si_format(prf, 2)
        );
        let vpp = match vpp {
            Some(v) => {
                msg.push_str(&format!(", {}Vpp", si_format(v, 2)));
                v
            }
            None => TTL_PAMP,
        };
        let period = describe_trigger(&mut msg, source, period);
        info!("{msg}");

        self.apply_pulse(ich, prf, vpp, vpp / 2.0).await?;
        self.set_pulse_width(ich, TTL_PWIDTH).await?;
        self.set_burst_idle_level(ich, BurstIdleLevel::Bottom).await?;
        // External source while configuring avoids spurious outputs.
        self.set_trigger_source(ich, TriggerSource::External).await?;
        if let Some(period) = period {
            self.set_burst_internal_period(ich, period).await?;
        }
        self.set_burst_duration(ich, tburst).await?;
        self.enable_burst(ich).await?;
        self.enable_output_sync(ich).await?;
        self.set_trigger_source(ich, source).await
    }

    /// Amplitude-modulating pulse train, with smoothed edges when `tramp`
    /// (s) is positive.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_am_pulse_train(
        &mut self,
        ich: u8,
        prf: f64,
        duty_cycle: f64,
        tburst: f64,
        tramp: f64,
        period: Option<f64>,
        source: TriggerSource,
    ) -> Result<()> {
        let mut msg = format!(
            "setting channel {ich} to trigger {}s long amplitude-modulating pulse train with {}Hz internal PRF",
            si_format(tburst, 2),
            si_format(prf, 2)
        );
        if tramp > 0.0 {
            msg.push_str(&format!(" and {}s ramping time", si_format(tramp, 2)));
        }
        let period = describe_trigger(&mut msg, source, period);
        info!("{msg}");

        if tramp > 0.0 {
            let (_, envelope) = duty_cycle_pulse_envelope(
                ARB_WF_MAXNPTS_PER_PACKET,
                prf,
                duty_cycle,
                tramp,
                RampKind::default(),
            )?;
            let opts = ArbUpload {
                activate: true,
                ..ArbUpload::default()
            };
            self.upload_arbitrary_waveform(ich, &envelope, opts).await?;
        } else {
            self.set_waveform_type(ich, WaveformType::Square).await?;
            self.set_square_duty_cycle(ich, duty_cycle).await?;
            // Inverted phase avoids a DC offset between pulses.
            self.invert_waveform_phase(ich).await?;
        }

        self.set_waveform_amp(ich, (1.0 + 2.0 * MOD_VOLT_MARGIN) * Self::mod_volt_amp())
            .await?;
        self.set_waveform_offset(ich, 0.0).await?;
        self.set_waveform_freq(ich, prf).await?;
        self.set_trigger_source(ich, TriggerSource::External).await?;
        if let Some(period) = period {
            self.set_burst_internal_period(ich, period).await?;
        }
        self.set_burst_duration(ich, tburst).await?;
        self.enable_burst(ich).await?;
        self.enable_output_sync(ich).await?;
        if self.is_waveform_phase_inverted(ich).await? {
            self.set_output_sync_polarity(ich, Slope::Negative).await?;
        }
        self.set_trigger_source(ich, source).await
    }

    /// Sine bursts on `ich_carrier`, each triggered by a pulse of `ich_trig`.
    pub async fn set_triggered_sine_burst_train(
        &mut self,
        train: &SineBurstTrain,
        ich_trig: u8,
        ich_carrier: u8,
    ) -> Result<()> {
        if ich_trig == ich_carrier {
            return Err(VisaError::OutOfRange(
                "trigger and carrier channels cannot be identical".into(),
            )
            .into());
        }
        // Carrier first to avoid spurious outputs.
        self.disable_output_channel(ich_carrier).await?;
        self.disable_output_channel(ich_trig).await?;

        self.set_trigger_pulse_train(
            ich_trig,
            train.prf,
            train.tstim,
            None,
            train.period,
            train.trigger_source,
        )
        .await?;

        let tburst = train.duty_cycle / (100.0 * train.prf);
        info!(
            "setting channel {ich_carrier} to output {}s long, ({}Hz, {}Vpp) sine wave triggered externally by channel {ich_trig}",
            si_format(tburst, 2),
            si_format(train.fdrive, 2),
            si_format(train.vpp, 3)
        );
        self.apply_sine(ich_carrier, train.fdrive, train.vpp, 0.0).await?;
        self.set_burst_duration(ich_carrier, tburst).await?;
        self.enable_burst(ich_carrier).await?;
        self.set_trigger_source(ich_carrier, TriggerSource::External)
            .await?;

        if train.vpp > 0.0 {
            self.enable_output_channel(ich_trig).await?;
            self.enable_output_channel(ich_carrier).await?;
        }
        Ok(())
    }

    /// Sine carrier on `ich_carrier`, amplitude-modulated by a pulse train
    /// on `ich_mod`.
    pub async fn set_am_sine_burst_train(
        &mut self,
        train: &SineBurstTrain,
        tramp: f64,
        ich_mod: u8,
        ich_carrier: u8,
    ) -> Result<()> {
        if ich_mod == ich_carrier {
            return Err(VisaError::OutOfRange(
                "gating and carrier channels cannot be identical".into(),
            )
            .into());
        }
        self.disable_output_channel(ich_carrier).await?;
        self.disable_output_channel(ich_mod).await?;

        self.set_am_pulse_train(
            ich_mod,
            train.prf,
            train.duty_cycle,
            train.tstim,
            tramp,
            train.period,
            train.trigger_source,
        )
        .await?;

        info!(
            "setting channel {ich_carrier} to output ({}Hz, {}Vpp) sine wave amplitude-modulated externally by channel {ich_mod}",
            si_format(train.fdrive, 2),
            si_format(train.vpp, 3)
        );
        self.apply_sine(ich_carrier, train.fdrive, train.vpp, 0.0).await?;
        self.enable_am(ich_carrier).await?;
        self.set_am_source(ich_carrier, ModulationSource::External)
            .await?;

        if train.vpp > 0.0 {
            self.enable_output_channel(ich_mod).await?;
            self.enable_output_channel(ich_carrier).await?;
        }
        Ok(())
    }

    /// Dispatch to the triggered or modulated variant. Ramps are only
    /// available with modulation gating.
    pub async fn set_gated_sine_burst(
        &mut self,
        train: &SineBurstTrain,
        tramp: f64,
        ich_gate: u8,
        ich_carrier: u8,
        gate: GateType,
    ) -> Result<()> {
        match gate {
            GateType::Trigger => {
                if tramp > 0.0 {
                    return Err(VisaError::OutOfRange(
                        "ramping time not supported for trigger gating".into(),
                    )
                    .into());
                }
                self.set_triggered_sine_burst_train(train, ich_gate, ich_carrier)
                    .await
            }
            GateType::Modulation => {
                self.set_am_sine_burst_train(train, tramp, ich_gate, ich_carrier)
                    .await
            }
        }
    }

    /// Sine burst of `ncycles` cycles repeating at `prf` (Hz), either looped
    /// internally on `ich` or gated by `ich_trig`.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_looping_sine_burst(
        &mut self,
        ich: u8,
        fdrive: f64,
        vpp: f64,
        ncycles: f64,
        prf: f64,
        tramp: f64,
        ich_trig: Option<u8>,
        gate: GateType,
    ) -> Result<()> {
        let ncycles = ncycles.round();
        if ncycles < 1.0 {
            return Err(VisaError::OutOfRange(format!(
                "invalid number of cycles: {ncycles} (must be >= 1)"
            ))
            .into());
        }
        let ncycles = ncycles as u32;

        let Some(ich_trig) = ich_trig else {
            if tramp > 0.0 {
                return Err(VisaError::OutOfRange(
                    "ramping time not supported for looping sine burst without trigger channel"
                        .into(),
                )
                .into());
            }
            info!(
                "setting ({}Hz, {}Vpp, {ncycles} cycles) sine wave looping at {prf:.1} Hz on channel {ich}",
                si_format(fdrive, 3),
                si_format(vpp, 3)
            );
            self.disable_output_channel(ich).await?;
            self.apply_sine(ich, fdrive, vpp, 0.0).await?;
            self.set_burst_internal_period(ich, 1.0 / prf).await?;
            self.set_burst_ncycles(ich, ncycles).await?;
            self.enable_burst(ich).await?;
            self.start_trigger_loop(ich, None).await?;
            return self.enable_output_channel(ich).await;
        };

        let tburst = f64::from(ncycles) / fdrive;
        let mut gate = gate;
        if tramp > 0.0 && gate == GateType::Trigger {
            warn!("ramping time not supported for trigger gating, switching to modulation gating");
            gate = GateType::Modulation;
        }
        let (duty_cycle, tstim, internal_prf) = match gate {
            GateType::Trigger => (100.0, tburst, 1.0 / tburst),
            GateType::Modulation => {
                let dc = prf * tburst * 100.0;
                if dc > 100.0 {
                    return Err(VisaError::OutOfRange(format!(
                        "{}s burst cannot be pulsed at {prf:.2} Hz",
                        si_format(tburst, 2)
                    ))
                    .into());
                }
                (dc, 2.0 / prf, prf)
            }
        };
        let train = SineBurstTrain {
            fdrive,
            vpp,
            tstim,
            prf: internal_prf,
            duty_cycle,
            period: Some(1.0 / prf),
            trigger_source: TriggerSource::External,
        };
        let tramp = if gate == GateType::Modulation { tramp } else { 0.0 };
        self.set_gated_sine_burst(&train, tramp, ich_trig, ich, gate)
            .await?;

        match gate {
            GateType::Trigger => self.start_trigger_loop(ich_trig, Some(1.0 / prf)).await,
            // Without burst the modulation loops indefinitely.
            GateType::Modulation => self.disable_burst(ich_trig).await,
        }
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.unlock_front_panel().await?;
        self.inst.close().await
    }
}

/// Complete a log message with the trigger source and return the effective
/// repetition period.
fn describe_trigger(msg: &mut String, source: TriggerSource, period: Option<f64>) -> Option<f64> {
    match source {
        TriggerSource::Internal => {
            let period = period.unwrap_or(2.0);
            msg.push_str(&format!(", repeated every {}s", si_format(period, 2)));
            Some(period)
        }
        TriggerSource::External => {
            msg.push_str(", triggered externally");
            period
        }
        TriggerSource::Manual => {
            msg.push_str(", triggered manually/programmatically");
            period
        }
    }
}

fn parse_coupling_state(out: &str) -> Result<CouplingState> {
    let re = Regex::new(COUPLING_PATTERN)?;
    let caps = re.captures(out.trim()).ok_or_else(|| VisaError::Response {
        command: "COUP?".into(),
        response: out.to_string(),
    })?;
    let on = |i: usize| caps.get(i).is_some_and(|m| parse_on_off(m.as_str()));
    Ok(CouplingState {
        frequency: on(1),
        phase: on(2),
        amplitude: on(3),
    })
}

fn parse_catalog(out: &str) -> Vec<String> {
    out.replace('"', "")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn check_waveform_file_name(name: &str) -> Result<()> {
    let re = Regex::new(WAVEFORM_FILE_PATTERN)?;
    if !re.is_match(name) {
        return Err(VisaError::OutOfRange(format!(
            "invalid waveform file name: {name:?} (must match {WAVEFORM_FILE_PATTERN})"
        ))
        .into());
    }
    debug!("waveform file name {name} is valid");
    Ok(())
}

#[async_trait]
impl WaveformGenerator for RigolDg1022z {
    fn channels(&self) -> &'static [u8] {
        CHANNELS
    }

    async fn idn(&mut self) -> Result<String> {
        RigolDg1022z::idn(self).await
    }

    async fn beep(&mut self) -> Result<()> {
        RigolDg1022z::beep(self).await
    }

    async fn enable_output_channel(&mut self, ich: u8) -> Result<()> {
        RigolDg1022z::enable_output_channel(self, ich).await
    }

    async fn disable_output_channel(&mut self, ich: u8) -> Result<()> {
        RigolDg1022z::disable_output_channel(self, ich).await
    }

    async fn output_state(&mut self, ich: u8) -> Result<bool> {
        RigolDg1022z::output_state(self, ich).await
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
        RigolDg1022z::apply_waveform(self, wtype, ich, freq, amp, offset, phase).await
    }

    async fn set_waveform_freq(&mut self, ich: u8, freq: f64) -> Result<()> {
        RigolDg1022z::set_waveform_freq(self, ich, freq).await
    }

    async fn waveform_freq(&mut self, ich: u8) -> Result<f64> {
        RigolDg1022z::waveform_freq(self, ich).await
    }

    async fn set_waveform_amp(&mut self, ich: u8, amp: f64) -> Result<()> {
        RigolDg1022z::set_waveform_amp(self, ich, amp).await
    }

    async fn waveform_amp(&mut self, ich: u8) -> Result<f64> {
        RigolDg1022z::waveform_amp(self, ich).await
    }

    async fn set_waveform_offset(&mut self, ich: u8, offset: f64) -> Result<()> {
        RigolDg1022z::set_waveform_offset(self, ich, offset).await
    }

    async fn waveform_offset(&mut self, ich: u8) -> Result<f64> {
        RigolDg1022z::waveform_offset(self, ich).await
    }

    async fn enable_burst(&mut self, ich: u8) -> Result<()> {
        RigolDg1022z::enable_burst(self, ich).await
    }

    async fn disable_burst(&mut self, ich: u8) -> Result<()> {
        RigolDg1022z::disable_burst(self, ich).await
    }

    async fn set_burst_ncycles(&mut self, ich: u8, n: u32) -> Result<()> {
        RigolDg1022z::set_burst_ncycles(self, ich, n).await
    }

    async fn set_trigger_source(&mut self, ich: u8, source: TriggerSource) -> Result<()> {
        RigolDg1022z::set_trigger_source(self, ich, source).await
    }

    async fn trigger_channel(&mut self, ich: u8) -> Result<()> {
        RigolDg1022z::trigger_channel(self, ich).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        RigolDg1022z::disconnect(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    async fn connected(mock: &MockTransport) -> RigolDg1022z {
        mock.reply("*IDN?", "Rigol Technologies,DG1022Z,DG1ZA2012604407,00.01.14\n");
        mock.reply(":SYST:ERR?", "0,\"No error\"\n");
        RigolDg1022z::with_transport(mock.boxed()).await.unwrap()
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
            vec!["*RST", "*CLS", "*IDN?", ":OUTP1 OFF", ":OUTP2 OFF", ":SYST:BEEP:IMM"]
        );
    }

    #[tokio::test]
    async fn channel_index_is_validated() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        let err = fg.enable_output_channel(3).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisaError>(),
            Some(VisaError::InvalidChannel(3, _))
        ));
    }

    #[tokio::test]
    async fn apply_and_query_waveform() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        mock.reply(":SOUR1:FUNC?", "SIN\n");
        mock.reply(":SOUR1:FREQ:FIX?", "5.000000E+05\n");
        fg.apply_sine(1, 500e3, 0.2, 0.0).await.unwrap();
        assert_eq!(fg.waveform_type(1).await.unwrap(), WaveformType::Sine);
        assert_eq!(fg.waveform_freq(1).await.unwrap(), 500e3);
        assert!(mock.writes().contains(&":SOUR1:APPL:SIN 500000, 0.2, 0, 0".to_string()));
    }

    #[tokio::test]
    async fn offset_is_checked_against_amplitude() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        mock.reply(":SOUR2:VOLT:LEV:IMM:AMPL?", "10\n");
        fg.set_waveform_offset(2, 15.0).await.unwrap();
        assert!(fg.set_waveform_offset(2, 15.1).await.is_err());
        assert!(fg.set_waveform_amp(2, 41.0).await.is_err());
    }

    #[tokio::test]
    async fn coupling_state_is_parsed() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        mock.reply(":COUP?", "FREQ:ON,PHASE:OFF,AMPL:ON\n");
        let state = fg.coupling_state().await.unwrap();
        assert_eq!(
            state,
            CouplingState {
                frequency: true,
                phase: false,
                amplitude: true
            }
        );
        assert!(fg.set_coupling_ratio(Coupling::Phase, 1e3).await.is_err());
        fg.set_coupling_deviation(Coupling::Frequency, 1e6).await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), ":COUP:FREQ:DEV 1000000");
    }

    #[tokio::test]
    async fn burst_duration_sets_cycle_count() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        mock.reply(":SOUR2:FREQ:FIX?", "5.000000E+05\n");
        fg.set_burst_duration(2, 200e-6).await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), ":SOUR2:BURS:NCYC 100");
        assert!(fg.set_burst_duration(2, 1e-6).await.is_err());
    }

    #[tokio::test]
    async fn dac16_upload_sends_binary_packets() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        let n0 = mock.writes().len();
        let y: Vec<f64> = (0..16384).map(|i| (i as f64 / 100.0).sin()).collect();
        let opts = ArbUpload {
            adapt_npoints: false,
            activate: true,
            ..ArbUpload::default()
        };
        fg.upload_arbitrary_waveform(1, &y, opts).await.unwrap();

        let raw = mock.raw_writes();
        let first = &raw[n0];
        let header = b":SOUR1:TRAC:DATA:DAC16 VOLATILE,CON,#516384";
        assert!(first.starts_with(header));
        assert_eq!(first.len(), header.len() + 16384 + 1);
        assert!(raw[n0 + 1].starts_with(b":SOUR1:TRAC:DATA:DAC16 VOLATILE,END,#516384"));
        assert_eq!(
            writes_after(&mock, n0 + 2),
            vec![":SYST:ERR?", ":SOUR1:FUNC:ARB:MODE FREQ", ":SOUR1:FUNC USER"]
        );
    }

    #[tokio::test]
    async fn short_text_upload_sets_point_count() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        mock.reply(":SOUR1:DATA:POIN? VOLATILE", "10\n");
        let n0 = mock.writes().len();
        let y: Vec<f64> = (0..10).map(f64::from).collect();
        let opts = ArbUpload {
            dtype: ArbDataType::Float,
            precision: 1,
            adapt_npoints: false,
            activate: false,
        };
        fg.upload_arbitrary_waveform(1, &y, opts).await.unwrap();
        let writes = writes_after(&mock, n0);
        assert_eq!(
            writes[0],
            ":SOUR1:DATA VOLATILE,-1.0,-0.8,-0.6,-0.3,-0.1,0.1,0.3,0.6,0.8,1.0"
        );
        assert!(writes.contains(&":SOUR1:DATA:POIN VOLATILE,10".to_string()));
        assert!(fg
            .upload_arbitrary_waveform(1, &[0.0, 1.0], opts)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn waveform_files_are_validated() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        fg.save_waveform_to_memory("ARB10").await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), "*SAV ARB10");
        assert!(fg.save_waveform_to_memory("ARB11").await.is_err());
        assert!(fg.recall_waveform_from_memory("ARB0").await.is_err());

        mock.reply(":SOUR1:DATA:CAT?", "\"ARB1\",\"ARB2\",\"\"\n");
        assert_eq!(
            fg.waveform_catalog(Some(1)).await.unwrap(),
            vec!["ARB1", "ARB2"]
        );
        assert!(fg.load_waveform_from_file(1, "ARB3").await.is_err());
        fg.load_waveform_from_file(1, "ARB2").await.unwrap();
    }

    #[tokio::test]
    async fn triggered_sine_burst_train_sequence() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        mock.reply(":SOUR1:FREQ:FIX?", "1.000000E+02\n");
        mock.reply(":SOUR2:FREQ:FIX?", "5.000000E+05\n");
        let n0 = mock.writes().len();
        let train = SineBurstTrain {
            fdrive: 500e3,
            vpp: 0.1,
            tstim: 0.2,
            prf: 100.0,
            duty_cycle: 50.0,
            period: None,
            trigger_source: TriggerSource::External,
        };
        fg.set_triggered_sine_burst_train(&train, 1, 2).await.unwrap();
        let writes = writes_after(&mock, n0);
        assert_eq!(writes[0], ":OUTP2 OFF");
        assert_eq!(writes[1], ":OUTP1 OFF");
        assert!(writes.contains(&":SOUR1:FUNC:PULS:WIDT 0.00001".to_string()));
        assert!(writes.contains(&":SOUR1:BURS:NCYC 20".to_string()));
        assert!(writes.contains(&":SOUR2:BURS:NCYC 2500".to_string()));
        assert_eq!(&writes[writes.len() - 2..], [":OUTP1 ON", ":OUTP2 ON"]);

        assert!(fg.set_triggered_sine_burst_train(&train, 1, 1).await.is_err());
    }

    #[tokio::test]
    async fn trigger_gating_rejects_ramps() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        let train = SineBurstTrain {
            fdrive: 500e3,
            vpp: 0.1,
            tstim: 0.2,
            prf: 100.0,
            duty_cycle: 50.0,
            period: None,
            trigger_source: TriggerSource::External,
        };
        assert!(fg
            .set_gated_sine_burst(&train, 1e-3, 1, 2, GateType::Trigger)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn looping_burst_without_trigger_channel() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        let n0 = mock.writes().len();
        fg.set_looping_sine_burst(1, 500e3, 0.1, 200.0, 100.0, 0.0, None, GateType::Trigger)
            .await
            .unwrap();
        assert_eq!(
            writes_after(&mock, n0),
            vec![
                ":OUTP1 OFF",
                ":SOUR1:APPL:SIN 500000, 0.1, 0, 0",
                ":SOUR1:BURS:INT:PER 0.01",
                ":SOUR1:BURS:NCYC 200",
                ":SOUR1:BURS ON",
                ":SOUR1:BURS:TRIG:SOUR INT",
                ":OUTP1 ON",
            ]
        );
        assert!(fg
            .set_looping_sine_burst(1, 500e3, 0.1, 0.2, 100.0, 0.0, None, GateType::Trigger)
            .await
            .is_err());
    }

    fn am_replies(mock: &MockTransport, phase: &str) {
        mock.reply(":SOUR1:FREQ:FIX?", "100\n");
        mock.reply(":SOUR1:VOLT:LEV:IMM:AMPL?", "11\n");
        mock.reply(":SOUR1:PHAS?", phase);
    }

    #[tokio::test]
    async fn ramped_am_pulse_train_uploads_an_envelope() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        am_replies(&mock, "0\n");
        let n0 = mock.writes().len();
        fg.set_am_pulse_train(1, 100.0, 50.0, 0.2, 1e-3, None, TriggerSource::External)
            .await
            .unwrap();
        let writes = writes_after(&mock, n0);
        assert!(writes[0].starts_with(":SOUR1:TRAC:DATA:DAC16 VOLATILE,END,#"));
        assert_eq!(
            &writes[1..],
            [
                ":SYST:ERR?",
                ":SOUR1:FUNC:ARB:MODE FREQ",
                ":SOUR1:FUNC USER",
                ":SOUR1:VOLT:LEV:IMM:AMPL 11",
                ":SOUR1:VOLT:LEV:IMM:AMPL?",
                ":SOUR1:VOLT:LEV:IMM:OFFS 0",
                ":SOUR1:FREQ:FIX 100",
                ":SOUR1:BURS:TRIG:SOUR EXT",
                ":SOUR1:FREQ:FIX?",
                ":SOUR1:BURS:NCYC 20",
                ":SOUR1:BURS ON",
                ":OUTP1:SYNC ON",
                ":SOUR1:PHAS?",
                ":SOUR1:BURS:TRIG:SOUR EXT",
            ]
        );
    }

    #[tokio::test]
    async fn square_am_pulse_train_inverts_phase_and_sync() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        am_replies(&mock, "180\n");
        let n0 = mock.writes().len();
        fg.set_am_pulse_train(1, 100.0, 50.0, 0.2, 0.0, None, TriggerSource::Internal)
            .await
            .unwrap();
        assert_eq!(
            writes_after(&mock, n0),
            vec![
                ":SOUR1:FUNC SQU",
                ":SOUR1:FUNC:SQU:DCYC 50",
                ":SOUR1:PHAS 180",
                ":SOUR1:VOLT:LEV:IMM:AMPL 11",
                ":SOUR1:VOLT:LEV:IMM:AMPL?",
                ":SOUR1:VOLT:LEV:IMM:OFFS 0",
                ":SOUR1:FREQ:FIX 100",
                ":SOUR1:BURS:TRIG:SOUR EXT",
                ":SOUR1:BURS:INT:PER 2",
                ":SOUR1:FREQ:FIX?",
                ":SOUR1:BURS:NCYC 20",
                ":SOUR1:BURS ON",
                ":OUTP1:SYNC ON",
                ":SOUR1:PHAS?",
                ":OUTP1:SYNC:POL NEG",
                ":SOUR1:BURS:TRIG:SOUR INT",
            ]
        );
    }

    #[tokio::test]
    async fn modulation_gating_drives_carrier_am() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        am_replies(&mock, "180\n");
        let train = SineBurstTrain {
            fdrive: 500e3,
            vpp: 0.1,
            tstim: 0.2,
            prf: 100.0,
            duty_cycle: 50.0,
            period: None,
            trigger_source: TriggerSource::External,
        };
        let n0 = mock.writes().len();
        fg.set_gated_sine_burst(&train, 0.0, 1, 2, GateType::Modulation)
            .await
            .unwrap();
        assert_eq!(
            writes_after(&mock, n0),
            vec![
                ":OUTP2 OFF",
                ":OUTP1 OFF",
                ":SOUR1:FUNC SQU",
                ":SOUR1:FUNC:SQU:DCYC 50",
                ":SOUR1:PHAS 180",
                ":SOUR1:VOLT:LEV:IMM:AMPL 11",
                ":SOUR1:VOLT:LEV:IMM:AMPL?",
                ":SOUR1:VOLT:LEV:IMM:OFFS 0",
                ":SOUR1:FREQ:FIX 100",
                ":SOUR1:BURS:TRIG:SOUR EXT",
                ":SOUR1:FREQ:FIX?",
                ":SOUR1:BURS:NCYC 20",
                ":SOUR1:BURS ON",
                ":OUTP1:SYNC ON",
                ":SOUR1:PHAS?",
                ":OUTP1:SYNC:POL NEG",
                ":SOUR1:BURS:TRIG:SOUR EXT",
                ":SOUR2:APPL:SIN 500000, 0.1, 0, 0",
                ":SOUR2:AM:STAT ON",
                ":SOUR2:AM:SOUR EXT",
                ":OUTP1 ON",
                ":OUTP2 ON",
            ]
        );
        assert!(fg
            .set_gated_sine_burst(&train, 0.0, 2, 2, GateType::Modulation)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn ramped_trigger_gating_falls_back_to_modulation() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        am_replies(&mock, "0\n");
        let n0 = mock.writes().len();
        fg.set_looping_sine_burst(2, 500e3, 0.1, 2500.0, 100.0, 1e-3, Some(1), GateType::Trigger)
            .await
            .unwrap();
        let writes = writes_after(&mock, n0);
        assert_eq!(&writes[..2], [":OUTP2 OFF", ":OUTP1 OFF"]);
        assert!(writes[2].starts_with(":SOUR1:TRAC:DATA:DAC16 VOLATILE,END,#"));
        assert_eq!(
            &writes[3..],
            [
                ":SYST:ERR?",
                ":SOUR1:FUNC:ARB:MODE FREQ",
                ":SOUR1:FUNC USER",
                ":SOUR1:VOLT:LEV:IMM:AMPL 11",
                ":SOUR1:VOLT:LEV:IMM:AMPL?",
                ":SOUR1:VOLT:LEV:IMM:OFFS 0",
                ":SOUR1:FREQ:FIX 100",
                ":SOUR1:BURS:TRIG:SOUR EXT",
                ":SOUR1:BURS:INT:PER 0.01",
                ":SOUR1:FREQ:FIX?",
                ":SOUR1:BURS:NCYC 2",
                ":SOUR1:BURS ON",
                ":OUTP1:SYNC ON",
                ":SOUR1:PHAS?",
                ":SOUR1:BURS:TRIG:SOUR EXT",
                ":SOUR2:APPL:SIN 500000, 0.1, 0, 0",
                ":SOUR2:AM:STAT ON",
                ":SOUR2:AM:SOUR EXT",
                ":OUTP1 ON",
                ":OUTP2 ON",
                ":SOUR1:BURS OFF",
            ]
        );
    }

    #[tokio::test]
    async fn display_for_clears_text() {
        let mock = MockTransport::new();
        let mut fg = connected(&mock).await;
        fg.display_for("connected", Duration::from_millis(1))
            .await
            .unwrap();
        let writes = mock.writes();
        assert_eq!(
            &writes[writes.len() - 2..],
            [":DISP:TEXT \"connected\"", ":DISP:TEXT:CLEAR"]
        );
        assert!(fg.display_text(&"x".repeat(41)).await.is_err());
    }

    #[tokio::test]
    async fn generic_trait_delegates() {
        let mock = MockTransport::new();
        let fg = connected(&mock).await;
        let mut dynamic: Box<dyn WaveformGenerator> = Box::new(fg);
        dynamic.enable_output().await.unwrap();
        let writes = mock.writes();
        assert_eq!(&writes[writes.len() - 2..], [":OUTP1 ON", ":OUTP2 ON"]);
    }
}
