//! B&K Precision 2555 four-channel digital oscilloscope.
//!
//! Every reply echoes its command header (`TDIV 5.00E-04S`), so values are
//! extracted with regular expressions.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use super::{clamp_trigger_delay, clamp_vertical_scale, closest_timebase, timebase_ladder, Oscilloscope, Waveform};
use crate::error::VisaError;
use crate::resource::ResourceManager;
use crate::si::{apply_suffix, is_within, si_command, si_format};
use crate::transport::Transport;
use crate::visa::{check_channel, extract_float, extract_int, ModelInfo, VisaInstrument};

pub const MODEL: ModelInfo = ModelInfo {
    name: "BK2555",
    id_pattern: r"378[A-Z]181\d+",
    prefix: "",
    no_error: "CMR 0",
    timeout: Some(Duration::from_secs(20)),
};

pub const CHANNELS: &[u8] = &[1, 2, 3, 4];
pub const NHDIVS: u32 = 18;
pub const NVDIVS: u32 = 8;
/// Max vertical scale (V/div).
pub const MAX_VDIV: f64 = 5.0;
/// Valid numbers of sweeps per acquisition.
pub const NAVGS: &[u32] = &[1, 4, 16, 32, 64, 128, 256];
/// Filter cutoff limits relative to the temporal scale (Hz * s/div).
pub const FILTER_REL_LIMS: (f64, f64) = (2.5, 230.0);
/// Plain units that may follow a value in replies.
pub const UNITS: &[&str] = &["S", "V", "%", "Hz", "Sa"];

const TIMEBASES: [f64; 3] = [1.0, 2.5, 5.0];

const SI_RE: &str = r"[+-]?\d\.\d+?[Ee][+-]?\d+";
const FLOAT_RE: &str = r"[+-]?\d*[.]?\d+";
const INT_RE: &str = r"\d+";

/// Compiled reply patterns, keyed by pattern text.
static REGEX_CACHE: LazyLock<Mutex<HashMap<String, Regex>>> = LazyLock::new(Mutex::default);

scpi_enum! {
    pub enum Coupling {
        /// AC, 1 MOhm input impedance.
        Ac1M => "A1M",
        Ac50 => "A50",
        Dc1M => "D1M",
        Dc50 => "D50",
        Ground => "GND",
    }
}

scpi_enum! {
    pub enum AcquisitionType {
        PeakDetect => "PEAK_DETECT",
        Sampling => "SAMPLING",
        Average => "AVERAGE",
    }
}

scpi_enum! {
    pub enum TriggerMode {
        Auto => "AUTO",
        Normal => "NORM",
        Single => "SINGLE",
        Stop => "STOP",
    }
}

scpi_enum! {
    pub enum TriggerCoupling {
        Ac => "AC",
        Dc => "DC",
        HighFreqReject => "HFREJ",
        LowFreqReject => "LFREJ",
    }
}

scpi_enum! {
    pub enum TriggerType {
        Edge => "EDGE",
        Glitch => "GLIT",
        Interval => "INTV",
        Video => "TV",
    }
}

scpi_enum! {
    pub enum TriggerSlope {
        Negative => "NEG",
        Positive => "POS",
        Window => "WINDOW",
    }
}

scpi_enum! {
    pub enum HoldType {
        Holdoff => "TI",
        PulseSmaller => "PS",
        PulseLarger => "PL",
        PulseEqual => "PE",
        IntervalSmaller => "IS",
        IntervalLarger => "IL",
        IntervalEqual => "IE",
    }
}

scpi_enum! {
    pub enum CursorType {
        HorizontalRef => "HREF",
        HorizontalDiff => "HDIF",
        VerticalRef => "VREF",
        VerticalDiff => "VDIF",
        TrackRef => "TREF",
        TrackDiff => "TDIF",
    }
}

scpi_enum! {
    pub enum CursorValueType {
        HorizontalRel => "HREL",
        VerticalRel => "VREL",
    }
}

scpi_enum! {
    pub enum FilterType {
        LowPass => "LP",
        HighPass => "HP",
        BandPass => "BP",
        BandReject => "BR",
    }
}

scpi_enum! {
    pub enum Interpolation {
        Linear => "OFF",
        Sine => "ON",
    }
}

/// Decoded `*STB?` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusByte {
    pub inb: bool,
    pub vab: bool,
    pub mav: bool,
    pub esb: bool,
    pub mss_rqs: bool,
}

impl StatusByte {
    /// Bits are read from the most significant one, `INB` first.
    pub fn from_register(stb: u8) -> Self {
        let bit = |from_msb: u32| stb & (0x80 >> from_msb) != 0;
        Self {
            inb: bit(0),
            vab: bit(2),
            mav: bit(4),
            esb: bit(5),
            mss_rqs: bit(6),
        }
    }
}

/// Trigger selection parsed from `TRSE?`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerOptions {
    pub kind: TriggerType,
    pub source: u8,
    pub hold_type: HoldType,
    /// Hold value (s).
    pub hold_value: f64,
}

/// `WFSU?` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveformSettings {
    pub sparsing: u32,
    pub npoints: usize,
    pub first_point: usize,
    pub segment: u32,
}

impl std::fmt::Display for WaveformSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "waveform settings:")?;
        writeln!(f, " - sparsing = {}", self.sparsing)?;
        writeln!(f, " - # points = {}", self.npoints)?;
        writeln!(f, " - 1st point = {}", self.first_point)?;
        write!(f, " - segment index = {}", self.segment)
    }
}

/// `CFMT?` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommFormat {
    pub block_format: String,
    pub data_type: String,
    pub encoding: String,
}

/// Fields of the binary waveform descriptor (`WF? DESC`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformDescriptor {
    pub nsweeps: i32,
    pub vgain: f32,
    pub voffset: f32,
    /// Sampling interval (s).
    pub dt: f32,
    /// Time of the first sample (s).
    pub hoffset: f64,
}

impl WaveformDescriptor {
    pub fn parse(desc: &[u8]) -> Result<Self, VisaError> {
        Ok(Self {
            nsweeps: i32::from_le_bytes(field(desc, 148)?),
            vgain: f32::from_le_bytes(field(desc, 156)?),
            voffset: f32::from_le_bytes(field(desc, 160)?),
            dt: f32::from_le_bytes(field(desc, 176)?),
            hoffset: f64::from_le_bytes(field(desc, 180)?),
        })
    }
}

fn field<const N: usize>(desc: &[u8], offset: usize) -> Result<[u8; N], VisaError> {
    desc.get(offset..offset + N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| VisaError::Response {
            command: "WF? DESC".into(),
            response: format!("descriptor too short ({} bytes)", desc.len()),
        })
}

fn regex(pattern: &str) -> Result<Regex> {
    let mut cache = REGEX_CACHE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

fn no_match(command: &str, out: &str) -> VisaError {
    VisaError::Response {
        command: command.to_string(),
        response: out.to_string(),
    }
}

pub struct Bk2555 {
    inst: VisaInstrument,
    timebases: Vec<f64>,
}

impl Bk2555 {
    pub async fn connect(rm: &ResourceManager) -> Result<Self> {
        Ok(Self::new(VisaInstrument::open(rm, MODEL).await?))
    }

    pub async fn with_transport(link: Box<dyn Transport>) -> Result<Self> {
        Ok(Self::new(VisaInstrument::from_transport(link, MODEL).await?))
    }

    fn new(inst: VisaInstrument) -> Self {
        Self {
            inst,
            timebases: timebase_ladder(&TIMEBASES),
        }
    }

    pub fn instrument(&mut self) -> &mut VisaInstrument {
        &mut self.inst
    }

    /// Query `command` and extract a float from the first group of
    /// `pattern`, scaled by the unit suffix in the second group.
    async fn query_float(&mut self, command: &str, pattern: &str) -> Result<f64> {
        let out = self.inst.query(command).await?;
        Ok(extract_float(&out, &regex(pattern)?, command, UNITS)?)
    }

    async fn query_int(&mut self, command: &str, pattern: &str) -> Result<i64> {
        let out = self.inst.query(command).await?;
        Ok(extract_int(&out, &regex(pattern)?, command)?)
    }

    /// Query `command` and return the first group of `pattern`.
    async fn query_word(&mut self, command: &str, pattern: &str) -> Result<String> {
        let out = self.inst.query(command).await?;
        regex(pattern)?
            .captures(&out)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| no_match(command, &out).into())
    }

    // --------------------- miscellaneous ---------------------

    pub async fn idn(&mut self) -> Result<String> {
        self.inst.idn().await
    }

    /// Wait for the current acquisition, at most `t` seconds if given.
    pub async fn wait(&mut self, t: Option<f64>) -> Result<()> {
        match t {
            Some(t) => self.inst.write(&format!("WAIT {t}")).await,
            None => self.inst.write("WAIT").await,
        }
    }

    pub async fn last_error(&mut self) -> Result<String> {
        self.inst.query("CMR?").await
    }

    pub async fn check_error(&mut self) -> Result<()> {
        self.inst.check_error("CMR?").await
    }

    pub async fn status_byte(&mut self) -> Result<StatusByte> {
        let stb = self.query_int("*STB?", &format!(r"^\*STB ({INT_RE})")).await?;
        Ok(StatusByte::from_register(stb as u8))
    }

    pub async fn lock_front_panel(&mut self) -> Result<()> {
        self.inst.write("LOCK ON").await
    }

    pub async fn unlock_front_panel(&mut self) -> Result<()> {
        self.inst.write("LOCK OFF").await
    }

    pub async fn calibrate(&mut self) -> Result<String> {
        self.inst.query("*CAL?").await
    }

    pub async fn set_automatic_calibration(&mut self, on: bool) -> Result<()> {
        self.inst.write(&format!("ACAL {}", on_off(on))).await
    }

    // --------------------- display ---------------------

    pub async fn display_menu(&mut self) -> Result<()> {
        self.inst.write("MENU ON").await
    }

    pub async fn hide_menu(&mut self) -> Result<()> {
        self.inst.write("MENU OFF").await
    }

    pub async fn show_trace(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("C{ich}: TRA ON")).await
    }

    pub async fn hide_trace(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("C{ich}: TRA OFF")).await
    }

    pub async fn is_trace(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        let out = self.inst.query(&format!("C{ich}: TRA?")).await?;
        Ok(out.ends_with("ON"))
    }

    /// Screen dump as raw bitmap bytes.
    pub async fn screen_image(&mut self) -> Result<Vec<u8>> {
        self.inst.write("SCDP").await?;
        self.inst.read_raw().await
    }

    // --------------------- scales / offsets ---------------------

    pub async fn auto_setup(&mut self) -> Result<()> {
        info!("running oscilloscope auto-setup...");
        self.inst.write("ASET").await
    }

    pub async fn set_temporal_scale(&mut self, value: f64) -> Result<()> {
        let value = closest_timebase(&self.timebases, value);
        info!("setting time scale to {}s/div", si_format(value, 2));
        self.inst
            .write(&format!("TDIV {}S", si_command(value, 1)))
            .await
    }

    pub async fn temporal_scale(&mut self) -> Result<f64> {
        self.query_float("TDIV?", &format!(r"^TDIV ({SI_RE})([A-Za-z]+)"))
            .await
    }

    pub async fn temporal_range(&mut self) -> Result<f64> {
        Ok(self.temporal_scale().await? * f64::from(NHDIVS))
    }

    pub async fn set_vertical_scale(&mut self, ich: u8, value: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        let value = clamp_vertical_scale(value, MAX_VDIV);
        info!("setting channel {ich} vertical scale to {}V/div", si_format(value, 2));
        self.inst
            .write(&format!("C{ich}: VDIV {}V", si_command(value, 1)))
            .await
    }

    pub async fn vertical_scale(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.query_float(
            &format!("C{ich}: VDIV?"),
            &format!(r"^C{ich}:VDIV ({SI_RE})([A-Za-z]+)"),
        )
        .await
    }

    pub async fn set_vertical_offset(&mut self, ich: u8, value: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("setting channel {ich} vertical offset to {}V", si_format(value, 2));
        self.inst
            .write(&format!("C{ich}: OFST {}V", si_command(value, 1)))
            .await
    }

    pub async fn vertical_offset(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.query_float(
            &format!("C{ich}: OFST?"),
            &format!(r"^C{ich}:OFST ({SI_RE})([A-Za-z]+)"),
        )
        .await
    }

    // --------------------- filters ---------------------

    pub async fn enable_bandwidth_filter(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("BWL C{ich}, ON")).await
    }

    pub async fn disable_bandwidth_filter(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("BWL C{ich}, OFF")).await
    }

    pub async fn is_bandwidth_filter_enabled(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        let out = self.inst.query("BWL?").await?;
        let pattern = format!(
            "^BWL {}",
            CHANNELS
                .iter()
                .map(|c| format!("C{c},(ON|OFF)"))
                .collect::<Vec<_>>()
                .join(",")
        );
        let caps = regex(&pattern)?
            .captures(&out)
            .ok_or_else(|| no_match("BWL?", &out))?;
        Ok(caps.get(usize::from(ich)).is_some_and(|m| m.as_str() == "ON"))
    }

    /// Configure a digital filter on channel `ich`.
    ///
    /// Low-pass filters take only `fhigh`, high-pass filters only `flow`,
    /// band filters both. Cutoffs (Hz) must lie within limits set by the
    /// current temporal scale.
    pub async fn set_filter(
        &mut self,
        ich: u8,
        ftype: FilterType,
        flow: Option<f64>,
        fhigh: Option<f64>,
    ) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        check_filter_limits(ftype, flow, fhigh)?;
        let tdiv = self.temporal_scale().await?;
        let flims = (FILTER_REL_LIMS.0 / tdiv, FILTER_REL_LIMS.1 / tdiv);
        for (key, f) in [("flow", flow), ("fhigh", fhigh)] {
            if let Some(f) = f {
                if !is_within(f, flims) {
                    return Err(VisaError::OutOfRange(format!(
                        "{key} value ({}Hz) outside of frequency limits ({}Hz - {}Hz) with current temporal scale ({}s/div)",
                        si_format(f, 1),
                        si_format(flims.0, 1),
                        si_format(flims.1, 1),
                        si_format(tdiv, 1)
                    ))
                    .into());
                }
            }
        }
        info!("setting {ftype} filter on channel {ich}");
        let mut command = format!("C{ich}:FILTS TYPE,{ftype}");
        if let Some(f) = flow {
            command.push_str(&format!(",LOWLIMIT,{}Hz", si_command(f, 1)));
        }
        if let Some(f) = fhigh {
            command.push_str(&format!(",UPPLIMIT,{}Hz", si_command(f, 1)));
        }
        self.inst.write(&command).await
    }

    pub async fn enable_filter(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("C{ich}: FILT ON")).await
    }

    pub async fn disable_filter(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("C{ich}: FILT OFF")).await
    }

    pub async fn is_filter_enabled(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        let state = self
            .query_word(&format!("C{ich}: FILT?"), &format!("^C{ich}:FILT (ON|OFF)"))
            .await?;
        Ok(state == "ON")
    }

    // --------------------- attenuation & coupling ---------------------

    pub async fn channel_attenuation(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        let n = self
            .query_int(&format!("C{ich}:ATTN?"), &format!("^C{ich}:ATTN ({INT_RE})"))
            .await?;
        Ok(n as f64)
    }

    pub async fn set_channel_attenuation(&mut self, ich: u8, value: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("setting channel {ich} attenuation factor to {value}");
        self.inst.write(&format!("C{ich}:ATTN {value}")).await
    }

    pub async fn coupling_mode(&mut self, ich: u8) -> Result<Coupling> {
        check_channel(ich, CHANNELS)?;
        let mode = self
            .query_word(&format!("C{ich}: CPL?"), &format!("^C{ich}:CPL ([A-Za-z0-9]+)"))
            .await?;
        Ok(mode.parse()?)
    }

    pub async fn set_coupling_mode(&mut self, ich: u8, mode: Coupling) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("setting channel {ich} coupling mode to {mode}");
        self.inst.write(&format!("C{ich}: CPL {mode}")).await
    }

    // --------------------- cursors ---------------------

    /// Place a cursor `pos` divisions from its reference.
    pub async fn set_cursor_position(&mut self, ich: u8, ctype: CursorType, pos: f64) -> Result<()> {
        let bounds = cursor_bounds(ctype);
        if !is_within(pos, bounds) {
            return Err(VisaError::OutOfRange(format!(
                "invalid {ctype} cursor position: {pos} (bounds are {bounds:?})"
            ))
            .into());
        }
        self.inst
            .write(&format!("C{ich}: CRST {ctype}, {pos}DIV"))
            .await
    }

    pub async fn cursor_position(&mut self, ich: u8, ctype: CursorType) -> Result<f64> {
        let command = format!("C{ich}: CRST? {ctype}");
        let out = self.inst.query(&command).await?;
        regex(&format!("^C{ich}:CRST {ctype},({FLOAT_RE})"))?
            .captures(&out)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| no_match(&command, &out).into())
    }

    /// Cursor readings: four values for `HREL`, one for `VREL`.
    pub async fn cursor_values(&mut self, ich: u8, ctype: CursorValueType) -> Result<Vec<f64>> {
        let command = format!("C{ich}: CRVA? {ctype}");
        let out = self.inst.query(&command).await?;
        let pattern = match ctype {
            CursorValueType::HorizontalRel => {
                format!("^C{ich}:CRVA {ctype},({SI_RE}),({SI_RE}),({SI_RE}),({FLOAT_RE})")
            }
            CursorValueType::VerticalRel => format!("^C{ich}:CRVA {ctype},({SI_RE})"),
        };
        let caps = regex(&pattern)?
            .captures(&out)
            .ok_or_else(|| no_match(&command, &out))?;
        caps.iter()
            .skip(1)
            .map(|m| {
                m.and_then(|m| m.as_str().parse().ok())
                    .ok_or_else(|| anyhow::Error::from(no_match(&command, &out)))
            })
            .collect()
    }

    pub async fn set_auto_cursor(&mut self) -> Result<()> {
        self.inst.write("CRAU").await
    }

    // --------------------- trigger ---------------------

    pub async fn trigger_mode(&mut self) -> Result<TriggerMode> {
        let mode = self.query_word("TRMD?", "^TRMD ([A-Za-z]+)").await?;
        Ok(mode.parse()?)
    }

    pub async fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        self.inst.write(&format!("TRMD {mode}")).await
    }

    pub async fn trigger_coupling_mode(&mut self, ich: u8) -> Result<TriggerCoupling> {
        check_channel(ich, CHANNELS)?;
        let mode = self
            .query_word(&format!("C{ich}: TRCP?"), &format!("^C{ich}:TRCP ([A-Za-z]+)"))
            .await?;
        Ok(mode.parse()?)
    }

    pub async fn set_trigger_coupling_mode(&mut self, ich: u8, mode: TriggerCoupling) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("C{ich}: TRCP {mode}")).await
    }

    pub async fn trigger_options(&mut self) -> Result<TriggerOptions> {
        let out = self.inst.query("TRIG_SELECT?").await?;
        let join = |all: &[&str]| all.join("|");
        let types: Vec<&str> = TriggerType::ALL.iter().map(|t| t.as_scpi()).collect();
        let holds: Vec<&str> = HoldType::ALL.iter().map(|t| t.as_scpi()).collect();
        let pattern = format!(
            "^TRSE ({}),SR,C({INT_RE}),HT,({}),HV,({FLOAT_RE})([A-Za-z]+)",
            join(&types),
            join(&holds)
        );
        let re = regex(&pattern)?;
        let caps = re.captures(&out).ok_or_else(|| no_match("TRIG_SELECT?", &out))?;
        let group = |i: usize| caps.get(i).map_or("", |m| m.as_str());
        let source = group(2)
            .parse()
            .map_err(|_| no_match("TRIG_SELECT?", &out))?;
        let hold_value = group(4)
            .parse()
            .ok()
            .and_then(|v| apply_suffix(v, group(5), UNITS))
            .ok_or_else(|| no_match("TRIG_SELECT?", &out))?;
        Ok(TriggerOptions {
            kind: group(1).parse()?,
            source,
            hold_type: group(3).parse()?,
            hold_value,
        })
    }

    pub async fn trigger_type(&mut self) -> Result<TriggerType> {
        Ok(self.trigger_options().await?.kind)
    }

    pub async fn set_trigger_type(&mut self, ttype: TriggerType) -> Result<()> {
        self.inst.write(&format!("TRSE {ttype}")).await
    }

    pub async fn trigger_source(&mut self) -> Result<u8> {
        Ok(self.trigger_options().await?.source)
    }

    pub async fn set_trigger_source(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("setting trigger source to channel {ich}");
        let ttype = self.trigger_type().await?;
        self.inst.write(&format!("TRSE {ttype},SR,C{ich}")).await
    }

    pub async fn trigger_slope(&mut self, ich: u8) -> Result<TriggerSlope> {
        check_channel(ich, CHANNELS)?;
        let slope = self
            .query_word(&format!("C{ich}: TRSL?"), &format!("^C{ich}:TRSL ([A-Za-z]+)"))
            .await?;
        Ok(slope.parse()?)
    }

    pub async fn set_trigger_slope(&mut self, ich: u8, slope: TriggerSlope) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("setting channel {ich} trigger slope to {slope}");
        self.inst.write(&format!("C{ich}: TRSL {slope}")).await
    }

    pub async fn trigger_level(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.query_float(
            &format!("C{ich}:TRLV?"),
            &format!(r"^C{ich}:TRLV ({SI_RE})([A-Za-z]+)"),
        )
        .await
    }

    pub async fn set_trigger_level(&mut self, ich: u8, value: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("setting channel {ich} trigger level to {}V", si_format(value, 2));
        self.inst
            .write(&format!("C{ich}:TRLV {}V", si_command(value, 1)))
            .await
    }

    /// Trigger level at the middle of the signal amplitude.
    pub async fn set_trigger_halfamp(&mut self) -> Result<()> {
        self.inst.write("SET50").await
    }

    pub async fn trigger_delay(&mut self) -> Result<f64> {
        self.query_float("TRDL?", &format!("^TRDL ({FLOAT_RE})([A-Za-z]+)"))
            .await
    }

    pub async fn set_trigger_delay(&mut self, value: f64) -> Result<()> {
        let half_range = self.temporal_range().await? / 2.0;
        let value = clamp_trigger_delay(value, half_range);
        info!("setting trigger time delay to {}s", si_format(value, 2));
        self.inst
            .write(&format!("TRDL {}S", si_command(value, 1)))
            .await
    }

    pub async fn force_trigger(&mut self) -> Result<()> {
        self.inst.write("FRTR").await
    }

    // --------------------- acquisition ---------------------

    pub async fn arm_acquisition(&mut self) -> Result<()> {
        self.inst.write("ARM").await
    }

    pub async fn stop_acquisition(&mut self) -> Result<()> {
        self.inst.write("STOP").await
    }

    pub async fn interpolation(&mut self) -> Result<Interpolation> {
        let state = self.query_word("SXSA?", "^SXSA (ON|OFF)").await?;
        Ok(state.parse()?)
    }

    pub async fn set_interpolation(&mut self, interp: Interpolation) -> Result<()> {
        self.inst.write(&format!("SXSA {interp}")).await
    }

    pub async fn nsweeps_per_acquisition(&mut self) -> Result<u32> {
        Ok(self.query_int("AVGA?", &format!("^AVGA ({INT_RE})")).await? as u32)
    }

    /// Number of sweeps to average; 1 switches back to plain sampling.
    pub async fn set_nsweeps_per_acquisition(&mut self, n: u32) -> Result<()> {
        if !NAVGS.contains(&n) {
            return Err(VisaError::OutOfRange(format!(
                "not a valid number of sweeps: {n} (candidates are {NAVGS:?})"
            ))
            .into());
        }
        if n == 1 {
            return self.set_acquisition_type(AcquisitionType::Sampling).await;
        }
        self.set_acquisition_type(AcquisitionType::Average).await?;
        self.inst.write(&format!("AVGA {n}")).await
    }

    pub async fn acquisition_status(&mut self) -> Result<String> {
        self.query_word("SAST?", "^SAST (.+)").await
    }

    pub async fn sample_rate(&mut self) -> Result<f64> {
        self.query_float("SARA?", &format!("^SARA ({FLOAT_RE})([A-Za-z]+)"))
            .await
    }

    /// Number of samples of the last acquisition on channel `ich`.
    pub async fn nsamples(&mut self, ich: u8) -> Result<usize> {
        check_channel(ich, CHANNELS)?;
        Ok(self
            .query_int(&format!("SANU? C{ich}"), &format!("^SANU ({INT_RE})"))
            .await? as usize)
    }

    pub async fn enable_peak_detector(&mut self) -> Result<()> {
        self.inst.write("PDET ON").await
    }

    pub async fn disable_peak_detector(&mut self) -> Result<()> {
        self.inst.write("PDET OFF").await
    }

    pub async fn acquisition_type(&mut self) -> Result<AcquisitionType> {
        let out = self
            .query_word("ACQW?", r"^ACQW (AVERAGE,?\d*|SAMPLING|PEAK_DETECT)")
            .await?;
        let kind = out.split(',').next().unwrap_or_default();
        Ok(kind.parse()?)
    }

    pub async fn set_acquisition_type(&mut self, atype: AcquisitionType) -> Result<()> {
        if atype == AcquisitionType::Average {
            let n = self.nsweeps_per_acquisition().await?;
            return self.inst.write(&format!("ACQW {atype},{n}")).await;
        }
        self.inst.write(&format!("ACQW {atype}")).await
    }

    // --------------------- parameters ---------------------

    /// Value of measurement `key` (e.g. `FREQ`, `PKPK`, `DUTY`) on `ich`.
    pub async fn parameter_value(&mut self, ich: u8, key: &str) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        let command = format!("C{ich}: PAVA? {key}");
        let out = self.inst.query(&command).await?;
        if out.contains("****") {
            return Err(VisaError::Instrument(format!(
                "could not extract {key} from channel {ich}"
            ))
            .into());
        }
        let pattern = if out.ends_with('%') {
            format!("^C{ich}:PAVA {key},({FLOAT_RE})(%)")
        } else {
            format!("^C{ich}:PAVA {key},({SI_RE})([A-Za-z]+)")
        };
        Ok(extract_float(&out, &regex(&pattern)?, &command, UNITS)?)
    }

    pub async fn frequency(&mut self, ich: u8) -> Result<f64> {
        self.parameter_value(ich, "FREQ").await
    }

    pub async fn amplitude(&mut self, ich: u8) -> Result<f64> {
        self.parameter_value(ich, "AMPL").await
    }

    pub async fn min(&mut self, ich: u8) -> Result<f64> {
        self.parameter_value(ich, "MIN").await
    }

    pub async fn max(&mut self, ich: u8) -> Result<f64> {
        self.parameter_value(ich, "MAX").await
    }

    pub async fn peak_to_peak(&mut self, ich: u8) -> Result<f64> {
        self.parameter_value(ich, "PKPK").await
    }

    // --------------------- waveforms ---------------------

    pub async fn waveform_settings(&mut self) -> Result<WaveformSettings> {
        let out = self.inst.query("WAVEFORM_SETUP?").await?;
        let re = regex(r"^WFSU SP,(\d+),NP,(\d+),FP,(\d+),SN,(\d+)")?;
        let caps = re
            .captures(&out)
            .ok_or_else(|| no_match("WAVEFORM_SETUP?", &out))?;
        let num = |i: usize| -> Result<usize, VisaError> {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .ok_or_else(|| no_match("WAVEFORM_SETUP?", &out))
        };
        Ok(WaveformSettings {
            sparsing: num(1)? as u32,
            npoints: num(2)?,
            first_point: num(3)?,
            segment: num(4)? as u32,
        })
    }

    pub async fn set_waveform_settings(&mut self, sparsing: u32, npoints: usize, first_point: usize) -> Result<()> {
        self.inst
            .write(&format!("WFSU SP,{sparsing}, NP,{npoints}, FP,{first_point}"))
            .await
    }

    /// Template describing the logical entities of a waveform.
    pub async fn waveform_template(&mut self) -> Result<String> {
        let out = self.inst.query("TMPL?").await?;
        let end = out.len().saturating_sub(5);
        Ok(out.get(8..end).unwrap_or_default().to_string())
    }

    pub async fn communication_format(&mut self) -> Result<CommFormat> {
        let out = self.inst.query("COMM_FORMAT?").await?;
        let re = regex(r"^CFMT (DEF9|IND0|OFF),(BYTE|WORD),(BIN|HEX)$")?;
        let caps = re
            .captures(&out)
            .ok_or_else(|| no_match("COMM_FORMAT?", &out))?;
        let group = |i: usize| caps.get(i).map_or(String::new(), |m| m.as_str().to_string());
        Ok(CommFormat {
            block_format: group(1),
            data_type: group(2),
            encoding: group(3),
        })
    }

    pub async fn waveform_descriptor(&mut self, ich: u8) -> Result<WaveformDescriptor> {
        check_channel(ich, CHANNELS)?;
        let desc = self.inst.query_block(&format!("C{ich}:WF? DESC")).await?;
        let desc = WaveformDescriptor::parse(&desc)?;
        debug!("# sweeps/acq: {}", desc.nsweeps);
        debug!("vertical gain: {:.5e}", desc.vgain);
        debug!("vertical offset: {:.5} V", desc.voffset);
        debug!("sampling interval: {}s", si_format(f64::from(desc.dt), 3));
        debug!("horizontal offset: {} s", desc.hoffset);
        Ok(desc)
    }

    pub async fn waveform_data(&mut self, ich: u8) -> Result<Waveform> {
        let desc = self.waveform_descriptor(ich).await?;
        let raw = self.inst.query_block(&format!("C{ich}:WF? DAT2")).await?;
        let expected = self.waveform_settings().await?.npoints;
        if raw.len() != expected {
            return Err(VisaError::Instrument(format!(
                "waveform parsing error: waveform size ({}) does not correspond to expected number of points ({expected})",
                raw.len()
            ))
            .into());
        }
        let gain = f64::from(desc.vgain);
        let offset = f64::from(desc.voffset);
        let volts = raw
            .iter()
            .map(|&b| f64::from(b as i8) * gain - offset)
            .collect();
        Ok(Waveform::from_samples(volts, f64::from(desc.dt), desc.hoffset))
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.inst.close().await
    }
}

fn on_off(on: bool) -> &'static str {
    if on { "ON" } else { "OFF" }
}

fn check_filter_limits(ftype: FilterType, flow: Option<f64>, fhigh: Option<f64>) -> Result<(), VisaError> {
    let fail = |msg: String| Err(VisaError::OutOfRange(msg));
    match (ftype, flow, fhigh) {
        (FilterType::LowPass, Some(_), _) => fail("cannot specify frequency lower limit for LP filter".into()),
        (FilterType::LowPass, None, None) => fail("frequency higher limit is required for LP filter".into()),
        (FilterType::HighPass, _, Some(_)) => fail("cannot specify frequency higher limit for HP filter".into()),
        (FilterType::HighPass, None, None) => fail("frequency lower limit is required for HP filter".into()),
        (FilterType::BandPass | FilterType::BandReject, Some(lo), Some(hi)) if lo >= hi => fail(format!(
            "frequency lower limit ({lo} Hz) must be smaller than higher limit ({hi} Hz)"
        )),
        (FilterType::BandPass | FilterType::BandReject, None, _) | (FilterType::BandPass | FilterType::BandReject, _, None) => {
            fail(format!("frequency lower and higher limits are required for {ftype} filter"))
        }
        _ => Ok(()),
    }
}

/// Valid cursor positions (div) for each cursor type.
fn cursor_bounds(ctype: CursorType) -> (f64, f64) {
    let h = f64::from(NHDIVS);
    let v = f64::from(NVDIVS);
    match ctype {
        CursorType::HorizontalRef | CursorType::HorizontalDiff => (0.1, h - 0.1),
        CursorType::TrackRef | CursorType::TrackDiff => (-v / 2.0, v / 2.0),
        CursorType::VerticalRef | CursorType::VerticalDiff => (-h / 2.0, h / 2.0),
    }
}

#[async_trait]
impl Oscilloscope for Bk2555 {
    fn channels(&self) -> &'static [u8] {
        CHANNELS
    }

    fn nhdivs(&self) -> u32 {
        NHDIVS
    }

    async fn idn(&mut self) -> Result<String> {
        Bk2555::idn(self).await
    }

    async fn show_trace(&mut self, ich: u8) -> Result<()> {
        Bk2555::show_trace(self, ich).await
    }

    async fn hide_trace(&mut self, ich: u8) -> Result<()> {
        Bk2555::hide_trace(self, ich).await
    }

    async fn is_trace(&mut self, ich: u8) -> Result<bool> {
        Bk2555::is_trace(self, ich).await
    }

    async fn auto_setup(&mut self) -> Result<()> {
        Bk2555::auto_setup(self).await
    }

    async fn set_temporal_scale(&mut self, value: f64) -> Result<()> {
        Bk2555::set_temporal_scale(self, value).await
    }

    async fn temporal_scale(&mut self) -> Result<f64> {
        Bk2555::temporal_scale(self).await
    }

    async fn set_vertical_scale(&mut self, ich: u8, value: f64) -> Result<()> {
        Bk2555::set_vertical_scale(self, ich, value).await
    }

    async fn vertical_scale(&mut self, ich: u8) -> Result<f64> {
        Bk2555::vertical_scale(self, ich).await
    }

    async fn set_vertical_offset(&mut self, ich: u8, value: f64) -> Result<()> {
        Bk2555::set_vertical_offset(self, ich, value).await
    }

    async fn vertical_offset(&mut self, ich: u8) -> Result<f64> {
        Bk2555::vertical_offset(self, ich).await
    }

    async fn enable_bandwidth_filter(&mut self, ich: u8) -> Result<()> {
        Bk2555::enable_bandwidth_filter(self, ich).await
    }

    async fn disable_bandwidth_filter(&mut self, ich: u8) -> Result<()> {
        Bk2555::disable_bandwidth_filter(self, ich).await
    }

    async fn is_bandwidth_filter_enabled(&mut self, ich: u8) -> Result<bool> {
        Bk2555::is_bandwidth_filter_enabled(self, ich).await
    }

    async fn channel_attenuation(&mut self, ich: u8) -> Result<f64> {
        Bk2555::channel_attenuation(self, ich).await
    }

    async fn set_channel_attenuation(&mut self, ich: u8, value: f64) -> Result<()> {
        Bk2555::set_channel_attenuation(self, ich, value).await
    }

    async fn coupling_mode(&mut self, ich: u8) -> Result<String> {
        Ok(Bk2555::coupling_mode(self, ich).await?.to_string())
    }

    async fn set_coupling_mode(&mut self, ich: u8, mode: &str) -> Result<()> {
        Bk2555::set_coupling_mode(self, ich, mode.parse()?).await
    }

    async fn trigger_mode(&mut self) -> Result<String> {
        Ok(Bk2555::trigger_mode(self).await?.to_string())
    }

    async fn set_trigger_mode(&mut self, mode: &str) -> Result<()> {
        Bk2555::set_trigger_mode(self, mode.parse()?).await
    }

    async fn trigger_source(&mut self) -> Result<u8> {
        Bk2555::trigger_source(self).await
    }

    async fn set_trigger_source(&mut self, ich: u8) -> Result<()> {
        Bk2555::set_trigger_source(self, ich).await
    }

    async fn trigger_level(&mut self, ich: u8) -> Result<f64> {
        Bk2555::trigger_level(self, ich).await
    }

    async fn set_trigger_level(&mut self, ich: u8, value: f64) -> Result<()> {
        Bk2555::set_trigger_level(self, ich, value).await
    }

    async fn trigger_delay(&mut self) -> Result<f64> {
        Bk2555::trigger_delay(self).await
    }

    async fn set_trigger_delay(&mut self, value: f64) -> Result<()> {
        Bk2555::set_trigger_delay(self, value).await
    }

    async fn force_trigger(&mut self) -> Result<()> {
        Bk2555::force_trigger(self).await
    }

    async fn arm_acquisition(&mut self) -> Result<()> {
        Bk2555::arm_acquisition(self).await
    }

    async fn stop_acquisition(&mut self) -> Result<()> {
        Bk2555::stop_acquisition(self).await
    }

    async fn sample_rate(&mut self) -> Result<f64> {
        Bk2555::sample_rate(self).await
    }

    async fn waveform_data(&mut self, ich: u8) -> Result<Waveform> {
        Bk2555::waveform_data(self, ich).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        Bk2555::disconnect(self).await
    }
}
