//! Rigol DS1054Z four-channel digital oscilloscope.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{clamp_trigger_delay, clamp_vertical_scale, closest_timebase, timebase_ladder, Oscilloscope, Waveform};
use crate::error::VisaError;
use crate::resource::ResourceManager;
use crate::si::si_format;
use crate::transport::Transport;
use crate::visa::{check_channel, parse_f64, ModelInfo, VisaInstrument};

pub const MODEL: ModelInfo = ModelInfo {
    name: "RigolDS1054Z",
    id_pattern: r"DS1ZA\d+",
    prefix: ":",
    no_error: "0,\"No error\"",
    // Slow commands such as auto-setup need a long timeout.
    timeout: Some(Duration::from_secs(20)),
};

pub const CHANNELS: &[u8] = &[1, 2, 3, 4];
pub const NHDIVS: u32 = 12;
pub const NVDIVS: u32 = 8;
/// Max vertical scale (V/div).
pub const MAX_VDIV: f64 = 10.0;
/// Samples on screen, used when the memory depth is automatic.
pub const SAMPLES_ON_DISPLAY: usize = 1200;
/// Largest chunk read from internal memory in one request.
pub const MAX_BYTE_LEN: usize = 250_000;

const TIMEBASES: [f64; 3] = [1.0, 2.0, 5.0];

scpi_enum! {
    pub enum VerticalUnit {
        Volt => "VOLT",
        Watt => "WATT",
        Amp => "AMP",
        Unknown => "UNKN",
    }
}

scpi_enum! {
    pub enum Coupling {
        Ac => "AC",
        Dc => "DC",
        Ground => "GND",
    }
}

scpi_enum! {
    pub enum AcquisitionType {
        Normal => "NORM",
        Average => "AVER",
        Peak => "PEAK",
        HighResolution => "HRES",
    }
}

scpi_enum! {
    pub enum TriggerSweep {
        Auto => "AUTO",
        Normal => "NORM",
        Single => "SING",
    }
}

scpi_enum! {
    pub enum TriggerCoupling {
        Ac => "AC",
        Dc => "DC",
        LowFreqReject => "LFR",
        HighFreqReject => "HFR",
    }
}

scpi_enum! {
    pub enum TriggerType {
        Edge => "EDGE",
        Pulse => "PULS",
        Runt => "RUNT",
        Window => "WIND",
        NthEdge => "NEDG",
        Slope => "SLOP",
        Video => "VID",
        Pattern => "PATT",
        Delay => "DEL",
        Timeout => "TIM",
        Duration => "DUR",
        SetupHold => "SHOL",
        Rs232 => "RS232",
        I2c => "IIC",
        Spi => "SPI",
    }
}

scpi_enum! {
    pub enum TriggerSlope {
        Positive => "POS",
        Negative => "NEG",
        Either => "RFAL",
    }
}

scpi_enum! {
    pub enum ReadingMode {
        Normal => "NORM",
        Max => "MAX",
        Raw => "RAW",
    }
}

scpi_enum! {
    pub enum WaveformFormat {
        Word => "WORD",
        Byte => "BYTE",
        Ascii => "ASC",
    }
}

/// Decoded `WAV:PRE?` reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preamble {
    pub format: i64,
    pub kind: i64,
    pub points: usize,
    pub count: i64,
    pub xinc: f64,
    pub xorig: f64,
    pub xref: i64,
    pub yinc: f64,
    pub yorig: i64,
    pub yref: i64,
}

impl Preamble {
    pub fn parse(out: &str) -> Result<Self, VisaError> {
        let bad = || VisaError::Response {
            command: "WAV:PRE?".into(),
            response: out.to_string(),
        };
        let fields: Vec<&str> = out.split(',').map(str::trim).collect();
        if fields.len() != 10 {
            return Err(bad());
        }
        let int = |i: usize| -> Result<i64, VisaError> {
            let f = fields[i];
            f.parse::<i64>()
                .or_else(|_| f.parse::<f64>().map(|v| v as i64))
                .map_err(|_| bad())
        };
        let float = |i: usize| fields[i].parse::<f64>().map_err(|_| bad());
        Ok(Self {
            format: int(0)?,
            kind: int(1)?,
            points: usize::try_from(int(2)?).map_err(|_| bad())?,
            count: int(3)?,
            xinc: float(4)?,
            xorig: float(5)?,
            xref: int(6)?,
            yinc: float(7)?,
            yorig: int(8)?,
            yref: int(9)?,
        })
    }

    /// Convert raw bytes to volts and attach the time vector.
    pub fn scale(&self, raw: &[u8]) -> Waveform {
        let volts = raw
            .iter()
            .map(|&b| (f64::from(b) - self.yorig as f64 - self.yref as f64) * self.yinc)
            .collect();
        Waveform::from_samples(volts, self.xinc, self.xorig)
    }
}

pub struct RigolDs1054z {
    inst: VisaInstrument,
    timebases: Vec<f64>,
}

impl RigolDs1054z {
    pub async fn connect(rm: &ResourceManager) -> Result<Self> {
        Ok(Self::new(VisaInstrument::open(rm, MODEL).await?))
    }

    pub async fn with_transport(link: Box<dyn Transport>) -> Result<Self> {
        Ok(Self::new(VisaInstrument::from_transport(link, MODEL).await?))
    }

    fn new(inst: VisaInstrument) -> Self {
        // The two fastest settings of the ladder are not available.
        let timebases = timebase_ladder(&TIMEBASES).into_iter().skip(2).collect();
        Self { inst, timebases }
    }

    pub fn instrument(&mut self) -> &mut VisaInstrument {
        &mut self.inst
    }

    pub fn timebases(&self) -> &[f64] {
        &self.timebases
    }

    // --------------------- miscellaneous ---------------------

    pub async fn idn(&mut self) -> Result<String> {
        self.inst.idn().await
    }

    pub async fn wait(&mut self) -> Result<()> {
        self.inst.wait().await
    }

    pub async fn last_error(&mut self) -> Result<String> {
        self.inst.query("SYST:ERR?").await
    }

    pub async fn check_error(&mut self) -> Result<()> {
        self.inst.check_error("SYST:ERR?").await
    }

    pub async fn lock_front_panel(&mut self) -> Result<()> {
        self.inst.write("SYST:LOCK ON").await
    }

    pub async fn unlock_front_panel(&mut self) -> Result<()> {
        self.inst.write("SYST:LOCK OFF").await
    }

    pub async fn calibrate(&mut self) -> Result<()> {
        self.inst.write("CAL:STAR").await
    }

    pub async fn stop_calibration(&mut self) -> Result<()> {
        self.inst.write("CAL:QUIT").await
    }

    // --------------------- display ---------------------

    pub async fn show_trace(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("CHAN{ich}:DISP ON")).await
    }

    pub async fn hide_trace(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("CHAN{ich}:DISP OFF")).await
    }

    pub async fn is_trace(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_bool(&format!("CHAN{ich}:DISP?")).await
    }

    /// Screen capture as PNG bytes.
    pub async fn screen_image(&mut self) -> Result<Vec<u8>> {
        info!("receiving screen capture...");
        let img = self.inst.query_block("DISP:DATA? ON,OFF,PNG").await?;
        info!("read {} bytes of screen capture", img.len());
        Ok(img)
    }

    // --------------------- scales / offsets ---------------------

    pub async fn auto_setup(&mut self) -> Result<()> {
        info!("running scope auto-setup...");
        self.inst.write("AUT").await
    }

    pub async fn set_temporal_scale(&mut self, value: f64) -> Result<()> {
        let value = closest_timebase(&self.timebases, value);
        info!("setting time scale to {}s/div", si_format(value, 2));
        self.inst.write(&format!("TIM:MAIN:SCAL {value}")).await
    }

    pub async fn temporal_scale(&mut self) -> Result<f64> {
        self.inst.query_f64("TIM:MAIN:SCAL?").await
    }

    pub async fn temporal_range(&mut self) -> Result<f64> {
        Ok(self.temporal_scale().await? * f64::from(NHDIVS))
    }

    pub async fn set_vertical_scale(&mut self, ich: u8, value: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        let value = clamp_vertical_scale(value, MAX_VDIV);
        info!("setting channel {ich} vertical scale to {}V/div", si_format(value, 2));
        self.inst.write(&format!("CHAN{ich}:SCAL {value}")).await
    }

    pub async fn vertical_scale(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("CHAN{ich}:SCAL?")).await
    }

    pub async fn set_vertical_offset(&mut self, ich: u8, value: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("CHAN{ich}:OFFS {value}")).await
    }

    pub async fn vertical_offset(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("CHAN{ich}:OFFS?")).await
    }

    pub async fn vertical_unit(&mut self, ich: u8) -> Result<VerticalUnit> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("CHAN{ich}:UNIT?")).await?.parse()?)
    }

    pub async fn set_vertical_unit(&mut self, ich: u8, unit: VerticalUnit) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("CHAN{ich}:UNIT {unit}")).await
    }

    /// Toggle fine adjustment of the vertical scale.
    pub async fn set_vernier(&mut self, ich: u8, on: bool) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("CHAN{ich}:VERN {}", on_off(on))).await
    }

    pub async fn is_vernier_enabled(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_bool(&format!("CHAN{ich}:VERN?")).await
    }

    pub async fn set_inverted(&mut self, ich: u8, on: bool) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("CHAN{ich}:INV {}", on_off(on))).await
    }

    pub async fn is_inverted(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_bool(&format!("CHAN{ich}:INV?")).await
    }

    pub async fn vertical_range(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("CHAN{ich}:RANG?")).await
    }

    pub async fn set_vertical_range(&mut self, ich: u8, value: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("CHAN{ich}:RANG {value}")).await
    }

    // --------------------- filters ---------------------

    /// 20 MHz bandwidth limit.
    pub async fn enable_bandwidth_filter(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("CHAN{ich}:BWL 20M")).await
    }

    pub async fn disable_bandwidth_filter(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("CHAN{ich}:BWL OFF")).await
    }

    pub async fn is_bandwidth_filter_enabled(&mut self, ich: u8) -> Result<bool> {
        check_channel(ich, CHANNELS)?;
        let out = self.inst.query(&format!("CHAN{ich}:BWL?")).await?;
        Ok(!out.eq_ignore_ascii_case("OFF"))
    }

    // --------------------- attenuation & coupling ---------------------

    pub async fn channel_attenuation(&mut self, ich: u8) -> Result<f64> {
        check_channel(ich, CHANNELS)?;
        self.inst.query_f64(&format!("CHAN{ich}:PROB?")).await
    }

    pub async fn set_channel_attenuation(&mut self, ich: u8, value: f64) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("CHAN{ich}:PROB {value}")).await
    }

    pub async fn coupling_mode(&mut self, ich: u8) -> Result<Coupling> {
        check_channel(ich, CHANNELS)?;
        Ok(self.inst.query(&format!("CHAN{ich}:COUP?")).await?.parse()?)
    }

    pub async fn set_coupling_mode(&mut self, ich: u8, mode: Coupling) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("setting channel {ich} coupling mode to {mode}");
        self.inst.write(&format!("CHAN{ich}:COUP {mode}")).await
    }

    // --------------------- trigger ---------------------

    pub async fn trigger_mode(&mut self) -> Result<TriggerSweep> {
        Ok(self.inst.query("TRIG:SWE?").await?.parse()?)
    }

    pub async fn set_trigger_mode(&mut self, mode: TriggerSweep) -> Result<()> {
        self.inst.write(&format!("TRIG:SWE {mode}")).await
    }

    /// Point the trigger at `ich` if it listens elsewhere.
    async fn select_trigger_source(&mut self, ich: u8) -> Result<()> {
        if self.trigger_source().await? != ich {
            self.set_trigger_source(ich).await?;
        }
        Ok(())
    }

    pub async fn trigger_coupling_mode(&mut self, ich: u8) -> Result<TriggerCoupling> {
        self.select_trigger_source(ich).await?;
        Ok(self.inst.query("TRIG:COUP?").await?.parse()?)
    }

    pub async fn set_trigger_coupling_mode(&mut self, ich: u8, mode: TriggerCoupling) -> Result<()> {
        self.select_trigger_source(ich).await?;
        self.inst.write(&format!("TRIG:COUP {mode}")).await
    }

    pub async fn trigger_type(&mut self) -> Result<TriggerType> {
        Ok(self.inst.query("TRIG:MODE?").await?.parse()?)
    }

    pub async fn set_trigger_type(&mut self, ttype: TriggerType) -> Result<()> {
        self.inst.write(&format!("TRIG:MODE {ttype}")).await
    }

    /// Raw trigger status: `TD`, `WAIT`, `RUN`, `AUTO` or `STOP`.
    pub async fn trigger_status(&mut self) -> Result<String> {
        self.inst.query("TRIG:STAT?").await
    }

    pub async fn set_trigger_holdoff(&mut self, value: f64) -> Result<()> {
        self.inst.write(&format!("TRIG:HOLD {value}")).await
    }

    pub async fn trigger_holdoff(&mut self) -> Result<f64> {
        self.inst.query_f64("TRIG:HOLD?").await
    }

    pub async fn set_trigger_noise_rejection(&mut self, on: bool) -> Result<()> {
        self.inst.write(&format!("TRIG:NREJ {}", on_off(on))).await
    }

    pub async fn is_trigger_noise_rejected(&mut self) -> Result<bool> {
        self.inst.query_bool("TRIG:NREJ?").await
    }

    /// Position in internal memory of the trigger point.
    pub async fn trigger_position(&mut self) -> Result<i64> {
        match self.inst.query_i64("TRIG:POS?").await? {
            -2 => Err(VisaError::Instrument("instrument triggered outside internal memory".into()).into()),
            -1 => Err(VisaError::Instrument("instrument not triggered".into()).into()),
            pos => Ok(pos),
        }
    }

    pub async fn trigger_source(&mut self) -> Result<u8> {
        let ttype = self.trigger_type().await?;
        let out = self.inst.query(&format!("TRIG:{ttype}:SOUR?")).await?;
        channel_suffix(&out).ok_or_else(|| {
            VisaError::Response {
                command: format!("TRIG:{ttype}:SOUR?"),
                response: out,
            }
            .into()
        })
    }

    pub async fn set_trigger_source(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        info!("setting trigger source to channel {ich}");
        let ttype = self.trigger_type().await?;
        self.inst.write(&format!("TRIG:{ttype}:SOUR CHAN{ich}")).await
    }

    pub async fn trigger_slope(&mut self, ich: u8) -> Result<TriggerSlope> {
        self.select_trigger_source(ich).await?;
        let ttype = self.trigger_type().await?;
        Ok(self.inst.query(&format!("TRIG:{ttype}:SLOP?")).await?.parse()?)
    }

    pub async fn set_trigger_slope(&mut self, ich: u8, slope: TriggerSlope) -> Result<()> {
        self.select_trigger_source(ich).await?;
        let ttype = self.trigger_type().await?;
        info!("setting {ttype} trigger slope to {slope}");
        self.inst.write(&format!("TRIG:{ttype}:SLOP {slope}")).await
    }

    pub async fn trigger_level(&mut self, ich: u8) -> Result<f64> {
        self.select_trigger_source(ich).await?;
        let ttype = self.trigger_type().await?;
        self.inst.query_f64(&format!("TRIG:{ttype}:LEV?")).await
    }

    pub async fn set_trigger_level(&mut self, ich: u8, value: f64) -> Result<()> {
        self.select_trigger_source(ich).await?;
        let ttype = self.trigger_type().await?;
        self.inst.write(&format!("TRIG:{ttype}:LEV {value}")).await
    }

    pub async fn trigger_delay(&mut self) -> Result<f64> {
        self.inst.query_f64("TIM:MAIN:OFFS?").await
    }

    pub async fn set_trigger_delay(&mut self, value: f64) -> Result<()> {
        let half_range = self.temporal_range().await? / 2.0;
        let value = clamp_trigger_delay(value, half_range);
        info!("setting trigger time delay to {}s", si_format(value, 2));
        self.inst.write(&format!("TIM:MAIN:OFFS {value}")).await
    }

    pub async fn force_trigger(&mut self) -> Result<()> {
        self.inst.write("TFOR").await
    }

    // --------------------- acquisition ---------------------

    pub async fn arm_acquisition(&mut self) -> Result<()> {
        self.inst.write("RUN").await
    }

    pub async fn stop_acquisition(&mut self) -> Result<()> {
        self.inst.write("STOP").await
    }

    pub async fn nsweeps_per_acquisition(&mut self) -> Result<u32> {
        Ok(self.inst.query_i64("ACQ:AVER?").await? as u32)
    }

    /// Number of sweeps to average (a power of two up to 1024); 1 switches
    /// back to normal acquisition.
    pub async fn set_nsweeps_per_acquisition(&mut self, n: u32) -> Result<()> {
        if !n.is_power_of_two() || n > 1024 {
            return Err(VisaError::OutOfRange(format!(
                "not a valid number of sweeps: {n} (must be a power of 2 up to 1024)"
            ))
            .into());
        }
        if n == 1 {
            return self.set_acquisition_type(AcquisitionType::Normal).await;
        }
        self.set_acquisition_type(AcquisitionType::Average).await?;
        self.inst.write(&format!("ACQ:AVER {n}")).await
    }

    pub async fn sample_rate(&mut self) -> Result<f64> {
        Ok(self.inst.query_f64("ACQ:SRAT?").await?.trunc())
    }

    /// Memory depth in samples.
    pub async fn nsamples(&mut self) -> Result<usize> {
        let out = self.inst.query("ACQ:MDEP?").await?;
        if out.eq_ignore_ascii_case("AUTO") {
            warn!("auto memory depth enabled -> returning default value");
            return Ok(SAMPLES_ON_DISPLAY);
        }
        Ok(parse_f64(&out)? as usize)
    }

    pub async fn set_nsamples(&mut self, n: usize) -> Result<()> {
        self.inst.write(&format!("ACQ:MDEP {n}")).await
    }

    pub async fn acquisition_type(&mut self) -> Result<AcquisitionType> {
        Ok(self.inst.query("ACQ:TYPE?").await?.parse()?)
    }

    pub async fn set_acquisition_type(&mut self, atype: AcquisitionType) -> Result<()> {
        self.inst.write(&format!("ACQ:TYPE {atype}")).await
    }

    pub async fn enable_peak_detector(&mut self) -> Result<()> {
        self.set_acquisition_type(AcquisitionType::Peak).await
    }

    pub async fn disable_peak_detector(&mut self) -> Result<()> {
        self.set_acquisition_type(AcquisitionType::Normal).await
    }

    // --------------------- waveforms ---------------------

    pub async fn set_waveform_source(&mut self, ich: u8) -> Result<()> {
        check_channel(ich, CHANNELS)?;
        self.inst.write(&format!("WAV:SOUR CHAN{ich}")).await
    }

    pub async fn waveform_source(&mut self) -> Result<u8> {
        let out = self.inst.query("WAV:SOUR?").await?;
        channel_suffix(&out).ok_or_else(|| {
            VisaError::Response {
                command: "WAV:SOUR?".into(),
                response: out,
            }
            .into()
        })
    }

    pub async fn set_waveform_reading_mode(&mut self, mode: ReadingMode) -> Result<()> {
        self.inst.write(&format!("WAV:MODE {mode}")).await
    }

    pub async fn waveform_reading_mode(&mut self) -> Result<ReadingMode> {
        Ok(self.inst.query("WAV:MODE?").await?.parse()?)
    }

    pub async fn set_waveform_format(&mut self, format: WaveformFormat) -> Result<()> {
        self.inst.write(&format!("WAV:FORM {format}")).await
    }

    pub async fn waveform_format(&mut self) -> Result<WaveformFormat> {
        Ok(self.inst.query("WAV:FORM?").await?.parse()?)
    }

    pub async fn set_waveform_start(&mut self, pos: usize) -> Result<()> {
        self.inst.write(&format!("WAV:STAR {pos}")).await
    }

    pub async fn waveform_start(&mut self) -> Result<usize> {
        Ok(self.inst.query_i64("WAV:STAR?").await? as usize)
    }

    pub async fn set_waveform_stop(&mut self, pos: usize) -> Result<()> {
        self.inst.write(&format!("WAV:STOP {pos}")).await
    }

    pub async fn waveform_stop(&mut self) -> Result<usize> {
        Ok(self.inst.query_i64("WAV:STOP?").await? as usize)
    }

    pub async fn is_running(&mut self) -> Result<bool> {
        let status = self.trigger_status().await?;
        Ok(matches!(status.as_str(), "TD" | "WAIT" | "RUN" | "AUTO"))
    }

    pub async fn preamble(&mut self) -> Result<Preamble> {
        let out = self.inst.query("WAV:PRE?").await?;
        Ok(Preamble::parse(&out)?)
    }

    pub async fn raw_waveform_buffer(&mut self) -> Result<Vec<u8>> {
        self.inst.query_block("WAV:DATA?").await
    }

    /// Waveform bytes of channel `ich`.
    ///
    /// `Raw` reads the internal memory and stops the acquisition first;
    /// `Max` reads the internal memory only when stopped.
    pub async fn waveform_bytes(&mut self, ich: u8, mode: ReadingMode) -> Result<Vec<u8>> {
        self.set_waveform_source(ich).await?;
        self.set_waveform_reading_mode(mode).await?;
        self.set_waveform_format(WaveformFormat::Byte).await?;
        let from_screen = match mode {
            ReadingMode::Normal => true,
            ReadingMode::Max => self.is_running().await?,
            ReadingMode::Raw => false,
        };
        if from_screen {
            self.waveform_bytes_screen().await
        } else {
            self.waveform_bytes_internal().await
        }
    }

    async fn waveform_bytes_screen(&mut self) -> Result<Vec<u8>> {
        let buff = self.raw_waveform_buffer().await?;
        let points = self.preamble().await?.points;
        if buff.len() != points {
            return Err(VisaError::Instrument(format!(
                "number of points in waveform buffer ({}) does not match header information ({points})",
                buff.len()
            ))
            .into());
        }
        Ok(buff)
    }

    async fn waveform_bytes_internal(&mut self) -> Result<Vec<u8>> {
        if self.is_running().await? {
            self.stop_acquisition().await?;
        }
        let npts = self.preamble().await?.points;
        let mut buff = Vec::with_capacity(npts);
        let mut pos = 1;
        while buff.len() < npts {
            self.set_waveform_start(pos).await?;
            self.set_waveform_stop(npts.min(pos + MAX_BYTE_LEN - 1)).await?;
            let chunk = self.raw_waveform_buffer().await?;
            if chunk.is_empty() {
                return Err(VisaError::Instrument(format!(
                    "empty waveform chunk at position {pos}"
                ))
                .into());
            }
            buff.extend(chunk);
            pos += MAX_BYTE_LEN;
            info!("waveform acquisition: fetched {}/{npts} points from internal memory", buff.len());
        }
        Ok(buff)
    }

    pub async fn waveform_data_with_mode(&mut self, ich: u8, mode: ReadingMode) -> Result<Waveform> {
        check_channel(ich, CHANNELS)?;
        let buff = self.waveform_bytes(ich, mode).await?;
        let preamble = self.preamble().await?;
        Ok(preamble.scale(&buff))
    }

    pub async fn waveform_data(&mut self, ich: u8) -> Result<Waveform> {
        self.waveform_data_with_mode(ich, ReadingMode::Normal).await
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.inst.close().await
    }
}

fn on_off(on: bool) -> &'static str {
    if on { "ON" } else { "OFF" }
}

/// Trailing channel digit of replies such as `CHAN2`.
fn channel_suffix(out: &str) -> Option<u8> {
    out.trim()
        .chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .map(|d| d as u8)
}

#[async_trait]
impl Oscilloscope for RigolDs1054z {
    fn channels(&self) -> &'static [u8] {
        CHANNELS
    }

    fn nhdivs(&self) -> u32 {
        NHDIVS
    }

    async fn idn(&mut self) -> Result<String> {
        RigolDs1054z::idn(self).await
    }

    async fn show_trace(&mut self, ich: u8) -> Result<()> {
        RigolDs1054z::show_trace(self, ich).await
    }

    async fn hide_trace(&mut self, ich: u8) -> Result<()> {
        RigolDs1054z::hide_trace(self, ich).await
    }

    async fn is_trace(&mut self, ich: u8) -> Result<bool> {
        RigolDs1054z::is_trace(self, ich).await
    }

    async fn auto_setup(&mut self) -> Result<()> {
        RigolDs1054z::auto_setup(self).await
    }

    async fn set_temporal_scale(&mut self, value: f64) -> Result<()> {
        RigolDs1054z::set_temporal_scale(self, value).await
    }

    async fn temporal_scale(&mut self) -> Result<f64> {
        RigolDs1054z::temporal_scale(self).await
    }

    async fn set_vertical_scale(&mut self, ich: u8, value: f64) -> Result<()> {
        RigolDs1054z::set_vertical_scale(self, ich, value).await
    }

    async fn vertical_scale(&mut self, ich: u8) -> Result<f64> {
        RigolDs1054z::vertical_scale(self, ich).await
    }

    async fn set_vertical_offset(&mut self, ich: u8, value: f64) -> Result<()> {
        RigolDs1054z::set_vertical_offset(self, ich, value).await
    }

    async fn vertical_offset(&mut self, ich: u8) -> Result<f64> {
        RigolDs1054z::vertical_offset(self, ich).await
    }

    async fn enable_bandwidth_filter(&mut self, ich: u8) -> Result<()> {
        RigolDs1054z::enable_bandwidth_filter(self, ich).await
    }

    async fn disable_bandwidth_filter(&mut self, ich: u8) -> Result<()> {
        RigolDs1054z::disable_bandwidth_filter(self, ich).await
    }

    async fn is_bandwidth_filter_enabled(&mut self, ich: u8) -> Result<bool> {
        RigolDs1054z::is_bandwidth_filter_enabled(self, ich).await
    }

    async fn channel_attenuation(&mut self, ich: u8) -> Result<f64> {
        RigolDs1054z::channel_attenuation(self, ich).await
    }

    async fn set_channel_attenuation(&mut self, ich: u8, value: f64) -> Result<()> {
        RigolDs1054z::set_channel_attenuation(self, ich, value).await
    }

    async fn coupling_mode(&mut self, ich: u8) -> Result<String> {
        Ok(RigolDs1054z::coupling_mode(self, ich).await?.to_string())
    }

    async fn set_coupling_mode(&mut self, ich: u8, mode: &str) -> Result<()> {
        RigolDs1054z::set_coupling_mode(self, ich, mode.parse()?).await
    }

    async fn trigger_mode(&mut self) -> Result<String> {
        Ok(RigolDs1054z::trigger_mode(self).await?.to_string())
    }

    async fn set_trigger_mode(&mut self, mode: &str) -> Result<()> {
        RigolDs1054z::set_trigger_mode(self, mode.parse()?).await
    }

    async fn trigger_source(&mut self) -> Result<u8> {
        RigolDs1054z::trigger_source(self).await
    }

    async fn set_trigger_source(&mut self, ich: u8) -> Result<()> {
        RigolDs1054z::set_trigger_source(self, ich).await
    }

    async fn trigger_level(&mut self, ich: u8) -> Result<f64> {
        RigolDs1054z::trigger_level(self, ich).await
    }

    async fn set_trigger_level(&mut self, ich: u8, value: f64) -> Result<()> {
        RigolDs1054z::set_trigger_level(self, ich, value).await
    }

    async fn trigger_delay(&mut self) -> Result<f64> {
        RigolDs1054z::trigger_delay(self).await
    }

    async fn set_trigger_delay(&mut self, value: f64) -> Result<()> {
        RigolDs1054z::set_trigger_delay(self, value).await
    }

    async fn force_trigger(&mut self) -> Result<()> {
        RigolDs1054z::force_trigger(self).await
    }

    async fn arm_acquisition(&mut self) -> Result<()> {
        RigolDs1054z::arm_acquisition(self).await
    }

    async fn stop_acquisition(&mut self) -> Result<()> {
        RigolDs1054z::stop_acquisition(self).await
    }

    async fn sample_rate(&mut self) -> Result<f64> {
        RigolDs1054z::sample_rate(self).await
    }

    async fn waveform_data(&mut self, ich: u8) -> Result<Waveform> {
        RigolDs1054z::waveform_data(self, ich).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        RigolDs1054z::disconnect(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::visa::encode_ieee_block;

    async fn connected(mock: &MockTransport) -> RigolDs1054z {
        mock.reply("*IDN?", "RIGOL TECHNOLOGIES,DS1054Z,DS1ZA123456789,00.04.04\n");
        RigolDs1054z::with_transport(mock.boxed()).await.unwrap()
    }

    #[tokio::test]
    async fn boxed_scope_disconnect_closes_link() {
        let mock = MockTransport::new();
        let mut scope: Box<dyn Oscilloscope> = Box::new(connected(&mock).await);
        assert!(!mock.is_closed());
        scope.disconnect().await.unwrap();
        assert!(mock.is_closed());
    }

    fn block_reply(payload: &[u8]) -> Vec<u8> {
        let mut reply = encode_ieee_block(payload);
        reply.push(b'\n');
        reply
    }

    #[tokio::test]
    async fn connect_applies_long_timeout() {
        let mock = MockTransport::new();
        let scope = connected(&mock).await;
        assert_eq!(mock.writes(), vec!["*RST", "*CLS", "*IDN?"]);
        assert_eq!(scope.inst.timeout(), Duration::from_secs(20));
        assert!((scope.timebases()[0] - 5e-9).abs() < 1e-20);
    }

    #[tokio::test]
    async fn temporal_scale_snaps_to_ladder() {
        let mock = MockTransport::new();
        let mut scope = connected(&mock).await;
        scope.set_temporal_scale(3e-4).await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), ":TIM:MAIN:SCAL 0.0002");
    }

    #[tokio::test]
    async fn vertical_scale_is_clamped() {
        let mock = MockTransport::new();
        let mut scope = connected(&mock).await;
        scope.set_vertical_scale(2, 50.0).await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), ":CHAN2:SCAL 10");
        assert!(scope.set_vertical_scale(5, 1.0).await.is_err());
    }

    #[tokio::test]
    async fn trigger_level_selects_source_first() {
        let mock = MockTransport::new();
        let mut scope = connected(&mock).await;
        mock.reply(":TRIG:MODE?", "EDGE\n");
        mock.reply(":TRIG:EDGE:SOUR?", "CHAN1\n");
        let n0 = mock.writes().len();
        scope.set_trigger_level(2, 2.5).await.unwrap();
        let writes: Vec<String> = mock.writes().into_iter().skip(n0).collect();
        assert_eq!(
            writes,
            vec![
                ":TRIG:MODE?",
                ":TRIG:EDGE:SOUR?",
                ":TRIG:MODE?",
                ":TRIG:EDGE:SOUR CHAN2",
                ":TRIG:MODE?",
                ":TRIG:EDGE:LEV 2.5",
            ]
        );
    }

    #[tokio::test]
    async fn trigger_delay_is_restricted_to_window() {
        let mock = MockTransport::new();
        let mut scope = connected(&mock).await;
        mock.reply(":TIM:MAIN:SCAL?", "5.000000e-01\n");
        scope.set_trigger_delay(-10.0).await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), ":TIM:MAIN:OFFS -3");
        scope.set_trigger_delay(0.5).await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), ":TIM:MAIN:OFFS 0.5");
    }

    #[tokio::test]
    async fn trigger_position_flags() {
        let mock = MockTransport::new();
        let mut scope = connected(&mock).await;
        mock.reply_once(":TRIG:POS?", "-1\n");
        mock.reply_once(":TRIG:POS?", "1024\n");
        assert!(scope.trigger_position().await.is_err());
        assert_eq!(scope.trigger_position().await.unwrap(), 1024);
    }

    #[tokio::test]
    async fn averaging_switches_acquisition_type() {
        let mock = MockTransport::new();
        let mut scope = connected(&mock).await;
        scope.set_nsweeps_per_acquisition(1).await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), ":ACQ:TYPE NORM");
        scope.set_nsweeps_per_acquisition(64).await.unwrap();
        let writes = mock.writes();
        assert_eq!(&writes[writes.len() - 2..], [":ACQ:TYPE AVER", ":ACQ:AVER 64"]);
        assert!(scope.set_nsweeps_per_acquisition(3).await.is_err());
        assert!(scope.set_nsweeps_per_acquisition(2048).await.is_err());
    }

    #[tokio::test]
    async fn auto_memory_depth_falls_back_to_screen() {
        let mock = MockTransport::new();
        let mut scope = connected(&mock).await;
        mock.reply(":ACQ:MDEP?", "AUTO\n");
        assert_eq!(scope.nsamples().await.unwrap(), SAMPLES_ON_DISPLAY);
    }

    #[test]
    fn preamble_parsing() {
        let pre = Preamble::parse("0,0,1200,1,1.000000e-06,-6.000000e-04,0,4.000000e-02,0,127").unwrap();
        assert_eq!(pre.points, 1200);
        assert_eq!(pre.yref, 127);
        assert!(Preamble::parse("0,0,1200").is_err());
    }

    #[test]
    fn preamble_rejects_negative_points() {
        let reply = "0,0,-1200,1,1.000000e-06,-6.000000e-04,0,4.000000e-02,0,127";
        assert_eq!(
            Preamble::parse(reply).unwrap_err(),
            VisaError::Response {
                command: "WAV:PRE?".into(),
                response: reply.into(),
            }
        );
    }

    #[tokio::test]
    async fn screen_waveform_is_scaled() {
        let mock = MockTransport::new();
        let mut scope = connected(&mock).await;
        mock.reply(":WAV:PRE?", "0,0,4,1,1.0e-3,-2.0e-3,0,0.1,0,127\n");
        mock.reply(":WAV:DATA?", block_reply(&[127, 128, 137, 117]));
        let wf = scope.waveform_data(1).await.unwrap();
        let expected = [0.0, 0.1, 1.0, -1.0];
        for (v, e) in wf.volts.iter().zip(expected) {
            assert!((v - e).abs() < 1e-9);
        }
        assert!((wf.time[0] + 2e-3).abs() < 1e-12);
        assert!((wf.time[3] - 1e-3).abs() < 1e-12);
        assert!(mock.writes().contains(&":WAV:FORM BYTE".to_string()));
    }

    #[tokio::test]
    async fn screen_waveform_size_must_match_preamble() {
        let mock = MockTransport::new();
        let mut scope = connected(&mock).await;
        mock.reply(":WAV:PRE?", "0,0,5,1,1.0e-3,0,0,0.1,0,127\n");
        mock.reply(":WAV:DATA?", block_reply(&[1, 2, 3, 4]));
        assert!(scope.waveform_data(1).await.is_err());
    }

    #[tokio::test]
    async fn raw_waveform_is_read_in_chunks() {
        let mock = MockTransport::new();
        let mut scope = connected(&mock).await;
        mock.reply(":TRIG:STAT?", "RUN\n");
        mock.reply(":WAV:PRE?", "0,2,300000,1,1.0e-6,0,0,0.1,0,127\n");
        mock.reply_once(":WAV:DATA?", block_reply(&vec![127; MAX_BYTE_LEN]));
        mock.reply_once(":WAV:DATA?", block_reply(&vec![127; 50_000]));
        let wf = scope
            .waveform_data_with_mode(1, ReadingMode::Raw)
            .await
            .unwrap();
        assert_eq!(wf.len(), 300_000);
        let writes = mock.writes();
        assert!(writes.contains(&":STOP".to_string()));
        assert!(writes.contains(&":WAV:STOP 250000".to_string()));
        assert!(writes.contains(&":WAV:STAR 250001".to_string()));
        assert!(writes.contains(&":WAV:STOP 300000".to_string()));
    }

    #[tokio::test]
    async fn restrict_traces_hides_visible_channels() {
        let mock = MockTransport::new();
        let scope = connected(&mock).await;
        mock.reply(":CHAN2:DISP?", "1\n");
        mock.reply(":CHAN3:DISP?", "0\n");
        mock.reply(":CHAN4:DISP?", "1\n");
        let mut scope: Box<dyn Oscilloscope> = Box::new(scope);
        scope.restrict_traces(&[1]).await.unwrap();
        let writes = mock.writes();
        assert!(writes.contains(&":CHAN1:DISP ON".to_string()));
        assert!(writes.contains(&":CHAN2:DISP OFF".to_string()));
        assert!(!writes.contains(&":CHAN3:DISP OFF".to_string()));
        assert!(writes.contains(&":CHAN4:DISP OFF".to_string()));
    }

    #[tokio::test]
    async fn trait_modes_are_validated() {
        let mock = MockTransport::new();
        let scope = connected(&mock).await;
        let mut scope: Box<dyn Oscilloscope> = Box::new(scope);
        scope.set_coupling_mode(1, "dc").await.unwrap();
        assert_eq!(mock.writes().last().unwrap(), ":CHAN1:COUP DC");
        assert!(scope.set_coupling_mode(1, "D1M").await.is_err());
    }
}
