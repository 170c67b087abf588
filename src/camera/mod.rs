//! FLIR (Point Grey) cameras driven through the FlyCapture2 SDK.
//!
//! SDK calls are blocking, so [`Camera`] is synchronous; async callers
//! should run long acquisitions on `tokio::task::spawn_blocking`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use crate::error::CameraError;

#[cfg(feature = "flycapture")]
pub mod flycapture;
#[cfg(test)]
pub(crate) mod mock;

/// Software trigger register.
pub const SOFTWARE_TRIGGER: u32 = 0x62C;
pub const FIRE_VAL: u32 = 0x8000_0000;
/// Trigger inquiry register.
pub const TRIGGER_INQ: u32 = 0x530;
pub const CAMERA_POWER: u32 = 0x610;
pub const POWER_VAL: u32 = 0x8000_0000;
/// H.264 bitrate (kb/s) above which frames get dropped.
pub const CRITICAL_BITRATE: u32 = 100;
pub const DEFAULT_BITRATE: u32 = 80;
pub const DEFAULT_JPEG_QUALITY: u32 = 75;
/// Shutter time relative to the frame interval set at connection.
pub const SHUTTER_TO_FRAME_INTERVAL_RATIO: f64 = 0.9;
/// Grab timeout during acquisitions, i.e. how often capture status is checked.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Reads of the software trigger register before giving up.
pub const SOFTWARE_TRIGGER_POLLS: usize = 10_000;
const CELSIUS_TO_KELVIN: f64 = 273.15;

/// Trigger modes of the IIDC standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// One shutter-long exposure per trigger.
    Standard,
    /// Exposure lasts the trigger width.
    Bulb,
    /// Standard, transmitting 1 out of N frames.
    SkipFrames,
    MultiExposurePreset,
    MultiExposureWidth,
    /// Standard, preceded by a fast CCD dump.
    LowSmear,
    OverlappedExposure,
    /// Stream of N shutter-long frames per trigger.
    MultiShot,
}

impl TriggerMode {
    pub fn code(self) -> u32 {
        match self {
            TriggerMode::Standard => 0,
            TriggerMode::Bulb => 1,
            TriggerMode::SkipFrames => 3,
            TriggerMode::MultiExposurePreset => 4,
            TriggerMode::MultiExposureWidth => 5,
            TriggerMode::LowSmear => 13,
            TriggerMode::OverlappedExposure => 14,
            TriggerMode::MultiShot => 15,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, CameraError> {
        [
            TriggerMode::Standard,
            TriggerMode::Bulb,
            TriggerMode::SkipFrames,
            TriggerMode::MultiExposurePreset,
            TriggerMode::MultiExposureWidth,
            TriggerMode::LowSmear,
            TriggerMode::OverlappedExposure,
            TriggerMode::MultiShot,
        ]
        .into_iter()
        .find(|m| m.code() == code)
        .ok_or_else(|| CameraError::InvalidSetting(format!("unknown trigger mode {code}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// GPIO 2 pin.
    External,
    Software,
}

impl TriggerSource {
    pub fn code(self) -> u32 {
        match self {
            TriggerSource::External => 2,
            TriggerSource::Software => 7,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, CameraError> {
        match code {
            2 => Ok(TriggerSource::External),
            7 => Ok(TriggerSource::Software),
            _ => Err(CameraError::InvalidSetting(format!("unknown trigger source {code}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoFormat {
    Avi,
    Mjpg,
    #[default]
    H264,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrabMode {
    DropFrames,
    BufferFrames,
    #[default]
    Unspecified,
}

impl GrabMode {
    pub fn code(self) -> u32 {
        match self {
            GrabMode::DropFrames => 0,
            GrabMode::BufferFrames => 1,
            GrabMode::Unspecified => 2,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => GrabMode::DropFrames,
            1 => GrabMode::BufferFrames,
            _ => GrabMode::Unspecified,
        }
    }
}

/// Camera properties read and written as absolute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    AutoExposure,
    /// ms.
    Shutter,
    /// fps.
    FrameRate,
    /// Raw register units (1/100 K).
    Temperature,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraInfo {
    pub serial_number: u32,
    pub model_name: String,
    pub vendor_name: String,
    pub sensor_info: String,
    pub sensor_resolution: String,
    pub firmware_version: String,
    pub firmware_build_time: String,
}

/// Capture configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraConfig {
    pub num_buffers: u32,
    pub num_image_notifications: u32,
    pub min_num_image_notifications: u32,
    /// ms, negative for no timeout.
    pub grab_timeout: i32,
    pub grab_mode: GrabMode,
    pub isoch_bus_speed: u32,
    pub async_bus_speed: u32,
    pub bandwidth_allocation: u32,
    pub register_timeout_retries: u32,
    pub register_timeout: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSettings {
    pub on_off: bool,
    pub mode: u32,
    /// Frames per trigger in multi-shot mode, 0 for unlimited.
    pub parameter: u32,
    pub polarity: u32,
    pub source: u32,
}

impl std::fmt::Display for TriggerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = TriggerMode::from_code(self.mode)
            .map_or_else(|_| self.mode.to_string(), |m| format!("{m:?}"));
        let source = TriggerSource::from_code(self.source)
            .map_or_else(|_| self.source.to_string(), |s| format!("{s:?}"));
        writeln!(f, "*** TRIGGER SETTINGS ***")?;
        writeln!(f, "   - mode: {mode}")?;
        writeln!(f, "   - onOff: {}", self.on_off)?;
        writeln!(f, "   - parameter: {}", self.parameter)?;
        writeln!(f, "   - polarity: {}", self.polarity)?;
        write!(f, "   - source: {source}")
    }
}

/// Image retrieved from the camera buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub rows: u32,
    pub cols: u32,
    pub stride: u32,
    pub pixel_format: u32,
    pub bayer_format: u32,
    pub data: Vec<u8>,
}

/// Parameters of a video file stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoSettings {
    pub format: VideoFormat,
    pub fps: f64,
    pub cols: u32,
    pub rows: u32,
    /// H.264 only (kb/s).
    pub bitrate: u32,
    /// MJPG only (1-100).
    pub jpeg_quality: u32,
}

/// User-facing video options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoOptions {
    pub format: VideoFormat,
    pub bitrate: u32,
    pub jpeg_quality: u32,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            format: VideoFormat::H264,
            bitrate: DEFAULT_BITRATE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// An open video file.
pub trait VideoStream: Send {
    fn append(&mut self, frame: &Frame) -> Result<(), CameraError>;

    fn close(&mut self) -> Result<(), CameraError>;
}

/// Blocking access to a camera SDK.
pub trait CameraBackend: Send {
    fn camera_count(&mut self) -> Result<u32, CameraError>;

    fn connect(&mut self, index: u32) -> Result<(), CameraError>;

    fn disconnect(&mut self) -> Result<(), CameraError>;

    fn info(&mut self) -> Result<CameraInfo, CameraError>;

    fn read_register(&mut self, address: u32) -> Result<u32, CameraError>;

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), CameraError>;

    fn property(&mut self, property: Property) -> Result<f64, CameraError>;

    fn set_property(&mut self, property: Property, value: f64) -> Result<(), CameraError>;

    fn trigger_mode(&mut self) -> Result<TriggerSettings, CameraError>;

    fn set_trigger_mode(&mut self, settings: &TriggerSettings) -> Result<(), CameraError>;

    fn configuration(&mut self) -> Result<CameraConfig, CameraError>;

    fn set_configuration(&mut self, config: &CameraConfig) -> Result<(), CameraError>;

    fn start_capture(&mut self) -> Result<(), CameraError>;

    fn stop_capture(&mut self) -> Result<(), CameraError>;

    /// Next frame; fails with [`CameraError::Timeout`] when none arrived
    /// within the grab timeout.
    fn retrieve_frame(&mut self) -> Result<Frame, CameraError>;

    fn open_video(&mut self, path: &Path, settings: &VideoSettings) -> Result<Box<dyn VideoStream>, CameraError>;
}

impl<B: CameraBackend + ?Sized> CameraBackend for Box<B> {
    fn camera_count(&mut self) -> Result<u32, CameraError> {
        (**self).camera_count()
    }

    fn connect(&mut self, index: u32) -> Result<(), CameraError> {
        (**self).connect(index)
    }

    fn disconnect(&mut self) -> Result<(), CameraError> {
        (**self).disconnect()
    }

    fn info(&mut self) -> Result<CameraInfo, CameraError> {
        (**self).info()
    }

    fn read_register(&mut self, address: u32) -> Result<u32, CameraError> {
        (**self).read_register(address)
    }

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), CameraError> {
        (**self).write_register(address, value)
    }

    fn property(&mut self, property: Property) -> Result<f64, CameraError> {
        (**self).property(property)
    }

    fn set_property(&mut self, property: Property, value: f64) -> Result<(), CameraError> {
        (**self).set_property(property, value)
    }

    fn trigger_mode(&mut self) -> Result<TriggerSettings, CameraError> {
        (**self).trigger_mode()
    }

    fn set_trigger_mode(&mut self, settings: &TriggerSettings) -> Result<(), CameraError> {
        (**self).set_trigger_mode(settings)
    }

    fn configuration(&mut self) -> Result<CameraConfig, CameraError> {
        (**self).configuration()
    }

    fn set_configuration(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
        (**self).set_configuration(config)
    }

    fn start_capture(&mut self) -> Result<(), CameraError> {
        (**self).start_capture()
    }

    fn stop_capture(&mut self) -> Result<(), CameraError> {
        (**self).stop_capture()
    }

    fn retrieve_frame(&mut self) -> Result<Frame, CameraError> {
        (**self).retrieve_frame()
    }

    fn open_video(&mut self, path: &Path, settings: &VideoSettings) -> Result<Box<dyn VideoStream>, CameraError> {
        (**self).open_video(path, settings)
    }
}

/// SDK backend compiled into this build.
pub fn default_backend() -> Result<Box<dyn CameraBackend>, CameraError> {
    #[cfg(feature = "flycapture")]
    {
        Ok(Box::new(flycapture::FlyCaptureBackend::new()?))
    }
    #[cfg(not(feature = "flycapture"))]
    {
        Err(CameraError::BackendUnavailable)
    }
}

/// `root_00001.ext`, `root_00002.ext`... for several acquisitions, `path`
/// itself for a single one.
pub fn acquisition_file_names(path: &Path, nacqs: usize) -> Vec<PathBuf> {
    if nacqs <= 1 {
        return vec![path.to_path_buf()];
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..=nacqs)
        .map(|i| path.with_file_name(format!("{stem}_{i:05}{ext}")))
        .collect()
}

/// Camera identity and current acquisition parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub info: CameraInfo,
    pub ncols: u32,
    pub nrows: u32,
    pub fps: f64,
}

impl std::fmt::Display for CameraSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "*** CAMERA SETTINGS ***")?;
        writeln!(f, "   - Serial number: {}", self.info.serial_number)?;
        writeln!(f, "   - Camera model: {}", self.info.model_name)?;
        writeln!(f, "   - Camera vendor: {}", self.info.vendor_name)?;
        writeln!(f, "   - Sensor: {}", self.info.sensor_info)?;
        writeln!(f, "   - Resolution: {}", self.info.sensor_resolution)?;
        writeln!(f, "   - Firmware version: {}", self.info.firmware_version)?;
        writeln!(f, "   - Firmware build time: {}", self.info.firmware_build_time)?;
        writeln!(f, "   - Frame dimensions: {} x {}", self.ncols, self.nrows)?;
        write!(f, "   - Frame rate: {} FPS", self.fps)
    }
}

pub struct Camera<B = Box<dyn CameraBackend>> {
    backend: B,
    is_capturing: bool,
    video: Option<(Box<dyn VideoStream>, PathBuf)>,
    ncols: u32,
    nrows: u32,
}

impl Camera {
    /// Connect to the first camera seen by the compiled-in SDK.
    pub fn grab() -> Result<Self> {
        Camera::connect(default_backend()?, 0)
    }
}

impl<B: CameraBackend> Camera<B> {
    /// Connect to camera `index`, read the frame size and set the shutter
    /// slightly below the frame interval.
    pub fn connect(mut backend: B, index: u32) -> Result<Self> {
        if backend.camera_count()? == 0 {
            return Err(CameraError::NotDetected)
                .context("make sure your camera is connected via a USB3 port");
        }
        info!("connecting to camera {index} ...");
        backend.connect(index)?;
        let mut cam = Self {
            backend,
            is_capturing: false,
            video: None,
            ncols: 0,
            nrows: 0,
        };
        cam.read_frame_dimensions()?;
        let fps = cam.framerate()?;
        cam.set_shutter(SHUTTER_TO_FRAME_INTERVAL_RATIO / fps * 1e3)?;
        info!("{}", cam.settings()?);
        Ok(cam)
    }

    pub fn disconnect(&mut self) -> Result<()> {
        info!("disconnecting from camera");
        if self.is_capturing {
            self.stop_capture(false)?;
        }
        Ok(self.backend.disconnect()?)
    }

    pub fn backend(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn is_capturing(&self) -> bool {
        self.is_capturing
    }

    /// (columns, rows) in pixels.
    pub fn frame_dimensions(&self) -> (u32, u32) {
        (self.ncols, self.nrows)
    }

    pub fn settings(&mut self) -> Result<CameraSettings> {
        Ok(CameraSettings {
            info: self.backend.info()?,
            ncols: self.ncols,
            nrows: self.nrows,
            fps: self.framerate()?,
        })
    }

    pub fn config(&mut self) -> Result<CameraConfig> {
        Ok(self.backend.configuration()?)
    }

    fn update_config(&mut self, update: impl FnOnce(&mut CameraConfig)) -> Result<()> {
        let mut config = self.backend.configuration()?;
        update(&mut config);
        Ok(self.backend.set_configuration(&config)?)
    }

    pub fn grab_mode(&mut self) -> Result<GrabMode> {
        Ok(self.config()?.grab_mode)
    }

    pub fn set_grab_mode(&mut self, mode: GrabMode) -> Result<()> {
        self.update_config(|c| c.grab_mode = mode)
    }

    /// `None` when grabs wait indefinitely.
    pub fn grab_timeout(&mut self) -> Result<Option<Duration>> {
        let ms = self.config()?.grab_timeout;
        Ok(u64::try_from(ms).ok().map(Duration::from_millis))
    }

    pub fn set_grab_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let ms = match timeout {
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };
        self.update_config(|c| c.grab_timeout = ms)
    }

    pub fn framerate(&mut self) -> Result<f64> {
        Ok(self.backend.property(Property::FrameRate)?)
    }

    pub fn set_framerate(&mut self, _fps: f64) -> Result<()> {
        Err(CameraError::InvalidSetting("acquisition frame rate cannot be set at the moment".into()).into())
    }

    /// Shutter exposure time (ms).
    pub fn shutter(&mut self) -> Result<f64> {
        Ok(self.backend.property(Property::Shutter)?)
    }

    /// Set the shutter exposure time (ms), which must fit in a frame interval.
    pub fn set_shutter(&mut self, shutter: f64) -> Result<()> {
        let interval = 1e3 / self.framerate()?;
        if shutter > interval {
            return Err(CameraError::InvalidSetting(format!(
                "target shutter time ({shutter:.2} ms) exceeds inter-frame interval ({interval:.2} ms)"
            ))
            .into());
        }
        info!("setting shutter time to {shutter:.2} ms ...");
        self.backend.set_property(Property::Shutter, shutter)?;
        let s = self.shutter()?;
        info!("shutter time set to {s:.2} ms");
        Ok(())
    }

    /// Automatically adjusted exposure value.
    pub fn exposure(&mut self) -> Result<f64> {
        Ok(self.backend.property(Property::AutoExposure)?)
    }

    /// Sensor temperature (degrees Celsius).
    pub fn temperature(&mut self) -> Result<f64> {
        Ok(self.backend.property(Property::Temperature)? * 100.0 - CELSIUS_TO_KELVIN)
    }

    fn read_frame_dimensions(&mut self) -> Result<()> {
        info!("getting frames dimensions...");
        self.disable_trigger(false)?;
        self.start_capture(false)?;
        let frame = self.grab_frame(false)?;
        self.stop_capture(false)?;
        let frame = frame.ok_or_else(|| CameraError::Sdk("no frame received while probing dimensions".into()))?;
        self.ncols = frame.cols;
        self.nrows = frame.rows;
        Ok(())
    }

    /// Wake the camera, checking the power register up to `nretries` times.
    pub fn power_up(&mut self, nretries: usize, sleep: Duration) -> Result<()> {
        self.backend.write_register(CAMERA_POWER, POWER_VAL)?;
        for _ in 0..nretries {
            std::thread::sleep(sleep);
            // Register reads may fail while the camera powers up.
            if let Ok(POWER_VAL) = self.backend.read_register(CAMERA_POWER) {
                return Ok(());
            }
        }
        Err(CameraError::Sdk("could not wake camera".into()).into())
    }

    pub fn start_capture(&mut self, verbose: bool) -> Result<()> {
        if verbose {
            info!("starting capture");
        }
        self.backend.start_capture()?;
        self.is_capturing = true;
        Ok(())
    }

    /// Stop capturing; a video file still being written is deleted.
    pub fn stop_capture(&mut self, verbose: bool) -> Result<()> {
        if verbose {
            info!("stopping capture");
        }
        self.backend.stop_capture()?;
        self.is_capturing = false;
        if let Some((mut stream, path)) = self.video.take() {
            info!("closing video stream");
            stream.close()?;
            if path.is_file() {
                info!("deleting incomplete video file {}", path.display());
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to delete {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Next frame, or `None` when not capturing. Timeouts are retried;
    /// any other failure stops the capture.
    pub fn grab_frame(&mut self, verbose: bool) -> Result<Option<Frame>> {
        while self.is_capturing {
            match self.backend.retrieve_frame() {
                Ok(frame) => return Ok(Some(frame)),
                Err(CameraError::Timeout) => {
                    if verbose {
                        info!("camera timed out, re-trying to capture frame ...");
                    }
                }
                Err(e) => {
                    self.stop_capture(true)?;
                    return Err(e.into());
                }
            }
        }
        Ok(None)
    }

    pub fn check_software_trigger_presence(&mut self) -> Result<()> {
        if self.backend.read_register(TRIGGER_INQ)? & 0x10000 != 0x10000 {
            return Err(CameraError::InvalidSetting(
                "SOFT_ASYNC_TRIGGER is not implemented on this camera".into(),
            )
            .into());
        }
        Ok(())
    }

    pub fn trigger_settings(&mut self) -> Result<TriggerSettings> {
        Ok(self.backend.trigger_mode()?)
    }

    /// Arm (`trigger`) or disarm the trigger. Armed, the camera takes
    /// `nframes` frames per trigger (0 for unlimited).
    pub fn set_trigger_settings(
        &mut self,
        trigger: bool,
        nframes: u32,
        mode: TriggerMode,
        source: TriggerSource,
        verbose: bool,
    ) -> Result<()> {
        let mut settings = self.backend.trigger_mode()?;
        settings.on_off = trigger;
        if trigger {
            settings.mode = mode.code();
            settings.parameter = nframes;
            if source == TriggerSource::Software {
                self.check_software_trigger_presence()?;
            }
            settings.source = source.code();
        }
        self.backend.set_trigger_mode(&settings)?;
        if verbose {
            info!("{}", self.trigger_settings()?);
        }
        if trigger && source == TriggerSource::Software {
            self.poll_for_software_trigger()?;
        }
        Ok(())
    }

    /// Multi-shot trigger for `nframes` frames from `source`.
    pub fn wait_for_trigger(&mut self, nframes: u32, source: TriggerSource) -> Result<()> {
        self.set_trigger_settings(true, nframes, TriggerMode::MultiShot, source, true)
    }

    pub fn disable_trigger(&mut self, verbose: bool) -> Result<()> {
        self.set_trigger_settings(false, 0, TriggerMode::MultiShot, TriggerSource::Software, verbose)
    }

    fn poll_for_software_trigger(&mut self) -> Result<()> {
        for _ in 0..SOFTWARE_TRIGGER_POLLS {
            if self.backend.read_register(SOFTWARE_TRIGGER)? == 0 {
                info!("camera is ready for software trigger.");
                return Ok(());
            }
        }
        Err(CameraError::Timeout).context("camera never became ready for software trigger")
    }

    pub fn fire_software_trigger(&mut self) -> Result<()> {
        Ok(self.backend.write_register(SOFTWARE_TRIGGER, FIRE_VAL)?)
    }

    pub fn open_video_stream(&mut self, path: &Path, options: &VideoOptions) -> Result<Box<dyn VideoStream>> {
        if options.format == VideoFormat::H264 && options.bitrate > CRITICAL_BITRATE {
            return Err(CameraError::InvalidSetting(format!(
                "specified H.264 encoding bitrate ({} kb/s) will likely induce some frame loss",
                options.bitrate
            ))
            .into());
        }
        let settings = VideoSettings {
            format: options.format,
            fps: self.framerate()?,
            cols: self.ncols,
            rows: self.nrows,
            bitrate: options.bitrate,
            jpeg_quality: options.jpeg_quality,
        };
        Ok(self.backend.open_video(path, &settings)?)
    }

    /// Stream `nframes` grabbed frames to `path`.
    pub fn save_video(&mut self, path: &Path, nframes: usize, options: &VideoOptions, verbose: bool) -> Result<()> {
        let stream = self.open_video_stream(path, options)?;
        self.video = Some((stream, path.to_path_buf()));
        info!("saving {nframes} frames to {} ...", path.display());
        let mut ngrabbed = 0;
        let mut tstart = None;
        while ngrabbed < nframes {
            match self.grab_frame(verbose) {
                Ok(frame) => {
                    if let (Some(frame), Some((stream, _))) = (frame, self.video.as_mut()) {
                        stream.append(&frame)?;
                    }
                    tstart.get_or_insert_with(Instant::now);
                    ngrabbed += 1;
                    debug!("{ngrabbed}/{nframes} frames");
                }
                Err(e) => error!("error retrieving buffer: {e:#}"),
            }
        }
        if let Some(t) = tstart {
            info!("acquisition time: {:.2} s", t.elapsed().as_secs_f64());
        }
        if let Some((mut stream, _)) = self.video.take() {
            stream.close()?;
        }
        Ok(())
    }

    /// Record `nacqs` videos of `duration` each, one per trigger.
    pub fn acquire(
        &mut self,
        path: &Path,
        duration: Duration,
        nacqs: usize,
        source: TriggerSource,
        options: &VideoOptions,
        verbose: bool,
    ) -> Result<Vec<PathBuf>> {
        let fnames = acquisition_file_names(path, nacqs);
        let nframes = (duration.as_secs_f64() * self.framerate()?).ceil() as usize;
        info!("number of frames per acquisition: {nframes}");
        self.set_grab_timeout(Some(CHECK_INTERVAL))?;
        self.set_grab_mode(GrabMode::BufferFrames)?;
        let nframes_trigger = u32::try_from(nframes)
            .map_err(|_| CameraError::InvalidSetting(format!("too many frames per acquisition: {nframes}")))?;
        self.wait_for_trigger(nframes_trigger, source)?;
        for (i, fname) in fnames.iter().enumerate() {
            self.start_capture(verbose)?;
            if source == TriggerSource::Software {
                self.fire_software_trigger()?;
            }
            info!("starting acquisition {}/{nacqs}", i + 1);
            self.save_video(fname, nframes, options, verbose)?;
            self.stop_capture(verbose)?;
        }
        Ok(fnames)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockCamera;
    use super::*;

    fn connected() -> (Camera<MockCamera>, MockCamera) {
        let mock = MockCamera::new(30.0, 640, 480);
        let cam = Camera::connect(mock.clone(), 0).unwrap();
        (cam, mock)
    }

    #[test]
    fn connect_reads_dimensions_and_sets_shutter() {
        let (mut cam, mock) = connected();
        assert_eq!(cam.frame_dimensions(), (640, 480));
        assert!((cam.shutter().unwrap() - 30.0).abs() < 1e-9);
        assert!(!cam.is_capturing());
        assert!(!mock.state().trigger.on_off);
        let text = cam.settings().unwrap().to_string();
        assert!(text.contains("Frame dimensions: 640 x 480"));
    }

    #[test]
    fn no_camera_is_reported() {
        let mock = MockCamera::new(30.0, 640, 480);
        mock.state().ncameras = 0;
        let err = Camera::connect(mock, 0).err().unwrap();
        assert!(crate::error::is_instrument_error(&err));
    }

    #[test]
    fn shutter_must_fit_in_frame_interval() {
        let (mut cam, _mock) = connected();
        assert!(cam.set_shutter(40.0).is_err());
        cam.set_shutter(10.0).unwrap();
        assert_eq!(cam.shutter().unwrap(), 10.0);
        assert!(cam.set_framerate(60.0).is_err());
    }

    #[test]
    fn temperature_is_converted_to_celsius() {
        let (mut cam, mock) = connected();
        mock.state().temperature = 3.0;
        assert!((cam.temperature().unwrap() - 26.85).abs() < 1e-9);
    }

    #[test]
    fn grab_timeout_round_trips_through_config() {
        let (mut cam, _mock) = connected();
        cam.set_grab_timeout(None).unwrap();
        assert_eq!(cam.config().unwrap().grab_timeout, -1);
        assert_eq!(cam.grab_timeout().unwrap(), None);
        cam.set_grab_timeout(Some(Duration::from_millis(1500))).unwrap();
        assert_eq!(cam.grab_timeout().unwrap(), Some(Duration::from_millis(1500)));
        cam.set_grab_mode(GrabMode::BufferFrames).unwrap();
        assert_eq!(cam.grab_mode().unwrap(), GrabMode::BufferFrames);
    }

    #[test]
    fn power_up_retries_until_register_is_set() {
        let (mut cam, mock) = connected();
        mock.state().power_reads_before_awake = 3;
        cam.power_up(5, Duration::from_millis(1)).unwrap();
        mock.state().power_reads_before_awake = 10;
        assert!(cam.power_up(2, Duration::from_millis(1)).is_err());
    }

    #[test]
    fn grab_retries_timeouts_and_stops_on_errors() {
        let (mut cam, mock) = connected();
        assert_eq!(cam.grab_frame(false).unwrap(), None);
        cam.start_capture(false).unwrap();
        mock.state().pending_errors.extend([CameraError::Timeout, CameraError::Timeout]);
        assert!(cam.grab_frame(true).unwrap().is_some());
        mock.state().pending_errors.push_back(CameraError::Sdk("bus reset".into()));
        assert!(cam.grab_frame(false).is_err());
        assert!(!cam.is_capturing());
    }

    #[test]
    fn software_trigger_requires_support() {
        let (mut cam, mock) = connected();
        mock.state().registers.insert(TRIGGER_INQ, 0);
        assert!(cam.wait_for_trigger(10, TriggerSource::Software).is_err());
        cam.wait_for_trigger(10, TriggerSource::External).unwrap();
        let settings = cam.trigger_settings().unwrap();
        assert!(settings.on_off);
        assert_eq!(settings.mode, TriggerMode::MultiShot.code());
        assert_eq!(settings.parameter, 10);
        assert_eq!(settings.source, 2);
    }

    #[test]
    fn high_h264_bitrates_are_refused() {
        let (mut cam, _mock) = connected();
        let dir = tempfile::tempdir().unwrap();
        let options = VideoOptions {
            bitrate: 150,
            ..Default::default()
        };
        assert!(cam.open_video_stream(&dir.path().join("a.mp4"), &options).is_err());
    }

    #[test]
    fn acquisitions_are_saved_to_numbered_files() {
        let (mut cam, mock) = connected();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.mp4");
        let files = cam
            .acquire(&path, Duration::from_secs(1), 2, TriggerSource::Software, &VideoOptions::default(), false)
            .unwrap();
        assert_eq!(files, vec![dir.path().join("run_00001.mp4"), dir.path().join("run_00002.mp4")]);
        for f in &files {
            // one byte per frame, 1 s at 30 fps
            assert_eq!(std::fs::read(f).unwrap().len(), 30);
        }
        let state = mock.state();
        assert_eq!(state.config.grab_timeout, 1000);
        assert_eq!(state.config.grab_mode, GrabMode::BufferFrames);
        assert_eq!(state.fired, 2);
    }

    #[test]
    fn stopping_mid_recording_deletes_the_file() {
        let (mut cam, _mock) = connected();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.avi");
        let stream = cam
            .open_video_stream(&path, &VideoOptions { format: VideoFormat::Avi, ..Default::default() })
            .unwrap();
        cam.video = Some((stream, path.clone()));
        assert!(path.is_file());
        cam.start_capture(false).unwrap();
        cam.stop_capture(false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn file_names() {
        let p = Path::new("/data/video.mp4");
        assert_eq!(acquisition_file_names(p, 1), vec![PathBuf::from("/data/video.mp4")]);
        assert_eq!(
            acquisition_file_names(p, 3)[2],
            PathBuf::from("/data/video_00003.mp4")
        );
    }

    #[test]
    fn trigger_codes() {
        assert_eq!(TriggerMode::from_code(15).unwrap(), TriggerMode::MultiShot);
        assert!(TriggerMode::from_code(2).is_err());
        assert_eq!(TriggerSource::from_code(7).unwrap(), TriggerSource::Software);
        assert_eq!(GrabMode::from_code(1), GrabMode::BufferFrames);
    }
}
