//! [`CameraBackend`] over the FlyCapture2 C API (`libflycapture-c`).

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::path::Path;

use tracing::info;

use super::{
    CameraBackend, CameraConfig, CameraInfo, Frame, GrabMode, Property, TriggerSettings, VideoFormat, VideoSettings,
    VideoStream,
};
use crate::error::CameraError;

type Fc2Context = *mut c_void;
type Fc2AviContext = *mut c_void;
type Fc2Error = c_int;

const FC2_ERROR_OK: Fc2Error = 0;
const FC2_ERROR_TIMEOUT: Fc2Error = 18;

const FC2_AUTO_EXPOSURE: c_int = 1;
const FC2_SHUTTER: c_int = 12;
const FC2_FRAME_RATE: c_int = 16;
const FC2_TEMPERATURE: c_int = 17;

const STRING_LEN: usize = 512;

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct Fc2PgrGuid {
    value: [c_uint; 4],
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct Fc2Property {
    kind: c_int,
    present: c_int,
    abs_control: c_int,
    one_push: c_int,
    on_off: c_int,
    auto_manual_mode: c_int,
    value_a: c_uint,
    value_b: c_uint,
    abs_value: f32,
    reserved: [c_uint; 8],
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct Fc2TriggerMode {
    on_off: c_int,
    polarity: c_uint,
    source: c_uint,
    mode: c_uint,
    parameter: c_uint,
    reserved: [c_uint; 8],
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct Fc2Config {
    num_buffers: c_uint,
    num_image_notifications: c_uint,
    min_num_image_notifications: c_uint,
    grab_timeout: c_int,
    grab_mode: c_int,
    isoch_bus_speed: c_int,
    async_bus_speed: c_int,
    bandwidth_allocation: c_int,
    register_timeout_retries: c_uint,
    register_timeout: c_uint,
    reserved: [c_uint; 16],
}

#[repr(C)]
struct Fc2Image {
    rows: c_uint,
    cols: c_uint,
    stride: c_uint,
    data: *mut u8,
    data_size: c_uint,
    received_data_size: c_uint,
    format: c_int,
    bayer_format: c_int,
    image_impl: *mut c_void,
}

/// Leading fields of `fc2CameraInfo`; the tail is left opaque.
#[repr(C)]
struct Fc2CameraInfo {
    serial_number: c_uint,
    interface_type: c_int,
    driver_type: c_int,
    is_color_camera: c_int,
    model_name: [c_char; STRING_LEN],
    vendor_name: [c_char; STRING_LEN],
    sensor_info: [c_char; STRING_LEN],
    sensor_resolution: [c_char; STRING_LEN],
    driver_name: [c_char; STRING_LEN],
    firmware_version: [c_char; STRING_LEN],
    firmware_build_time: [c_char; STRING_LEN],
    tail: [u8; 8192],
}

#[repr(C)]
struct Fc2AviOption {
    frame_rate: f32,
    reserved: [c_uint; 256],
}

#[repr(C)]
struct Fc2MjpgOption {
    frame_rate: f32,
    quality: c_uint,
    reserved: [c_uint; 256],
}

#[repr(C)]
struct Fc2H264Option {
    frame_rate: f32,
    width: c_uint,
    height: c_uint,
    bitrate: c_uint,
    reserved: [c_uint; 256],
}

#[cfg_attr(windows, link(name = "FlyCapture2_C"))]
#[cfg_attr(not(windows), link(name = "flycapture-c"))]
unsafe extern "C" {
    fn fc2CreateContext(ctx: *mut Fc2Context) -> Fc2Error;
    fn fc2DestroyContext(ctx: Fc2Context) -> Fc2Error;
    fn fc2GetNumOfCameras(ctx: Fc2Context, n: *mut c_uint) -> Fc2Error;
    fn fc2GetCameraFromIndex(ctx: Fc2Context, index: c_uint, guid: *mut Fc2PgrGuid) -> Fc2Error;
    fn fc2Connect(ctx: Fc2Context, guid: *mut Fc2PgrGuid) -> Fc2Error;
    fn fc2Disconnect(ctx: Fc2Context) -> Fc2Error;
    fn fc2GetCameraInfo(ctx: Fc2Context, info: *mut Fc2CameraInfo) -> Fc2Error;
    fn fc2ReadRegister(ctx: Fc2Context, address: c_uint, value: *mut c_uint) -> Fc2Error;
    fn fc2WriteRegister(ctx: Fc2Context, address: c_uint, value: c_uint) -> Fc2Error;
    fn fc2GetProperty(ctx: Fc2Context, prop: *mut Fc2Property) -> Fc2Error;
    fn fc2SetProperty(ctx: Fc2Context, prop: *mut Fc2Property) -> Fc2Error;
    fn fc2GetTriggerMode(ctx: Fc2Context, mode: *mut Fc2TriggerMode) -> Fc2Error;
    fn fc2SetTriggerMode(ctx: Fc2Context, mode: *mut Fc2TriggerMode) -> Fc2Error;
    fn fc2GetConfiguration(ctx: Fc2Context, config: *mut Fc2Config) -> Fc2Error;
    fn fc2SetConfiguration(ctx: Fc2Context, config: *mut Fc2Config) -> Fc2Error;
    fn fc2StartCapture(ctx: Fc2Context) -> Fc2Error;
    fn fc2StopCapture(ctx: Fc2Context) -> Fc2Error;
    fn fc2CreateImage(image: *mut Fc2Image) -> Fc2Error;
    fn fc2DestroyImage(image: *mut Fc2Image) -> Fc2Error;
    fn fc2RetrieveBuffer(ctx: Fc2Context, image: *mut Fc2Image) -> Fc2Error;
    fn fc2SetImageDimensions(
        image: *mut Fc2Image,
        rows: c_uint,
        cols: c_uint,
        stride: c_uint,
        format: c_int,
        bayer_format: c_int,
    ) -> Fc2Error;
    fn fc2SetImageData(image: *mut Fc2Image, data: *const u8, size: c_uint) -> Fc2Error;
    fn fc2CreateAVI(ctx: *mut Fc2AviContext) -> Fc2Error;
    fn fc2DestroyAVI(ctx: Fc2AviContext) -> Fc2Error;
    fn fc2AVIOpen(ctx: Fc2AviContext, name: *const c_char, option: *mut Fc2AviOption) -> Fc2Error;
    fn fc2MJPGOpen(ctx: Fc2AviContext, name: *const c_char, option: *mut Fc2MjpgOption) -> Fc2Error;
    fn fc2H264Open(ctx: Fc2AviContext, name: *const c_char, option: *mut Fc2H264Option) -> Fc2Error;
    fn fc2AVIAppend(ctx: Fc2AviContext, image: *mut Fc2Image) -> Fc2Error;
    fn fc2AVIClose(ctx: Fc2AviContext) -> Fc2Error;
    fn fc2ErrorToDescription(error: Fc2Error) -> *const c_char;
    fn fc2GetLibraryVersion(version: *mut [c_uint; 4]) -> Fc2Error;
}

fn check(code: Fc2Error) -> Result<(), CameraError> {
    match code {
        FC2_ERROR_OK => Ok(()),
        FC2_ERROR_TIMEOUT => Err(CameraError::Timeout),
        _ => {
            // SAFETY: the SDK returns a static NUL-terminated string.
            let msg = unsafe { CStr::from_ptr(fc2ErrorToDescription(code)) };
            Err(CameraError::Sdk(msg.to_string_lossy().into_owned()))
        }
    }
}

fn text(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn property_code(property: Property) -> c_int {
    match property {
        Property::AutoExposure => FC2_AUTO_EXPOSURE,
        Property::Shutter => FC2_SHUTTER,
        Property::FrameRate => FC2_FRAME_RATE,
        Property::Temperature => FC2_TEMPERATURE,
    }
}

pub struct FlyCaptureBackend {
    ctx: Fc2Context,
}

// The context is only used through `&mut self`.
unsafe impl Send for FlyCaptureBackend {}

impl FlyCaptureBackend {
    pub fn new() -> Result<Self, CameraError> {
        let mut version = [0; 4];
        // SAFETY: out-pointer to a 4-element array, as documented.
        check(unsafe { fc2GetLibraryVersion(&mut version) })?;
        info!(
            "FlyCapture2 library version: {}.{}.{}.{}",
            version[0], version[1], version[2], version[3]
        );
        let mut ctx = std::ptr::null_mut();
        // SAFETY: valid out-pointer.
        check(unsafe { fc2CreateContext(&mut ctx) })?;
        Ok(Self { ctx })
    }
}

impl Drop for FlyCaptureBackend {
    fn drop(&mut self) {
        // SAFETY: created in `new`, destroyed once.
        unsafe {
            fc2DestroyContext(self.ctx);
        }
    }
}

impl CameraBackend for FlyCaptureBackend {
    fn camera_count(&mut self) -> Result<u32, CameraError> {
        let mut n = 0;
        check(unsafe { fc2GetNumOfCameras(self.ctx, &mut n) })?;
        Ok(n)
    }

    fn connect(&mut self, index: u32) -> Result<(), CameraError> {
        let mut guid = Fc2PgrGuid::default();
        check(unsafe { fc2GetCameraFromIndex(self.ctx, index, &mut guid) })?;
        info!("connecting to camera with GUID {:?} ...", guid.value);
        check(unsafe { fc2Connect(self.ctx, &mut guid) })
    }

    fn disconnect(&mut self) -> Result<(), CameraError> {
        check(unsafe { fc2Disconnect(self.ctx) })
    }

    fn info(&mut self) -> Result<CameraInfo, CameraError> {
        // SAFETY: plain C struct, all-zero is a valid bit pattern.
        let mut raw: Box<Fc2CameraInfo> = Box::new(unsafe { std::mem::zeroed() });
        check(unsafe { fc2GetCameraInfo(self.ctx, &mut *raw) })?;
        Ok(CameraInfo {
            serial_number: raw.serial_number,
            model_name: text(&raw.model_name),
            vendor_name: text(&raw.vendor_name),
            sensor_info: text(&raw.sensor_info),
            sensor_resolution: text(&raw.sensor_resolution),
            firmware_version: text(&raw.firmware_version),
            firmware_build_time: text(&raw.firmware_build_time),
        })
    }

    fn read_register(&mut self, address: u32) -> Result<u32, CameraError> {
        let mut value = 0;
        check(unsafe { fc2ReadRegister(self.ctx, address, &mut value) })?;
        Ok(value)
    }

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), CameraError> {
        check(unsafe { fc2WriteRegister(self.ctx, address, value) })
    }

    fn property(&mut self, property: Property) -> Result<f64, CameraError> {
        let mut prop = Fc2Property {
            kind: property_code(property),
            ..Default::default()
        };
        check(unsafe { fc2GetProperty(self.ctx, &mut prop) })?;
        Ok(f64::from(prop.abs_value))
    }

    fn set_property(&mut self, property: Property, value: f64) -> Result<(), CameraError> {
        let mut prop = Fc2Property {
            kind: property_code(property),
            ..Default::default()
        };
        check(unsafe { fc2GetProperty(self.ctx, &mut prop) })?;
        prop.abs_control = 1;
        prop.on_off = 1;
        prop.auto_manual_mode = 0;
        prop.abs_value = value as f32;
        check(unsafe { fc2SetProperty(self.ctx, &mut prop) })
    }

    fn trigger_mode(&mut self) -> Result<TriggerSettings, CameraError> {
        let mut raw = Fc2TriggerMode::default();
        check(unsafe { fc2GetTriggerMode(self.ctx, &mut raw) })?;
        Ok(TriggerSettings {
            on_off: raw.on_off != 0,
            mode: raw.mode,
            parameter: raw.parameter,
            polarity: raw.polarity,
            source: raw.source,
        })
    }

    fn set_trigger_mode(&mut self, settings: &TriggerSettings) -> Result<(), CameraError> {
        let mut raw = Fc2TriggerMode {
            on_off: c_int::from(settings.on_off),
            polarity: settings.polarity,
            source: settings.source,
            mode: settings.mode,
            parameter: settings.parameter,
            ..Default::default()
        };
        check(unsafe { fc2SetTriggerMode(self.ctx, &mut raw) })
    }

    fn configuration(&mut self) -> Result<CameraConfig, CameraError> {
        let mut raw = Fc2Config::default();
        check(unsafe { fc2GetConfiguration(self.ctx, &mut raw) })?;
        Ok(CameraConfig {
            num_buffers: raw.num_buffers,
            num_image_notifications: raw.num_image_notifications,
            min_num_image_notifications: raw.min_num_image_notifications,
            grab_timeout: raw.grab_timeout,
            grab_mode: GrabMode::from_code(raw.grab_mode as u32),
            isoch_bus_speed: raw.isoch_bus_speed as u32,
            async_bus_speed: raw.async_bus_speed as u32,
            bandwidth_allocation: raw.bandwidth_allocation as u32,
            register_timeout_retries: raw.register_timeout_retries,
            register_timeout: raw.register_timeout,
        })
    }

    fn set_configuration(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
        let mut raw = Fc2Config {
            num_buffers: config.num_buffers,
            num_image_notifications: config.num_image_notifications,
            min_num_image_notifications: config.min_num_image_notifications,
            grab_timeout: config.grab_timeout,
            grab_mode: config.grab_mode.code() as c_int,
            isoch_bus_speed: config.isoch_bus_speed as c_int,
            async_bus_speed: config.async_bus_speed as c_int,
            bandwidth_allocation: config.bandwidth_allocation as c_int,
            register_timeout_retries: config.register_timeout_retries,
            register_timeout: config.register_timeout,
            ..Default::default()
        };
        check(unsafe { fc2SetConfiguration(self.ctx, &mut raw) })
    }

    fn start_capture(&mut self) -> Result<(), CameraError> {
        check(unsafe { fc2StartCapture(self.ctx) })
    }

    fn stop_capture(&mut self) -> Result<(), CameraError> {
        check(unsafe { fc2StopCapture(self.ctx) })
    }

    fn retrieve_frame(&mut self) -> Result<Frame, CameraError> {
        let mut image = Image::new()?;
        check(unsafe { fc2RetrieveBuffer(self.ctx, &mut image.0) })?;
        let raw = &image.0;
        let len = raw.received_data_size.min(raw.data_size) as usize;
        let data = if raw.data.is_null() {
            Vec::new()
        } else {
            // SAFETY: the SDK owns `len` valid bytes at `data` until the
            // image is destroyed.
            unsafe { std::slice::from_raw_parts(raw.data, len) }.to_vec()
        };
        Ok(Frame {
            rows: raw.rows,
            cols: raw.cols,
            stride: raw.stride,
            pixel_format: raw.format as u32,
            bayer_format: raw.bayer_format as u32,
            data,
        })
    }

    fn open_video(&mut self, path: &Path, settings: &VideoSettings) -> Result<Box<dyn VideoStream>, CameraError> {
        let name = CString::new(path.to_string_lossy().into_owned())
            .map_err(|_| CameraError::InvalidSetting(format!("invalid file name {}", path.display())))?;
        let mut ctx = std::ptr::null_mut();
        check(unsafe { fc2CreateAVI(&mut ctx) })?;
        let video = FlyCaptureVideo { ctx };
        let frame_rate = settings.fps as f32;
        let code = match settings.format {
            VideoFormat::Avi => {
                let mut option = Fc2AviOption {
                    frame_rate,
                    reserved: [0; 256],
                };
                unsafe { fc2AVIOpen(ctx, name.as_ptr(), &mut option) }
            }
            VideoFormat::Mjpg => {
                let mut option = Fc2MjpgOption {
                    frame_rate,
                    quality: settings.jpeg_quality,
                    reserved: [0; 256],
                };
                unsafe { fc2MJPGOpen(ctx, name.as_ptr(), &mut option) }
            }
            VideoFormat::H264 => {
                let mut option = Fc2H264Option {
                    frame_rate,
                    width: settings.cols,
                    height: settings.rows,
                    bitrate: settings.bitrate * 1000,
                    reserved: [0; 256],
                };
                unsafe { fc2H264Open(ctx, name.as_ptr(), &mut option) }
            }
        };
        check(code)?;
        Ok(Box::new(video))
    }
}

/// SDK-allocated image, destroyed on drop.
struct Image(Fc2Image);

impl Image {
    fn new() -> Result<Self, CameraError> {
        let mut raw = Fc2Image {
            rows: 0,
            cols: 0,
            stride: 0,
            data: std::ptr::null_mut(),
            data_size: 0,
            received_data_size: 0,
            format: 0,
            bayer_format: 0,
            image_impl: std::ptr::null_mut(),
        };
        check(unsafe { fc2CreateImage(&mut raw) })?;
        Ok(Self(raw))
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            fc2DestroyImage(&mut self.0);
        }
    }
}

struct FlyCaptureVideo {
    ctx: Fc2AviContext,
}

unsafe impl Send for FlyCaptureVideo {}

impl VideoStream for FlyCaptureVideo {
    fn append(&mut self, frame: &Frame) -> Result<(), CameraError> {
        let mut image = Image::new()?;
        check(unsafe {
            fc2SetImageDimensions(
                &mut image.0,
                frame.rows,
                frame.cols,
                frame.stride,
                frame.pixel_format as c_int,
                frame.bayer_format as c_int,
            )
        })?;
        let size = c_uint::try_from(frame.data.len())
            .map_err(|_| CameraError::InvalidSetting("frame too large".into()))?;
        // The SDK copies the buffer.
        check(unsafe { fc2SetImageData(&mut image.0, frame.data.as_ptr(), size) })?;
        check(unsafe { fc2AVIAppend(self.ctx, &mut image.0) })
    }

    fn close(&mut self) -> Result<(), CameraError> {
        check(unsafe { fc2AVIClose(self.ctx) })
    }
}

impl Drop for FlyCaptureVideo {
    fn drop(&mut self) {
        unsafe {
            fc2DestroyAVI(self.ctx);
        }
    }
}
