//! Simulated camera for tests.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    CameraBackend, CameraConfig, CameraInfo, Frame, Property, TriggerSettings, VideoSettings, VideoStream,
    CAMERA_POWER, SOFTWARE_TRIGGER, TRIGGER_INQ,
};
use crate::error::CameraError;

pub struct MockState {
    pub ncameras: u32,
    pub connected: bool,
    pub capturing: bool,
    pub fps: f64,
    pub shutter: f64,
    pub temperature: f64,
    pub cols: u32,
    pub rows: u32,
    pub registers: HashMap<u32, u32>,
    /// Failed reads of the power register before it reflects writes.
    pub power_reads_before_awake: usize,
    pub trigger: TriggerSettings,
    pub config: CameraConfig,
    /// Returned by the next frame retrievals, in order.
    pub pending_errors: VecDeque<CameraError>,
    /// Software triggers fired.
    pub fired: usize,
}

/// Clones share state.
#[derive(Clone)]
pub struct MockCamera {
    state: Arc<Mutex<MockState>>,
}

impl MockCamera {
    pub fn new(fps: f64, cols: u32, rows: u32) -> Self {
        let registers = HashMap::from([(TRIGGER_INQ, 0x0001_0000)]);
        Self {
            state: Arc::new(Mutex::new(MockState {
                ncameras: 1,
                connected: false,
                capturing: false,
                fps,
                shutter: 0.0,
                temperature: 2.98,
                cols,
                rows,
                registers,
                power_reads_before_awake: 0,
                trigger: TriggerSettings {
                    on_off: false,
                    mode: 0,
                    parameter: 0,
                    polarity: 0,
                    source: 0,
                },
                config: CameraConfig {
                    num_buffers: 10,
                    grab_timeout: -1,
                    ..Default::default()
                },
                pending_errors: VecDeque::new(),
                fired: 0,
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl CameraBackend for MockCamera {
    fn camera_count(&mut self) -> Result<u32, CameraError> {
        Ok(self.state().ncameras)
    }

    fn connect(&mut self, index: u32) -> Result<(), CameraError> {
        let mut state = self.state();
        if index >= state.ncameras {
            return Err(CameraError::NotDetected);
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), CameraError> {
        self.state().connected = false;
        Ok(())
    }

    fn info(&mut self) -> Result<CameraInfo, CameraError> {
        Ok(CameraInfo {
            serial_number: 17_123_456,
            model_name: "Blackfly S BFS-U3-04S2M".into(),
            vendor_name: "FLIR".into(),
            sensor_info: "Sony IMX287 (1/2.9\" Mono CMOS)".into(),
            sensor_resolution: "720x540".into(),
            firmware_version: "1.2.3".into(),
            firmware_build_time: "Jan 1 2022".into(),
        })
    }

    fn read_register(&mut self, address: u32) -> Result<u32, CameraError> {
        let mut state = self.state();
        if address == CAMERA_POWER && state.power_reads_before_awake > 0 {
            state.power_reads_before_awake -= 1;
            return Err(CameraError::Sdk("register read failed".into()));
        }
        Ok(state.registers.get(&address).copied().unwrap_or(0))
    }

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), CameraError> {
        let mut state = self.state();
        if address == SOFTWARE_TRIGGER {
            state.fired += 1;
        } else {
            state.registers.insert(address, value);
        }
        Ok(())
    }

    fn property(&mut self, property: Property) -> Result<f64, CameraError> {
        let state = self.state();
        Ok(match property {
            Property::FrameRate => state.fps,
            Property::Shutter => state.shutter,
            Property::AutoExposure => 1.5,
            Property::Temperature => state.temperature,
        })
    }

    fn set_property(&mut self, property: Property, value: f64) -> Result<(), CameraError> {
        let mut state = self.state();
        match property {
            Property::Shutter => state.shutter = value,
            Property::FrameRate => state.fps = value,
            other => return Err(CameraError::Sdk(format!("{other:?} is read-only"))),
        }
        Ok(())
    }

    fn trigger_mode(&mut self) -> Result<TriggerSettings, CameraError> {
        Ok(self.state().trigger)
    }

    fn set_trigger_mode(&mut self, settings: &TriggerSettings) -> Result<(), CameraError> {
        self.state().trigger = *settings;
        Ok(())
    }

    fn configuration(&mut self) -> Result<CameraConfig, CameraError> {
        Ok(self.state().config)
    }

    fn set_configuration(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
        self.state().config = *config;
        Ok(())
    }

    fn start_capture(&mut self) -> Result<(), CameraError> {
        self.state().capturing = true;
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), CameraError> {
        self.state().capturing = false;
        Ok(())
    }

    fn retrieve_frame(&mut self) -> Result<Frame, CameraError> {
        let mut state = self.state();
        if let Some(err) = state.pending_errors.pop_front() {
            return Err(err);
        }
        if !state.capturing {
            return Err(CameraError::Sdk("capture not started".into()));
        }
        Ok(Frame {
            rows: state.rows,
            cols: state.cols,
            stride: state.cols,
            data: vec![0; (state.cols * state.rows) as usize],
            ..Default::default()
        })
    }

    fn open_video(&mut self, path: &Path, _settings: &VideoSettings) -> Result<Box<dyn VideoStream>, CameraError> {
        let file = File::create(path).map_err(|e| CameraError::Sdk(e.to_string()))?;
        Ok(Box::new(MockVideo { file }))
    }
}

/// Writes one byte per appended frame.
struct MockVideo {
    file: File,
}

impl VideoStream for MockVideo {
    fn append(&mut self, _frame: &Frame) -> Result<(), CameraError> {
        self.file
            .write_all(&[0])
            .map_err(|e| CameraError::Sdk(e.to_string()))
    }

    fn close(&mut self) -> Result<(), CameraError> {
        self.file.flush().map_err(|e| CameraError::Sdk(e.to_string()))
    }
}
