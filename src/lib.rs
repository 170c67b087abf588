//! Async drivers for laboratory instruments: SCPI waveform generators and
//! oscilloscopes over VXI-11 or raw sockets, a Sutter micro-manipulator over
//! serial, a FLIR camera and NI-DAQ counter triggers through their vendor C
//! libraries, and discovery helpers picking whichever instrument is plugged in.

#[macro_use]
mod macros;

pub mod camera;
pub mod config;
pub mod daq;
pub mod error;
pub mod factory;
pub mod generator;
pub mod logging;
pub mod manipulator;
pub mod resource;
pub mod scope;
pub mod si;
pub mod transport;
pub mod visa;
pub mod waveform;

// Re-export the entry points so users can depend on the crate without
// knowing the internal module layout.
pub use config::Settings;
pub use error::{is_instrument_error, CameraError, DaqError, SutterError, VisaError};
pub use factory::{grab_camera, grab_generator, grab_instrument, grab_manipulator, grab_oscilloscope};
pub use resource::{Resource, ResourceManager};
pub use visa::VisaInstrument;
