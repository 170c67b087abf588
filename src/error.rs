//! Typed error kinds raised by the instrument drivers.
//!
//! Driver operations return [`anyhow::Result`]; the enums below are the
//! errors wrapped inside it when the failure belongs to a specific access
//! path. Discovery relies on this split: [`is_instrument_error`] tells an
//! absent or misbehaving device (skip it, try the next candidate) apart
//! from everything else (propagate).

use thiserror::Error;

/// Failures of VISA-style SCPI instruments (generators, oscilloscopes).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VisaError {
    #[error("invalid VISA resource name {0:?}")]
    InvalidResource(String),

    #[error("{0} resources cannot be opened by this crate")]
    UnsupportedInterface(String),

    #[error("no VISA resources configured")]
    NoInstrument,

    #[error("no instrument matching {0:?} detected")]
    NotDetected(String),

    #[error("{0} is not a valid channel index (candidates are {1:?})")]
    InvalidChannel(u8, Vec<u8>),

    #[error("{what} {value:?} is not a valid option (candidates are {options:?})")]
    InvalidOption {
        what: String,
        value: String,
        options: Vec<String>,
    },

    #[error("{0}")]
    OutOfRange(String),

    #[error("instrument reported an error: {0}")]
    Instrument(String),

    #[error("unexpected response {response:?} to {command:?}")]
    Response { command: String, response: String },
}

/// Failures of the Sutter micro-manipulator controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SutterError {
    #[error("no serial port matching {0:?} found")]
    PortNotFound(String),

    #[error("command {command:?} not acknowledged (received {received:?})")]
    NotAcknowledged { command: String, received: Vec<u8> },

    #[error("timed out waiting for {0} bytes")]
    Timeout(usize),

    #[error("{0}")]
    OutOfRange(String),

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("target {target:?} not reached (stopped at {actual:?})")]
    TargetMissed { target: [f64; 3], actual: [f64; 3] },
}

/// Failures of the camera access path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("no camera detected")]
    NotDetected,

    #[error("camera SDK error: {0}")]
    Sdk(String),

    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("{0}")]
    InvalidSetting(String),

    #[error("camera support not compiled in, rebuild with --features flycapture")]
    BackendUnavailable,
}

/// Failures of the DAQ counter-output access path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaqError {
    #[error("DAQmx error {code}: {message}")]
    Driver { code: i32, message: String },

    #[error("{0}")]
    InvalidSetting(String),

    #[error("cannot change {0} while the task is running")]
    TaskRunning(String),

    #[error("no DAQ device found")]
    NoDevice,

    #[error("DAQ support not compiled in, rebuild with --features nidaqmx")]
    BackendUnavailable,
}

/// Whether `err` means "this instrument is not usable", as opposed to a
/// programming or environment error.
pub fn is_instrument_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<VisaError>()
            || cause.is::<SutterError>()
            || cause.is::<CameraError>()
            || cause.downcast_ref::<std::io::Error>().is_some()
            || cause.downcast_ref::<tokio::time::error::Elapsed>().is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn instrument_errors_are_recognised_through_context() {
        let err = Err::<(), _>(VisaError::NotDetected("DG1ZA".into()))
            .context("connecting generator")
            .unwrap_err();
        assert!(is_instrument_error(&err));

        let err = anyhow::Error::new(SutterError::Timeout(13));
        assert!(is_instrument_error(&err));
    }

    #[test]
    fn plain_errors_are_not_instrument_errors() {
        let err = anyhow::anyhow!("bad argument");
        assert!(!is_instrument_error(&err));
        let err = anyhow::Error::new(DaqError::NoDevice);
        assert!(!is_instrument_error(&err));
    }

    #[test]
    fn messages_name_the_offending_value() {
        let err = VisaError::InvalidChannel(3, vec![1, 2]);
        assert_eq!(
            err.to_string(),
            "3 is not a valid channel index (candidates are [1, 2])"
        );
    }
}
