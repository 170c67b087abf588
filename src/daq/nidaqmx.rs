//! [`CounterBackend`] over the NI-DAQmx C API (`nicaiu`).

use std::ffi::{c_char, c_void, CString};
use std::ptr;

use tracing::debug;

use super::{CounterBackend, PulseTiming};
use crate::error::DaqError;

type TaskHandle = *mut c_void;
type Int32 = i32;
type UInt32 = u32;
type UInt64 = u64;
type Bool32 = u32;

const DAQMX_VAL_HZ: Int32 = 10373;
const DAQMX_VAL_LOW: Int32 = 10214;
const DAQMX_VAL_FINITE_SAMPS: Int32 = 10178;
const DAQMX_VAL_RISING: Int32 = 10280;
/// Channel name selecting every channel of the task.
const ALL_CHANNELS: &[u8] = b"\0";
const ERROR_BUFFER_SIZE: usize = 2048;

#[link(name = "nicaiu")]
unsafe extern "C" {
    fn DAQmxGetSysDevNames(data: *mut c_char, size: UInt32) -> Int32;
    fn DAQmxGetDevTerminals(device: *const c_char, data: *mut c_char, size: UInt32) -> Int32;
    fn DAQmxGetDevCOPhysicalChans(device: *const c_char, data: *mut c_char, size: UInt32) -> Int32;
    fn DAQmxCreateTask(name: *const c_char, task: *mut TaskHandle) -> Int32;
    fn DAQmxCreateCOPulseChanFreq(
        task: TaskHandle,
        counter: *const c_char,
        name: *const c_char,
        units: Int32,
        idle_state: Int32,
        initial_delay: f64,
        freq: f64,
        duty_cycle: f64,
    ) -> Int32;
    fn DAQmxSetCOPulseFreq(task: TaskHandle, channel: *const c_char, value: f64) -> Int32;
    fn DAQmxSetCOPulseDutyCyc(task: TaskHandle, channel: *const c_char, value: f64) -> Int32;
    fn DAQmxSetCOPulseFreqInitialDelay(task: TaskHandle, channel: *const c_char, value: f64) -> Int32;
    fn DAQmxSetCOEnableInitialDelayOnRetrigger(task: TaskHandle, channel: *const c_char, value: Bool32) -> Int32;
    fn DAQmxSetCOPulseTerm(task: TaskHandle, channel: *const c_char, terminal: *const c_char) -> Int32;
    fn DAQmxCfgImplicitTiming(task: TaskHandle, sample_mode: Int32, samples: UInt64) -> Int32;
    fn DAQmxCfgDigEdgeStartTrig(task: TaskHandle, source: *const c_char, edge: Int32) -> Int32;
    fn DAQmxSetStartTrigRetriggerable(task: TaskHandle, value: Bool32) -> Int32;
    fn DAQmxStartTask(task: TaskHandle) -> Int32;
    fn DAQmxStopTask(task: TaskHandle) -> Int32;
    fn DAQmxIsTaskDone(task: TaskHandle, done: *mut Bool32) -> Int32;
    fn DAQmxClearTask(task: TaskHandle) -> Int32;
    fn DAQmxGetExtendedErrorInfo(data: *mut c_char, size: UInt32) -> Int32;
}

/// Negative codes are errors, positive ones warnings.
fn check(code: Int32) -> Result<(), DaqError> {
    if code >= 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; ERROR_BUFFER_SIZE];
    // SAFETY: buf outlives the call and its length is passed along.
    unsafe { DAQmxGetExtendedErrorInfo(buf.as_mut_ptr().cast(), buf.len() as UInt32) };
    Err(DaqError::Driver {
        code,
        message: nul_terminated(&buf),
    })
}

fn nul_terminated(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn c_string(s: &str) -> Result<CString, DaqError> {
    CString::new(s).map_err(|_| DaqError::InvalidSetting(format!("{s:?} contains a NUL byte")))
}

/// Query a comma separated list: the first call returns the required size.
fn query_list(query: impl Fn(*mut c_char, UInt32) -> Int32) -> Result<Vec<String>, DaqError> {
    let size = query(ptr::null_mut(), 0);
    check(size)?;
    if size == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; size as usize];
    check(query(buf.as_mut_ptr().cast(), size as UInt32))?;
    Ok(nul_terminated(&buf)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

pub struct NiDaqmxBackend {
    task: TaskHandle,
}

// SAFETY: DAQmx task handles may be used from any thread.
unsafe impl Send for NiDaqmxBackend {}

impl NiDaqmxBackend {
    pub fn new() -> Self {
        Self { task: ptr::null_mut() }
    }

    fn task(&self) -> Result<TaskHandle, DaqError> {
        if self.task.is_null() {
            return Err(DaqError::InvalidSetting("no task created".into()));
        }
        Ok(self.task)
    }
}

impl Default for NiDaqmxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterBackend for NiDaqmxBackend {
    fn device_names(&mut self) -> Result<Vec<String>, DaqError> {
        // SAFETY: the closure forwards a buffer of the advertised size.
        query_list(|data, size| unsafe { DAQmxGetSysDevNames(data, size) })
    }

    fn terminals(&mut self, device: &str) -> Result<Vec<String>, DaqError> {
        let device = c_string(device)?;
        // SAFETY: device is NUL-terminated and outlives the call.
        query_list(|data, size| unsafe { DAQmxGetDevTerminals(device.as_ptr(), data, size) })
    }

    fn co_channels(&mut self, device: &str) -> Result<Vec<String>, DaqError> {
        let device = c_string(device)?;
        // SAFETY: device is NUL-terminated and outlives the call.
        query_list(|data, size| unsafe { DAQmxGetDevCOPhysicalChans(device.as_ptr(), data, size) })
    }

    fn create_task(&mut self, name: &str) -> Result<(), DaqError> {
        if !self.task.is_null() {
            self.clear()?;
        }
        let name = c_string(name)?;
        debug!("DAQmx create task {name:?}");
        // SAFETY: name is NUL-terminated; task receives the new handle.
        check(unsafe { DAQmxCreateTask(name.as_ptr(), &mut self.task) })
    }

    fn create_pulse_channel(&mut self, counter: &str, timing: &PulseTiming) -> Result<(), DaqError> {
        let task = self.task()?;
        let counter = c_string(counter)?;
        // SAFETY: task is live and the strings are NUL-terminated.
        check(unsafe {
            DAQmxCreateCOPulseChanFreq(
                task,
                counter.as_ptr(),
                ALL_CHANNELS.as_ptr().cast(),
                DAQMX_VAL_HZ,
                DAQMX_VAL_LOW,
                timing.initial_delay,
                timing.freq,
                timing.duty_cycle,
            )
        })
    }

    fn configure_timing(&mut self, timing: &PulseTiming) -> Result<(), DaqError> {
        let task = self.task()?;
        let all = ALL_CHANNELS.as_ptr().cast();
        // SAFETY: task is live and `all` is a static empty C string.
        unsafe {
            check(DAQmxSetCOPulseFreq(task, all, timing.freq))?;
            check(DAQmxSetCOPulseDutyCyc(task, all, timing.duty_cycle))?;
            check(DAQmxSetCOPulseFreqInitialDelay(task, all, timing.initial_delay))?;
            check(DAQmxCfgImplicitTiming(task, DAQMX_VAL_FINITE_SAMPS, timing.npulses))?;
            check(DAQmxSetCOEnableInitialDelayOnRetrigger(task, all, 1))
        }
    }

    fn configure_trigger(&mut self, input: &str, output: &str) -> Result<(), DaqError> {
        let task = self.task()?;
        let input = c_string(input)?;
        let output = c_string(output)?;
        // SAFETY: task is live and the strings are NUL-terminated.
        unsafe {
            check(DAQmxCfgDigEdgeStartTrig(task, input.as_ptr(), DAQMX_VAL_RISING))?;
            check(DAQmxSetStartTrigRetriggerable(task, 1))?;
            check(DAQmxSetCOPulseTerm(task, ALL_CHANNELS.as_ptr().cast(), output.as_ptr()))
        }
    }

    fn start(&mut self) -> Result<(), DaqError> {
        let task = self.task()?;
        // SAFETY: task is live.
        check(unsafe { DAQmxStartTask(task) })
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        let task = self.task()?;
        // SAFETY: task is live.
        check(unsafe { DAQmxStopTask(task) })
    }

    fn is_done(&mut self) -> Result<bool, DaqError> {
        let task = self.task()?;
        let mut done: Bool32 = 0;
        // SAFETY: task is live; done is a valid out pointer.
        check(unsafe { DAQmxIsTaskDone(task, &mut done) })?;
        Ok(done != 0)
    }

    fn clear(&mut self) -> Result<(), DaqError> {
        if self.task.is_null() {
            return Ok(());
        }
        let task = std::mem::replace(&mut self.task, ptr::null_mut());
        // SAFETY: task is live and no longer referenced afterwards.
        check(unsafe { DAQmxClearTask(task) })
    }
}

impl Drop for NiDaqmxBackend {
    fn drop(&mut self) {
        let _ = self.clear();
    }
}
