//! Native `libvkdaq` backend.
//!
//! The vendor library is loaded at runtime with `libloading` so the server
//! builds and runs (in mock mode) on machines without the driver installed.
//! Tasks are addressed by name on the native side; the adapter keeps the
//! name of the current task as its handle.
//!
//! Native calls return a status code. Negative values are failures; the
//! read call returns the number of points captured per channel.
#![allow(unsafe_code)]

use std::ffi::{c_char, c_double, c_int, c_ulonglong, CString, OsStr};
use std::time::Duration;

use libloading::Library;
use tracing::{debug, info};

use super::{
    ChannelDefinition, DaqDriver, DriverError, DriverResult, Edge, FillMode, SampleMode,
    TerminalConfig, TriggerDefinition,
};

type FnTask = unsafe extern "C" fn(*const c_char) -> c_int;
type FnCreateAiVoltageChan = unsafe extern "C" fn(
    *const c_char, // task
    *const c_char, // physical channel
    *const c_char, // name to assign
    c_int,         // terminal config
    c_double,      // min
    c_double,      // max
    c_int,         // units
    *const c_char, // custom scale
) -> c_int;
type FnCfgSampClkTiming = unsafe extern "C" fn(
    *const c_char, // task
    *const c_char, // clock source, null = onboard
    c_double,      // rate
    c_int,         // active edge
    c_int,         // sample mode
    c_ulonglong,   // samples per channel
) -> c_int;
type FnCfgDigEdgeRefTrig = unsafe extern "C" fn(
    *const c_char, // task
    *const c_char, // trigger source
    c_int,         // edge
    c_int,         // retrigger count
) -> c_int;
type FnGetTaskData = unsafe extern "C" fn(
    *const c_char,   // task
    *mut c_double,   // buffer
    c_int,           // points per channel
    c_int,           // fill mode
    c_double,        // timeout in seconds
) -> c_int;

/// Units code for volts.
const UNITS_VOLTS: c_int = 0;

/// Resolved entry points of the vendor library.
struct VkDaqApi {
    create_task: FnTask,
    create_ai_voltage_chan: FnCreateAiVoltageChan,
    cfg_samp_clk_timing: FnCfgSampClkTiming,
    cfg_dig_edge_ref_trig: FnCfgDigEdgeRefTrig,
    start_task: FnTask,
    get_task_data: FnGetTaskData,
    stop_task: FnTask,
    clear_task: FnTask,
    // Keeps the function pointers above valid.
    _lib: Library,
}

impl VkDaqApi {
    fn load(path: &OsStr) -> DriverResult<Self> {
        let load_error = |e: libloading::Error| DriverError::LibraryLoad {
            library: path.to_string_lossy().into_owned(),
            message: e.to_string(),
        };

        // Safety: loading the vendor library runs its initializers; the
        // signatures below follow the vendor's C header.
        unsafe {
            let lib = Library::new(path).map_err(load_error)?;
            Ok(Self {
                create_task: *lib.get(b"VkDaqCreateTask\0").map_err(load_error)?,
                create_ai_voltage_chan: *lib
                    .get(b"VkDaqCreateAIVoltageChan\0")
                    .map_err(load_error)?,
                cfg_samp_clk_timing: *lib.get(b"VkDaqCfgSampClkTiming\0").map_err(load_error)?,
                cfg_dig_edge_ref_trig: *lib
                    .get(b"VkDaqCfgDigEdgeRefTrig\0")
                    .map_err(load_error)?,
                start_task: *lib.get(b"VkDaqStartTask\0").map_err(load_error)?,
                get_task_data: *lib.get(b"VkDaqGetTaskData\0").map_err(load_error)?,
                stop_task: *lib.get(b"VkDaqStopTask\0").map_err(load_error)?,
                clear_task: *lib.get(b"VkDaqClearTask\0").map_err(load_error)?,
                _lib: lib,
            })
        }
    }
}

/// Adapter over the native `libvkdaq` library.
pub struct VkDaqLibrary {
    api: VkDaqApi,
    task: Option<CString>,
    channels: usize,
}

impl VkDaqLibrary {
    /// Platform file name of the vendor library (`libvkdaq.so`, `vkdaq.dll`, ...).
    pub fn default_library_name() -> std::ffi::OsString {
        libloading::library_filename("vkdaq")
    }

    /// Load the vendor library from `path`.
    pub fn open(path: impl AsRef<OsStr>) -> DriverResult<Self> {
        let path = path.as_ref();
        let api = VkDaqApi::load(path)?;
        info!(library = %path.to_string_lossy(), "Loaded vkdaq driver library");
        Ok(Self {
            api,
            task: None,
            channels: 0,
        })
    }

    fn task(&self, operation: &'static str) -> DriverResult<&CString> {
        self.task.as_ref().ok_or(DriverError::NoTask { operation })
    }

    fn check(operation: &'static str, code: c_int) -> DriverResult<c_int> {
        if code < 0 {
            Err(DriverError::status(
                operation,
                code,
                format!("native status {code}"),
            ))
        } else {
            Ok(code)
        }
    }
}

/// Reject a read buffer too small for `points_per_channel` on every channel.
fn check_read_buffer(
    buffer_len: usize,
    points_per_channel: usize,
    channels: usize,
) -> DriverResult<()> {
    let needed = points_per_channel
        .checked_mul(channels.max(1))
        .ok_or(DriverError::InvalidArgument {
            operation: "read_data",
            message: format!("{points_per_channel} points overflow the buffer size"),
        })?;
    if buffer_len < needed {
        return Err(DriverError::InvalidArgument {
            operation: "read_data",
            message: format!("buffer holds {buffer_len} values, {needed} needed"),
        });
    }
    Ok(())
}

fn c_string(operation: &'static str, value: &str) -> DriverResult<CString> {
    CString::new(value).map_err(|e| DriverError::InvalidArgument {
        operation,
        message: e.to_string(),
    })
}

fn edge_code(edge: Edge) -> c_int {
    match edge {
        Edge::Rising => 1,
        Edge::Falling => 0,
    }
}

fn sample_mode_code(mode: SampleMode) -> c_int {
    match mode {
        SampleMode::Finite => 1,
        SampleMode::Continuous => 0,
    }
}

fn fill_mode_code(mode: FillMode) -> c_int {
    match mode {
        FillMode::GroupByChannel => 1,
        FillMode::GroupByScanNumber => 0,
    }
}

fn terminal_code(terminal: TerminalConfig) -> c_int {
    match terminal {
        TerminalConfig::Default => 0,
        TerminalConfig::Rse => 1,
        TerminalConfig::Nrse => 2,
        TerminalConfig::Differential => 3,
    }
}

impl DaqDriver for VkDaqLibrary {
    fn create_task(&mut self, name: &str) -> DriverResult<()> {
        let name = c_string("create_task", name)?;
        // Safety: `name` is a valid NUL-terminated string for the call.
        let code = unsafe { (self.api.create_task)(name.as_ptr()) };
        Self::check("create_task", code)?;
        debug!(task = ?name, "Created task");
        self.task = Some(name);
        self.channels = 0;
        Ok(())
    }

    fn add_voltage_channel(&mut self, channel: &ChannelDefinition) -> DriverResult<()> {
        let physical = c_string("add_voltage_channel", &channel.name)?;
        let empty = c_string("add_voltage_channel", "")?;
        let task = self.task("add_voltage_channel")?;
        // Safety: all pointers are valid NUL-terminated strings owned here.
        let code = unsafe {
            (self.api.create_ai_voltage_chan)(
                task.as_ptr(),
                physical.as_ptr(),
                empty.as_ptr(),
                terminal_code(channel.terminal),
                channel.range_min,
                channel.range_max,
                UNITS_VOLTS,
                empty.as_ptr(),
            )
        };
        Self::check("add_voltage_channel", code)?;
        self.channels += 1;
        Ok(())
    }

    fn configure_clock(
        &mut self,
        rate_hz: f64,
        edge: Edge,
        mode: SampleMode,
        samples_per_channel: u64,
    ) -> DriverResult<()> {
        let task = self.task("configure_clock")?;
        // Safety: null clock source selects the onboard clock.
        let code = unsafe {
            (self.api.cfg_samp_clk_timing)(
                task.as_ptr(),
                std::ptr::null(),
                rate_hz,
                edge_code(edge),
                sample_mode_code(mode),
                samples_per_channel,
            )
        };
        Self::check("configure_clock", code).map(|_| ())
    }

    fn configure_digital_trigger(&mut self, trigger: &TriggerDefinition) -> DriverResult<()> {
        let source = c_string("configure_digital_trigger", &trigger.source)?;
        let retrigger = c_int::try_from(trigger.retrigger_count).map_err(|e| {
            DriverError::InvalidArgument {
                operation: "configure_digital_trigger",
                message: e.to_string(),
            }
        })?;
        let task = self.task("configure_digital_trigger")?;
        // Safety: pointers are valid NUL-terminated strings owned here.
        let code = unsafe {
            (self.api.cfg_dig_edge_ref_trig)(
                task.as_ptr(),
                source.as_ptr(),
                edge_code(trigger.edge),
                retrigger,
            )
        };
        Self::check("configure_digital_trigger", code).map(|_| ())
    }

    fn start_task(&mut self) -> DriverResult<()> {
        let task = self.task("start_task")?;
        // Safety: task name is a valid NUL-terminated string.
        let code = unsafe { (self.api.start_task)(task.as_ptr()) };
        Self::check("start_task", code).map(|_| ())
    }

    fn read_data(
        &mut self,
        buffer: &mut [f64],
        points_per_channel: usize,
        fill_mode: FillMode,
        timeout: Duration,
    ) -> DriverResult<usize> {
        let points = c_int::try_from(points_per_channel).map_err(|e| {
            DriverError::InvalidArgument {
                operation: "read_data",
                message: e.to_string(),
            }
        })?;
        check_read_buffer(buffer.len(), points_per_channel, self.channels)?;
        let task = self.task("read_data")?;
        // Safety: `buffer` holds `points` values for every channel added to
        // the task; the driver writes at most that many.
        let code = unsafe {
            (self.api.get_task_data)(
                task.as_ptr(),
                buffer.as_mut_ptr(),
                points,
                fill_mode_code(fill_mode),
                timeout.as_secs_f64(),
            )
        };
        let read = Self::check("read_data", code)?;
        Ok(usize::try_from(read).unwrap_or(0))
    }

    fn stop_task(&mut self) -> DriverResult<()> {
        let task = self.task("stop_task")?;
        // Safety: task name is a valid NUL-terminated string.
        let code = unsafe { (self.api.stop_task)(task.as_ptr()) };
        Self::check("stop_task", code).map(|_| ())
    }

    fn clear_task(&mut self) -> DriverResult<()> {
        let task = self.task.take().ok_or(DriverError::NoTask {
            operation: "clear_task",
        })?;
        self.channels = 0;
        // Safety: task name is a valid NUL-terminated string.
        let code = unsafe { (self.api.clear_task)(task.as_ptr()) };
        Self::check("clear_task", code).map(|_| ())
    }

    fn has_task(&self) -> bool {
        self.task.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_load_error() {
        let result = VkDaqLibrary::open("/nonexistent/libvkdaq-missing.so");
        match result {
            Err(DriverError::LibraryLoad { library, .. }) => {
                assert!(library.contains("libvkdaq-missing"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("library should not load"),
        }
    }

    #[test]
    fn test_native_codes() {
        assert_eq!(edge_code(Edge::Rising), 1);
        assert_eq!(sample_mode_code(SampleMode::Finite), 1);
        assert_eq!(fill_mode_code(FillMode::GroupByChannel), 1);
        assert_eq!(terminal_code(TerminalConfig::Default), 0);
    }

    #[test]
    fn test_read_buffer_must_hold_every_channel() {
        assert!(check_read_buffer(780, 390, 2).is_ok());
        assert!(check_read_buffer(1000, 390, 2).is_ok());

        let err = check_read_buffer(1, 390, 2).unwrap_err();
        assert!(matches!(
            err,
            DriverError::InvalidArgument {
                operation: "read_data",
                ..
            }
        ));
        assert!(check_read_buffer(779, 390, 2).is_err());
        // No channel added yet still needs room for one.
        assert!(check_read_buffer(389, 390, 0).is_err());
        assert!(check_read_buffer(usize::MAX, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_negative_status_is_error() {
        assert!(VkDaqLibrary::check("start_task", -1).is_err());
        assert_eq!(VkDaqLibrary::check("read_data", 390).ok(), Some(390));
    }
}
