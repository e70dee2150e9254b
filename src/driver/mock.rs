//! Simulated acquisition device.
//!
//! [`MockDaq`] implements the full task lifecycle in memory. A read blocks
//! until the simulated trigger fires (every `trigger_period_ms`) or until a
//! scripted capture is queued, and otherwise returns 0 points at the timeout
//! like the real driver.
//!
//! A [`MockHandle`] shares the device's bookkeeping with the test (or the
//! caller) after the driver itself has been moved into the acquisition
//! worker:
//!
//! - every call is recorded as a [`DriverCall`]
//! - faults can be injected per operation ([`FaultInjection`])
//! - raw capture buffers can be queued for the next reads
//!
//! # Example
//!
//! ```rust,ignore
//! let (driver, handle) = MockDaq::new(MockDaqConfig::default());
//! handle.inject(FaultInjection::FailFirst { operation: "start_task", count: 3 });
//! handle.queue_capture((0..200).map(f64::from).collect());
//! ```

use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{
    ChannelDefinition, DaqDriver, DriverError, DriverResult, Edge, FillMode, SampleMode,
    TriggerDefinition,
};

/// Status code reported for injected faults.
pub const INJECTED_FAULT_STATUS: i32 = -50103;

/// Simulated signal parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockDaqConfig {
    /// Interval between simulated triggers; `None` disables synthetic
    /// captures so only queued captures are delivered.
    pub trigger_period_ms: Option<u64>,
    /// Sine amplitude in volts
    pub amplitude: f64,
    /// Sine frequency in Hz
    pub signal_hz: f64,
    /// Peak uniform noise in volts
    pub noise: f64,
}

impl Default for MockDaqConfig {
    fn default() -> Self {
        Self {
            trigger_period_ms: Some(200),
            amplitude: 0.1,
            signal_hz: 50.0,
            noise: 0.005,
        }
    }
}

impl MockDaqConfig {
    /// Configuration that only delivers queued captures.
    pub fn scripted() -> Self {
        Self {
            trigger_period_ms: None,
            ..Self::default()
        }
    }
}

/// Fault scenario for a driver operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultInjection {
    /// Fail the next `count` calls of `operation`, then succeed
    FailFirst {
        /// Operation name, e.g. `"create_task"`
        operation: &'static str,
        /// Number of failing calls
        count: u32,
    },
    /// Fail every call of `operation` until cleared
    FailAlways {
        /// Operation name
        operation: &'static str,
    },
}

/// Recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverCall {
    /// Operation name
    pub operation: &'static str,
    /// Whether the call succeeded
    pub ok: bool,
}

#[derive(Debug, Default)]
struct Timing {
    rate_hz: f64,
    samples_per_channel: u64,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<DriverCall>,
    fail_first: HashMap<&'static str, u32>,
    fail_always: Vec<&'static str>,
    queued: VecDeque<Vec<f64>>,
    task: Option<String>,
    started: bool,
    channels: Vec<ChannelDefinition>,
    timing: Timing,
    trigger: Option<TriggerDefinition>,
    live_tasks: usize,
    max_live_tasks: usize,
    reads_completed: u64,
}

impl MockState {
    /// Consume an injected fault for `operation`, if any.
    fn take_fault(&mut self, operation: &'static str) -> Option<DriverError> {
        let fail = if self.fail_always.contains(&operation) {
            true
        } else if let Some(remaining) = self.fail_first.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        } else {
            false
        };

        fail.then(|| DriverError::status(operation, INJECTED_FAULT_STATUS, "injected fault"))
    }

    fn record<T>(&mut self, operation: &'static str, result: DriverResult<T>) -> DriverResult<T> {
        self.calls.push(DriverCall {
            operation,
            ok: result.is_ok(),
        });
        result
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MockState>,
    capture_ready: Condvar,
}

/// Handle onto a [`MockDaq`]'s bookkeeping.
#[derive(Debug, Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

impl MockHandle {
    /// Add a fault scenario.
    pub fn inject(&self, fault: FaultInjection) {
        let mut state = self.shared.state.lock();
        match fault {
            FaultInjection::FailFirst { operation, count } => {
                *state.fail_first.entry(operation).or_insert(0) += count;
            }
            FaultInjection::FailAlways { operation } => state.fail_always.push(operation),
        }
    }

    /// Queue a raw capture buffer, delivered by the next read of an armed task.
    pub fn queue_capture(&self, buffer: Vec<f64>) {
        self.shared.state.lock().queued.push_back(buffer);
        self.shared.capture_ready.notify_all();
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.shared.state.lock().calls.clone()
    }

    /// Number of recorded calls of `operation`.
    pub fn count(&self, operation: &str) -> usize {
        self.shared
            .state
            .lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    /// Number of successful calls of `operation`.
    pub fn successes(&self, operation: &str) -> usize {
        self.shared
            .state
            .lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation && call.ok)
            .count()
    }

    /// Tasks currently created and not cleared.
    pub fn live_tasks(&self) -> usize {
        self.shared.state.lock().live_tasks
    }

    /// Highest number of simultaneously live tasks observed.
    pub fn max_live_tasks(&self) -> usize {
        self.shared.state.lock().max_live_tasks
    }

    /// Whether the current task is started.
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Samples per channel of the last clock configuration.
    pub fn configured_points(&self) -> u64 {
        self.shared.state.lock().timing.samples_per_channel
    }

    /// Rate of the last clock configuration.
    pub fn configured_rate(&self) -> f64 {
        self.shared.state.lock().timing.rate_hz
    }

    /// Reads that delivered a capture.
    pub fn reads_completed(&self) -> u64 {
        self.shared.state.lock().reads_completed
    }

    /// Trigger of the current task.
    pub fn trigger(&self) -> Option<TriggerDefinition> {
        self.shared.state.lock().trigger.clone()
    }

    /// Channels added to the current task, in order.
    pub fn channels(&self) -> Vec<ChannelDefinition> {
        self.shared.state.lock().channels.clone()
    }
}

/// Simulated multi-channel analog input device.
pub struct MockDaq {
    config: MockDaqConfig,
    shared: Arc<Shared>,
    next_trigger: Option<Instant>,
}

impl MockDaq {
    /// Create a device and the handle observing it.
    pub fn new(config: MockDaqConfig) -> (Self, MockHandle) {
        let shared = Arc::new(Shared::default());
        let handle = MockHandle {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                config,
                shared,
                next_trigger: None,
            },
            handle,
        )
    }

    /// Fill `buffer` with one synthetic capture.
    fn synthesize(&self, buffer: &mut [f64], n_channels: usize, points: usize, rate_hz: f64) {
        let mut rng = rand::thread_rng();
        let rate = if rate_hz > 0.0 { rate_hz } else { 1.0 };
        for ch in 0..n_channels {
            let phase = ch as f64 * PI / 2.0;
            for i in 0..points {
                let t = i as f64 / rate;
                let noise = if self.config.noise > 0.0 {
                    rng.gen_range(-self.config.noise..=self.config.noise)
                } else {
                    0.0
                };
                let value =
                    self.config.amplitude * (2.0 * PI * self.config.signal_hz * t + phase).sin();
                buffer[ch * points + i] = value + noise;
            }
        }
    }
}

/// Reorder a channel-grouped buffer into scan order.
fn interleave(grouped: &[f64], n_channels: usize, points: usize) -> Vec<f64> {
    let mut out = vec![0.0; grouped.len()];
    for ch in 0..n_channels {
        for i in 0..points {
            out[i * n_channels + ch] = grouped[ch * points + i];
        }
    }
    out
}

impl DaqDriver for MockDaq {
    fn create_task(&mut self, name: &str) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        let result = match state.take_fault("create_task") {
            Some(err) => Err(err),
            None if state.task.is_some() => Err(DriverError::status(
                "create_task",
                -50100,
                "a task is already live on this device",
            )),
            None => {
                state.task = Some(name.to_string());
                state.started = false;
                state.channels.clear();
                state.timing = Timing::default();
                state.trigger = None;
                state.live_tasks += 1;
                state.max_live_tasks = state.max_live_tasks.max(state.live_tasks);
                Ok(())
            }
        };
        state.record("create_task", result)
    }

    fn add_voltage_channel(&mut self, channel: &ChannelDefinition) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        let result = if state.task.is_none() {
            Err(DriverError::NoTask {
                operation: "add_voltage_channel",
            })
        } else if let Some(err) = state.take_fault("add_voltage_channel") {
            Err(err)
        } else {
            state.channels.push(channel.clone());
            Ok(())
        };
        state.record("add_voltage_channel", result)
    }

    fn configure_clock(
        &mut self,
        rate_hz: f64,
        _edge: Edge,
        _mode: SampleMode,
        samples_per_channel: u64,
    ) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        let result = if state.task.is_none() {
            Err(DriverError::NoTask {
                operation: "configure_clock",
            })
        } else if let Some(err) = state.take_fault("configure_clock") {
            Err(err)
        } else {
            state.timing = Timing {
                rate_hz,
                samples_per_channel,
            };
            Ok(())
        };
        state.record("configure_clock", result)
    }

    fn configure_digital_trigger(&mut self, trigger: &TriggerDefinition) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        let result = if state.task.is_none() {
            Err(DriverError::NoTask {
                operation: "configure_digital_trigger",
            })
        } else if let Some(err) = state.take_fault("configure_digital_trigger") {
            Err(err)
        } else {
            state.trigger = Some(trigger.clone());
            Ok(())
        };
        state.record("configure_digital_trigger", result)
    }

    fn start_task(&mut self) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        let result = if state.task.is_none() {
            Err(DriverError::NoTask {
                operation: "start_task",
            })
        } else if let Some(err) = state.take_fault("start_task") {
            Err(err)
        } else {
            state.started = true;
            self.next_trigger = self
                .config
                .trigger_period_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms));
            Ok(())
        };
        state.record("start_task", result)
    }

    fn read_data(
        &mut self,
        buffer: &mut [f64],
        points_per_channel: usize,
        fill_mode: FillMode,
        timeout: Duration,
    ) -> DriverResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        if state.task.is_none() {
            return state.record("read_data", Err(DriverError::NoTask { operation: "read_data" }));
        }
        if !state.started {
            let err = DriverError::status("read_data", -200, "task not started");
            return state.record("read_data", Err(err));
        }
        if let Some(err) = state.take_fault("read_data") {
            return state.record("read_data", Err(err));
        }

        let n_channels = state.channels.len().max(1);
        loop {
            if let Some(capture) = state.queued.pop_front() {
                let points = (capture.len() / n_channels).min(points_per_channel);
                let data = match fill_mode {
                    FillMode::GroupByChannel => capture,
                    FillMode::GroupByScanNumber => interleave(&capture, n_channels, points),
                };
                let len = data.len().min(buffer.len());
                buffer[..len].copy_from_slice(&data[..len]);
                state.reads_completed += 1;
                trace!(points, "Delivered queued capture");
                return state.record("read_data", Ok(points));
            }

            let now = Instant::now();
            if let Some(trigger_at) = self.next_trigger {
                if trigger_at <= now {
                    let rate = state.timing.rate_hz;
                    let needed = n_channels * points_per_channel;
                    if buffer.len() < needed {
                        let err = DriverError::status("read_data", -200_229, "buffer too small");
                        return state.record("read_data", Err(err));
                    }
                    let mut grouped = vec![0.0; needed];
                    self.synthesize(&mut grouped, n_channels, points_per_channel, rate);
                    let data = match fill_mode {
                        FillMode::GroupByChannel => grouped,
                        FillMode::GroupByScanNumber => {
                            interleave(&grouped, n_channels, points_per_channel)
                        }
                    };
                    buffer[..needed].copy_from_slice(&data);
                    state.reads_completed += 1;
                    let period = self.config.trigger_period_ms.unwrap_or(0);
                    self.next_trigger = Some(now + Duration::from_millis(period));
                    return state.record("read_data", Ok(points_per_channel));
                }
            }

            if now >= deadline {
                return state.record("read_data", Ok(0));
            }
            let wake = match self.next_trigger {
                Some(trigger_at) => trigger_at.min(deadline),
                None => deadline,
            };
            self.shared.capture_ready.wait_until(&mut state, wake);
        }
    }

    fn stop_task(&mut self) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        let result = if state.task.is_none() {
            Err(DriverError::NoTask {
                operation: "stop_task",
            })
        } else if let Some(err) = state.take_fault("stop_task") {
            Err(err)
        } else {
            state.started = false;
            Ok(())
        };
        state.record("stop_task", result)
    }

    fn clear_task(&mut self) -> DriverResult<()> {
        let mut state = self.shared.state.lock();
        let result = if state.task.take().is_none() {
            Err(DriverError::NoTask {
                operation: "clear_task",
            })
        } else {
            // The handle is released even when the native call reports failure.
            state.started = false;
            state.live_tasks = state.live_tasks.saturating_sub(1);
            match state.take_fault("clear_task") {
                Some(err) => Err(err),
                None => Ok(()),
            }
        };
        state.record("clear_task", result)
    }

    fn has_task(&self) -> bool {
        self.shared.state.lock().task.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed(config: MockDaqConfig) -> (MockDaq, MockHandle) {
        let (mut daq, handle) = MockDaq::new(config);
        daq.create_task("test").unwrap();
        daq.add_voltage_channel(&ChannelDefinition::new("dev1/AIN1")).unwrap();
        daq.add_voltage_channel(&ChannelDefinition::new("dev1/AIN2")).unwrap();
        daq.configure_clock(1000.0, Edge::Rising, SampleMode::Finite, 10)
            .unwrap();
        daq.configure_digital_trigger(&TriggerDefinition::default())
            .unwrap();
        daq.start_task().unwrap();
        (daq, handle)
    }

    #[test]
    fn test_lifecycle_is_journaled() {
        let (mut daq, handle) = armed(MockDaqConfig::scripted());
        daq.stop_task().unwrap();
        daq.clear_task().unwrap();

        let ops: Vec<_> = handle.calls().iter().map(|c| c.operation).collect();
        assert_eq!(
            ops,
            vec![
                "create_task",
                "add_voltage_channel",
                "add_voltage_channel",
                "configure_clock",
                "configure_digital_trigger",
                "start_task",
                "stop_task",
                "clear_task",
            ]
        );
        assert_eq!(handle.live_tasks(), 0);
        assert_eq!(handle.max_live_tasks(), 1);
        assert!(!daq.has_task());
    }

    #[test]
    fn test_second_task_is_rejected() {
        let (mut daq, handle) = MockDaq::new(MockDaqConfig::scripted());
        daq.create_task("a").unwrap();
        assert!(daq.create_task("b").is_err());
        assert_eq!(handle.live_tasks(), 1);
    }

    #[test]
    fn test_fail_first_then_succeed() {
        let (mut daq, handle) = MockDaq::new(MockDaqConfig::scripted());
        handle.inject(FaultInjection::FailFirst {
            operation: "create_task",
            count: 2,
        });

        assert!(daq.create_task("t").is_err());
        assert!(daq.create_task("t").is_err());
        assert!(daq.create_task("t").is_ok());
        assert_eq!(handle.count("create_task"), 3);
        assert_eq!(handle.successes("create_task"), 1);
    }

    #[test]
    fn test_read_times_out_without_trigger() {
        let (mut daq, _handle) = armed(MockDaqConfig::scripted());
        let mut buffer = vec![0.0; 20];
        let start = Instant::now();
        let read = daq
            .read_data(&mut buffer, 10, FillMode::GroupByChannel, Duration::from_millis(30))
            .unwrap();
        assert_eq!(read, 0);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_queued_capture_is_delivered() {
        let (mut daq, handle) = armed(MockDaqConfig::scripted());
        handle.queue_capture((0..20).map(f64::from).collect());

        let mut buffer = vec![0.0; 20];
        let read = daq
            .read_data(&mut buffer, 10, FillMode::GroupByChannel, Duration::from_secs(1))
            .unwrap();
        assert_eq!(read, 10);
        assert_eq!(buffer[0], 0.0);
        assert_eq!(buffer[10], 10.0);
        assert_eq!(handle.reads_completed(), 1);
    }

    #[test]
    fn test_queued_capture_interleaved() {
        let (mut daq, handle) = armed(MockDaqConfig::scripted());
        handle.queue_capture(vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);

        let mut buffer = vec![0.0; 6];
        let read = daq
            .read_data(&mut buffer, 3, FillMode::GroupByScanNumber, Duration::from_secs(1))
            .unwrap();
        assert_eq!(read, 3);
        assert_eq!(buffer, vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0]);
    }

    #[test]
    fn test_synthetic_trigger_produces_full_capture() {
        let config = MockDaqConfig {
            trigger_period_ms: Some(5),
            ..MockDaqConfig::default()
        };
        let (mut daq, _handle) = armed(config);
        let mut buffer = vec![f64::NAN; 20];
        let read = daq
            .read_data(&mut buffer, 10, FillMode::GroupByChannel, Duration::from_secs(1))
            .unwrap();
        assert_eq!(read, 10);
        assert!(buffer.iter().all(|v| v.is_finite() && v.abs() < 0.2));
    }

    #[test]
    fn test_read_before_start_fails() {
        let (mut daq, _handle) = MockDaq::new(MockDaqConfig::scripted());
        daq.create_task("t").unwrap();
        let mut buffer = vec![0.0; 4];
        assert!(daq
            .read_data(&mut buffer, 2, FillMode::GroupByChannel, Duration::from_millis(1))
            .is_err());
    }

    #[test]
    fn test_clear_releases_handle_even_on_fault() {
        let (mut daq, handle) = MockDaq::new(MockDaqConfig::scripted());
        handle.inject(FaultInjection::FailAlways {
            operation: "clear_task",
        });
        daq.create_task("t").unwrap();
        assert!(daq.clear_task().is_err());
        assert!(!daq.has_task());
        assert_eq!(handle.live_tasks(), 0);
    }
}
