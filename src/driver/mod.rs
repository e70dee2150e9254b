//! Hardware driver adapter.
//!
//! [`DaqDriver`] mirrors the task lifecycle of the native acquisition library:
//!
//! ```text
//! create_task → add_voltage_channel (×N) → configure_clock
//!             → configure_digital_trigger → start_task
//!             → read_data (0..n) → stop_task → clear_task
//! ```
//!
//! The calls are synchronous and may block (`read_data` blocks until the
//! trigger fires or the timeout elapses). Implementations are not assumed to
//! be reentrant, so a driver value is owned by exactly one thread: the
//! acquisition worker.
//!
//! Two backends are provided:
//! - [`VkDaqLibrary`] - the native `libvkdaq` library, loaded at runtime
//! - [`MockDaq`] - a simulated device with fault injection, used by the
//!   `--mock` mode and by the tests

pub mod error;
pub mod mock;
pub mod vkdaq;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{DriverError, DriverResult};
pub use mock::{DriverCall, FaultInjection, MockDaq, MockDaqConfig, MockHandle};
pub use vkdaq::VkDaqLibrary;

/// Signal edge used for the sample clock and for the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    /// Low-to-high transition
    #[default]
    Rising,
    /// High-to-low transition
    Falling,
}

/// Sample clock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleMode {
    /// Acquire a fixed number of samples per channel per trigger
    #[default]
    Finite,
    /// Acquire until stopped
    Continuous,
}

/// Layout of multi-channel data in the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// `[ch0_s0, ch0_s1, ..., ch1_s0, ch1_s1, ...]`
    #[default]
    GroupByChannel,
    /// `[s0_ch0, s0_ch1, ..., s1_ch0, s1_ch1, ...]`
    GroupByScanNumber,
}

/// Analog input terminal configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalConfig {
    /// Device default
    #[default]
    Default,
    /// Referenced single-ended
    Rse,
    /// Non-referenced single-ended
    Nrse,
    /// Differential
    Differential,
}

/// One analog voltage input channel of the acquisition task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDefinition {
    /// Physical channel name, e.g. `dev1/AIN1`
    pub name: String,
    /// Lower bound of the expected input range in volts
    #[serde(default = "default_range_min")]
    pub range_min: f64,
    /// Upper bound of the expected input range in volts
    #[serde(default = "default_range_max")]
    pub range_max: f64,
    /// Terminal configuration
    #[serde(default)]
    pub terminal: TerminalConfig,
}

impl ChannelDefinition {
    /// Channel with the default ±0.2 V range.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            range_min: default_range_min(),
            range_max: default_range_max(),
            terminal: TerminalConfig::Default,
        }
    }
}

/// Digital edge trigger that starts each capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Digital line carrying the trigger, e.g. `dev1/DIN1.1`
    pub source: String,
    /// Edge that fires the trigger
    #[serde(default)]
    pub edge: Edge,
    /// Retrigger count passed to the driver
    #[serde(default)]
    pub retrigger_count: u32,
}

impl Default for TriggerDefinition {
    fn default() -> Self {
        Self {
            source: "dev1/DIN1.1".to_string(),
            edge: Edge::Rising,
            retrigger_count: 0,
        }
    }
}

fn default_range_min() -> f64 {
    -0.2
}

fn default_range_max() -> f64 {
    0.2
}

/// Synchronous task lifecycle of a multi-channel analog input device.
///
/// The adapter keeps the handle of the current task and nothing else. All
/// calls other than [`create_task`](DaqDriver::create_task) operate on that
/// task and fail with [`DriverError::NoTask`] when none exists.
pub trait DaqDriver: Send {
    /// Create a new task named `name` and make it the current task.
    fn create_task(&mut self, name: &str) -> DriverResult<()>;

    /// Add an analog voltage input channel to the current task.
    fn add_voltage_channel(&mut self, channel: &ChannelDefinition) -> DriverResult<()>;

    /// Configure the onboard sample clock.
    fn configure_clock(
        &mut self,
        rate_hz: f64,
        edge: Edge,
        mode: SampleMode,
        samples_per_channel: u64,
    ) -> DriverResult<()>;

    /// Configure a digital edge reference trigger.
    fn configure_digital_trigger(&mut self, trigger: &TriggerDefinition) -> DriverResult<()>;

    /// Arm the current task.
    fn start_task(&mut self) -> DriverResult<()>;

    /// Block until `points_per_channel` points are captured or `timeout`
    /// elapses, filling `buffer` according to `fill_mode`.
    ///
    /// Returns the number of points read per channel; `0` means the timeout
    /// elapsed without a trigger.
    fn read_data(
        &mut self,
        buffer: &mut [f64],
        points_per_channel: usize,
        fill_mode: FillMode,
        timeout: Duration,
    ) -> DriverResult<usize>;

    /// Stop the current task.
    fn stop_task(&mut self) -> DriverResult<()>;

    /// Release the current task. The adapter holds no task afterwards, even
    /// if the native call fails.
    fn clear_task(&mut self) -> DriverResult<()>;

    /// Whether a task handle is currently held.
    fn has_task(&self) -> bool;
}

impl<D: DaqDriver + ?Sized> DaqDriver for Box<D> {
    fn create_task(&mut self, name: &str) -> DriverResult<()> {
        (**self).create_task(name)
    }

    fn add_voltage_channel(&mut self, channel: &ChannelDefinition) -> DriverResult<()> {
        (**self).add_voltage_channel(channel)
    }

    fn configure_clock(
        &mut self,
        rate_hz: f64,
        edge: Edge,
        mode: SampleMode,
        samples_per_channel: u64,
    ) -> DriverResult<()> {
        (**self).configure_clock(rate_hz, edge, mode, samples_per_channel)
    }

    fn configure_digital_trigger(&mut self, trigger: &TriggerDefinition) -> DriverResult<()> {
        (**self).configure_digital_trigger(trigger)
    }

    fn start_task(&mut self) -> DriverResult<()> {
        (**self).start_task()
    }

    fn read_data(
        &mut self,
        buffer: &mut [f64],
        points_per_channel: usize,
        fill_mode: FillMode,
        timeout: Duration,
    ) -> DriverResult<usize> {
        (**self).read_data(buffer, points_per_channel, fill_mode, timeout)
    }

    fn stop_task(&mut self) -> DriverResult<()> {
        (**self).stop_task()
    }

    fn clear_task(&mut self) -> DriverResult<()> {
        (**self).clear_task()
    }

    fn has_task(&self) -> bool {
        (**self).has_task()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_definition_defaults() {
        let channel = ChannelDefinition::new("dev1/AIN1");
        assert_eq!(channel.range_min, -0.2);
        assert_eq!(channel.range_max, 0.2);
        assert_eq!(channel.terminal, TerminalConfig::Default);
    }

    #[test]
    fn test_trigger_deserializes_with_defaults() {
        let trigger: TriggerDefinition =
            serde_json::from_str(r#"{"source": "dev1/DIN1.2"}"#).unwrap();
        assert_eq!(trigger.source, "dev1/DIN1.2");
        assert_eq!(trigger.edge, Edge::Rising);
        assert_eq!(trigger.retrigger_count, 0);
    }
}
