//! Request-side operations on the acquisition state.
//!
//! [`ControlSurface`] is what the HTTP handlers call. It never touches the
//! driver: `configure` only records the desired configuration and returns,
//! and reads copy out of the latest published snapshot.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::acquisition::{AcquisitionState, AcquisitionStats, Configuration, WorkerPhase};
use crate::error::{AppResult, DaqError, ValidationError};

/// Sample rate used when `/configure` omits `sample_rate`.
pub const DEFAULT_SAMPLE_RATE_HZ: i64 = 3990;

/// Capture length used when `/configure` omits `points`.
pub const DEFAULT_POINTS: i64 = 400;

/// Upper bounds accepted by [`ControlSurface::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted sample rate in Hz
    pub max_sample_rate_hz: u32,
    /// Largest accepted points per channel
    pub max_points_per_channel: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_sample_rate_hz: 1_000_000,
            max_points_per_channel: 1_000_000,
        }
    }
}

/// Data served for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReport {
    /// Capture time, or the request time for the placeholder
    pub captured_at: DateTime<Utc>,
    /// Samples in volts
    pub samples: Vec<f64>,
    /// No capture has been published yet
    pub placeholder: bool,
}

impl ChannelReport {
    /// Report served before the first capture: the current time and one `0.0`.
    pub fn placeholder() -> Self {
        Self {
            captured_at: Utc::now(),
            samples: vec![0.0],
            placeholder: true,
        }
    }

    /// Plain-text body: Unix timestamp, then one sample per line.
    pub fn render(&self) -> String {
        let mut body = format_timestamp(self.captured_at);
        for value in &self.samples {
            let _ = write!(body, "\n{value:.6}");
        }
        body
    }
}

/// Unix timestamp as decimal seconds with microsecond precision.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

/// Status document served at `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Server name
    pub name: String,
    /// Worker phase
    pub phase: WorkerPhase,
    /// Most recently requested configuration
    pub desired: Configuration,
    /// Configuration of the live hardware task
    pub applied: Option<Configuration>,
    /// Re-initialization requested and not yet picked up
    pub reinit_pending: bool,
    /// Physical channel names, in channel id order
    pub channels: Vec<String>,
    /// Time of the latest capture
    pub last_capture: Option<DateTime<Utc>>,
    /// Points per channel of the latest capture
    pub last_capture_points: Option<usize>,
    /// Worker counters
    pub stats: AcquisitionStats,
}

/// HTTP-facing operations.
#[derive(Debug, Clone)]
pub struct ControlSurface {
    state: Arc<AcquisitionState>,
    limits: Limits,
    channels: Vec<String>,
    name: String,
}

impl ControlSurface {
    /// Create a control surface over `state`.
    pub fn new(
        state: Arc<AcquisitionState>,
        limits: Limits,
        channels: Vec<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            state,
            limits,
            channels,
            name: name.into(),
        }
    }

    /// Shared acquisition state.
    pub fn state(&self) -> &Arc<AcquisitionState> {
        &self.state
    }

    /// Number of configured channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Request a new sample rate and capture length.
    ///
    /// Validation failures leave the state untouched. On success the worker
    /// picks the configuration up after its current read; this call does not
    /// wait for it.
    pub fn configure(
        &self,
        sample_rate_hz: i64,
        points_per_channel: i64,
    ) -> Result<Configuration, ValidationError> {
        let sample_rate_hz =
            check_range("sample_rate", sample_rate_hz, self.limits.max_sample_rate_hz)?;
        let points_per_channel =
            check_range("points", points_per_channel, self.limits.max_points_per_channel)?;

        let config = Configuration::new(sample_rate_hz, points_per_channel);
        self.state.set_desired_configuration(config);
        info!(
            sample_rate_hz,
            points = points_per_channel,
            "Configuration requested"
        );
        Ok(config)
    }

    /// Latest samples of the 1-based channel `id`.
    pub fn read_channel(&self, id: usize) -> AppResult<ChannelReport> {
        if id == 0 || id > self.channels.len() {
            return Err(DaqError::UnknownChannel(id));
        }
        let Some(snapshot) = self.state.read_snapshot() else {
            return Ok(ChannelReport::placeholder());
        };
        let channel = snapshot.channel(id).ok_or(DaqError::UnknownChannel(id))?;
        Ok(ChannelReport {
            captured_at: snapshot.captured_at(),
            samples: channel.samples.clone(),
            placeholder: false,
        })
    }

    /// Current status.
    pub fn status(&self) -> StatusReport {
        let snapshot = self.state.read_snapshot();
        StatusReport {
            name: self.name.clone(),
            phase: self.state.phase(),
            desired: self.state.desired_configuration(),
            applied: self.state.applied_configuration(),
            reinit_pending: self.state.reinit_pending(),
            channels: self.channels.clone(),
            last_capture: snapshot.as_ref().map(|s| s.captured_at()),
            last_capture_points: snapshot.as_ref().map(|s| s.points_per_channel()),
            stats: self.state.stats(),
        }
    }

    /// HTML status page served at `/`.
    pub fn index_html(&self) -> String {
        let status = self.status();
        let mut page = format!(
            "<html><body><h1>{}</h1><p>Server is running.</p>",
            escape_html(&status.name)
        );
        let _ = write!(page, "<p>Phase: {}</p>", status.phase);
        let _ = write!(
            page,
            "<p>Sample rate: {} Hz, points per channel: {}</p>",
            status.desired.sample_rate_hz, status.desired.points_per_channel
        );
        page.push_str("<ul>");
        for (index, name) in status.channels.iter().enumerate() {
            let id = index + 1;
            let _ = write!(
                page,
                "<li><a href=\"/ch{id}.dat\">ch{id}.dat</a> {}</li>",
                escape_html(name)
            );
        }
        page.push_str("</ul></body></html>");
        page
    }
}

/// Parse an optional integer request parameter.
pub fn parse_param(
    field: &'static str,
    raw: Option<&str>,
    default: i64,
) -> Result<i64, ValidationError> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| ValidationError::new(field, format!("'{raw}' is not an integer"))),
    }
}

fn check_range(field: &'static str, value: i64, max: u32) -> Result<u32, ValidationError> {
    if value <= 0 {
        return Err(ValidationError::new(field, "must be a positive integer"));
    }
    match u32::try_from(value) {
        Ok(value) if value <= max => Ok(value),
        _ => Err(ValidationError::new(field, format!("must not exceed {max}"))),
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
