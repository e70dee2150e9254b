//! Background acquisition loop.
//!
//! The worker owns the driver and is the only code that ever calls into it.
//! It runs on a dedicated thread because the driver's read call blocks until
//! the hardware trigger fires or the read timeout elapses.
//!
//! # State machine
//!
//! ```text
//!            start / reinit requested
//!   Idle ───────────────────────────────► Initializing
//!                                            │      │
//!                              task started  │      │ driver error
//!                                            ▼      ▼
//!        ┌──────────────────────────────► Armed   Faulted ──(backoff)──► Initializing
//!        │                                   │      ▲
//!        │ pause              capture read   │      │ read error
//!        │                                   ▼      │
//!        └──────────────────────────────  Publishing
//! ```
//!
//! Re-initialization always tears the current task down first (stop + clear,
//! best-effort) and rebuilds it in a fixed order: create task, add channels,
//! configure clock, configure trigger, start. Reads are never retried in
//! place; any driver error leads back through `Faulted` to a fresh task.
//!
//! Reconfiguration is cooperative: pending requests are picked up between
//! reads, never by interrupting a read already blocked in the driver.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use super::state::{AcquisitionState, ChannelSamples, Configuration, Snapshot, WorkerPhase};
use crate::driver::{
    ChannelDefinition, DaqDriver, DriverError, Edge, FillMode, SampleMode, TriggerDefinition,
};

/// Longest uninterrupted sleep while waiting out a pause or backoff.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Fixed parameters of the hardware task and of the loop timing.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Channels in acquisition order; channel 1 is the first entry
    pub channels: Vec<ChannelDefinition>,
    /// Trigger that starts each capture
    pub trigger: TriggerDefinition,
    /// Upper bound on one blocking read
    pub read_timeout: Duration,
    /// Minimum delay between two captures
    pub capture_pause: Duration,
    /// Delay before re-initializing after a fault
    pub retry_backoff: Duration,
    /// Prefix of the hardware task name
    pub task_prefix: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            channels: vec![
                ChannelDefinition::new("dev1/AIN1"),
                ChannelDefinition::new("dev1/AIN2"),
            ],
            trigger: TriggerDefinition::default(),
            read_timeout: Duration::from_secs(1),
            capture_pause: Duration::from_millis(50),
            retry_backoff: Duration::from_secs(1),
            task_prefix: "VkDaqServer".to_string(),
        }
    }
}

/// Split a channel-grouped buffer into per-channel sequences.
///
/// The buffer holds `points` values for each channel, channel after channel;
/// the first segment belongs to the first channel. Returns `None` when the
/// buffer is too short to hold every channel.
pub fn split_channels(
    buffer: &[f64],
    channels: &[ChannelDefinition],
    points: usize,
) -> Option<Vec<ChannelSamples>> {
    if points == 0 || buffer.len() < points * channels.len() {
        return None;
    }
    Some(
        buffer
            .chunks_exact(points)
            .zip(channels)
            .map(|(segment, channel)| ChannelSamples {
                name: channel.name.clone(),
                samples: segment.to_vec(),
            })
            .collect(),
    )
}

/// Handle to a running worker thread.
///
/// Dropping the handle stops the worker and waits for it to exit.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to stop after its current blocking call.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop the worker and wait until it has released the hardware task.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.request_stop();
        if let Some(handle) = self.thread.take() {
            if let Err(e) = handle.join() {
                error!("Acquisition worker panicked: {:?}", e);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.join();
    }
}

/// The acquisition loop and the hardware task it owns.
pub struct AcquisitionWorker<D: DaqDriver> {
    driver: D,
    state: Arc<AcquisitionState>,
    settings: WorkerSettings,
    task_name: String,
    stop: Arc<AtomicBool>,
    phase: WorkerPhase,
    buffer: Vec<f64>,
}

impl<D: DaqDriver + 'static> AcquisitionWorker<D> {
    /// Create a worker publishing into `state`.
    pub fn new(driver: D, state: Arc<AcquisitionState>, settings: WorkerSettings) -> Self {
        let suffix: u16 = rand::thread_rng().gen_range(1000..=9999);
        let task_name = format!("{}_{}", settings.task_prefix, suffix);
        Self {
            driver,
            state,
            settings,
            task_name,
            stop: Arc::new(AtomicBool::new(false)),
            phase: WorkerPhase::Idle,
            buffer: Vec::new(),
        }
    }

    /// Name used for the hardware task.
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> io::Result<WorkerHandle> {
        let stop = Arc::clone(&self.stop);
        let thread = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || self.run())?;
        Ok(WorkerHandle {
            stop,
            thread: Some(thread),
        })
    }

    /// Run the loop on the current thread until a stop is requested.
    pub fn run(mut self) {
        info!(
            task = %self.task_name,
            channels = self.settings.channels.len(),
            "Acquisition worker started"
        );

        let mut active: Option<Configuration> = None;
        while !self.stop_requested() {
            if let Some(config) = self.state.consume_pending_reinit() {
                active = None;
                match self.initialize(config) {
                    Ok(()) => active = Some(config),
                    Err(err) => {
                        self.fault(&err);
                        continue;
                    }
                }
            }

            let Some(config) = active else {
                self.state.rearm_reinit();
                continue;
            };

            if let Err(err) = self.acquire(config) {
                active = None;
                self.fault(&err);
            }
        }

        self.teardown();
        self.state.clear_applied();
        self.transition(WorkerPhase::Idle);
        info!(task = %self.task_name, "Acquisition worker stopped");
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn transition(&mut self, phase: WorkerPhase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "Worker phase transition");
        }
        self.phase = phase;
        self.state.set_phase(phase);
    }

    /// Build and start a fresh hardware task for `config`.
    fn initialize(&mut self, config: Configuration) -> Result<(), DriverError> {
        self.transition(WorkerPhase::Initializing);
        self.teardown();
        self.state.clear_applied();

        let points = config.points_per_channel as usize;
        info!(
            sample_rate_hz = config.sample_rate_hz,
            points, "Initializing hardware task"
        );

        self.driver.create_task(&self.task_name)?;
        for channel in &self.settings.channels {
            self.driver.add_voltage_channel(channel)?;
        }
        self.driver.configure_clock(
            f64::from(config.sample_rate_hz),
            Edge::Rising,
            SampleMode::Finite,
            u64::from(config.points_per_channel),
        )?;
        self.driver
            .configure_digital_trigger(&self.settings.trigger)?;
        self.driver.start_task()?;

        self.buffer.clear();
        self.buffer
            .resize(points * self.settings.channels.len(), 0.0);
        self.state.mark_applied(config);
        info!(
            trigger = %self.settings.trigger.source,
            "Task started. Waiting for triggers"
        );
        self.transition(WorkerPhase::Armed);
        Ok(())
    }

    /// One blocking read on the armed task, publishing any positive read.
    ///
    /// The whole `points × channels` buffer is published even when the
    /// driver reports fewer points than requested.
    fn acquire(&mut self, config: Configuration) -> Result<(), DriverError> {
        let points = config.points_per_channel as usize;
        let read = self.driver.read_data(
            &mut self.buffer,
            points,
            FillMode::GroupByChannel,
            self.settings.read_timeout,
        )?;

        if read == 0 {
            trace!("Read timed out without trigger");
            return Ok(());
        }
        if read < points {
            warn!(read, expected = points, "Short read, publishing full buffer");
            self.state.record_short_read();
        }

        self.transition(WorkerPhase::Publishing);
        let snapshot = split_channels(&self.buffer, &self.settings.channels, points)
            .and_then(|channels| Snapshot::new(channels, Utc::now()));
        match snapshot {
            Some(snapshot) => {
                self.state.publish(snapshot);
                debug!(points = read, "Captured");
            }
            None => warn!(points, "Capture buffer did not hold every channel"),
        }
        self.transition(WorkerPhase::Armed);

        self.sleep_unless_stopped(self.settings.capture_pause);
        Ok(())
    }

    /// Enter `Faulted`, wait out the backoff and request re-initialization.
    fn fault(&mut self, err: &DriverError) {
        self.transition(WorkerPhase::Faulted);
        error!(error = %err, "Acquisition fault, re-initializing");
        self.state.record_fault(err.to_string());
        self.state.rearm_reinit();
        self.sleep_unless_stopped(self.settings.retry_backoff);
    }

    /// Stop and clear the live task. Failures are logged and ignored.
    fn teardown(&mut self) {
        if !self.driver.has_task() {
            return;
        }
        if let Err(e) = self.driver.stop_task() {
            warn!(error = %e, "Failed to stop task");
        }
        if let Err(e) = self.driver.clear_task() {
            warn!(error = %e, "Failed to clear task");
        }
    }

    fn sleep_unless_stopped(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }
}
