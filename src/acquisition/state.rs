//! Shared acquisition state.
//!
//! [`AcquisitionState`] is the only value shared between the acquisition
//! worker and the HTTP handlers:
//!
//! - the latest [`Snapshot`], swapped as a whole behind an `Arc` so readers
//!   copy out a pointer and never see channel data from two captures
//! - the desired [`Configuration`] and its pending-reinit flag, which live
//!   under one lock so the flag can never be consumed against a newer
//!   configuration than the one returned with it
//! - the worker phase and counters, for status reporting
//!
//! Every critical section is a pointer swap or a small copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Sample rate and capture length applied to the hardware task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Configuration {
    /// Sample clock rate in Hz
    pub sample_rate_hz: u32,
    /// Points captured per channel per trigger
    pub points_per_channel: u32,
}

impl Configuration {
    /// Create a configuration.
    pub fn new(sample_rate_hz: u32, points_per_channel: u32) -> Self {
        Self {
            sample_rate_hz,
            points_per_channel,
        }
    }
}

/// Samples of one channel within a capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSamples {
    /// Physical channel name
    pub name: String,
    /// Samples in volts
    pub samples: Vec<f64>,
}

/// One complete capture. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    channels: Vec<ChannelSamples>,
    captured_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build a snapshot. Returns `None` when the channels differ in length or
    /// any channel is empty, since such a capture is partial.
    pub fn new(channels: Vec<ChannelSamples>, captured_at: DateTime<Utc>) -> Option<Self> {
        let len = channels.first()?.samples.len();
        if len == 0 || channels.iter().any(|ch| ch.samples.len() != len) {
            return None;
        }
        Some(Self {
            channels,
            captured_at,
        })
    }

    /// Capture time.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Samples of the 1-based channel `id`.
    pub fn channel(&self, id: usize) -> Option<&ChannelSamples> {
        id.checked_sub(1).and_then(|index| self.channels.get(index))
    }

    /// All channels in acquisition order.
    pub fn channels(&self) -> &[ChannelSamples] {
        &self.channels
    }

    /// Points per channel.
    pub fn points_per_channel(&self) -> usize {
        self.channels.first().map_or(0, |ch| ch.samples.len())
    }
}

/// Phase of the acquisition worker's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    /// No hardware task
    #[default]
    Idle,
    /// Creating and configuring the hardware task
    Initializing,
    /// Task started, waiting for the trigger
    Armed,
    /// Capture read, snapshot being published
    Publishing,
    /// A driver call failed; re-initialization pending
    Faulted,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Armed => "armed",
            Self::Publishing => "publishing",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Counters maintained by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcquisitionStats {
    /// Snapshots published
    pub captures: u64,
    /// Driver faults handled
    pub faults: u64,
    /// Successful task initializations
    pub initializations: u64,
    /// Published reads that returned fewer points than requested
    pub short_reads: u64,
    /// Message of the most recent fault
    pub last_fault: Option<String>,
}

#[derive(Debug)]
struct ConfigSlot {
    desired: Configuration,
    applied: Option<Configuration>,
    pending_reinit: bool,
}

/// Concurrency-safe hand-off between the worker and the request handlers.
#[derive(Debug)]
pub struct AcquisitionState {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    config: Mutex<ConfigSlot>,
    phase: RwLock<WorkerPhase>,
    captures: AtomicU64,
    faults: AtomicU64,
    initializations: AtomicU64,
    short_reads: AtomicU64,
    last_fault: Mutex<Option<String>>,
}

impl AcquisitionState {
    /// Create state holding `initial` as the desired configuration, with
    /// re-initialization pending so the worker starts by applying it.
    pub fn new(initial: Configuration) -> Self {
        Self {
            snapshot: RwLock::new(None),
            config: Mutex::new(ConfigSlot {
                desired: initial,
                applied: None,
                pending_reinit: true,
            }),
            phase: RwLock::new(WorkerPhase::Idle),
            captures: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            initializations: AtomicU64::new(0),
            short_reads: AtomicU64::new(0),
            last_fault: Mutex::new(None),
        }
    }

    /// Replace the stored snapshot.
    pub fn publish(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = Some(snapshot);
        self.captures.fetch_add(1, Ordering::Relaxed);
    }

    /// Current snapshot, or `None` before the first capture.
    pub fn read_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().clone()
    }

    /// Store a new desired configuration and request re-initialization.
    pub fn set_desired_configuration(&self, config: Configuration) {
        let mut slot = self.config.lock();
        slot.desired = config;
        slot.pending_reinit = true;
    }

    /// Request re-initialization with the current desired configuration.
    pub fn rearm_reinit(&self) {
        self.config.lock().pending_reinit = true;
    }

    /// Take the pending-reinit flag together with the configuration to apply.
    pub fn consume_pending_reinit(&self) -> Option<Configuration> {
        let mut slot = self.config.lock();
        if slot.pending_reinit {
            slot.pending_reinit = false;
            Some(slot.desired)
        } else {
            None
        }
    }

    /// Whether re-initialization is pending.
    pub fn reinit_pending(&self) -> bool {
        self.config.lock().pending_reinit
    }

    /// Most recently requested configuration.
    pub fn desired_configuration(&self) -> Configuration {
        self.config.lock().desired
    }

    /// Configuration of the live hardware task, if any.
    pub fn applied_configuration(&self) -> Option<Configuration> {
        self.config.lock().applied
    }

    /// Record the configuration of a successfully started task.
    pub fn mark_applied(&self, config: Configuration) {
        self.config.lock().applied = Some(config);
        self.initializations.fetch_add(1, Ordering::Relaxed);
    }

    /// Forget the applied configuration after the task was torn down.
    pub fn clear_applied(&self) {
        self.config.lock().applied = None;
    }

    /// Set the worker phase.
    pub fn set_phase(&self, phase: WorkerPhase) {
        *self.phase.write() = phase;
    }

    /// Current worker phase.
    pub fn phase(&self) -> WorkerPhase {
        *self.phase.read()
    }

    /// Record a handled driver fault.
    pub fn record_fault(&self, message: impl Into<String>) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        *self.last_fault.lock() = Some(message.into());
    }

    /// Record a read that returned fewer points than requested.
    pub fn record_short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of the counters.
    pub fn stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            captures: self.captures.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            initializations: self.initializations.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            last_fault: self.last_fault.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn snapshot(ch1: Vec<f64>, ch2: Vec<f64>) -> Snapshot {
        Snapshot::new(
            vec![
                ChannelSamples {
                    name: "dev1/AIN1".into(),
                    samples: ch1,
                },
                ChannelSamples {
                    name: "dev1/AIN2".into(),
                    samples: ch2,
                },
            ],
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_starts_with_pending_reinit() {
        let state = AcquisitionState::new(Configuration::new(3990, 390));
        assert!(state.read_snapshot().is_none());
        assert_eq!(
            state.consume_pending_reinit(),
            Some(Configuration::new(3990, 390))
        );
        assert_eq!(state.consume_pending_reinit(), None);
        assert_eq!(state.phase(), WorkerPhase::Idle);
    }

    #[test]
    fn test_consume_returns_latest_configuration() {
        let state = AcquisitionState::new(Configuration::new(1000, 10));
        state.consume_pending_reinit();

        state.set_desired_configuration(Configuration::new(2000, 20));
        state.set_desired_configuration(Configuration::new(3000, 30));
        assert_eq!(
            state.consume_pending_reinit(),
            Some(Configuration::new(3000, 30))
        );
        assert!(!state.reinit_pending());
    }

    #[test]
    fn test_rearm_keeps_desired_configuration() {
        let state = AcquisitionState::new(Configuration::new(1000, 10));
        state.consume_pending_reinit();
        state.rearm_reinit();
        assert_eq!(
            state.consume_pending_reinit(),
            Some(Configuration::new(1000, 10))
        );
    }

    #[test]
    fn test_publish_replaces_snapshot() {
        let state = AcquisitionState::new(Configuration::new(1000, 3));
        state.publish(snapshot(vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]));
        let first = state.read_snapshot().unwrap();

        state.publish(snapshot(vec![7.0, 8.0, 9.0], vec![1.0, 1.0, 1.0]));
        let second = state.read_snapshot().unwrap();

        // Readers holding the old Arc keep a consistent view.
        assert_eq!(first.channel(1).unwrap().samples, vec![1.0, 2.0, 3.0]);
        assert_eq!(second.channel(1).unwrap().samples, vec![7.0, 8.0, 9.0]);
        assert_eq!(state.stats().captures, 2);
    }

    #[test]
    fn test_snapshot_rejects_partial_capture() {
        let mismatched = Snapshot::new(
            vec![
                ChannelSamples {
                    name: "a".into(),
                    samples: vec![1.0, 2.0],
                },
                ChannelSamples {
                    name: "b".into(),
                    samples: vec![1.0],
                },
            ],
            Utc::now(),
        );
        assert!(mismatched.is_none());
        assert!(Snapshot::new(vec![], Utc::now()).is_none());
    }

    #[test]
    fn test_channel_ids_are_one_based() {
        let snap = snapshot(vec![1.0], vec![2.0]);
        assert!(snap.channel(0).is_none());
        assert_eq!(snap.channel(2).unwrap().samples, vec![2.0]);
        assert!(snap.channel(3).is_none());
        assert_eq!(snap.points_per_channel(), 1);
    }

    #[test]
    fn test_concurrent_readers_never_mix_captures() {
        let state = Arc::new(AcquisitionState::new(Configuration::new(1000, 64)));

        let writer = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                for capture in 0..2000u32 {
                    let value = f64::from(capture);
                    state.publish(snapshot(vec![value; 64], vec![-value; 64]));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for _ in 0..5000 {
                        if let Some(snap) = state.read_snapshot() {
                            let ch1 = &snap.channel(1).unwrap().samples;
                            let ch2 = &snap.channel(2).unwrap().samples;
                            assert_eq!(ch1.len(), ch2.len());
                            assert!(ch1.iter().all(|v| *v == ch1[0]));
                            assert!(ch1.iter().zip(ch2).all(|(a, b)| *a == -*b));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_fault_counters() {
        let state = AcquisitionState::new(Configuration::new(1000, 10));
        state.record_fault("start_task failed");
        state.record_short_read();
        state.mark_applied(Configuration::new(1000, 10));

        let stats = state.stats();
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.short_reads, 1);
        assert_eq!(stats.initializations, 1);
        assert_eq!(stats.last_fault.as_deref(), Some("start_task failed"));
        assert_eq!(
            state.applied_configuration(),
            Some(Configuration::new(1000, 10))
        );
    }
}
