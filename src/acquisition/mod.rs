//! Acquisition-and-publish core.
//!
//! - [`state`]: the lock-guarded hand-off between the worker and the HTTP
//!   handlers (latest snapshot, desired configuration, status)
//! - [`worker`]: the background loop that owns the hardware task

pub mod state;
pub mod worker;

pub use state::{
    AcquisitionState, AcquisitionStats, ChannelSamples, Configuration, Snapshot, WorkerPhase,
};
pub use worker::{split_channels, AcquisitionWorker, WorkerHandle, WorkerSettings};
