//! # VkDaq Server Library
//!
//! Trigger-driven acquisition server: a background worker samples analog
//! input channels through the native `libvkdaq` driver each time a digital
//! trigger fires, and HTTP clients read the most recent capture.
//!
//! ## Crate Structure
//!
//! - **`driver`**: The `DaqDriver` trait over the native task lifecycle, with
//!   the runtime-loaded `VkDaqLibrary` backend and the simulated `MockDaq`.
//! - **`acquisition`**: Shared acquisition state and the worker thread that
//!   owns the hardware task.
//! - **`control`**: Request-side operations (configure, read channel, status).
//! - **`server`**: hyper routes onto the control surface.
//! - **`config`**: Figment-based configuration loading and validation.
//! - **`logging`**: tracing-subscriber initialization.
//! - **`error`**: Application error types.

pub mod acquisition;
pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod logging;
pub mod server;

pub use acquisition::{AcquisitionState, AcquisitionWorker, Configuration, WorkerHandle};
pub use config::ServerConfig;
pub use control::ControlSurface;
pub use error::{AppResult, DaqError, ValidationError};
