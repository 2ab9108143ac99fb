//! Queue-driven media processing worker.
//!
//! This crate provides:
//! - Job executor with per-type limits and queue backpressure
//! - Staged pipeline (download, process, upload, cleanup)
//! - Zip batch expansion into child jobs
//! - Temp file tracking per job
//! - Graceful shutdown

pub mod config;
pub mod error;
pub mod executor;
pub mod keys;
pub mod limiter;
pub mod logging;
pub mod pipeline;
pub mod temp_files;
pub mod zip_batch;

pub use config::WorkerConfig;
pub use error::{StageError, WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use limiter::{ConcurrencyLimiter, ConcurrencyToken};
pub use logging::JobLogger;
pub use pipeline::{JobOutcome, MediaPipeline};
pub use temp_files::{CleanupReport, FileRole, FileStage, TempFileRecord, TempFileTracker};
pub use zip_batch::{BatchReport, ScanResult, ZipBatchExpander};
