//! gpusched-core: Core types for the gpusched GPU job scheduler
//!
//! This crate provides the fundamental types used throughout the system:
//! - GPU device snapshots and admission thresholds
//! - Job requests, jobs and the job state machine
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod job;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use job::*;
