//! gpusched-scheduler: scheduling engine for gpusched
//!
//! This crate owns the scheduling state and the loop that advances it:
//! - Device monitoring with a cached snapshot
//! - The job store and its state machine
//! - Device allocation and placement
//! - The scheduler loop tying them to a process supervisor

pub mod allocator;
pub mod monitor;
pub mod placement;
pub mod scheduler;
pub mod store;

pub use allocator::{allocate, availability, Allocation};
pub use monitor::DeviceMonitor;
pub use placement::{placement_for, BestFitPlacement, FirstFitPlacement, PlacementStrategy};
pub use scheduler::{EngineStatus, GpuReport, JobDetail, Scheduler, TickReport};
pub use store::{CancelOutcome, JobCounts, JobStore};
