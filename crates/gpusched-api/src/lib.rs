//! gpusched-api: HTTP API for gpusched
//!
//! This crate exposes the scheduler's typed operations over HTTP:
//! - Job submission, listing, detail and cancellation
//! - Device status
//! - Engine status

pub mod rest;

pub use rest::{create_router, SubmitJobRequest};
