//! Device allocation
//!
//! Both functions here are pure: they take a device view and a job list and
//! decide, without I/O, which pending jobs can start and on which devices.

use gpusched_core::{
    scheduling_order, AdmissionThresholds, DeviceId, DeviceSnapshot, GpuRequest, GpuStatus, Job,
    JobId, JobState,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::placement::PlacementStrategy;

/// Devices approved for one pending job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub job_id: JobId,
    pub gpu_ids: Vec<DeviceId>,
}

/// Derive per-device availability
///
/// A device is available when it passes the thresholds and no running job
/// holds it. Nothing is available while the snapshot is degraded.
pub fn availability(
    snapshot: &DeviceSnapshot,
    thresholds: &AdmissionThresholds,
    held: &BTreeMap<DeviceId, JobId>,
) -> BTreeMap<DeviceId, GpuStatus> {
    snapshot
        .devices
        .values()
        .map(|device| {
            let assigned_job_id = held.get(&device.id).copied();
            let available =
                !snapshot.degraded && assigned_job_id.is_none() && device.meets(thresholds);
            (
                device.id,
                GpuStatus {
                    device: device.clone(),
                    available,
                    assigned_job_id,
                },
            )
        })
        .collect()
}

/// Decide which pending jobs start now
///
/// Jobs are visited in scheduling order, greedily and without backtracking.
/// A device claimed for one job is gone for every later job in the pass.
/// Jobs that do not fit are left out of the result and stay pending.
pub fn allocate(
    devices: &BTreeMap<DeviceId, GpuStatus>,
    pending_jobs: &[Job],
    placement: &dyn PlacementStrategy,
) -> Vec<Allocation> {
    let mut order: Vec<&Job> = pending_jobs
        .iter()
        .filter(|job| job.state == JobState::Pending)
        .collect();
    order.sort_by(|a, b| scheduling_order(a, b));

    let mut claimed: BTreeSet<DeviceId> = BTreeSet::new();
    let mut allocations = Vec::new();

    for job in order {
        let free = |id: &DeviceId| {
            !claimed.contains(id) && devices.get(id).map(|s| s.available).unwrap_or(false)
        };

        let chosen = match &job.gpus {
            GpuRequest::Ids(ids) => {
                if !ids.is_empty() && ids.iter().all(free) {
                    Some(ids.clone())
                } else {
                    None
                }
            }
            GpuRequest::Count(0) => None,
            GpuRequest::Count(n) => {
                let candidates: Vec<&GpuStatus> =
                    devices.values().filter(|s| free(&s.device.id)).collect();
                placement.select(&candidates, *n as usize)
            }
        };

        match chosen {
            Some(gpu_ids) => {
                claimed.extend(gpu_ids.iter().copied());
                allocations.push(Allocation {
                    job_id: job.id,
                    gpu_ids,
                });
            }
            None => debug!(job_id = job.id, gpus = ?job.gpus, "Job does not fit, stays pending"),
        }
    }

    allocations
}
