//! Device placement for count-based requests

use gpusched_core::{DeviceId, GpuStatus, PlacementKind};
use std::sync::Arc;

/// Strategy for choosing which available devices a job gets
pub trait PlacementStrategy: Send + Sync {
    /// Choose `count` devices from `candidates`, or `None` if there are too few
    ///
    /// Every candidate is available and unclaimed. The result is sorted by id.
    fn select(&self, candidates: &[&GpuStatus], count: usize) -> Option<Vec<DeviceId>>;

    /// Get the strategy name
    fn name(&self) -> &'static str;
}

/// Strategy for a configured placement kind
pub fn placement_for(kind: PlacementKind) -> Arc<dyn PlacementStrategy> {
    match kind {
        PlacementKind::BestFit => Arc::new(BestFitPlacement),
        PlacementKind::FirstFit => Arc::new(FirstFitPlacement),
    }
}

/// Most free memory first, ties by ascending id
pub struct BestFitPlacement;

impl PlacementStrategy for BestFitPlacement {
    fn select(&self, candidates: &[&GpuStatus], count: usize) -> Option<Vec<DeviceId>> {
        if candidates.len() < count {
            return None;
        }

        let mut ranked: Vec<&GpuStatus> = candidates.to_vec();
        ranked.sort_by(|a, b| {
            b.device
                .free_memory_mb
                .cmp(&a.device.free_memory_mb)
                .then_with(|| a.device.id.cmp(&b.device.id))
        });

        Some(take_sorted(&ranked, count))
    }

    fn name(&self) -> &'static str {
        "best-fit"
    }
}

/// Lowest ids first
pub struct FirstFitPlacement;

impl PlacementStrategy for FirstFitPlacement {
    fn select(&self, candidates: &[&GpuStatus], count: usize) -> Option<Vec<DeviceId>> {
        if candidates.len() < count {
            return None;
        }

        let mut ranked: Vec<&GpuStatus> = candidates.to_vec();
        ranked.sort_by_key(|s| s.device.id);

        Some(take_sorted(&ranked, count))
    }

    fn name(&self) -> &'static str {
        "first-fit"
    }
}

fn take_sorted(ranked: &[&GpuStatus], count: usize) -> Vec<DeviceId> {
    let mut ids: Vec<DeviceId> = ranked.iter().take(count).map(|s| s.device.id).collect();
    ids.sort_unstable();
    ids
}
