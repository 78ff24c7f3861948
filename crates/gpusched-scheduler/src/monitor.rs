//! Device monitor with a cached snapshot

use gpusched_core::{DeviceSnapshot, SchedError};
use gpusched_runtime::DeviceQuery;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Polls a device query and keeps the latest result
///
/// Readers always get the last snapshot. A failed or timed-out query keeps
/// the previous device list but flags the snapshot as degraded, and no new
/// work is assigned until a query succeeds again.
pub struct DeviceMonitor {
    query: Arc<dyn DeviceQuery>,
    timeout: Duration,
    latest: RwLock<DeviceSnapshot>,
}

impl DeviceMonitor {
    /// Create a monitor; the snapshot is empty until the first refresh
    pub fn new(query: Arc<dyn DeviceQuery>, timeout: Duration) -> Self {
        Self {
            query,
            timeout,
            latest: RwLock::new(DeviceSnapshot::default()),
        }
    }

    /// Backend name of the underlying query
    pub fn backend(&self) -> &'static str {
        self.query.name()
    }

    /// Last known snapshot
    pub async fn snapshot(&self) -> DeviceSnapshot {
        self.latest.read().await.clone()
    }

    /// Query the devices and replace the snapshot
    pub async fn refresh(&self) -> DeviceSnapshot {
        let result = match tokio::time::timeout(self.timeout, self.query.query()).await {
            Ok(result) => result,
            Err(_) => Err(SchedError::DeviceQuery(format!(
                "device query timed out after {}s",
                self.timeout.as_secs()
            ))),
        };

        let mut latest = self.latest.write().await;
        match result {
            Ok(devices) => {
                if latest.degraded {
                    info!(gpus = devices.len(), "Device query recovered");
                }
                *latest = DeviceSnapshot::fresh(devices);
                debug!(gpus = latest.device_count(), "Device snapshot refreshed");
            }
            Err(e) => {
                if latest.degraded {
                    debug!(error = %e, "Device query still failing");
                } else {
                    warn!(
                        backend = self.query.name(),
                        error = %e,
                        "Device query failed, holding new assignments"
                    );
                }
                latest.degraded = true;
                latest.error = Some(e.to_string());
            }
        }

        latest.clone()
    }
}
