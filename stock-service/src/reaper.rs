use std::time::Duration;

use tokio::time;
use tracing::error;

use crate::reservation::ReservationLifecycleManager;

pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 30;
/// Batch expiry and safety-stock recalculation run every Nth reap tick.
pub const DEFAULT_MAINTENANCE_EVERY: u64 = 120;

/// Periodic job that releases reservations past their expiry deadline, and on
/// a slower cadence expires stock batches and recalculates safety stock.
///
/// Safe to run from multiple instances: every release underneath is a
/// conditional update, so concurrent reapers reap each row once.
pub struct ExpiryReaper {
    manager: ReservationLifecycleManager,
    interval: Duration,
    maintenance_every: u64,
}

impl ExpiryReaper {
    pub fn new(manager: ReservationLifecycleManager) -> Self {
        Self {
            manager,
            interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
            maintenance_every: DEFAULT_MAINTENANCE_EVERY,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);
        let mut tick: u64 = 0;
        loop {
            interval.tick().await;
            tick += 1;

            if let Err(e) = self.manager.release_expired().await {
                error!("error releasing expired reservations: {}", e);
            }

            if tick % self.maintenance_every == 0 {
                if let Err(e) = self.manager.expire_stock_batches().await {
                    error!("error expiring stock batches: {}", e);
                }
                if let Err(e) = self.manager.recalculate_safety_stock().await {
                    error!("error recalculating safety stock: {}", e);
                }
            }
        }
    }
}
