//! Idle disconnector
//!
//! Periodically disconnects peripherals nobody has touched for longer than
//! the keep-alive threshold. The sweep only requests disconnection; the
//! adapter's disconnect event is what zeroes the entry's timestamp.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adapter::{BleAdapter, RadioState};
use crate::connection::{now_millis, ConnectionCache};
use crate::registry::DeviceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleConfig {
    /// Idle time after which a connection is dropped
    pub keep_alive: Duration,
    /// Time between sweeps
    pub check_interval: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(180),
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub disconnected: Vec<String>,
    pub failed: Vec<String>,
    /// Stale entries without a registry record
    pub missing: Vec<String>,
}

pub struct IdleDisconnector {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<DeviceRegistry>,
    cache: Arc<ConnectionCache>,
    config: IdleConfig,
}

impl IdleDisconnector {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<DeviceRegistry>,
        cache: Arc<ConnectionCache>,
        config: IdleConfig,
    ) -> Self {
        Self {
            adapter,
            registry,
            cache,
            config,
        }
    }

    pub fn config(&self) -> IdleConfig {
        self.config
    }

    /// An entry is stale when it is connected (`last_access != 0`) and idle
    /// for strictly longer than the keep-alive threshold.
    pub fn is_stale(&self, last_access: u64, now: u64) -> bool {
        let keep_alive = self.config.keep_alive.as_millis() as u64;
        last_access != 0 && now.saturating_sub(last_access) > keep_alive
    }

    /// Disconnect every stale, radio-connected entry as of `now` (ms since
    /// the UNIX epoch).
    pub async fn sweep(&self, now: u64) -> SweepReport {
        let mut report = SweepReport::default();

        for entry in self.cache.snapshot() {
            report.checked += 1;
            if !self.is_stale(entry.last_access(), now) {
                continue;
            }
            let address = entry.address().to_string();

            if self.registry.find(&address).is_none() {
                warn!(address = %address, "idle entry has no registry record, skipping");
                report.missing.push(address);
                continue;
            }
            if self.adapter.radio_state(&address).await != RadioState::Connected {
                continue;
            }

            let idle_ms = now.saturating_sub(entry.last_access());
            match self.adapter.disconnect(&address).await {
                Ok(()) => {
                    info!(address = %address, idle_ms, "disconnected idle peripheral");
                    report.disconnected.push(address);
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "idle disconnect failed");
                    report.failed.push(address);
                }
            }
        }

        debug!(
            checked = report.checked,
            disconnected = report.disconnected.len(),
            "idle sweep done"
        );
        report
    }

    /// Run [`sweep`](Self::sweep) every check interval, starting one
    /// interval from now.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.check_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep(now_millis()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, MockBleAdapter, Node};
    use crate::normalize;

    const KEEP_ALIVE_MS: u64 = 180_000;

    fn fixture(mock: MockBleAdapter, addresses: &[&str]) -> (IdleDisconnector, Arc<ConnectionCache>) {
        let registry = Arc::new(DeviceRegistry::new());
        for address in addresses {
            registry.upsert(Node::new(*address));
        }
        let cache = Arc::new(ConnectionCache::new());
        let idle = IdleDisconnector::new(
            Arc::new(mock),
            registry,
            cache.clone(),
            IdleConfig::default(),
        );
        (idle, cache)
    }

    #[test]
    fn test_is_stale_boundaries() {
        let (idle, _) = fixture(MockBleAdapter::new(), &[]);
        assert!(!idle.is_stale(0, u64::MAX));
        assert!(!idle.is_stale(1_000, 1_000 + KEEP_ALIVE_MS));
        assert!(idle.is_stale(1_000, 1_000 + KEEP_ALIVE_MS + 1));
        assert!(!idle.is_stale(5_000, 1_000));
    }

    #[tokio::test]
    async fn test_sweep_disconnects_stale_connected_entry() {
        let mut mock = MockBleAdapter::new();
        mock.expect_radio_state()
            .returning(|_| RadioState::Connected);
        mock.expect_disconnect()
            .withf(|address| normalize::equal(address, "aa"))
            .times(1)
            .returning(|_| Ok(()));

        let (idle, cache) = fixture(mock, &["aa", "bb"]);
        cache.get_or_create("aa").touch_at(1_000);
        cache.get_or_create("bb").touch_at(100_000);

        let report = idle.sweep(1_000 + KEEP_ALIVE_MS + 1).await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.disconnected, vec!["aa".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_ignores_zero_timestamp() {
        let mut mock = MockBleAdapter::new();
        mock.expect_radio_state().never();
        mock.expect_disconnect().never();

        let (idle, cache) = fixture(mock, &["aa"]);
        cache.get_or_create("aa");

        let report = idle.sweep(u64::MAX).await;
        assert!(report.disconnected.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_radio_disconnected() {
        let mut mock = MockBleAdapter::new();
        mock.expect_radio_state()
            .returning(|_| RadioState::Disconnected);
        mock.expect_disconnect().never();

        let (idle, cache) = fixture(mock, &["aa"]);
        cache.get_or_create("aa").touch_at(1);

        assert!(idle.sweep(1 + KEEP_ALIVE_MS + 1).await.disconnected.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_missing_node() {
        let mut mock = MockBleAdapter::new();
        mock.expect_radio_state().never();
        mock.expect_disconnect().never();

        let (idle, cache) = fixture(mock, &[]);
        cache.get_or_create("aa").touch_at(1);

        let report = idle.sweep(1 + KEEP_ALIVE_MS + 1).await;
        assert_eq!(report.missing, vec!["aa".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_disconnects_many_and_logs_failures() {
        let mut mock = MockBleAdapter::new();
        mock.expect_radio_state()
            .returning(|_| RadioState::Connected);
        mock.expect_disconnect().times(3).returning(|address| {
            if normalize::equal(address, "cc") {
                Err(AdapterError::Backend("busy".into()))
            } else {
                Ok(())
            }
        });

        let (idle, cache) = fixture(mock, &["aa", "bb", "cc"]);
        for address in ["aa", "bb", "cc"] {
            cache.get_or_create(address).touch_at(1);
        }

        let report = idle.sweep(1 + KEEP_ALIVE_MS + 1).await;
        assert_eq!(report.disconnected.len(), 2);
        assert_eq!(report.failed, vec!["cc".to_string()]);
        // Timestamps are reset by the adapter's disconnect event, not here.
        assert!(cache.get("aa").unwrap().is_active());
    }
}
