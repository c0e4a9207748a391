//! Connection cache and lifecycle manager
//!
//! [`ConnectionManager::resolve`] is the only way to get a usable
//! connection: it connects on demand, discovers the GATT catalog once per
//! address and refreshes the entry's last-access time. Connection setup for
//! one address is serialized by the entry's connect lock, so concurrent
//! callers wait for the first one instead of racing a second connect.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{
    AdapterError, AdapterEvent, BleAdapter, CharacteristicInfo, GattCatalog, RadioState,
    ServiceInfo,
};
use crate::error::{GatewayError, Result};
use crate::normalize;
use crate::registry::DeviceRegistry;

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
        .max(1)
}

// ============================================================================
// CACHE ENTRY
// ============================================================================

/// Session state of one peripheral
#[derive(Debug)]
pub struct ConnectionEntry {
    address: String,
    catalog: RwLock<Option<Arc<GattCatalog>>>,
    /// 0 while not connected
    last_access: AtomicU64,
    /// Bumped on every connect. An observer only ends its own session.
    session: parking_lot::Mutex<u64>,
    observer: parking_lot::Mutex<Option<JoinHandle<()>>>,
    connect_lock: Mutex<()>,
}

impl ConnectionEntry {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            catalog: RwLock::new(None),
            last_access: AtomicU64::new(0),
            session: parking_lot::Mutex::new(0),
            observer: parking_lot::Mutex::new(None),
            connect_lock: Mutex::new(()),
        }
    }

    /// Address as the adapter reported it.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Last access in milliseconds since the UNIX epoch, 0 if not connected.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.last_access() != 0
    }

    pub fn catalog(&self) -> Option<Arc<GattCatalog>> {
        self.catalog.read().clone()
    }

    pub fn has_catalog(&self) -> bool {
        self.catalog.read().is_some()
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.catalog()
            .map(|c| c.services.clone())
            .unwrap_or_default()
    }

    /// See [`GattCatalog::find_characteristic`].
    pub fn find_characteristic(
        &self,
        characteristic_uuid: &str,
        service_uuid: Option<&str>,
    ) -> Option<CharacteristicInfo> {
        self.catalog()
            .and_then(|c| c.find_characteristic(characteristic_uuid, service_uuid).cloned())
    }

    pub(crate) fn touch(&self) {
        self.touch_at(now_millis());
    }

    pub(crate) fn touch_at(&self, millis: u64) {
        self.last_access.store(millis, Ordering::SeqCst);
    }

    pub(crate) fn mark_disconnected(&self) {
        self.last_access.store(0, Ordering::SeqCst);
    }

    fn begin_session(&self) -> u64 {
        let mut session = self.session.lock();
        *session += 1;
        self.touch();
        *session
    }

    /// Zero the timestamp if `session` is still the current one.
    fn end_session(&self, session: u64) -> bool {
        let current = self.session.lock();
        if *current != session {
            return false;
        }
        self.mark_disconnected();
        true
    }

    fn has_observer(&self) -> bool {
        self.observer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Store the catalog unless one is already present.
    fn populate(&self, catalog: GattCatalog) -> bool {
        let mut slot = self.catalog.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::new(catalog));
        true
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// At most one [`ConnectionEntry`] per normalized address, in creation order
pub struct ConnectionCache {
    entries: RwLock<Vec<(String, Arc<ConnectionEntry>)>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn get(&self, address: &str) -> Option<Arc<ConnectionEntry>> {
        let key = normalize::normalize(address);
        self.entries
            .read()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, e)| e.clone())
    }

    pub fn get_or_create(&self, address: &str) -> Arc<ConnectionEntry> {
        let key = normalize::normalize(address);
        let mut entries = self.entries.write();
        if let Some((_, entry)) = entries.iter().find(|(k, _)| *k == key) {
            return entry.clone();
        }
        let entry = Arc::new(ConnectionEntry::new(address));
        entries.push((key, entry.clone()));
        entry
    }

    pub fn snapshot(&self) -> Vec<Arc<ConnectionEntry>> {
        self.entries.read().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Forget every entry. Only used when the radio restarts.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// LIFECYCLE MANAGER
// ============================================================================

/// Bounds on adapter calls made while resolving a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ConnectionManager {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<DeviceRegistry>,
    cache: Arc<ConnectionCache>,
    config: LifecycleConfig,
}

impl ConnectionManager {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<DeviceRegistry>,
        cache: Arc<ConnectionCache>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            adapter,
            registry,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    /// Return a connected entry with a populated catalog for `address`.
    pub async fn resolve(&self, address: &str) -> Result<Arc<ConnectionEntry>> {
        let node = self
            .registry
            .find(address)
            .ok_or_else(|| GatewayError::NodeNotFound(address.to_string()))?;
        let entry = self.cache.get_or_create(&node.address);
        self.establish(&entry).await?;
        Ok(entry)
    }

    /// See [`GattCatalog::find_characteristic`].
    pub fn find_characteristic(
        &self,
        entry: &ConnectionEntry,
        characteristic_uuid: &str,
        service_uuid: Option<&str>,
    ) -> Option<CharacteristicInfo> {
        entry.find_characteristic(characteristic_uuid, service_uuid)
    }

    async fn establish(&self, entry: &Arc<ConnectionEntry>) -> Result<()> {
        let _guard = entry.connect_lock.lock().await;
        let address = entry.address();
        let events = self.adapter.events();

        if self.adapter.radio_state(address).await == RadioState::Connected {
            if entry.has_observer() {
                entry.touch();
            } else {
                // Connected behind our back, e.g. after the cache was reset.
                let session = entry.begin_session();
                self.spawn_observer(entry, session, events);
            }
        } else {
            self.connect(entry).await?;
        }

        if entry.has_catalog() {
            return Ok(());
        }
        self.discover(entry).await
    }

    async fn connect(&self, entry: &Arc<ConnectionEntry>) -> Result<()> {
        let address = entry.address();
        // Subscribed before connecting so an immediate drop is not missed.
        let events = self.adapter.events();

        info!(address, "connecting");
        self.registry.set_state(address, RadioState::Connecting);
        let outcome = tokio::time::timeout(self.config.connect_timeout, self.adapter.connect(address))
            .await
            .unwrap_or(Err(AdapterError::Timeout(self.config.connect_timeout)));

        if let Err(e) = outcome {
            warn!(address, error = %e, "connect failed");
            self.registry.set_state(address, RadioState::Disconnected);
            return Err(GatewayError::connect(e));
        }

        info!(address, "connected");
        self.registry.set_state(address, RadioState::Connected);
        let session = entry.begin_session();
        self.spawn_observer(entry, session, events);
        Ok(())
    }

    async fn discover(&self, entry: &ConnectionEntry) -> Result<()> {
        let address = entry.address();
        debug!(address, "discovering services and characteristics");
        let outcome = tokio::time::timeout(
            self.config.discovery_timeout,
            self.adapter.discover_all(address),
        )
        .await
        .unwrap_or(Err(AdapterError::Timeout(self.config.discovery_timeout)));

        match outcome {
            Ok(catalog) => {
                info!(
                    address,
                    services = catalog.services.len(),
                    characteristics = catalog.characteristics.len(),
                    "discovery complete"
                );
                entry.populate(catalog);
                Ok(())
            }
            Err(e) => {
                warn!(address, error = %e, "discovery failed");
                Err(GatewayError::discovery(e))
            }
        }
    }

    /// Spawn the one-shot task that ends `session` when the adapter reports
    /// the link gone. It replaces the entry's previous observer.
    fn spawn_observer(
        &self,
        entry: &Arc<ConnectionEntry>,
        session: u64,
        mut events: broadcast::Receiver<AdapterEvent>,
    ) {
        let watched = entry.clone();
        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let handle = tokio::spawn(async move {
            loop {
                let gone = match events.recv().await {
                    Ok(AdapterEvent::Disconnected(address)) => {
                        normalize::equal(&address, watched.address())
                    }
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(address = %watched.address(), skipped, "disconnect observer lagged");
                        adapter.radio_state(watched.address()).await != RadioState::Connected
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if gone {
                    if watched.end_session(session) {
                        debug!(address = %watched.address(), session, "disconnected");
                        registry.set_state(watched.address(), RadioState::Disconnected);
                    } else {
                        debug!(
                            address = %watched.address(),
                            session,
                            "ignoring disconnect of an older session"
                        );
                    }
                    break;
                }
            }
        });
        if let Some(previous) = entry.observer.lock().replace(handle) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_one_entry_per_address() {
        let cache = ConnectionCache::new();
        let a = cache.get_or_create("C0:AB:2A:6A:1A:89");
        let b = cache.get_or_create("c0ab2a6a1a89");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert_eq!(a.address(), "C0:AB:2A:6A:1A:89");
        assert!(cache.get("c0-ab-2a-6a-1a-89").is_some());
        assert!(cache.get("ffffffffffff").is_none());
    }

    #[test]
    fn test_new_entry_is_inactive_and_empty() {
        let entry = ConnectionEntry::new("aa");
        assert_eq!(entry.last_access(), 0);
        assert!(!entry.is_active());
        assert!(entry.services().is_empty());
        assert!(entry.find_characteristic("2a19", None).is_none());
    }

    #[test]
    fn test_catalog_is_populated_once() {
        let entry = ConnectionEntry::new("aa");
        let first = GattCatalog {
            services: vec![ServiceInfo::new("180f")],
            characteristics: vec![],
        };
        assert!(entry.populate(first.clone()));
        assert!(!entry.populate(GattCatalog::default()));
        assert_eq!(*entry.catalog().unwrap(), first);
    }

    #[test]
    fn test_disconnect_keeps_catalog() {
        let entry = ConnectionEntry::new("aa");
        entry.populate(GattCatalog {
            services: vec![ServiceInfo::new("180f")],
            characteristics: vec![],
        });
        entry.touch();
        assert!(entry.is_active());
        entry.mark_disconnected();
        assert!(!entry.is_active());
        assert_eq!(entry.services().len(), 1);
    }

    #[test]
    fn test_stale_session_does_not_reset() {
        let entry = ConnectionEntry::new("aa");
        let first = entry.begin_session();
        let second = entry.begin_session();
        assert!(second > first);

        assert!(!entry.end_session(first));
        assert!(entry.is_active());
        assert!(entry.end_session(second));
        assert!(!entry.is_active());
    }

    #[test]
    fn test_now_millis_is_nonzero() {
        assert!(now_millis() > 0);
    }
}
