// Integration test: connection lifecycle against the simulated adapter
//
// Covers on-demand connect, one-time discovery across reconnects,
// per-address serialization of concurrent resolves, failure handling and
// the disconnect observer resetting the access timestamp, including after a
// quick reconnect and after the observer falls behind the event channel.

use blegate_core::adapter::simulated::{DEMO_ADDRESS, EVENT_CAPACITY};
use blegate_core::{
    BleAdapter, ConnectionCache, ConnectionManager, DeviceRegistry, GatewayError,
    LifecycleConfig, Node, RadioState, SimulatedAdapter,
};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    sim: Arc<SimulatedAdapter>,
    registry: Arc<DeviceRegistry>,
    cache: Arc<ConnectionCache>,
    manager: ConnectionManager,
}

fn fixture_with(config: LifecycleConfig) -> Fixture {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init()
        .ok();

    let sim = Arc::new(SimulatedAdapter::with_demo_device());
    let adapter: Arc<dyn BleAdapter> = sim.clone();
    let registry = Arc::new(DeviceRegistry::new());
    registry.upsert(Node::new(DEMO_ADDRESS));
    let cache = Arc::new(ConnectionCache::new());
    let manager = ConnectionManager::new(adapter, registry.clone(), cache.clone(), config);
    Fixture {
        sim,
        registry,
        cache,
        manager,
    }
}

fn fixture() -> Fixture {
    fixture_with(LifecycleConfig::default())
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_resolve_connects_and_discovers() {
    let f = fixture();

    let entry = f.manager.resolve("C0AB2A6A1A89").await.unwrap();
    assert!(entry.is_active());
    assert_eq!(entry.services().len(), 2);
    assert_eq!(f.sim.connect_count(), 1);
    assert_eq!(f.sim.discover_count(), 1);
    assert_eq!(
        f.registry.find(DEMO_ADDRESS).unwrap().state,
        RadioState::Connected
    );
}

#[tokio::test]
async fn test_discovery_happens_once_across_reconnect() {
    let f = fixture();

    let entry = f.manager.resolve(DEMO_ADDRESS).await.unwrap();
    f.manager.resolve(DEMO_ADDRESS).await.unwrap();
    assert_eq!(f.sim.connect_count(), 1);

    f.sim.drop_connection(DEMO_ADDRESS);
    assert!(wait_until(|| !entry.is_active()).await, "observer should zero the timestamp");
    assert_eq!(entry.services().len(), 2, "catalog survives the disconnect");

    let again = f.manager.resolve(DEMO_ADDRESS).await.unwrap();
    assert!(Arc::ptr_eq(&entry, &again));
    assert!(again.is_active());
    assert_eq!(f.sim.connect_count(), 2);
    assert_eq!(f.sim.discover_count(), 1);
}

#[tokio::test]
async fn test_disconnect_seen_after_reconnect_keeps_entry_active() {
    let f = fixture();
    let entry = f.manager.resolve(DEMO_ADDRESS).await.unwrap();
    tokio::task::yield_now().await;

    // Reconnect before the observer gets to run on the drop.
    f.sim.drop_connection(DEMO_ADDRESS);
    let again = f.manager.resolve(DEMO_ADDRESS).await.unwrap();
    assert!(Arc::ptr_eq(&entry, &again));
    assert_eq!(f.sim.connect_count(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.sim.radio_state(DEMO_ADDRESS).await, RadioState::Connected);
    assert!(entry.is_active(), "old disconnect must not reset the new connection");
    assert_eq!(
        f.registry.find(DEMO_ADDRESS).unwrap().state,
        RadioState::Connected
    );

    f.sim.drop_connection(DEMO_ADDRESS);
    assert!(wait_until(|| !entry.is_active()).await);
    assert_eq!(
        f.registry.find(DEMO_ADDRESS).unwrap().state,
        RadioState::Disconnected
    );
}

#[tokio::test]
async fn test_lagged_observer_detects_lost_link() {
    let f = fixture();
    let entry = f.manager.resolve(DEMO_ADDRESS).await.unwrap();

    // Push the disconnect out of the observer's window.
    f.sim.drop_connection(DEMO_ADDRESS);
    for _ in 0..EVENT_CAPACITY + 8 {
        f.sim.power_on();
    }
    assert!(entry.is_active());

    assert!(wait_until(|| !entry.is_active()).await, "lagged observer should check the radio");
    assert_eq!(
        f.registry.find(DEMO_ADDRESS).unwrap().state,
        RadioState::Disconnected
    );
}

#[tokio::test]
async fn test_lagged_observer_keeps_live_link() {
    let f = fixture();
    let entry = f.manager.resolve(DEMO_ADDRESS).await.unwrap();

    for _ in 0..EVENT_CAPACITY + 8 {
        f.sim.power_on();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(entry.is_active());

    f.sim.drop_connection(DEMO_ADDRESS);
    assert!(wait_until(|| !entry.is_active()).await, "observer keeps watching after a lag");
}

#[tokio::test]
async fn test_concurrent_resolves_issue_one_connect() {
    let f = fixture();
    f.sim.set_connect_delay(Duration::from_millis(50));

    let (a, b, c) = tokio::join!(
        f.manager.resolve(DEMO_ADDRESS),
        f.manager.resolve("c0ab2a6a1a89"),
        f.manager.resolve("C0:AB:2A:6A:1A:89"),
    );
    let a = a.unwrap();
    assert!(Arc::ptr_eq(&a, &b.unwrap()));
    assert!(Arc::ptr_eq(&a, &c.unwrap()));
    assert_eq!(f.sim.connect_count(), 1);
    assert_eq!(f.sim.discover_count(), 1);
    assert_eq!(f.cache.len(), 1);
}

#[tokio::test]
async fn test_connect_failure_leaves_entry_untouched() {
    let f = fixture();
    f.sim.fail_next_connects(1);

    let err = f.manager.resolve(DEMO_ADDRESS).await.unwrap_err();
    assert_eq!(
        err,
        GatewayError::ConnectFailure("simulated connect failure".into())
    );
    let entry = f.cache.get(DEMO_ADDRESS).unwrap();
    assert_eq!(entry.last_access(), 0);
    assert!(!entry.has_catalog());
    assert_eq!(f.sim.discover_count(), 0);
    assert_eq!(
        f.registry.find(DEMO_ADDRESS).unwrap().state,
        RadioState::Disconnected
    );

    assert!(f.manager.resolve(DEMO_ADDRESS).await.is_ok());
    assert_eq!(f.sim.connect_count(), 2);
}

#[tokio::test]
async fn test_discovery_failure_is_retried_on_next_access() {
    let f = fixture();
    f.sim.fail_next_discoveries(1);

    let err = f.manager.resolve(DEMO_ADDRESS).await.unwrap_err();
    assert!(matches!(err, GatewayError::DiscoveryFailure(_)));
    let entry = f.cache.get(DEMO_ADDRESS).unwrap();
    assert!(entry.is_active(), "still connected, just without a catalog");
    assert!(!entry.has_catalog());

    let entry = f.manager.resolve(DEMO_ADDRESS).await.unwrap();
    assert!(entry.has_catalog());
    assert_eq!(f.sim.connect_count(), 1);
    assert_eq!(f.sim.discover_count(), 2);
}

#[tokio::test]
async fn test_unknown_node() {
    let f = fixture();
    let err = f.manager.resolve("ffffffffffff").await.unwrap_err();
    assert_eq!(err.to_string(), "no such peripheral: ffffffffffff");
    assert!(f.cache.is_empty());
    assert_eq!(f.sim.connect_count(), 0);
}

#[tokio::test]
async fn test_connect_timeout() {
    let f = fixture_with(LifecycleConfig {
        connect_timeout: Duration::from_millis(20),
        discovery_timeout: Duration::from_secs(1),
    });
    f.sim.set_connect_delay(Duration::from_millis(500));

    let err = f.manager.resolve(DEMO_ADDRESS).await.unwrap_err();
    assert!(matches!(err, GatewayError::ConnectFailure(_)));
    assert!(err.to_string().contains("timed out"));
    assert_eq!(f.cache.get(DEMO_ADDRESS).unwrap().last_access(), 0);
}

#[tokio::test]
async fn test_discovery_timeout() {
    let f = fixture_with(LifecycleConfig {
        connect_timeout: Duration::from_secs(1),
        discovery_timeout: Duration::from_millis(20),
    });
    f.sim.set_discover_delay(Duration::from_millis(500));

    let err = f.manager.resolve(DEMO_ADDRESS).await.unwrap_err();
    assert!(matches!(err, GatewayError::DiscoveryFailure(_)));
}

#[tokio::test]
async fn test_resolve_on_live_connection_refreshes_timestamp() {
    let f = fixture();
    let entry = f.manager.resolve(DEMO_ADDRESS).await.unwrap();
    let first = entry.last_access();

    tokio::time::sleep(Duration::from_millis(10)).await;
    f.manager.resolve(DEMO_ADDRESS).await.unwrap();
    assert!(entry.last_access() > first);
    assert_eq!(f.sim.connect_count(), 1);
}

#[tokio::test]
async fn test_find_characteristic_with_and_without_service() {
    let f = fixture();
    let entry = f.manager.resolve(DEMO_ADDRESS).await.unwrap();

    assert!(f.manager.find_characteristic(&entry, "2A19", None).is_some());
    assert!(f.manager.find_characteristic(&entry, "2a19", Some("180F")).is_some());
    assert!(f
        .manager
        .find_characteristic(&entry, "2a19", Some("6e400001b5a3f393e0a9e50e24dcca9e"))
        .is_none());
}
