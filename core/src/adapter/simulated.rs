//! In-memory BLE adapter
//!
//! Behaves like a radio with a fixed set of peripherals: scanning reports
//! them, connects and discoveries succeed (or fail on request), reads return
//! stored values and subscriptions receive whatever [`SimulatedAdapter::notify`]
//! pushes. Call counters and failure injection make it the test double for
//! the connection lifecycle as well as the `simulated` adapter of the CLI.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    AdapterError, AdapterEvent, BleAdapter, CharacteristicInfo, CharacteristicRef, GattCatalog,
    Node, Operation, RadioState, ServiceInfo, ValueStream,
};
use crate::normalize;

/// Capacity of the adapter event channel
pub const EVENT_CAPACITY: usize = 256;

/// Capacity of each per-characteristic notification channel
const NOTIFY_CAPACITY: usize = 64;

/// Address of the peripheral created by [`SimulatedAdapter::with_demo_device`]
pub const DEMO_ADDRESS: &str = "c0:ab:2a:6a:1a:89";

/// Battery service of the demo peripheral
pub const DEMO_BATTERY_SERVICE: &str = "180f";

/// Battery level characteristic of the demo peripheral
pub const DEMO_BATTERY_LEVEL: &str = "2a19";

/// Custom service of the demo peripheral
pub const DEMO_UART_SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Writable characteristic of the demo custom service
pub const DEMO_UART_RX: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Notifying characteristic of the demo custom service
pub const DEMO_UART_TX: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

struct SimPeripheral {
    node: Node,
    catalog: GattCatalog,
    values: HashMap<String, Vec<u8>>,
    connected: bool,
}

/// A recorded write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimWrite {
    pub target: CharacteristicRef,
    pub data: Vec<u8>,
    pub no_ack: bool,
}

/// In-memory [`BleAdapter`]
pub struct SimulatedAdapter {
    peripherals: RwLock<Vec<SimPeripheral>>,
    events: broadcast::Sender<AdapterEvent>,
    notifiers: RwLock<HashMap<String, broadcast::Sender<Result<Vec<u8>, AdapterError>>>>,
    writes: Mutex<Vec<SimWrite>>,
    scanning: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    discover_calls: AtomicUsize,
    pending_connect_failures: AtomicUsize,
    pending_discover_failures: AtomicUsize,
    connect_delay: Mutex<Duration>,
    discover_delay: Mutex<Duration>,
}

fn value_key(address: &str, service_uuid: &str, uuid: &str) -> String {
    format!(
        "{}/{}/{}",
        normalize::normalize(address),
        normalize::normalize(service_uuid),
        normalize::normalize(uuid)
    )
}

impl SimulatedAdapter {
    /// Create an adapter with no peripherals.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            peripherals: RwLock::new(Vec::new()),
            events,
            notifiers: RwLock::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            scanning: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            discover_calls: AtomicUsize::new(0),
            pending_connect_failures: AtomicUsize::new(0),
            pending_discover_failures: AtomicUsize::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            discover_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Create an adapter with one demo peripheral: a battery service and a
    /// UART-style service with a writable and a notifying characteristic.
    pub fn with_demo_device() -> Self {
        let adapter = Self::new();
        let node = Node::new(DEMO_ADDRESS)
            .with_local_name("blegate-demo")
            .with_rssi(-52)
            .with_service_uuids(vec![DEMO_BATTERY_SERVICE.to_string()])
            .with_manufacturer_data(&[0xff, 0xff, 0x01]);
        let catalog = GattCatalog {
            services: vec![
                ServiceInfo::new(DEMO_BATTERY_SERVICE),
                ServiceInfo::new(DEMO_UART_SERVICE),
            ],
            characteristics: vec![
                CharacteristicInfo::new(
                    DEMO_BATTERY_SERVICE,
                    DEMO_BATTERY_LEVEL,
                    vec![Operation::Read, Operation::Notify],
                ),
                CharacteristicInfo::new(
                    DEMO_UART_SERVICE,
                    DEMO_UART_RX,
                    vec![Operation::Write, Operation::WriteWithoutResponse],
                ),
                CharacteristicInfo::new(DEMO_UART_SERVICE, DEMO_UART_TX, vec![Operation::Notify]),
            ],
        };
        adapter.add_peripheral(node, catalog);
        adapter.set_value(DEMO_ADDRESS, DEMO_BATTERY_SERVICE, DEMO_BATTERY_LEVEL, vec![0x64]);
        adapter
    }

    /// Add a peripheral; it is advertised right away when scanning.
    pub fn add_peripheral(&self, node: Node, catalog: GattCatalog) {
        let scanning = self.scanning.load(Ordering::SeqCst);
        {
            let mut peripherals = self.peripherals.write();
            peripherals.retain(|p| !p.node.has_address(&node.address));
            peripherals.push(SimPeripheral {
                node: node.clone(),
                catalog,
                values: HashMap::new(),
                connected: false,
            });
        }
        if scanning {
            let _ = self.events.send(AdapterEvent::Discovered(node));
        }
    }

    /// Store the value returned by reads of a characteristic.
    pub fn set_value(&self, address: &str, service_uuid: &str, uuid: &str, data: Vec<u8>) {
        let mut peripherals = self.peripherals.write();
        if let Some(p) = peripherals.iter_mut().find(|p| p.node.has_address(address)) {
            p.values.insert(value_key(address, service_uuid, uuid), data);
        }
    }

    /// Stored value of a characteristic.
    pub fn value(&self, address: &str, service_uuid: &str, uuid: &str) -> Option<Vec<u8>> {
        let peripherals = self.peripherals.read();
        peripherals
            .iter()
            .find(|p| p.node.has_address(address))
            .and_then(|p| p.values.get(&value_key(address, service_uuid, uuid)).cloned())
    }

    /// Push a notification to every subscriber of a characteristic.
    /// Returns how many subscribers received it.
    pub fn notify(&self, address: &str, service_uuid: &str, uuid: &str, data: Vec<u8>) -> usize {
        let key = value_key(address, service_uuid, uuid);
        self.notifiers
            .read()
            .get(&key)
            .and_then(|tx| tx.send(Ok(data)).ok())
            .unwrap_or(0)
    }

    /// Push an error to every subscriber of a characteristic.
    pub fn notify_error(&self, address: &str, service_uuid: &str, uuid: &str, message: &str) {
        let key = value_key(address, service_uuid, uuid);
        if let Some(tx) = self.notifiers.read().get(&key) {
            let _ = tx.send(Err(AdapterError::Backend(message.to_string())));
        }
    }

    /// Number of live subscriptions on a characteristic.
    pub fn subscriber_count(&self, address: &str, service_uuid: &str, uuid: &str) -> usize {
        let key = value_key(address, service_uuid, uuid);
        self.notifiers
            .read()
            .get(&key)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Simulate the peripheral dropping the link. Subscriptions on it end.
    pub fn drop_connection(&self, address: &str) {
        let dropped = {
            let mut peripherals = self.peripherals.write();
            match peripherals.iter_mut().find(|p| p.node.has_address(address)) {
                Some(p) if p.connected => {
                    p.connected = false;
                    Some(p.node.address.clone())
                }
                _ => None,
            }
        };
        if let Some(address) = dropped {
            self.end_subscriptions(&address);
            let _ = self.events.send(AdapterEvent::Disconnected(address));
        }
    }

    /// Emit a power-on event, as a radio does when it becomes available.
    pub fn power_on(&self) {
        let _ = self.events.send(AdapterEvent::PoweredOn);
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.pending_connect_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` discovery attempts.
    pub fn fail_next_discoveries(&self, count: usize) {
        self.pending_discover_failures.store(count, Ordering::SeqCst);
    }

    /// Delay applied to every connect attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Delay applied to every discovery.
    pub fn set_discover_delay(&self, delay: Duration) {
        *self.discover_delay.lock() = delay;
    }

    pub fn connect_count(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn discover_count(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Writes received so far, oldest first.
    pub fn writes(&self) -> Vec<SimWrite> {
        self.writes.lock().clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn end_subscriptions(&self, address: &str) {
        let prefix = format!("{}/", normalize::normalize(address));
        self.notifiers.write().retain(|key, _| !key.starts_with(&prefix));
    }

    /// Look up a connected peripheral's characteristic.
    fn connected_characteristic(
        &self,
        target: &CharacteristicRef,
    ) -> Result<CharacteristicInfo, AdapterError> {
        let peripherals = self.peripherals.read();
        let peripheral = peripherals
            .iter()
            .find(|p| p.node.has_address(&target.address))
            .ok_or_else(|| AdapterError::UnknownPeripheral(target.address.clone()))?;
        if !peripheral.connected {
            return Err(AdapterError::NotConnected(target.address.clone()));
        }
        peripheral
            .catalog
            .find_characteristic(&target.uuid, Some(&target.service_uuid))
            .cloned()
            .ok_or_else(|| AdapterError::UnknownCharacteristic(target.to_string()))
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleAdapter for SimulatedAdapter {
    async fn start_scan(
        &self,
        service_filter: &[String],
        allow_duplicates: bool,
    ) -> Result<(), AdapterError> {
        self.scanning.store(true, Ordering::SeqCst);
        debug!(filter = ?service_filter, allow_duplicates, "simulated scan started");

        let advertised: Vec<Node> = self
            .peripherals
            .read()
            .iter()
            .filter(|p| {
                service_filter.is_empty()
                    || service_filter.iter().any(|wanted| {
                        p.node
                            .service_uuids
                            .iter()
                            .any(|uuid| normalize::equal(uuid, wanted))
                    })
            })
            .map(|p| p.node.clone())
            .collect();
        for node in advertised {
            let _ = self.events.send(AdapterEvent::Discovered(node));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    async fn radio_state(&self, address: &str) -> RadioState {
        let peripherals = self.peripherals.read();
        match peripherals.iter().find(|p| p.node.has_address(address)) {
            Some(p) if p.connected => RadioState::Connected,
            _ => RadioState::Disconnected,
        }
    }

    async fn connect(&self, address: &str) -> Result<(), AdapterError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.pending_connect_failures) {
            return Err(AdapterError::Backend("simulated connect failure".to_string()));
        }

        let connected = {
            let mut peripherals = self.peripherals.write();
            let peripheral = peripherals
                .iter_mut()
                .find(|p| p.node.has_address(address))
                .ok_or_else(|| AdapterError::UnknownPeripheral(address.to_string()))?;
            peripheral.connected = true;
            peripheral.node.address.clone()
        };
        let _ = self.events.send(AdapterEvent::Connected(connected));
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), AdapterError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let disconnected = {
            let mut peripherals = self.peripherals.write();
            let peripheral = peripherals
                .iter_mut()
                .find(|p| p.node.has_address(address))
                .ok_or_else(|| AdapterError::UnknownPeripheral(address.to_string()))?;
            if !peripheral.connected {
                return Err(AdapterError::NotConnected(address.to_string()));
            }
            peripheral.connected = false;
            peripheral.node.address.clone()
        };
        self.end_subscriptions(&disconnected);
        let _ = self.events.send(AdapterEvent::Disconnected(disconnected));
        Ok(())
    }

    async fn discover_all(&self, address: &str) -> Result<GattCatalog, AdapterError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.discover_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.pending_discover_failures) {
            return Err(AdapterError::Backend("simulated discovery failure".to_string()));
        }

        let peripherals = self.peripherals.read();
        let peripheral = peripherals
            .iter()
            .find(|p| p.node.has_address(address))
            .ok_or_else(|| AdapterError::UnknownPeripheral(address.to_string()))?;
        if !peripheral.connected {
            return Err(AdapterError::NotConnected(address.to_string()));
        }
        Ok(peripheral.catalog.clone())
    }

    async fn read(&self, target: &CharacteristicRef) -> Result<Vec<u8>, AdapterError> {
        let characteristic = self.connected_characteristic(target)?;
        if !characteristic.supports(Operation::Read) {
            return Err(AdapterError::NotPermitted(format!("read {}", target)));
        }
        Ok(self
            .value(&target.address, &target.service_uuid, &target.uuid)
            .unwrap_or_default())
    }

    async fn write(
        &self,
        target: &CharacteristicRef,
        data: &[u8],
        no_ack: bool,
    ) -> Result<(), AdapterError> {
        let characteristic = self.connected_characteristic(target)?;
        let operation = if no_ack {
            Operation::WriteWithoutResponse
        } else {
            Operation::Write
        };
        if !characteristic.supports(operation) {
            return Err(AdapterError::NotPermitted(format!("write {}", target)));
        }
        self.set_value(&target.address, &target.service_uuid, &target.uuid, data.to_vec());
        self.writes.lock().push(SimWrite {
            target: target.clone(),
            data: data.to_vec(),
            no_ack,
        });
        Ok(())
    }

    async fn subscribe(&self, target: &CharacteristicRef) -> Result<ValueStream, AdapterError> {
        let characteristic = self.connected_characteristic(target)?;
        if !characteristic.can_push() {
            return Err(AdapterError::NotPermitted(format!("subscribe {}", target)));
        }

        let key = value_key(&target.address, &target.service_uuid, &target.uuid);
        let rx = self
            .notifiers
            .write()
            .entry(key)
            .or_insert_with(|| broadcast::channel(NOTIFY_CAPACITY).0)
            .subscribe();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(item) => return Some((item, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery() -> CharacteristicRef {
        CharacteristicRef {
            address: DEMO_ADDRESS.to_string(),
            service_uuid: DEMO_BATTERY_SERVICE.to_string(),
            uuid: DEMO_BATTERY_LEVEL.to_string(),
        }
    }

    #[tokio::test]
    async fn test_scan_reports_demo_device() {
        let adapter = SimulatedAdapter::with_demo_device();
        let mut events = adapter.events();
        adapter.start_scan(&[], false).await.unwrap();

        match events.recv().await.unwrap() {
            AdapterEvent::Discovered(node) => assert!(node.has_address("C0AB2A6A1A89")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(adapter.is_scanning());
    }

    #[tokio::test]
    async fn test_scan_filter_excludes_other_services() {
        let adapter = SimulatedAdapter::with_demo_device();
        let mut events = adapter.events();
        adapter.start_scan(&["1800".to_string()], false).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_requires_connection() {
        let adapter = SimulatedAdapter::with_demo_device();
        assert!(matches!(
            adapter.read(&battery()).await,
            Err(AdapterError::NotConnected(_))
        ));

        adapter.connect(DEMO_ADDRESS).await.unwrap();
        assert_eq!(adapter.read(&battery()).await.unwrap(), vec![0x64]);
        assert_eq!(adapter.radio_state("C0:AB:2A:6A:1A:89").await, RadioState::Connected);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let adapter = SimulatedAdapter::with_demo_device();
        adapter.fail_next_connects(1);
        assert!(adapter.connect(DEMO_ADDRESS).await.is_err());
        assert!(adapter.connect(DEMO_ADDRESS).await.is_ok());
        assert_eq!(adapter.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_ends_subscriptions() {
        let adapter = SimulatedAdapter::with_demo_device();
        adapter.connect(DEMO_ADDRESS).await.unwrap();
        let mut stream = adapter.subscribe(&battery()).await.unwrap();

        assert_eq!(
            adapter.notify(DEMO_ADDRESS, DEMO_BATTERY_SERVICE, DEMO_BATTERY_LEVEL, vec![0x50]),
            1
        );
        assert_eq!(stream.next().await, Some(Ok(vec![0x50])));

        adapter.drop_connection(DEMO_ADDRESS);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_write_respects_properties() {
        let adapter = SimulatedAdapter::with_demo_device();
        adapter.connect(DEMO_ADDRESS).await.unwrap();
        assert!(matches!(
            adapter.write(&battery(), &[1], false).await,
            Err(AdapterError::NotPermitted(_))
        ));

        let rx = CharacteristicRef {
            address: DEMO_ADDRESS.to_string(),
            service_uuid: DEMO_UART_SERVICE.to_string(),
            uuid: DEMO_UART_RX.to_string(),
        };
        adapter.write(&rx, b"hi", true).await.unwrap();
        assert_eq!(adapter.writes().len(), 1);
        assert!(adapter.writes()[0].no_ack);
    }
}
