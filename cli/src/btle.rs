// btleplug-backed BLE adapter
//
// Wraps the first Bluetooth adapter of the host. Peripherals are tracked by
// the address btleplug reports for them; UUIDs built on the Bluetooth base
// UUID are shown in their 16-bit short form (`180f`), everything else in the
// hyphenated 128-bit form.

use anyhow::{Context, Result};
use async_trait::async_trait;
use blegate_core::adapter::{
    AdapterError, AdapterEvent, BleAdapter, CharacteristicInfo, CharacteristicRef, GattCatalog,
    Node, Operation, RadioState, ServiceInfo, ValueStream,
};
use blegate_core::normalize;
use btleplug::api::{
    AddressType, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 512;

/// Bluetooth base UUID, `0000xxxx-0000-1000-8000-00805f9b34fb`
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const SHORT_MASK: u128 = 0xffff_ffff << 96;

/// Short form for base UUIDs, hyphenated lowercase otherwise.
pub fn display_uuid(uuid: &Uuid) -> String {
    let value = uuid.as_u128();
    if value & !SHORT_MASK == BASE_UUID {
        let short = (value >> 96) as u32;
        if short <= 0xffff {
            return format!("{:04x}", short);
        }
        return format!("{:08x}", short);
    }
    uuid.to_string()
}

/// Parse a 16-bit, 32-bit or 128-bit UUID in any separator style.
pub fn parse_uuid(text: &str) -> Option<Uuid> {
    let plain = normalize::normalize(text);
    match plain.len() {
        4 | 8 => u32::from_str_radix(&plain, 16)
            .ok()
            .map(|short| Uuid::from_u128(BASE_UUID | (u128::from(short) << 96))),
        32 => Uuid::parse_str(&plain).ok(),
        _ => None,
    }
}

fn uuid_matches(uuid: &Uuid, text: &str) -> bool {
    parse_uuid(text).map_or(false, |parsed| parsed == *uuid)
}

fn operations(flags: CharPropFlags) -> Vec<Operation> {
    [
        (CharPropFlags::READ, Operation::Read),
        (CharPropFlags::WRITE, Operation::Write),
        (CharPropFlags::WRITE_WITHOUT_RESPONSE, Operation::WriteWithoutResponse),
        (CharPropFlags::NOTIFY, Operation::Notify),
        (CharPropFlags::INDICATE, Operation::Indicate),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, op)| op)
    .collect()
}

/// Node view of an advertisement
pub fn node_from_properties(props: &PeripheralProperties) -> Node {
    let mut node = Node::new(props.address.to_string());
    // btleplug does not report the advertising PDU type, so every node stays
    // connectable and `?connectable=1` only filters simulated peripherals.
    node.connectable = true;
    node.address_type = match props.address_type {
        Some(AddressType::Public) => "public",
        Some(AddressType::Random) => "random",
        _ => "unknown",
    }
    .to_string();
    node.local_name = props.local_name.clone();
    node.service_uuids = props.services.iter().map(display_uuid).collect();
    node.rssi = props.rssi;

    // Company identifier first, little-endian, as it appears on air.
    let mut companies: Vec<_> = props.manufacturer_data.iter().collect();
    companies.sort_by_key(|(company, _)| **company);
    if let Some((company, data)) = companies.first() {
        let mut raw = company.to_le_bytes().to_vec();
        raw.extend_from_slice(data);
        node = node.with_manufacturer_data(&raw);
    }
    node
}

fn backend(err: btleplug::Error) -> AdapterError {
    AdapterError::Backend(err.to_string())
}

#[derive(Default)]
struct Known {
    by_address: HashMap<String, PeripheralId>,
    by_id: HashMap<PeripheralId, String>,
}

pub struct BtleplugAdapter {
    adapter: Adapter,
    events: broadcast::Sender<AdapterEvent>,
    known: Arc<RwLock<Known>>,
}

impl BtleplugAdapter {
    /// Open the first adapter of the host and start translating its events.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to initialize BLE manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list BLE adapters")?
            .into_iter()
            .next()
            .context("No BLE adapter found")?;
        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "BLE adapter ready");
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let known = Arc::new(RwLock::new(Known::default()));
        let central_events = adapter
            .events()
            .await
            .context("Failed to subscribe to BLE adapter events")?;

        let pump_adapter = adapter.clone();
        let pump_events = events.clone();
        let pump_known = known.clone();
        tokio::spawn(async move {
            let mut central_events = central_events;
            while let Some(event) = central_events.next().await {
                translate(&pump_adapter, &pump_known, &pump_events, event).await;
            }
            let _ = pump_events.send(AdapterEvent::PoweredOff);
            warn!("BLE adapter event stream ended");
        });

        Ok(Self {
            adapter,
            events,
            known,
        })
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral, AdapterError> {
        let id = self
            .known
            .read()
            .by_address
            .get(&normalize::normalize(address))
            .cloned()
            .ok_or_else(|| AdapterError::UnknownPeripheral(address.to_string()))?;
        self.adapter.peripheral(&id).await.map_err(backend)
    }

    async fn characteristic(
        &self,
        target: &CharacteristicRef,
    ) -> Result<(Peripheral, Characteristic), AdapterError> {
        let peripheral = self.peripheral(&target.address).await?;
        if !peripheral.is_connected().await.map_err(backend)? {
            return Err(AdapterError::NotConnected(target.address.clone()));
        }
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                uuid_matches(&c.uuid, &target.uuid)
                    && uuid_matches(&c.service_uuid, &target.service_uuid)
            })
            .ok_or_else(|| AdapterError::UnknownCharacteristic(target.to_string()))?;
        Ok((peripheral, characteristic))
    }
}

async fn translate(
    adapter: &Adapter,
    known: &RwLock<Known>,
    events: &broadcast::Sender<AdapterEvent>,
    event: CentralEvent,
) {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
            let props = match adapter.peripheral(&id).await {
                Ok(peripheral) => peripheral.properties().await,
                Err(e) => Err(e),
            };
            match props {
                Ok(Some(props)) => {
                    let node = node_from_properties(&props);
                    {
                        let mut known = known.write();
                        known
                            .by_address
                            .insert(normalize::normalize(&node.address), id.clone());
                        known.by_id.insert(id, node.address.clone());
                    }
                    let _ = events.send(AdapterEvent::Discovered(node));
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "no properties for discovered peripheral"),
            }
        }
        CentralEvent::DeviceConnected(id) => {
            if let Some(address) = known.read().by_id.get(&id).cloned() {
                let _ = events.send(AdapterEvent::Connected(address));
            }
        }
        CentralEvent::DeviceDisconnected(id) => {
            if let Some(address) = known.read().by_id.get(&id).cloned() {
                let _ = events.send(AdapterEvent::Disconnected(address));
            }
        }
        _ => {}
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn start_scan(
        &self,
        service_filter: &[String],
        allow_duplicates: bool,
    ) -> Result<(), AdapterError> {
        let services = service_filter
            .iter()
            .filter_map(|s| {
                let parsed = parse_uuid(s);
                if parsed.is_none() {
                    warn!(uuid = %s, "ignoring unparsable scan filter entry");
                }
                parsed
            })
            .collect();
        // btleplug reports every advertisement as DeviceUpdated regardless.
        debug!(allow_duplicates, "duplicate filtering is left to the platform");
        self.adapter
            .start_scan(ScanFilter { services })
            .await
            .map_err(backend)
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.adapter.stop_scan().await.map_err(backend)
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    async fn radio_state(&self, address: &str) -> RadioState {
        match self.peripheral(address).await {
            Ok(peripheral) => match peripheral.is_connected().await {
                Ok(true) => RadioState::Connected,
                _ => RadioState::Disconnected,
            },
            Err(_) => RadioState::Disconnected,
        }
    }

    async fn connect(&self, address: &str) -> Result<(), AdapterError> {
        self.peripheral(address)
            .await?
            .connect()
            .await
            .map_err(backend)
    }

    async fn disconnect(&self, address: &str) -> Result<(), AdapterError> {
        self.peripheral(address)
            .await?
            .disconnect()
            .await
            .map_err(backend)
    }

    async fn discover_all(&self, address: &str) -> Result<GattCatalog, AdapterError> {
        let peripheral = self.peripheral(address).await?;
        peripheral.discover_services().await.map_err(backend)?;

        let mut catalog = GattCatalog::default();
        for service in peripheral.services() {
            let service_uuid = display_uuid(&service.uuid);
            catalog.services.push(ServiceInfo::new(service_uuid.clone()));
            for characteristic in &service.characteristics {
                catalog.characteristics.push(CharacteristicInfo::new(
                    service_uuid.clone(),
                    display_uuid(&characteristic.uuid),
                    operations(characteristic.properties),
                ));
            }
        }
        Ok(catalog)
    }

    async fn read(&self, target: &CharacteristicRef) -> Result<Vec<u8>, AdapterError> {
        let (peripheral, characteristic) = self.characteristic(target).await?;
        peripheral.read(&characteristic).await.map_err(backend)
    }

    async fn write(
        &self,
        target: &CharacteristicRef,
        data: &[u8],
        no_ack: bool,
    ) -> Result<(), AdapterError> {
        let (peripheral, characteristic) = self.characteristic(target).await?;
        let write_type = if no_ack {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(backend)
    }

    async fn subscribe(&self, target: &CharacteristicRef) -> Result<ValueStream, AdapterError> {
        let (peripheral, characteristic) = self.characteristic(target).await?;
        let notifications = peripheral.notifications().await.map_err(backend)?;
        peripheral.subscribe(&characteristic).await.map_err(backend)?;

        let uuid = characteristic.uuid;
        let stream = notifications
            .filter(move |n| futures::future::ready(n.uuid == uuid))
            .map(|n| Ok(n.value));
        Ok(stream.boxed())
    }
}
