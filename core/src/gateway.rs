//! Gateway operations
//!
//! Everything the HTTP surface offers, without HTTP: node listings, GATT
//! catalog listings, value reads, writes and subscriptions, plus the scan and
//! connection controls. The gateway also owns the adapter event pump that
//! feeds the device registry.

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{
    AdapterEvent, BleAdapter, CharacteristicInfo, Node, RadioState, ServiceInfo,
};
use crate::connection::{ConnectionCache, ConnectionEntry, ConnectionManager, LifecycleConfig};
use crate::error::{GatewayError, Result};
use crate::idle::{IdleConfig, IdleDisconnector};
use crate::registry::DeviceRegistry;
use crate::value::{self, DecodePolicy, DecodedValue};

/// Decoded notifications of one subscription; ends after the first error
pub type DecodedStream = BoxStream<'static, Result<DecodedValue>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfig {
    pub lifecycle: LifecycleConfig,
    pub idle: IdleConfig,
    pub decode_policy: DecodePolicy,
    pub allow_duplicates: bool,
    /// Advertised services to scan for, empty for all
    pub scan_filter: Vec<String>,
}

/// One row of the connection cache, as shown by `GET connections`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub address: String,
    pub connected: bool,
    /// Milliseconds since the UNIX epoch, 0 when not connected
    pub last_access: u64,
    pub services: usize,
    pub characteristics: usize,
}

impl From<&ConnectionEntry> for ConnectionSummary {
    fn from(entry: &ConnectionEntry) -> Self {
        let catalog = entry.catalog();
        Self {
            address: entry.address().to_string(),
            connected: entry.is_active(),
            last_access: entry.last_access(),
            services: catalog.as_ref().map_or(0, |c| c.services.len()),
            characteristics: catalog.as_ref().map_or(0, |c| c.characteristics.len()),
        }
    }
}

/// Background tasks started by [`Gateway::start`]
pub struct GatewayTasks {
    pub event_pump: JoinHandle<()>,
    pub idle_sweep: JoinHandle<()>,
}

impl GatewayTasks {
    pub fn abort(&self) {
        self.event_pump.abort();
        self.idle_sweep.abort();
    }
}

pub struct Gateway {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<DeviceRegistry>,
    connections: ConnectionManager,
    idle: Arc<IdleDisconnector>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(adapter: Arc<dyn BleAdapter>, config: GatewayConfig) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let cache = Arc::new(ConnectionCache::new());
        let connections = ConnectionManager::new(
            adapter.clone(),
            registry.clone(),
            cache.clone(),
            config.lifecycle,
        );
        let idle = Arc::new(IdleDisconnector::new(
            adapter.clone(),
            registry.clone(),
            cache,
            config.idle,
        ));
        Self {
            adapter,
            registry,
            connections,
            idle,
            config,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn BleAdapter> {
        &self.adapter
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        self.connections.cache()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn idle_disconnector(&self) -> &Arc<IdleDisconnector> {
        &self.idle
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------------

    /// Start the event pump, the first scan and the idle sweep.
    ///
    /// A failing initial scan is logged; `wakeup` or a radio power-on retries
    /// it.
    pub async fn start(self: &Arc<Self>) -> GatewayTasks {
        let event_pump = self.spawn_event_pump();
        if let Err(e) = self.wakeup().await {
            warn!(error = %e, "initial scan failed");
        }
        let idle_sweep = self.idle.clone().spawn();
        GatewayTasks {
            event_pump,
            idle_sweep,
        }
    }

    /// Consume adapter events until the adapter goes away.
    pub fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.adapter.events();
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => gateway.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "adapter event pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("adapter event pump stopped");
        })
    }

    pub async fn handle_event(&self, event: AdapterEvent) {
        match event {
            AdapterEvent::Discovered(node) => {
                let address = node.address.clone();
                if self.registry.upsert(node) {
                    info!(address = %address, "discovered");
                }
            }
            AdapterEvent::Connected(address) => {
                self.registry.set_state(&address, RadioState::Connected);
            }
            AdapterEvent::Disconnected(address) => {
                self.registry.set_state(&address, RadioState::Disconnected);
            }
            AdapterEvent::PoweredOn => {
                info!("adapter powered on, restarting scan");
                self.registry.clear();
                self.cache().clear();
                if let Err(e) = self.wakeup().await {
                    warn!(error = %e, "scan restart failed");
                }
            }
            AdapterEvent::PoweredOff => {
                warn!("adapter powered off");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Nodes and catalog
    // ------------------------------------------------------------------------

    pub fn nodes(&self, connectable_only: bool) -> Vec<Node> {
        self.registry.list(connectable_only)
    }

    pub fn node(&self, address: &str) -> Option<Node> {
        self.registry.find(address)
    }

    /// Services of a node, connecting and discovering if needed.
    pub async fn services(&self, address: &str) -> Result<Vec<ServiceInfo>> {
        let entry = self.connections.resolve(address).await?;
        Ok(entry.services())
    }

    /// Characteristics of one service of a node.
    pub async fn items(&self, address: &str, service_uuid: &str) -> Result<Vec<CharacteristicInfo>> {
        let entry = self.connections.resolve(address).await?;
        Ok(entry
            .catalog()
            .map(|c| c.characteristics_of(service_uuid))
            .unwrap_or_default())
    }

    // ------------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------------

    pub async fn read_value(
        &self,
        address: &str,
        service_uuid: &str,
        uuid: &str,
    ) -> Result<DecodedValue> {
        let (entry, characteristic) = self.characteristic(address, service_uuid, uuid).await?;
        let data = self
            .adapter
            .read(&characteristic.reference(entry.address()))
            .await
            .map_err(|e| GatewayError::ReadFailure(e.to_string()))?;
        entry.touch();
        debug!(address = %entry.address(), uuid, len = data.len(), "read");
        Ok(value::decode_with(&data, self.config.decode_policy))
    }

    /// Write a textual value. The value is validated before any radio I/O.
    pub async fn write_value(
        &self,
        address: &str,
        service_uuid: &str,
        uuid: &str,
        text: Option<&str>,
        no_ack: bool,
    ) -> Result<()> {
        let data = text
            .ok_or(value::ValueError::Empty)
            .and_then(value::parse)
            .map_err(|e| GatewayError::invalid_value(text, e))?;

        let (entry, characteristic) = self.characteristic(address, service_uuid, uuid).await?;
        self.adapter
            .write(&characteristic.reference(entry.address()), &data, no_ack)
            .await
            .map_err(|e| GatewayError::WriteFailure(e.to_string()))?;
        entry.touch();
        debug!(address = %entry.address(), uuid, len = data.len(), no_ack, "wrote");
        Ok(())
    }

    /// Stream of decoded notifications. Every notification counts as an
    /// access; the stream yields the first adapter error and then ends.
    pub async fn subscribe(
        &self,
        address: &str,
        service_uuid: &str,
        uuid: &str,
    ) -> Result<DecodedStream> {
        let (entry, characteristic) = self.characteristic(address, service_uuid, uuid).await?;
        let values = self
            .adapter
            .subscribe(&characteristic.reference(entry.address()))
            .await
            .map_err(|e| GatewayError::SubscribeFailure(e.to_string()))?;
        info!(address = %entry.address(), uuid, "subscribed");

        let policy = self.config.decode_policy;
        let decoded = values
            .map(move |item| match item {
                Ok(data) => {
                    entry.touch();
                    Ok(value::decode_with(&data, policy))
                }
                Err(e) => Err(GatewayError::SubscribeFailure(e.to_string())),
            })
            .scan(false, |failed, item| {
                if *failed {
                    return futures::future::ready(None);
                }
                *failed = item.is_err();
                futures::future::ready(Some(item))
            });
        Ok(decoded.boxed())
    }

    async fn characteristic(
        &self,
        address: &str,
        service_uuid: &str,
        uuid: &str,
    ) -> Result<(Arc<ConnectionEntry>, CharacteristicInfo)> {
        let entry = self.connections.resolve(address).await?;
        let characteristic = self
            .connections
            .find_characteristic(&entry, uuid, Some(service_uuid))
            .ok_or_else(|| GatewayError::characteristic_not_found(Some(service_uuid), uuid))?;
        Ok((entry, characteristic))
    }

    // ------------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------------

    /// Start scanning with the configured filter and duplicate policy.
    pub async fn wakeup(&self) -> Result<()> {
        self.adapter
            .start_scan(&self.config.scan_filter, self.config.allow_duplicates)
            .await
            .map_err(|e| GatewayError::ScanFailure(e.to_string()))?;
        info!(allow_duplicates = self.config.allow_duplicates, "scanning");
        Ok(())
    }

    pub async fn sleep(&self) -> Result<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| GatewayError::ScanFailure(e.to_string()))?;
        info!("scan stopped");
        Ok(())
    }

    /// Connect and discover without touching a characteristic.
    pub async fn open(&self, address: &str) -> Result<()> {
        self.connections.resolve(address).await.map(|_| ())
    }

    /// Disconnect a node if the radio reports it connected.
    pub async fn close(&self, address: &str) -> Result<()> {
        let node = self
            .registry
            .find(address)
            .ok_or_else(|| GatewayError::NodeNotFound(address.to_string()))?;
        if self.adapter.radio_state(&node.address).await != RadioState::Connected {
            return Ok(());
        }
        self.adapter
            .disconnect(&node.address)
            .await
            .map_err(|e| GatewayError::DisconnectFailure(e.to_string()))?;
        info!(address = %node.address, "closed");
        Ok(())
    }

    pub fn connection_summaries(&self) -> Vec<ConnectionSummary> {
        self.cache()
            .snapshot()
            .iter()
            .map(|entry| ConnectionSummary::from(entry.as_ref()))
            .collect()
    }
}
