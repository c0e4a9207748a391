// blegate core: BLE GATT peripherals behind plain HTTP verbs
//
// The HTTP layer lives in the CLI crate. Everything with state or timing
// lives here: the device registry, the connection lifecycle, the idle
// sweep and the value codec.

pub mod adapter;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod idle;
pub mod normalize;
pub mod registry;
pub mod value;

pub use adapter::{
    AdapterError, AdapterEvent, BleAdapter, CharacteristicInfo, CharacteristicRef, GattCatalog,
    Node, Operation, RadioState, ServiceInfo, SimulatedAdapter, ValueStream,
};
pub use connection::{
    now_millis, ConnectionCache, ConnectionEntry, ConnectionManager, LifecycleConfig,
};
pub use error::GatewayError;
pub use gateway::{ConnectionSummary, DecodedStream, Gateway, GatewayConfig, GatewayTasks};
pub use idle::{IdleConfig, IdleDisconnector, SweepReport};
pub use registry::DeviceRegistry;
pub use value::{DecodePolicy, DecodedValue, StrDetection, ValueError};
