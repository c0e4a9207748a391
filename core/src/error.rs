//! Gateway error kinds
//!
//! Every failure is per-request and carries the text shown to the HTTP
//! client. Adapter failures are kept verbatim as their display text.

use thiserror::Error;

use crate::adapter::AdapterError;
use crate::value::ValueError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("no such peripheral: {0}")]
    NodeNotFound(String),
    /// `<service>.<item>` that did not resolve in the catalog
    #[error("{0}: not found")]
    CharacteristicNotFound(String),
    #[error("{0}")]
    ConnectFailure(String),
    #[error("{0}")]
    DiscoveryFailure(String),
    #[error("{0}")]
    ReadFailure(String),
    #[error("{0}")]
    WriteFailure(String),
    #[error("{0}")]
    SubscribeFailure(String),
    #[error("invalid value: {value}")]
    InvalidValueFormat { value: String, reason: String },
    #[error("{0}")]
    ScanFailure(String),
    #[error("{0}")]
    DisconnectFailure(String),
}

impl GatewayError {
    /// Stable name of the error kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NodeNotFound(_) => "node_not_found",
            GatewayError::CharacteristicNotFound(_) => "characteristic_not_found",
            GatewayError::ConnectFailure(_) => "connect_failure",
            GatewayError::DiscoveryFailure(_) => "discovery_failure",
            GatewayError::ReadFailure(_) => "read_failure",
            GatewayError::WriteFailure(_) => "write_failure",
            GatewayError::SubscribeFailure(_) => "subscribe_failure",
            GatewayError::InvalidValueFormat { .. } => "invalid_value_format",
            GatewayError::ScanFailure(_) => "scan_failure",
            GatewayError::DisconnectFailure(_) => "disconnect_failure",
        }
    }

    /// Whether the request named something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GatewayError::NodeNotFound(_) | GatewayError::CharacteristicNotFound(_)
        )
    }

    /// Whether the error originated in the BLE adapter.
    pub fn is_adapter_failure(&self) -> bool {
        !self.is_not_found() && !matches!(self, GatewayError::InvalidValueFormat { .. })
    }

    pub fn characteristic_not_found(service_uuid: Option<&str>, uuid: &str) -> Self {
        GatewayError::CharacteristicNotFound(format!("{}.{}", service_uuid.unwrap_or(""), uuid))
    }

    pub fn invalid_value(value: Option<&str>, err: ValueError) -> Self {
        GatewayError::InvalidValueFormat {
            value: value.unwrap_or("").to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn connect(err: AdapterError) -> Self {
        GatewayError::ConnectFailure(err.to_string())
    }

    pub(crate) fn discovery(err: AdapterError) -> Self {
        GatewayError::DiscoveryFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
