//! Modbus transport capability
//!
//! The core talks to devices only through [`Transport`] and [`Session`].
//! [`client::TcpTransport`] is the tokio-modbus implementation; tests plug in
//! their own.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

pub mod client;
pub mod events;

pub use client::TcpTransport;
pub use events::{EventSink, FunctionCode, TracingEventSink, TransportEvent};

/// Network address of a Modbus TCP slave
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error type for Modbus operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: FunctionCode,
        timeout: Duration,
    },
    #[error("Modbus exception {code:#04x}: {message}")]
    Exception { code: u8, message: String },
    #[error("Transport error: {0}")]
    Link(#[from] tokio_modbus::Error),
}

impl TransportError {
    /// Remote exception responses mean the link itself is healthy
    pub fn is_protocol(&self) -> bool {
        matches!(self, TransportError::Exception { .. })
    }

    pub fn exception_code(&self) -> Option<u8> {
        match self {
            TransportError::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Opens sessions to field devices
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// One open connection, used for a single poll or command sequence
#[async_trait]
pub trait Session: Send {
    async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_single_register(
        &mut self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError>;
}
