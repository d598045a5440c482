//! Structured transport events
//!
//! Every connect and request/response exchange of [`super::TcpTransport`] is
//! reported to an [`EventSink`]. The default sink forwards to `tracing`.

use std::fmt;

use super::{Endpoint, TransportError};

/// Modbus function codes issued by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadHoldingRegisters,
    WriteSingleRegister,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::WriteSingleRegister => 0x06,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionCode::ReadHoldingRegisters => f.write_str("read holding registers"),
            FunctionCode::WriteSingleRegister => f.write_str("write single register"),
        }
    }
}

#[derive(Debug)]
pub enum TransportEvent<'a> {
    Connecting {
        endpoint: &'a Endpoint,
    },
    Connected {
        endpoint: &'a Endpoint,
    },
    ConnectFailed {
        endpoint: &'a Endpoint,
        error: &'a TransportError,
    },
    /// `argument` is the register count for reads and the value for writes
    Request {
        endpoint: &'a Endpoint,
        unit_id: u8,
        function: FunctionCode,
        address: u16,
        argument: u16,
    },
    Response {
        endpoint: &'a Endpoint,
        unit_id: u8,
        function: FunctionCode,
        words: &'a [u16],
    },
    RequestFailed {
        endpoint: &'a Endpoint,
        unit_id: u8,
        function: FunctionCode,
        error: &'a TransportError,
    },
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &TransportEvent<'_>);
}

/// Logs transport events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, event: &TransportEvent<'_>) {
        match event {
            TransportEvent::Connecting { endpoint } => {
                tracing::debug!("Connecting to Modbus TCP: {}", endpoint);
            }
            TransportEvent::Connected { endpoint } => {
                tracing::debug!("Connected to Modbus TCP: {}", endpoint);
            }
            TransportEvent::ConnectFailed { endpoint, error } => {
                tracing::warn!("Connection to {} failed: {}", endpoint, error);
            }
            TransportEvent::Request {
                endpoint,
                unit_id,
                function,
                address,
                argument,
            } => {
                tracing::trace!(
                    "{} (fc {:#04x}) addr {} arg {} -> {} (unit {})",
                    function,
                    function.code(),
                    address,
                    argument,
                    endpoint,
                    unit_id
                );
            }
            TransportEvent::Response {
                endpoint,
                unit_id,
                function,
                words,
            } => {
                tracing::trace!(
                    "{} response from {} (unit {}): {:?}",
                    function,
                    endpoint,
                    unit_id,
                    words
                );
            }
            TransportEvent::RequestFailed {
                endpoint,
                unit_id,
                function,
                error,
            } => {
                tracing::warn!(
                    "{} on {} (unit {}) failed: {}",
                    function,
                    endpoint,
                    unit_id,
                    error
                );
            }
        }
    }
}
