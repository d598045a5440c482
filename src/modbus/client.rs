//! Modbus TCP transport built on tokio-modbus
//!
//! A fresh TCP connection is opened for every session; nothing is pooled.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_modbus::slave::SlaveContext;

use super::events::{EventSink, FunctionCode, TracingEventSink, TransportEvent};
use super::{Endpoint, Session, Transport, TransportError};

/// Opens Modbus TCP sessions with bounded connect and request times
pub struct TcpTransport {
    request_timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl TcpTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            events: Arc::new(TracingEventSink),
        }
    }

    /// Replace the default tracing sink
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }
}

async fn open(endpoint: &Endpoint) -> std::io::Result<Context> {
    let addr = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {}", endpoint),
            )
        })?;

    tcp::connect_slave(addr, Slave(1)).await
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, TransportError> {
        self.events.on_event(&TransportEvent::Connecting { endpoint });

        let result = match tokio::time::timeout(timeout, open(endpoint)).await {
            Err(_) => Err(TransportError::ConnectTimeout {
                endpoint: endpoint.to_string(),
                timeout,
            }),
            Ok(Err(source)) => Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                source,
            }),
            Ok(Ok(ctx)) => Ok(ctx),
        };

        match result {
            Ok(ctx) => {
                self.events.on_event(&TransportEvent::Connected { endpoint });
                Ok(Box::new(TcpSession {
                    endpoint: endpoint.clone(),
                    ctx,
                    timeout: self.request_timeout,
                    events: Arc::clone(&self.events),
                }))
            }
            Err(error) => {
                self.events.on_event(&TransportEvent::ConnectFailed {
                    endpoint,
                    error: &error,
                });
                Err(error)
            }
        }
    }
}

struct TcpSession {
    endpoint: Endpoint,
    ctx: Context,
    timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl TcpSession {
    fn report_failure(&self, unit_id: u8, function: FunctionCode, error: &TransportError) {
        self.events.on_event(&TransportEvent::RequestFailed {
            endpoint: &self.endpoint,
            unit_id,
            function,
            error,
        });
    }
}

#[async_trait]
impl Session for TcpSession {
    async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let function = FunctionCode::ReadHoldingRegisters;
        self.events.on_event(&TransportEvent::Request {
            endpoint: &self.endpoint,
            unit_id,
            function,
            address,
            argument: count,
        });

        self.ctx.set_slave(Slave(unit_id));
        let request = self.ctx.read_holding_registers(address, count);
        let result = match tokio::time::timeout(self.timeout, request).await {
            Err(_) => Err(TransportError::Timeout {
                operation: function,
                timeout: self.timeout,
            }),
            Ok(response) => flatten(response),
        };

        match result {
            Ok(words) => {
                self.events.on_event(&TransportEvent::Response {
                    endpoint: &self.endpoint,
                    unit_id,
                    function,
                    words: &words,
                });
                Ok(words)
            }
            Err(error) => {
                self.report_failure(unit_id, function, &error);
                Err(error)
            }
        }
    }

    async fn write_single_register(
        &mut self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let function = FunctionCode::WriteSingleRegister;
        self.events.on_event(&TransportEvent::Request {
            endpoint: &self.endpoint,
            unit_id,
            function,
            address,
            argument: value,
        });

        self.ctx.set_slave(Slave(unit_id));
        let request = self.ctx.write_single_register(address, value);
        let result = match tokio::time::timeout(self.timeout, request).await {
            Err(_) => Err(TransportError::Timeout {
                operation: function,
                timeout: self.timeout,
            }),
            Ok(response) => flatten(response),
        };

        match result {
            Ok(()) => {
                self.events.on_event(&TransportEvent::Response {
                    endpoint: &self.endpoint,
                    unit_id,
                    function,
                    words: &[value],
                });
                Ok(())
            }
            Err(error) => {
                self.report_failure(unit_id, function, &error);
                Err(error)
            }
        }
    }
}

/// Split a tokio-modbus response into link errors and exception responses
fn flatten<T>(response: tokio_modbus::Result<T>) -> Result<T, TransportError> {
    match response {
        Err(e) => Err(TransportError::Link(e)),
        Ok(Err(exception)) => {
            let message = format!("{:?}", exception);
            Err(TransportError::Exception {
                code: u8::from(exception),
                message,
            })
        }
        Ok(Ok(value)) => Ok(value),
    }
}
