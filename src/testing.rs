//! In-memory transport for tests
//!
//! Records every request, counts connects and tracks how many sessions are
//! open per host so tests can assert that sequences on one device never
//! overlap.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::DeviceConfig;
use crate::modbus::{Endpoint, FunctionCode, Session, Transport, TransportError};
use crate::registry::{DeviceKind, DeviceRegistry};

/// Registry with one device of each kind on distinct hosts
pub fn device_configs() -> Vec<DeviceConfig> {
    let device = |id: &str, name: &str, kind, host: &str| DeviceConfig {
        id: id.to_string(),
        name: name.to_string(),
        kind,
        host: host.to_string(),
        port: 502,
        unit_id: 1,
    };
    vec![
        device("sbms", "SBMS", DeviceKind::Bms, "10.0.0.2"),
        device("pcs", "PCS", DeviceKind::Pcs, "10.0.0.1"),
        device("pn14", "PN14", DeviceKind::Renewable, "10.0.0.3"),
        device("diesel", "DG", DeviceKind::Genset, "10.0.0.4"),
    ]
}

pub fn registry() -> Arc<DeviceRegistry> {
    Arc::new(DeviceRegistry::new(&device_configs()))
}

pub const PCS_HOST: &str = "10.0.0.1";
pub const SBMS_HOST: &str = "10.0.0.2";
pub const DIESEL_HOST: &str = "10.0.0.4";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Read { host: String, address: u16, count: u16 },
    Write { host: String, address: u16, value: u16 },
}

#[derive(Default)]
struct FakeDevice {
    registers: HashMap<u16, u16>,
    unreachable: bool,
    /// Writes allowed before the link drops
    writes_before_failure: Option<usize>,
    exceptions: HashMap<u16, u8>,
    read_limit: Option<usize>,
    open_sessions: usize,
    max_open_sessions: usize,
}

#[derive(Default)]
struct Inner {
    devices: Mutex<HashMap<String, FakeDevice>>,
    calls: Mutex<Vec<Call>>,
    connects: AtomicUsize,
    latency: Mutex<Duration>,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Inner>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_device<T>(&self, host: &str, f: impl FnOnce(&mut FakeDevice) -> T) -> T {
        let mut devices = self.inner.devices.lock().unwrap();
        f(devices.entry(host.to_string()).or_default())
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        self.with_device(host, |d| d.unreachable = !reachable);
    }

    pub fn set_registers(&self, host: &str, start: u16, words: &[u16]) {
        self.with_device(host, |d| {
            for (offset, word) in words.iter().enumerate() {
                d.registers.insert(start + offset as u16, *word);
            }
        });
    }

    pub fn register(&self, host: &str, address: u16) -> u16 {
        self.with_device(host, |d| d.registers.get(&address).copied().unwrap_or(0))
    }

    /// Let `writes` more writes succeed, then time out every request
    pub fn fail_after_writes(&self, host: &str, writes: usize) {
        self.with_device(host, |d| d.writes_before_failure = Some(writes));
    }

    pub fn set_exception(&self, host: &str, address: u16, code: u8) {
        self.with_device(host, |d| {
            d.exceptions.insert(address, code);
        });
    }

    /// Return at most `len` words per read
    pub fn limit_reads(&self, host: &str, len: usize) {
        self.with_device(host, |d| d.read_limit = Some(len));
    }

    /// Delay applied to every request
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock().unwrap() = latency;
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().unwrap().clone()
    }

    /// (address, value) of every write sent to `host`, in order
    pub fn writes(&self, host: &str) -> Vec<(u16, u16)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Write {
                    host: h,
                    address,
                    value,
                } if h == host => Some((address, value)),
                _ => None,
            })
            .collect()
    }

    /// Highest number of sessions ever open at once against `host`
    pub fn max_open_sessions(&self, host: &str) -> usize {
        self.with_device(host, |d| d.max_open_sessions)
    }

    fn link_down(function: FunctionCode) -> TransportError {
        TransportError::Timeout {
            operation: function,
            timeout: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, TransportError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let reachable = self.with_device(&endpoint.host, |d| {
            if d.unreachable {
                return false;
            }
            d.open_sessions += 1;
            d.max_open_sessions = d.max_open_sessions.max(d.open_sessions);
            true
        });

        if !reachable {
            return Err(TransportError::ConnectTimeout {
                endpoint: endpoint.to_string(),
                timeout,
            });
        }

        Ok(Box::new(FakeSession {
            endpoint: endpoint.clone(),
            transport: self.clone(),
        }))
    }
}

struct FakeSession {
    endpoint: Endpoint,
    transport: FakeTransport,
}

impl FakeSession {
    async fn delay(&self) {
        let latency = *self.transport.inner.latency.lock().unwrap();
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.transport
            .with_device(&self.endpoint.host, |d| d.open_sessions -= 1);
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn read_holding_registers(
        &mut self,
        _unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let host = self.endpoint.host.clone();
        self.transport.inner.calls.lock().unwrap().push(Call::Read {
            host: host.clone(),
            address,
            count,
        });
        self.delay().await;

        self.transport.with_device(&host, |d| {
            if d.unreachable || d.writes_before_failure == Some(0) {
                return Err(FakeTransport::link_down(FunctionCode::ReadHoldingRegisters));
            }
            if let Some(code) = d.exceptions.get(&address) {
                return Err(TransportError::Exception {
                    code: *code,
                    message: "fake exception".to_string(),
                });
            }
            let len = d.read_limit.map_or(count as usize, |l| l.min(count as usize));
            Ok((0..len as u16)
                .map(|offset| d.registers.get(&(address + offset)).copied().unwrap_or(0))
                .collect())
        })
    }

    async fn write_single_register(
        &mut self,
        _unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let host = self.endpoint.host.clone();
        self.delay().await;

        self.transport.with_device(&host, |d| {
            if d.unreachable || d.writes_before_failure == Some(0) {
                return Err(FakeTransport::link_down(FunctionCode::WriteSingleRegister));
            }
            if let Some(code) = d.exceptions.get(&address) {
                return Err(TransportError::Exception {
                    code: *code,
                    message: "fake exception".to_string(),
                });
            }
            if let Some(remaining) = d.writes_before_failure.as_mut() {
                *remaining -= 1;
            }
            d.registers.insert(address, value);
            Ok(())
        })?;

        self.transport.inner.calls.lock().unwrap().push(Call::Write {
            host,
            address,
            value,
        });
        Ok(())
    }
}
