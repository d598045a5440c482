//! Connection manager
//!
//! Owns per-device exclusive access and connection state. Sessions are opened
//! fresh on every request and never pooled; state only changes while the
//! caller holds the device's [`DeviceGuard`].

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::error::SupervisorError;
use crate::metrics;
use crate::modbus::{Endpoint, Session, Transport, TransportError};
use crate::registry::{DeviceDescriptor, DeviceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

struct DeviceSlot {
    device: Arc<DeviceDescriptor>,
    endpoint: Endpoint,
    access: Arc<Mutex<()>>,
    connected: AtomicBool,
}

impl DeviceSlot {
    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

/// Exclusive access to one device
///
/// Held by the poller for one poll and by the executor for a whole command
/// sequence. Dropping the guard releases the device.
pub struct DeviceGuard {
    slot: Arc<DeviceSlot>,
    _access: OwnedMutexGuard<()>,
}

impl fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGuard")
            .field("device", &self.slot.device.id)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceGuard {
    pub fn device(&self) -> &Arc<DeviceDescriptor> {
        &self.slot.device
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let connected = state == ConnectionState::Connected;
        let previous = self.slot.connected.swap(connected, Ordering::SeqCst);
        if previous != connected {
            let device = &self.slot.device;
            if connected {
                info!("Device {} ({}) connected", device.id, self.slot.endpoint);
            } else {
                warn!("Device {} ({}) disconnected", device.id, self.slot.endpoint);
            }
        }
        metrics::record_connection_state(&self.slot.device.id, connected);
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    slots: HashMap<String, Arc<DeviceSlot>>,
}

impl ConnectionManager {
    pub fn new(
        registry: &DeviceRegistry,
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
    ) -> Self {
        let slots = registry
            .iter()
            .map(|device| {
                let slot = DeviceSlot {
                    device: Arc::clone(device),
                    endpoint: Endpoint::new(device.host.clone(), device.port),
                    access: Arc::new(Mutex::new(())),
                    connected: AtomicBool::new(false),
                };
                (device.id.clone(), Arc::new(slot))
            })
            .collect();

        Self {
            transport,
            connect_timeout,
            slots,
        }
    }

    fn slot(&self, device_id: &str) -> Result<&Arc<DeviceSlot>, SupervisorError> {
        self.slots
            .get(device_id)
            .ok_or_else(|| SupervisorError::UnknownDevice(device_id.to_string()))
    }

    /// Wait for exclusive access to a device
    pub async fn lock(&self, device_id: &str) -> Result<DeviceGuard, SupervisorError> {
        let slot = self.slot(device_id)?;
        let access = Arc::clone(&slot.access).lock_owned().await;
        Ok(DeviceGuard {
            slot: Arc::clone(slot),
            _access: access,
        })
    }

    /// Exclusive access if nobody holds it right now
    pub fn try_lock(&self, device_id: &str) -> Result<Option<DeviceGuard>, SupervisorError> {
        let slot = self.slot(device_id)?;
        Ok(Arc::clone(&slot.access)
            .try_lock_owned()
            .ok()
            .map(|access| DeviceGuard {
                slot: Arc::clone(slot),
                _access: access,
            }))
    }

    /// Open a new session to the guarded device
    ///
    /// Success marks the device connected; any failure marks it disconnected.
    /// Failures are not retried here.
    pub async fn acquire_session(
        &self,
        guard: &DeviceGuard,
    ) -> Result<Box<dyn Session>, TransportError> {
        match self
            .transport
            .connect(&guard.slot.endpoint, self.connect_timeout)
            .await
        {
            Ok(session) => {
                guard.set_state(ConnectionState::Connected);
                Ok(session)
            }
            Err(e) => {
                guard.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    pub fn state(&self, device_id: &str) -> Result<ConnectionState, SupervisorError> {
        Ok(self.slot(device_id)?.state())
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        matches!(self.state(device_id), Ok(ConnectionState::Connected))
    }

    pub fn all_connected(&self) -> bool {
        self.slots
            .values()
            .all(|slot| slot.state() == ConnectionState::Connected)
    }
}
