//! Supervisor surface
//!
//! Wires registry, connection manager, state store, poller and executor
//! together and exposes the operations the HTTP facade needs.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::activity::ActivityLog;
use crate::command::CommandCatalog;
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::SupervisorError;
use crate::executor::{CommandExecutor, CommandResult};
use crate::modbus::Transport;
use crate::poller::Poller;
use crate::registry::{DeviceDescriptor, DeviceKind, DeviceRegistry};
use crate::store::{SnapshotRecord, StateStore};

/// Command target meaning "every device must be connected"
pub const SYSTEM_TARGET: &str = "system";

pub struct Supervisor {
    registry: Arc<DeviceRegistry>,
    connections: Arc<ConnectionManager>,
    store: Arc<StateStore>,
    executor: CommandExecutor,
    poller: Arc<Poller>,
    activity: Arc<ActivityLog>,
    system_device: Option<String>,
}

impl Supervisor {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let registry = Arc::new(DeviceRegistry::new(&config.devices));
        let connections = Arc::new(ConnectionManager::new(
            &registry,
            transport,
            config.polling.connect_timeout(),
        ));
        let store = Arc::new(StateStore::new(&registry));
        let activity = Arc::new(ActivityLog::default());
        let catalog =
            Arc::new(CommandCatalog::builtin().with_overrides(config.commands.iter().cloned()));

        let executor = CommandExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            Arc::clone(&store),
            catalog,
            Arc::clone(&activity),
        );
        let poller = Arc::new(Poller::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            Arc::clone(&store),
            config.polling.interval(),
        ));

        let system_device = config.system_device.clone().or_else(|| {
            registry
                .first_of_kind(DeviceKind::Pcs)
                .map(|device| device.id.clone())
        });
        match &system_device {
            Some(id) => info!("System commands are dispatched to {}", id),
            None => warn!("No PCS configured; system commands are unavailable"),
        }

        Self {
            registry,
            connections,
            store,
            executor,
            poller,
            activity,
            system_device,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// Start the background polling task
    pub fn spawn_polling(&self) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.poller).run())
    }

    pub fn snapshot(&self, device_id: &str) -> Result<Arc<SnapshotRecord>, SupervisorError> {
        self.store.get(device_id)
    }

    pub fn snapshots(&self) -> BTreeMap<String, Arc<SnapshotRecord>> {
        self.store.all()
    }

    pub fn connection_state(&self, device_id: &str) -> Result<ConnectionState, SupervisorError> {
        self.connections.state(device_id)
    }

    pub fn all_connected(&self) -> bool {
        self.connections.all_connected()
    }

    /// Names of disconnected devices in registry order
    pub fn disconnected_names(&self) -> Vec<String> {
        self.registry
            .iter()
            .filter(|device| !self.connections.is_connected(&device.id))
            .map(|device| device.name.clone())
            .collect()
    }

    pub async fn submit_command(
        &self,
        target: &str,
        command: &str,
    ) -> Result<CommandResult, SupervisorError> {
        self.submit_command_with_deadline(target, command, None)
            .await
    }

    /// Run a command on a device, or on the system device for `"system"`
    ///
    /// A system command requires every registered device to be connected and
    /// fails listing the disconnected ones otherwise, without network I/O.
    pub async fn submit_command_with_deadline(
        &self,
        target: &str,
        command: &str,
        deadline: Option<Instant>,
    ) -> Result<CommandResult, SupervisorError> {
        if target != SYSTEM_TARGET {
            return self
                .executor
                .execute_with_deadline(target, command, deadline)
                .await;
        }

        self.executor.catalog().get(command)?;
        let device = self.system_device()?;

        let not_connected = self.disconnected_names();
        if !not_connected.is_empty() {
            warn!(
                "Rejecting system command {}: {} not connected",
                command,
                not_connected.join(", ")
            );
            return Err(SupervisorError::SystemNotReady(not_connected));
        }

        self.executor
            .execute_with_deadline(&device.id, command, deadline)
            .await
    }

    fn system_device(&self) -> Result<&Arc<DeviceDescriptor>, SupervisorError> {
        let id = self
            .system_device
            .as_deref()
            .ok_or(SupervisorError::NoSystemDevice)?;
        self.registry.get(id)
    }
}
