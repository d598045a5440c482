//! Command executor
//!
//! Runs a named [`CommandSpec`] against one device while holding the device's
//! exclusive access, so a sequence never interleaves with a poll or another
//! command on the same device.

use serde::Serialize;
use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::activity::ActivityLog;
use crate::command::{CommandCatalog, CommandSpec, CommandStep, Sequence, StepOperation};
use crate::connection::{ConnectionManager, ConnectionState, DeviceGuard};
use crate::error::SupervisorError;
use crate::metrics;
use crate::modbus::{Session, TransportError};
use crate::registry::DeviceRegistry;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Link failed; the device is now disconnected
    Connection,
    /// Device answered with an exception code
    Protocol,
    /// Caller deadline passed at a step boundary
    Deadline,
    /// Step definition cannot be executed
    InvalidStep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct CommandFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Modbus exception code for protocol failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u8>,
}

impl From<&TransportError> for CommandFailure {
    fn from(error: &TransportError) -> Self {
        Self {
            kind: if error.is_protocol() {
                FailureKind::Protocol
            } else {
                FailureKind::Connection
            },
            message: error.to_string(),
            code: error.exception_code(),
        }
    }
}

/// Outcome of a command sequence that was allowed to start
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub device_id: String,
    pub command: String,
    pub succeeded: bool,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandFailure>,
}

impl CommandResult {
    /// Operator-facing summary
    pub fn describe(&self) -> String {
        let seconds = self.elapsed_ms as f64 / 1000.0;
        match &self.error {
            None => format!("Action {} executed in {:.2} seconds", self.command, seconds),
            Some(failure) if self.steps_completed > 0 => format!(
                "Action {} on {} stopped after {} of {} steps, device may need inspection: {}",
                self.command, self.device_id, self.steps_completed, self.total_steps, failure
            ),
            Some(failure) => format!(
                "Error executing action {} on {}: {}",
                self.command, self.device_id, failure
            ),
        }
    }
}

/// Progress of one running sequence, counted in register operations
struct Run<'a> {
    sequence: &'a Sequence,
    operations: usize,
}

impl Run<'_> {
    fn outcome(&self, error: Option<CommandFailure>) -> Outcome {
        Outcome {
            completed: self.sequence.steps_for(self.operations),
            total: self.sequence.total_steps(),
            error,
        }
    }

    fn fail(&self, failure: CommandFailure) -> Outcome {
        self.outcome(Some(failure))
    }

    fn finish(&self) -> Outcome {
        self.outcome(None)
    }

    fn deadline_reached(&self) -> Outcome {
        let completed = self.sequence.steps_for(self.operations);
        self.fail(CommandFailure {
            kind: FailureKind::Deadline,
            message: format!("deadline reached after {} steps", completed),
            code: None,
        })
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

struct Outcome {
    completed: usize,
    total: usize,
    error: Option<CommandFailure>,
}

pub struct CommandExecutor {
    registry: Arc<DeviceRegistry>,
    connections: Arc<ConnectionManager>,
    store: Arc<StateStore>,
    catalog: Arc<CommandCatalog>,
    activity: Arc<ActivityLog>,
}

impl CommandExecutor {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        connections: Arc<ConnectionManager>,
        store: Arc<StateStore>,
        catalog: Arc<CommandCatalog>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            registry,
            connections,
            store,
            catalog,
            activity,
        }
    }

    pub fn catalog(&self) -> &CommandCatalog {
        &self.catalog
    }

    pub async fn execute(
        &self,
        device_id: &str,
        command: &str,
    ) -> Result<CommandResult, SupervisorError> {
        self.execute_with_deadline(device_id, command, None).await
    }

    /// Execute a command, aborting at the first step boundary past `deadline`
    ///
    /// Unknown names, unsupported kinds and disconnected devices are rejected
    /// before any network I/O. Everything after that is reported in the
    /// returned [`CommandResult`].
    pub async fn execute_with_deadline(
        &self,
        device_id: &str,
        command: &str,
        deadline: Option<Instant>,
    ) -> Result<CommandResult, SupervisorError> {
        let device = self.registry.get(device_id)?;
        let spec = self.catalog.get(command)?;
        if let Some(kind) = spec.required_kind() {
            if kind != device.kind {
                return Err(SupervisorError::UnsupportedCommand {
                    command: spec.name.clone(),
                    kind: device.kind,
                });
            }
        }
        if !self.connections.is_connected(device_id) {
            return Err(SupervisorError::NotConnected {
                id: device.id.clone(),
                name: device.name.clone(),
            });
        }

        debug!("Waiting for exclusive access to {} for {}", device_id, command);
        let guard = self.connections.lock(device_id).await?;
        // the link may have dropped while queued behind another holder
        if guard.state() == ConnectionState::Disconnected {
            return Err(SupervisorError::NotConnected {
                id: device.id.clone(),
                name: device.name.clone(),
            });
        }
        let started = Instant::now();

        let snapshot = self.store.get(device_id)?;
        let sequence = spec.expand(&snapshot.snapshot)?;
        let outcome = self.run(&guard, &spec, &sequence, deadline).await;
        drop(guard);

        let elapsed = started.elapsed();
        let result = CommandResult {
            device_id: device.id.clone(),
            command: spec.name.clone(),
            succeeded: outcome.error.is_none(),
            steps_completed: outcome.completed,
            total_steps: outcome.total,
            elapsed_ms: elapsed.as_millis() as u64,
            error: outcome.error,
        };

        let summary = result.describe();
        if result.succeeded {
            info!("{} on {}", summary, device_id);
        } else {
            error!("{}", summary);
        }
        self.activity.record(&summary).await;
        metrics::record_command(device_id, &spec.name, result.succeeded, elapsed);

        Ok(result)
    }

    async fn run(
        &self,
        guard: &DeviceGuard,
        spec: &CommandSpec,
        sequence: &Sequence,
        deadline: Option<Instant>,
    ) -> Outcome {
        let device = guard.device();
        let mut run = Run {
            sequence,
            operations: 0,
        };

        if expired(deadline) {
            warn!("Deadline passed before {} on {} started", spec.name, device.id);
            return run.deadline_reached();
        }

        let mut session = match self.connections.acquire_session(guard).await {
            Ok(session) => session,
            Err(e) => return run.fail(CommandFailure::from(&e)),
        };

        info!(
            "Running {} on {} ({} steps)",
            spec.name,
            device.id,
            sequence.total_steps()
        );

        for step in &sequence.operations {
            if expired(deadline) {
                warn!(
                    "Deadline reached for {} on {} after {} operations",
                    spec.name, device.id, run.operations
                );
                return run.deadline_reached();
            }

            match self.run_step(guard, session.as_mut(), step).await {
                Ok(StepFlow::Continue) => run.operations += 1,
                Ok(StepFlow::Satisfied) => {
                    run.operations += 1;
                    info!(
                        "Register {} on {} already in desired state, skipping remaining steps",
                        step.address, device.id
                    );
                    return run.finish();
                }
                Err(failure) => return run.fail(failure),
            }

            let delay = step.post_delay();
            if !delay.is_zero() {
                let wake = Instant::now() + delay;
                match deadline {
                    Some(deadline) if deadline < wake => {
                        sleep_until(deadline).await;
                        warn!(
                            "Deadline cut the settle delay of {} on {} short",
                            spec.name, device.id
                        );
                        return run.deadline_reached();
                    }
                    _ => sleep_until(wake).await,
                }
            }
        }

        run.finish()
    }

    async fn run_step(
        &self,
        guard: &DeviceGuard,
        session: &mut dyn Session,
        step: &CommandStep,
    ) -> Result<StepFlow, CommandFailure> {
        let device = guard.device();
        let result = match step.operation {
            StepOperation::ReadRegister => session
                .read_holding_registers(device.unit_id, step.address, 1)
                .await
                .map(|words| {
                    debug!("{} register {} = {:?}", device.id, step.address, words);
                    match step.value {
                        Some(desired) if words.first() == Some(&desired) => StepFlow::Satisfied,
                        _ => StepFlow::Continue,
                    }
                }),
            StepOperation::WriteRegister => {
                let Some(value) = step.value else {
                    return Err(CommandFailure {
                        kind: FailureKind::InvalidStep,
                        message: format!("write to register {} has no value", step.address),
                        code: None,
                    });
                };
                session
                    .write_single_register(device.unit_id, step.address, value)
                    .await
                    .map(|()| {
                        debug!("Wrote value {} to register {} on {}", value, step.address, device.id);
                        StepFlow::Continue
                    })
            }
        };

        result.map_err(|e| {
            if !e.is_protocol() {
                guard.set_state(ConnectionState::Disconnected);
            }
            CommandFailure::from(&e)
        })
    }
}

enum StepFlow {
    Continue,
    /// Precondition read found the target state already in place
    Satisfied,
}

/// Upper bound on how long a command may run, for callers that need one
pub fn deadline_after(limit: Duration) -> Instant {
    Instant::now() + limit
}
