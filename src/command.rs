//! Command definitions
//!
//! A [`CommandSpec`] is an interpreted list of register operations with
//! post-step delays. Fixed plans run as written; a [`FrequencyRamp`] is
//! expanded at invocation time from the live PCS snapshot.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SupervisorError;
use crate::registry::DeviceKind;
use crate::telemetry::DeviceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOperation {
    ReadRegister,
    WriteRegister,
}

/// One register operation followed by a delay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStep {
    pub operation: StepOperation,
    pub address: u16,
    /// Value to write. On reads: if the register already holds this value
    /// the rest of the sequence is skipped.
    #[serde(default)]
    pub value: Option<u16>,
    #[serde(default)]
    pub post_delay_ms: u64,
}

impl CommandStep {
    pub fn read(address: u16) -> Self {
        Self {
            operation: StepOperation::ReadRegister,
            address,
            value: None,
            post_delay_ms: 0,
        }
    }

    /// Read that ends the sequence early when the register already equals `desired`
    pub fn read_unless(address: u16, desired: u16) -> Self {
        Self {
            value: Some(desired),
            ..Self::read(address)
        }
    }

    pub fn write(address: u16, value: u16) -> Self {
        Self {
            operation: StepOperation::WriteRegister,
            address,
            value: Some(value),
            post_delay_ms: 0,
        }
    }

    pub fn then_wait(mut self, delay: Duration) -> Self {
        self.post_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn post_delay(&self) -> Duration {
        Duration::from_millis(self.post_delay_ms)
    }
}

/// Set a register, hold, clear it, settle
pub fn pulse(address: u16, value: u16, hold: Duration, settle: Duration) -> [CommandStep; 2] {
    [
        CommandStep::write(address, value).then_wait(hold),
        CommandStep::write(address, 0).then_wait(settle),
    ]
}

/// Pulses a frequency-raise register once per resolution step between the
/// PCS output frequency and its supply frequency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRamp {
    pub register: u16,
    pub raise_value: u16,
    pub hold_ms: u64,
    pub settle_ms: u64,
    /// Hz per pulse
    pub resolution_hz: f64,
}

impl FrequencyRamp {
    /// Number of pulses to move from `current` to `target`; never negative
    pub fn increments(&self, current: f64, target: f64) -> u32 {
        let steps = ((target - current) / self.resolution_hz).round();
        if steps.is_finite() && steps > 0.0 {
            steps as u32
        } else {
            0
        }
    }

    pub fn expand(&self, current: f64, target: f64) -> Vec<CommandStep> {
        let increments = self.increments(current, target) as usize;
        pulse(
            self.register,
            self.raise_value,
            Duration::from_millis(self.hold_ms),
            Duration::from_millis(self.settle_ms),
        )
        .iter()
        .cloned()
        .cycle()
        .take(increments * 2)
        .collect()
    }
}

/// Register operations of one invocation
///
/// Steps are reported in units of `group` operations: a ramp counts one step
/// per pulse, fixed plans count every operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    pub operations: Vec<CommandStep>,
    pub group: usize,
}

impl Sequence {
    fn single(operations: Vec<CommandStep>) -> Self {
        Self {
            operations,
            group: 1,
        }
    }

    pub fn total_steps(&self) -> usize {
        self.operations.len() / self.group
    }

    /// Whole steps covered by `operations` completed operations
    pub fn steps_for(&self, operations: usize) -> usize {
        operations / self.group
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandPlan {
    Fixed { steps: Vec<CommandStep> },
    FrequencyRamp { ramp: FrequencyRamp },
}

/// Named command template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(flatten)]
    pub plan: CommandPlan,
}

impl CommandSpec {
    pub fn fixed(name: &str, steps: impl IntoIterator<Item = CommandStep>) -> Self {
        Self {
            name: name.to_string(),
            plan: CommandPlan::Fixed {
                steps: steps.into_iter().collect(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("command name is empty");
        }
        match &self.plan {
            CommandPlan::Fixed { steps } => {
                if steps.is_empty() {
                    bail!("command has no steps");
                }
                for step in steps {
                    if step.operation == StepOperation::WriteRegister && step.value.is_none() {
                        bail!("write to register {} has no value", step.address);
                    }
                }
            }
            CommandPlan::FrequencyRamp { ramp } => {
                if !(ramp.resolution_hz.is_finite() && ramp.resolution_hz > 0.0) {
                    bail!("ramp resolution must be positive");
                }
            }
        }
        Ok(())
    }

    /// Concrete steps for this invocation
    ///
    /// Ramps read the current and target frequency from the live snapshot,
    /// so they only apply to PCS devices.
    pub fn expand(&self, snapshot: &DeviceSnapshot) -> Result<Sequence, SupervisorError> {
        match &self.plan {
            CommandPlan::Fixed { steps } => Ok(Sequence::single(steps.clone())),
            CommandPlan::FrequencyRamp { ramp } => match snapshot {
                DeviceSnapshot::Pcs(pcs) => Ok(Sequence {
                    operations: ramp.expand(pcs.frequency, pcs.supply_frequency),
                    group: 2,
                }),
                other => Err(SupervisorError::UnsupportedCommand {
                    command: self.name.clone(),
                    kind: other.kind(),
                }),
            },
        }
    }

    pub fn required_kind(&self) -> Option<DeviceKind> {
        match self.plan {
            CommandPlan::FrequencyRamp { .. } => Some(DeviceKind::Pcs),
            CommandPlan::Fixed { .. } => None,
        }
    }
}

/// Commands known to the supervisor, by name
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    commands: BTreeMap<String, Arc<CommandSpec>>,
}

const SECOND: Duration = Duration::from_secs(1);

impl CommandCatalog {
    /// Site command set
    pub fn builtin() -> Self {
        let freq_pulse_hold = 2 * SECOND;
        let settle = Duration::from_millis(100);

        let specs = [
            CommandSpec::fixed("operation", [CommandStep::read(501)]),
            CommandSpec::fixed("shutdown", [CommandStep::read(501)]),
            CommandSpec::fixed("pcs_read_summary", [CommandStep::read(2101)]),
            CommandSpec::fixed("start_dg", [CommandStep::write(0x0007, 1)]),
            CommandSpec::fixed("stop_dg", [CommandStep::write(0x0007, 2)]),
            CommandSpec::fixed("acb_open", [CommandStep::write(0x0006, 8)]),
            CommandSpec::fixed("acb_close", [CommandStep::write(0x0006, 4)]),
            CommandSpec::fixed(
                "open_dc_switch",
                [CommandStep::read_unless(5, 1), CommandStep::write(5, 1)],
            ),
            CommandSpec::fixed(
                "close_dc_switch",
                [CommandStep::read_unless(5, 2), CommandStep::write(5, 2)],
            ),
            CommandSpec::fixed("close_pcs_switch", [CommandStep::write(6, 1)]),
            CommandSpec::fixed(
                "close_precharge_switch",
                [CommandStep::read(8), CommandStep::write(8, 7)],
            ),
            CommandSpec::fixed("power_off_sbms", [CommandStep::write(503, 2)]),
            CommandSpec::fixed("clear_sbms_fault", [CommandStep::write(501, 1)]),
            CommandSpec::fixed(
                "power_on_sbms",
                [
                    CommandStep::write(501, 1).then_wait(10 * SECOND),
                    CommandStep::write(503, 1).then_wait(10 * SECOND),
                ],
            ),
            CommandSpec::fixed("pcs_fault_reset", pulse(2000, 128, 5 * SECOND, settle)),
            CommandSpec::fixed(
                "pcs_freq_up",
                pulse(2003, 32, freq_pulse_hold, Duration::ZERO),
            ),
            CommandSpec::fixed(
                "pcs_freq_down",
                pulse(2003, 16, freq_pulse_hold, Duration::ZERO),
            ),
            CommandSpec::fixed("pcs_run_microgrid", [CommandStep::write(2000, 1024 + 1 + 8)]),
            CommandSpec::fixed("pcs_stop_microgrid", [CommandStep::write(2000, 1024)]),
            CommandSpec {
                name: "pcs_freq_reset".to_string(),
                plan: CommandPlan::FrequencyRamp {
                    ramp: FrequencyRamp {
                        register: 2003,
                        raise_value: 32,
                        hold_ms: freq_pulse_hold.as_millis() as u64,
                        settle_ms: settle.as_millis() as u64,
                        resolution_hz: 0.01,
                    },
                },
            },
        ];

        let mut catalog = Self::default();
        for spec in specs {
            catalog.insert(spec);
        }
        catalog
    }

    /// Add a command, replacing any existing one with the same name
    pub fn insert(&mut self, spec: CommandSpec) {
        self.commands.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn with_overrides(mut self, specs: impl IntoIterator<Item = CommandSpec>) -> Self {
        for spec in specs {
            self.insert(spec);
        }
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<CommandSpec>, SupervisorError> {
        self.commands
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownCommand(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}
