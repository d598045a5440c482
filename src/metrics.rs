//! Prometheus metrics
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`install`] registers the Prometheus recorder.

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

pub const POLLS_TOTAL: &str = "supervisor_polls_total";
pub const COMMANDS_TOTAL: &str = "supervisor_commands_total";
pub const DEVICE_CONNECTED: &str = "supervisor_device_connected";
pub const COMMAND_DURATION: &str = "supervisor_command_duration_seconds";

/// Install the global Prometheus recorder and return its render handle
pub fn install() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .with_context(|| "Failed to install Prometheus recorder")?;

    describe_counter!(POLLS_TOTAL, "Device polls by outcome");
    describe_counter!(COMMANDS_TOTAL, "Command executions by outcome");
    describe_gauge!(DEVICE_CONNECTED, "1 when the device answered its last request");
    describe_histogram!(COMMAND_DURATION, "Wall-clock duration of command sequences");

    Ok(handle)
}

pub fn record_poll(device_id: &str, outcome: &'static str) {
    counter!(POLLS_TOTAL, "device" => device_id.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_connection_state(device_id: &str, connected: bool) {
    gauge!(DEVICE_CONNECTED, "device" => device_id.to_string())
        .set(if connected { 1.0 } else { 0.0 });
}

pub fn record_command(device_id: &str, command: &str, succeeded: bool, elapsed: Duration) {
    let outcome = if succeeded { "success" } else { "failure" };
    counter!(
        COMMANDS_TOTAL,
        "device" => device_id.to_string(),
        "command" => command.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(COMMAND_DURATION, "command" => command.to_string()).record(elapsed.as_secs_f64());
}
