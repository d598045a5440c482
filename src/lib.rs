//! Microgrid device supervisor
//!
//! Polls PCS, BMS, renewable and genset units over Modbus TCP, keeps the
//! latest decoded telemetry per device and runs named control sequences
//! under per-device exclusive access.

pub mod activity;
pub mod api;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod modbus;
pub mod poller;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::SupervisorError;
pub use supervisor::{Supervisor, SYSTEM_TARGET};
