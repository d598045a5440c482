//! Errors raised before a command reaches the network

use crate::registry::DeviceKind;

/// Rejections of supervisor requests
///
/// All variants are produced without touching the transport.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Invalid device: {0}")]
    UnknownDevice(String),
    #[error("Invalid control command: {0}")]
    UnknownCommand(String),
    #[error("Command {command} is not supported by {kind} devices")]
    UnsupportedCommand { command: String, kind: DeviceKind },
    #[error("{name} is not connected")]
    NotConnected { id: String, name: String },
    #[error("Devices not connected: {}", .0.join(", "))]
    SystemNotReady(Vec<String>),
    #[error("No device is configured to receive system commands")]
    NoSystemDevice,
}

impl SupervisorError {
    /// Unknown ids and command names, as opposed to device state
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SupervisorError::UnknownDevice(_)
                | SupervisorError::UnknownCommand(_)
                | SupervisorError::UnsupportedCommand { .. }
                | SupervisorError::NoSystemDevice
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_not_ready_lists_names() {
        let err = SupervisorError::SystemNotReady(vec!["PCS".to_string(), "DG".to_string()]);
        assert_eq!(err.to_string(), "Devices not connected: PCS, DG");
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_configuration_errors() {
        assert!(SupervisorError::UnknownDevice("x".to_string()).is_configuration());
        assert!(SupervisorError::UnknownCommand("x".to_string()).is_configuration());
        assert!(!SupervisorError::NotConnected {
            id: "pcs".to_string(),
            name: "PCS".to_string()
        }
        .is_configuration());
    }
}
