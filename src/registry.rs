//! Static device registry built from configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::error::SupervisorError;

/// Device kind, selects register map and decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Power conversion system (inverter / grid interface)
    Pcs,
    /// Battery management system
    Bms,
    /// Renewable source unit
    Renewable,
    /// Diesel generator
    Genset,
}

/// Block of holding registers read on every poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    pub address: u16,
    pub count: u16,
}

/// Single register read used as the liveness probe
pub const LIVENESS_PROBE: RegisterBlock = RegisterBlock {
    address: 0,
    count: 1,
};

impl DeviceKind {
    pub fn telemetry_block(self) -> RegisterBlock {
        match self {
            DeviceKind::Pcs => RegisterBlock {
                address: 2101,
                count: 12,
            },
            DeviceKind::Bms => RegisterBlock {
                address: 500,
                count: 10,
            },
            DeviceKind::Renewable => RegisterBlock {
                address: 200,
                count: 5,
            },
            DeviceKind::Genset => RegisterBlock {
                address: 100,
                count: 16,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Pcs => "pcs",
            DeviceKind::Bms => "bms",
            DeviceKind::Renewable => "renewable",
            DeviceKind::Genset => "genset",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of a supervised device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub kind: DeviceKind,
}

impl From<&DeviceConfig> for DeviceDescriptor {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            unit_id: config.unit_id,
            kind: config.kind,
        }
    }
}

/// Registered devices in configuration order
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<Arc<DeviceDescriptor>>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new(configs: &[DeviceConfig]) -> Self {
        Self::from_descriptors(configs.iter().map(DeviceDescriptor::from))
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        let mut devices = Vec::new();
        let mut index = HashMap::new();
        for descriptor in descriptors {
            // first definition wins; config validation rejects duplicates anyway
            if index.contains_key(&descriptor.id) {
                continue;
            }
            index.insert(descriptor.id.clone(), devices.len());
            devices.push(Arc::new(descriptor));
        }
        Self { devices, index }
    }

    pub fn get(&self, id: &str) -> Result<&Arc<DeviceDescriptor>, SupervisorError> {
        self.index
            .get(id)
            .map(|&i| &self.devices[i])
            .ok_or_else(|| SupervisorError::UnknownDevice(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceDescriptor>> {
        self.devices.iter()
    }

    /// First device of the given kind, in configuration order
    pub fn first_of_kind(&self, kind: DeviceKind) -> Option<&Arc<DeviceDescriptor>> {
        self.devices.iter().find(|d| d.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
