//! Response shapes for the HTTP facade

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connection::ConnectionState;
use crate::registry::{DeviceDescriptor, DeviceKind};
use crate::store::SnapshotRecord;
use crate::telemetry::{
    BmsSnapshot, DeviceSnapshot, GensetSnapshot, PcsSnapshot, RenewableSnapshot,
};

/// Kind-specific telemetry, one variant per device kind
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TelemetryView {
    Pcs(PcsSnapshot),
    Bms(BmsSnapshot),
    Renewable(RenewableSnapshot),
    Genset(GensetSnapshot),
}

impl TelemetryView {
    fn active(&self) -> bool {
        match self {
            TelemetryView::Pcs(pcs) => pcs.active,
            TelemetryView::Bms(bms) => bms.active,
            TelemetryView::Renewable(renewable) => renewable.active,
            TelemetryView::Genset(genset) => genset.active,
        }
    }
}

impl From<&DeviceSnapshot> for TelemetryView {
    fn from(snapshot: &DeviceSnapshot) -> Self {
        match snapshot {
            DeviceSnapshot::Pcs(pcs) => TelemetryView::Pcs(pcs.clone()),
            DeviceSnapshot::Bms(bms) => TelemetryView::Bms(bms.clone()),
            DeviceSnapshot::Renewable(renewable) => TelemetryView::Renewable(renewable.clone()),
            DeviceSnapshot::Genset(genset) => TelemetryView::Genset(genset.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub kind: DeviceKind,
    pub connected: bool,
    /// "Active" or "Inactive" as shown on the operator panel
    pub status: &'static str,
    pub updated_at: Option<DateTime<Utc>>,
    pub telemetry: TelemetryView,
}

impl DeviceView {
    pub fn new(device: &DeviceDescriptor, state: ConnectionState, record: &SnapshotRecord) -> Self {
        let telemetry = TelemetryView::from(&record.snapshot);
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            host: device.host.clone(),
            port: device.port,
            kind: device.kind,
            connected: state == ConnectionState::Connected,
            status: if telemetry.active() { "Active" } else { "Inactive" },
            updated_at: record.updated_at,
            telemetry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyLink {
    pub from: &'static str,
    pub to: &'static str,
    pub active: bool,
}

/// Charge path below 90% SOC, discharge path at or above it
pub fn energy_links(soc: f64) -> [EnergyLink; 2] {
    [
        EnergyLink {
            from: "diesel",
            to: "sbms",
            active: soc < 90.0,
        },
        EnergyLink {
            from: "sbms",
            to: "fuel_cell",
            active: soc >= 90.0,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry;

    #[test]
    fn test_energy_links_threshold() {
        let [charge, discharge] = energy_links(89.9);
        assert!(charge.active);
        assert!(!discharge.active);

        let [charge, discharge] = energy_links(90.0);
        assert!(!charge.active);
        assert!(discharge.active);
    }

    #[test]
    fn test_device_view_shape() {
        let device = DeviceDescriptor {
            id: "pn14".to_string(),
            name: "PN14".to_string(),
            host: "10.0.0.3".to_string(),
            port: 502,
            unit_id: 1,
            kind: DeviceKind::Renewable,
        };
        let record = SnapshotRecord {
            snapshot: telemetry::decode(DeviceKind::Renewable, &[125, 3, 1]),
            updated_at: None,
        };

        let view = DeviceView::new(&device, ConnectionState::Connected, &record);
        let json = serde_json::to_value(&view).unwrap();

        assert_eq!(json["kind"], "renewable");
        assert_eq!(json["connected"], true);
        assert_eq!(json["status"], "Active");
        assert_eq!(json["telemetry"]["wind"], 12.5);
        assert!(json["telemetry"].get("kind").is_none());
    }
}
