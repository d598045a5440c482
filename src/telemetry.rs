//! Telemetry decoding
//!
//! [`decode`] maps a raw holding-register block onto the typed snapshot of a
//! device kind. Registers missing from a short block decode as zero/false.

use serde::Serialize;

use crate::registry::DeviceKind;

/// Register at `offset`, or 0 if the block is too short
fn word(raw: &[u16], offset: usize) -> u16 {
    raw.get(offset).copied().unwrap_or(0)
}

/// Register at `offset` divided by `divisor`
fn scaled(raw: &[u16], offset: usize, divisor: f64) -> f64 {
    f64::from(word(raw, offset)) / divisor
}

/// Register at `offset` equals 1
fn flag(raw: &[u16], offset: usize) -> bool {
    raw.get(offset) == Some(&1)
}

/// Power conversion system summary block (2101..2112)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PcsSnapshot {
    pub status: u16,
    pub grid_status: u16,
    /// A
    pub current: f64,
    pub operation_mode: u16,
    /// kW
    pub power: f64,
    /// Hz, output frequency
    pub frequency: f64,
    /// Hz, frequency the PCS is asked to supply
    pub supply_frequency: f64,
    pub temperature: f64,
    pub dc_voltage: f64,
    pub fault: u16,
    pub line_voltage: f64,
    pub line_frequency: f64,
    /// Derived: current flowing
    pub active: bool,
}

impl PcsSnapshot {
    pub fn decode(raw: &[u16]) -> Self {
        let current = scaled(raw, 2, 10.0);
        Self {
            status: word(raw, 0),
            grid_status: word(raw, 1),
            current,
            operation_mode: word(raw, 3),
            power: scaled(raw, 4, 100.0),
            frequency: scaled(raw, 5, 100.0),
            supply_frequency: scaled(raw, 6, 100.0),
            temperature: scaled(raw, 7, 1.0),
            dc_voltage: scaled(raw, 8, 10.0),
            fault: word(raw, 9),
            line_voltage: scaled(raw, 10, 10.0),
            line_frequency: scaled(raw, 11, 10.0),
            active: current > 0.0,
        }
    }
}

/// Battery management system block (500..509)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BmsSnapshot {
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    /// %
    pub soc: f64,
    /// %
    pub soh: f64,
    pub capacity: f64,
    pub active: bool,
}

impl BmsSnapshot {
    pub fn decode(raw: &[u16]) -> Self {
        Self {
            power: scaled(raw, 0, 10.0),
            voltage: scaled(raw, 1, 10.0),
            current: scaled(raw, 2, 10.0),
            temperature: scaled(raw, 3, 1.0),
            soc: scaled(raw, 4, 1.0),
            soh: scaled(raw, 5, 1.0),
            capacity: scaled(raw, 6, 10.0),
            active: flag(raw, 7),
        }
    }
}

/// Renewable source block (200..204)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenewableSnapshot {
    /// m/s
    pub wind: f64,
    pub force: f64,
    pub active: bool,
}

impl RenewableSnapshot {
    pub fn decode(raw: &[u16]) -> Self {
        Self {
            wind: scaled(raw, 0, 10.0),
            force: scaled(raw, 1, 1.0),
            active: flag(raw, 2),
        }
    }
}

/// Generator run state reported in register 114
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GensetStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Fault,
    Unknown,
}

impl From<u16> for GensetStatus {
    fn from(raw: u16) -> Self {
        match raw {
            0 => GensetStatus::Stopped,
            1 => GensetStatus::Starting,
            2 => GensetStatus::Running,
            3 => GensetStatus::Fault,
            _ => GensetStatus::Unknown,
        }
    }
}

/// Diesel generator block (100..115)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GensetSnapshot {
    pub l3l1_voltage: f64,
    pub l2l3_voltage: f64,
    pub l1l2_voltage: f64,
    pub l3_current: f64,
    pub l2_current: f64,
    pub l1_current: f64,
    pub frequency: f64,
    pub l3_power: f64,
    pub l2_power: f64,
    pub l1_power: f64,
    pub oil_pressure: f64,
    pub coolant_temperature: f64,
    pub battery_voltage: f64,
    pub charger_voltage: f64,
    pub status: GensetStatus,
    pub fuel: f64,
    /// Derived: l1 + l2 + l3
    pub power: f64,
    /// Derived: coolant temperature
    pub temperature: f64,
    /// Derived: starting or running
    pub active: bool,
}

impl GensetSnapshot {
    pub fn decode(raw: &[u16]) -> Self {
        let mut snapshot = Self {
            l3l1_voltage: scaled(raw, 0, 1.0),
            l2l3_voltage: scaled(raw, 1, 1.0),
            l1l2_voltage: scaled(raw, 2, 1.0),
            l3_current: scaled(raw, 3, 1.0),
            l2_current: scaled(raw, 4, 1.0),
            l1_current: scaled(raw, 5, 1.0),
            frequency: scaled(raw, 6, 100.0),
            l3_power: scaled(raw, 7, 1.0),
            l2_power: scaled(raw, 8, 1.0),
            l1_power: scaled(raw, 9, 1.0),
            oil_pressure: scaled(raw, 10, 1.0),
            coolant_temperature: scaled(raw, 11, 1.0),
            battery_voltage: scaled(raw, 12, 10.0),
            charger_voltage: scaled(raw, 13, 10.0),
            status: GensetStatus::from(word(raw, 14)),
            fuel: scaled(raw, 15, 1.0),
            ..Self::default()
        };

        snapshot.power = snapshot.l1_power + snapshot.l2_power + snapshot.l3_power;
        snapshot.temperature = snapshot.coolant_temperature;
        snapshot.active = matches!(
            snapshot.status,
            GensetStatus::Starting | GensetStatus::Running
        );
        snapshot
    }
}

/// Decoded telemetry of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceSnapshot {
    Pcs(PcsSnapshot),
    Bms(BmsSnapshot),
    Renewable(RenewableSnapshot),
    Genset(GensetSnapshot),
}

impl DeviceSnapshot {
    /// Zero snapshot used before the first successful poll
    pub fn empty(kind: DeviceKind) -> Self {
        decode(kind, &[])
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceSnapshot::Pcs(_) => DeviceKind::Pcs,
            DeviceSnapshot::Bms(_) => DeviceKind::Bms,
            DeviceSnapshot::Renewable(_) => DeviceKind::Renewable,
            DeviceSnapshot::Genset(_) => DeviceKind::Genset,
        }
    }

    pub fn as_pcs(&self) -> Option<&PcsSnapshot> {
        match self {
            DeviceSnapshot::Pcs(pcs) => Some(pcs),
            _ => None,
        }
    }

    pub fn as_bms(&self) -> Option<&BmsSnapshot> {
        match self {
            DeviceSnapshot::Bms(bms) => Some(bms),
            _ => None,
        }
    }
}

/// Decode a raw telemetry block for the given device kind
pub fn decode(kind: DeviceKind, raw: &[u16]) -> DeviceSnapshot {
    match kind {
        DeviceKind::Pcs => DeviceSnapshot::Pcs(PcsSnapshot::decode(raw)),
        DeviceKind::Bms => DeviceSnapshot::Bms(BmsSnapshot::decode(raw)),
        DeviceKind::Renewable => DeviceSnapshot::Renewable(RenewableSnapshot::decode(raw)),
        DeviceKind::Genset => DeviceSnapshot::Genset(GensetSnapshot::decode(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcs_scale_table() {
        let raw = [3, 1, 125, 2, 5432, 6000, 6100, 41, 7805, 0, 3801, 600];
        let pcs = PcsSnapshot::decode(&raw);

        assert_eq!(pcs.status, 3);
        assert_eq!(pcs.grid_status, 1);
        assert_eq!(pcs.current, 12.5);
        assert_eq!(pcs.operation_mode, 2);
        assert_eq!(pcs.power, f64::from(raw[4]) / 100.0);
        assert_eq!(pcs.frequency, 60.0);
        assert_eq!(pcs.supply_frequency, 61.0);
        assert_eq!(pcs.temperature, 41.0);
        assert_eq!(pcs.dc_voltage, f64::from(raw[8]) / 10.0);
        assert_eq!(pcs.line_voltage, 380.1);
        assert_eq!(pcs.line_frequency, 60.0);
        assert!(pcs.active);
    }

    #[test]
    fn test_pcs_power_and_dc_voltage_for_longer_blocks() {
        for extra in 0..4u16 {
            let mut raw: Vec<u16> = (0..12u16).map(|i| i * 97 + extra).collect();
            raw.extend(std::iter::repeat(9).take(extra as usize));

            let pcs = PcsSnapshot::decode(&raw);
            assert_eq!(pcs.power, f64::from(raw[4]) / 100.0);
            assert_eq!(pcs.dc_voltage, f64::from(raw[8]) / 10.0);
        }
    }

    #[test]
    fn test_pcs_inactive_without_current() {
        let pcs = PcsSnapshot::decode(&[1, 1, 0]);
        assert!(!pcs.active);
        assert_eq!(pcs.power, 0.0);
    }

    #[test]
    fn test_bms_short_block_defaults() {
        let bms = BmsSnapshot::decode(&[123, 7680, 152, 28]);

        // registers present in the block still decode
        assert_eq!(bms.power, 12.3);
        assert_eq!(bms.voltage, 768.0);
        assert_eq!(bms.current, 15.2);
        assert_eq!(bms.temperature, 28.0);
        assert_eq!(bms.soc, 0.0);
        assert_eq!(bms.soh, 0.0);
        assert_eq!(bms.capacity, 0.0);
        assert!(!bms.active);
    }

    #[test]
    fn test_bms_full_block() {
        let bms = BmsSnapshot::decode(&[500, 7680, 152, 28, 87, 99, 2150, 1, 0, 0]);

        assert_eq!(bms.power, 50.0);
        assert_eq!(bms.voltage, 768.0);
        assert_eq!(bms.current, 15.2);
        assert_eq!(bms.soc, 87.0);
        assert_eq!(bms.capacity, 215.0);
        assert!(bms.active);
    }

    #[test]
    fn test_renewable_decode() {
        let unit = RenewableSnapshot::decode(&[85, 4, 1, 0, 0]);
        assert_eq!(unit.wind, 8.5);
        assert_eq!(unit.force, 4.0);
        assert!(unit.active);

        // status register missing
        assert!(!RenewableSnapshot::decode(&[85, 4]).active);
    }

    #[test]
    fn test_genset_derived_fields() {
        let raw = [
            400, 401, 402, 10, 11, 12, 5998, 30, 31, 32, 5, 82, 243, 271, 2, 75,
        ];
        let dg = GensetSnapshot::decode(&raw);

        assert_eq!(dg.frequency, 59.98);
        assert_eq!(dg.power, 93.0);
        assert_eq!(dg.temperature, 82.0);
        assert_eq!(dg.battery_voltage, 24.3);
        assert_eq!(dg.charger_voltage, 27.1);
        assert_eq!(dg.status, GensetStatus::Running);
        assert_eq!(dg.fuel, 75.0);
        assert!(dg.active);
    }

    #[test]
    fn test_genset_without_fuel_register() {
        let dg = GensetSnapshot::decode(&[0; 15]);
        assert_eq!(dg.fuel, 0.0);
        assert_eq!(dg.status, GensetStatus::Stopped);
        assert!(!dg.active);
    }

    #[test]
    fn test_empty_snapshots_match_kind() {
        for kind in [
            DeviceKind::Pcs,
            DeviceKind::Bms,
            DeviceKind::Renewable,
            DeviceKind::Genset,
        ] {
            assert_eq!(DeviceSnapshot::empty(kind).kind(), kind);
        }
        assert_eq!(
            DeviceSnapshot::empty(DeviceKind::Pcs),
            DeviceSnapshot::Pcs(PcsSnapshot::default())
        );
    }

    #[test]
    fn test_snapshot_serializes_with_kind_tag() {
        let json = serde_json::to_value(decode(DeviceKind::Renewable, &[10, 2, 1])).unwrap();
        assert_eq!(json["kind"], "renewable");
        assert_eq!(json["wind"], 1.0);
        assert_eq!(json["active"], true);
    }
}
