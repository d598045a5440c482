//! Shared state store
//!
//! One snapshot slot per registered device. Reads are lock-free loads of the
//! current `Arc`; writes swap in a whole new record and require the device's
//! exclusive access guard.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::connection::DeviceGuard;
use crate::error::SupervisorError;
use crate::registry::DeviceRegistry;
use crate::telemetry::DeviceSnapshot;

/// Snapshot with the time it was published
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub snapshot: DeviceSnapshot,
    /// `None` until the first successful poll
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct StateStore {
    entries: HashMap<String, ArcSwap<SnapshotRecord>>,
}

impl StateStore {
    pub fn new(registry: &DeviceRegistry) -> Self {
        let entries = registry
            .iter()
            .map(|device| {
                let record = SnapshotRecord {
                    snapshot: DeviceSnapshot::empty(device.kind),
                    updated_at: None,
                };
                (device.id.clone(), ArcSwap::from_pointee(record))
            })
            .collect();

        Self { entries }
    }

    pub fn get(&self, device_id: &str) -> Result<Arc<SnapshotRecord>, SupervisorError> {
        self.entries
            .get(device_id)
            .map(|slot| slot.load_full())
            .ok_or_else(|| SupervisorError::UnknownDevice(device_id.to_string()))
    }

    pub fn all(&self) -> BTreeMap<String, Arc<SnapshotRecord>> {
        self.entries
            .iter()
            .map(|(id, slot)| (id.clone(), slot.load_full()))
            .collect()
    }

    /// Replace the device's snapshot wholesale
    pub fn publish(&self, guard: &DeviceGuard, snapshot: DeviceSnapshot) {
        let device = guard.device();
        match self.entries.get(&device.id) {
            Some(slot) => slot.store(Arc::new(SnapshotRecord {
                snapshot,
                updated_at: Some(Utc::now()),
            })),
            None => tracing::warn!("Dropping snapshot for unregistered device {}", device.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::registry::DeviceKind;
    use crate::telemetry::decode;
    use crate::testing::{self, FakeTransport};
    use std::time::Duration;

    fn fixture() -> (Arc<DeviceRegistry>, StateStore, ConnectionManager) {
        let registry = testing::registry();
        let store = StateStore::new(&registry);
        let connections = ConnectionManager::new(
            &registry,
            Arc::new(FakeTransport::new()),
            Duration::from_secs(1),
        );
        (registry, store, connections)
    }

    #[test]
    fn test_every_device_starts_with_empty_snapshot() {
        let (registry, store, _) = fixture();
        let all = store.all();

        assert_eq!(all.len(), registry.len());
        for device in registry.iter() {
            let record = &all[&device.id];
            assert_eq!(record.snapshot, DeviceSnapshot::empty(device.kind));
            assert!(record.updated_at.is_none());
        }
    }

    #[test]
    fn test_unknown_device() {
        let (_, store, _) = fixture();
        assert!(matches!(
            store.get("nope"),
            Err(SupervisorError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_replaces_whole_snapshot() {
        let (_, store, connections) = fixture();
        let before = store.get("pcs").unwrap();

        let guard = connections.lock("pcs").await.unwrap();
        store.publish(&guard, decode(DeviceKind::Pcs, &[1, 1, 100, 0, 5000]));
        drop(guard);

        let after = store.get("pcs").unwrap();
        assert!(after.updated_at.is_some());
        assert_eq!(after.snapshot.as_pcs().unwrap().power, 50.0);
        // readers holding the old Arc keep a consistent view
        assert_eq!(before.snapshot.as_pcs().unwrap().power, 0.0);
    }
}
