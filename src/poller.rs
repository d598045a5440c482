//! Polling scheduler
//!
//! One long-lived loop. Every tick each device gets a liveness probe and a
//! telemetry read under its exclusive access; devices are polled concurrently
//! and a failure on one never affects the others.

use futures_util::future::join_all;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionManager, ConnectionState, DeviceGuard};
use crate::metrics;
use crate::modbus::TransportError;
use crate::registry::{DeviceDescriptor, DeviceRegistry, LIVENESS_PROBE};
use crate::store::StateStore;
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// New snapshot published
    Updated,
    /// A command holds the device; polled again next cycle
    Busy,
    /// Session could not be opened
    Unreachable,
    /// Session opened but a read failed
    ReadFailed,
}

impl PollOutcome {
    fn label(self) -> &'static str {
        match self {
            PollOutcome::Updated => "updated",
            PollOutcome::Busy => "busy",
            PollOutcome::Unreachable => "unreachable",
            PollOutcome::ReadFailed => "read_failed",
        }
    }
}

pub struct Poller {
    registry: Arc<DeviceRegistry>,
    connections: Arc<ConnectionManager>,
    store: Arc<StateStore>,
    period: Duration,
}

impl Poller {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        connections: Arc<ConnectionManager>,
        store: Arc<StateStore>,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            connections,
            store,
            period,
        }
    }

    /// Poll forever, one cycle per period measured between cycle starts
    pub async fn run(self: Arc<Self>) {
        info!(
            "Starting polling for {} devices every {}ms",
            self.registry.len(),
            self.period.as_millis()
        );

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.poll_cycle().await;
        }
    }

    /// Poll every registered device once
    pub async fn poll_cycle(&self) -> Vec<(String, PollOutcome)> {
        let polls = self.registry.iter().map(|device| async move {
            let outcome = self.poll_device(device).await;
            metrics::record_poll(&device.id, outcome.label());
            (device.id.clone(), outcome)
        });

        join_all(polls).await
    }

    async fn poll_device(&self, device: &DeviceDescriptor) -> PollOutcome {
        let guard = match self.connections.try_lock(&device.id) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!("Device {} busy with a command, skipping poll", device.id);
                return PollOutcome::Busy;
            }
            Err(e) => {
                error!("Cannot poll {}: {}", device.id, e);
                return PollOutcome::Unreachable;
            }
        };

        let mut session = match self.connections.acquire_session(&guard).await {
            Ok(session) => session,
            Err(e) => {
                error!(
                    "Device {} ({}:{}) connection failed or timed out: {}",
                    device.id, device.host, device.port, e
                );
                return PollOutcome::Unreachable;
            }
        };

        let block = device.kind.telemetry_block();
        let probe = session
            .read_holding_registers(device.unit_id, LIVENESS_PROBE.address, LIVENESS_PROBE.count)
            .await;
        let read = match probe {
            Ok(_) => {
                session
                    .read_holding_registers(device.unit_id, block.address, block.count)
                    .await
            }
            Err(e) => Err(e),
        };

        match read {
            Ok(raw) => {
                if raw.len() < block.count as usize {
                    warn!(
                        "Device {} returned {} of {} registers",
                        device.id,
                        raw.len(),
                        block.count
                    );
                }
                let snapshot = telemetry::decode(device.kind, &raw);
                debug!("Device {} telemetry: {:?}", device.id, snapshot);
                self.store.publish(&guard, snapshot);
                PollOutcome::Updated
            }
            Err(e) => {
                self.read_failed(&guard, &e);
                PollOutcome::ReadFailed
            }
        }
    }

    fn read_failed(&self, guard: &DeviceGuard, error: &TransportError) {
        let device = guard.device();
        if error.is_protocol() {
            error!("Device {} rejected telemetry read: {}", device.id, error);
        } else {
            error!("Failed to read telemetry from {}: {}", device.id, error);
            guard.set_state(ConnectionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceKind;
    use crate::testing::{self, FakeTransport, DIESEL_HOST, PCS_HOST, SBMS_HOST};
    use crate::telemetry::DeviceSnapshot;

    struct Fixture {
        fake: FakeTransport,
        connections: Arc<ConnectionManager>,
        store: Arc<StateStore>,
        poller: Poller,
    }

    fn fixture() -> Fixture {
        let fake = FakeTransport::new();
        let registry = testing::registry();
        let connections = Arc::new(ConnectionManager::new(
            &registry,
            Arc::new(fake.clone()),
            Duration::from_secs(1),
        ));
        let store = Arc::new(StateStore::new(&registry));
        let poller = Poller::new(
            registry,
            Arc::clone(&connections),
            Arc::clone(&store),
            Duration::from_secs(1),
        );
        Fixture {
            fake,
            connections,
            store,
            poller,
        }
    }

    const PCS_BLOCK: [u16; 12] = [3, 1, 125, 2, 5432, 6000, 6100, 41, 7805, 0, 3801, 600];

    #[tokio::test]
    async fn test_cycle_publishes_snapshots() {
        let fx = fixture();
        fx.fake.set_registers(PCS_HOST, 2101, &PCS_BLOCK);

        let outcomes = fx.poller.poll_cycle().await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|(_, o)| *o == PollOutcome::Updated));
        assert!(fx.connections.all_connected());

        let pcs = fx.store.get("pcs").unwrap();
        let pcs = pcs.snapshot.as_pcs().unwrap();
        assert_eq!(pcs.power, 54.32);
        assert_eq!(pcs.supply_frequency, 61.0);

        let calls = fx.fake.calls();
        assert!(calls.contains(&testing::Call::Read {
            host: PCS_HOST.to_string(),
            address: 0,
            count: 1
        }));
        assert!(calls.contains(&testing::Call::Read {
            host: DIESEL_HOST.to_string(),
            address: 100,
            count: 16
        }));
    }

    #[tokio::test]
    async fn test_failed_session_keeps_stale_snapshot() {
        let fx = fixture();
        fx.fake.set_registers(PCS_HOST, 2101, &PCS_BLOCK);
        fx.poller.poll_cycle().await;
        let before = fx.store.get("pcs").unwrap();

        fx.fake.set_reachable(PCS_HOST, false);
        let outcomes = fx.poller.poll_cycle().await;

        assert!(outcomes.contains(&("pcs".to_string(), PollOutcome::Unreachable)));
        assert_eq!(
            fx.connections.state("pcs").unwrap(),
            ConnectionState::Disconnected
        );
        assert_eq!(fx.store.get("pcs").unwrap(), before);
        assert_ne!(before.snapshot, DeviceSnapshot::empty(DeviceKind::Pcs));

        // other devices unaffected
        assert!(fx.connections.is_connected("sbms"));
        assert!(fx.connections.is_connected("diesel"));
    }

    #[tokio::test]
    async fn test_reconnects_on_next_cycle() {
        let fx = fixture();
        fx.fake.set_reachable(SBMS_HOST, false);
        fx.poller.poll_cycle().await;
        assert!(!fx.connections.is_connected("sbms"));

        fx.fake.set_reachable(SBMS_HOST, true);
        fx.poller.poll_cycle().await;
        assert!(fx.connections.is_connected("sbms"));
    }

    #[tokio::test]
    async fn test_short_block_still_decodes() {
        let fx = fixture();
        fx.fake.set_registers(SBMS_HOST, 500, &[123, 7680, 15, 28, 87, 99, 2150, 1]);
        fx.fake.limit_reads(SBMS_HOST, 4);

        fx.poller.poll_cycle().await;

        let record = fx.store.get("sbms").unwrap();
        let bms = record.snapshot.as_bms().unwrap();
        assert_eq!(bms.voltage, 768.0);
        assert_eq!(bms.soc, 0.0);
        assert!(!bms.active);
    }

    #[tokio::test]
    async fn test_exception_on_read_keeps_connection() {
        let fx = fixture();
        fx.fake.set_exception(DIESEL_HOST, 100, 0x02);

        let outcomes = fx.poller.poll_cycle().await;

        assert!(outcomes.contains(&("diesel".to_string(), PollOutcome::ReadFailed)));
        assert!(fx.connections.is_connected("diesel"));
        assert!(fx.store.get("diesel").unwrap().updated_at.is_none());
    }

    #[tokio::test]
    async fn test_busy_device_skipped() {
        let fx = fixture();
        let held = fx.connections.lock("pcs").await.unwrap();

        let outcomes = fx.poller.poll_cycle().await;

        assert!(outcomes.contains(&("pcs".to_string(), PollOutcome::Busy)));
        assert!(outcomes.contains(&("sbms".to_string(), PollOutcome::Updated)));
        assert!(!fx
            .fake
            .calls()
            .iter()
            .any(|c| matches!(c, testing::Call::Read { host, .. } if host == PCS_HOST)));
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_polls_each_period() {
        let fx = fixture();
        let poller = Arc::new(fx.poller);

        let task = tokio::spawn(Arc::clone(&poller).run());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        task.abort();

        // ticks at 0s, 1s and 2s, two reads per device each
        let pcs_reads = fx
            .fake
            .calls()
            .iter()
            .filter(|c| matches!(c, testing::Call::Read { host, .. } if host == PCS_HOST))
            .count();
        assert_eq!(pcs_reads, 6);
    }
}
