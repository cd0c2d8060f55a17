use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use vanet::claims::{Allocation, ConsumerKey};
use vanet::reconcile::{self, ReconciliationLoop};
use vanet::registry::DeviceState;
use vanet::simulation::{SimulatedFleet, SimulatedTransport, SimulationConfig};
use vanet::transport::TransportEvent;
use vanet::vehicle::DeviceHandle;
use vanet::VanetConfig;

struct Harness {
    fleet: Arc<StdMutex<SimulatedFleet>>,
    reconciler: ReconciliationLoop<SimulatedTransport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    sender: mpsc::UnboundedSender<TransportEvent>,
}

impl Harness {
    fn new(simulation: SimulationConfig, config: VanetConfig) -> Self {
        let fleet = Arc::new(StdMutex::new(SimulatedFleet::new(simulation)));
        let (sender, events) = mpsc::unbounded_channel();
        let transport = SimulatedTransport::new(Arc::clone(&fleet), sender.clone());
        let mut reconciler = ReconciliationLoop::new(config, transport);
        reconciler.start().unwrap();
        Self {
            fleet,
            reconciler,
            events,
            sender,
        }
    }

    /// Handles queued events, including the ones handling produces.
    fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.reconciler.handle_event(event);
            handled += 1;
        }
        handled
    }

    fn tick(&mut self) {
        let produced = self.fleet.lock().unwrap().tick();
        for event in produced {
            self.sender.send(event).unwrap();
        }
        self.drain();
    }
}

fn reported_ids(harness: &Harness) -> Vec<i64> {
    let mut ids: Vec<i64> = harness.reconciler.snapshot().iter().map(|vehicle| vehicle.id).collect();
    ids.sort_unstable();
    ids
}

#[test]
fn test_reliable_fleet_comes_up() {
    let mut harness = Harness::new(SimulationConfig::reliable(3), VanetConfig::default());
    harness.drain();

    let snapshot = harness.reconciler.snapshot();
    assert_eq!(snapshot.len(), 3);
    // Initial reads land before any tick
    assert_eq!(reported_ids(&harness), vec![1, 2, 3]);
    for vehicle in snapshot.iter() {
        assert_eq!(
            harness.reconciler.registry().state(vehicle.handle()),
            Some(DeviceState::Ready)
        );
    }
    assert_eq!(harness.reconciler.get_stats().vehicles_created, 3);
}

#[test]
fn test_strangers_never_become_vehicles() {
    let simulation = SimulationConfig {
        stranger_count: 3,
        ..SimulationConfig::reliable(2)
    };
    let mut harness = Harness::new(simulation, VanetConfig::default());
    harness.drain();

    let snapshot = harness.reconciler.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot
        .iter()
        .all(|vehicle| vehicle.handle().as_str().starts_with("sim-")));
    assert_eq!(harness.reconciler.registry().get_stats().total_ignored, 3);
}

#[test]
fn test_flaky_discovery_converges() {
    let simulation = SimulationConfig {
        device_count: 4,
        stranger_count: 1,
        partial_services_percent: 30.0,
        partial_characteristics_percent: 30.0,
        malformed_frame_percent: 0.0,
        disconnect_percent: 0.0,
        ..SimulationConfig::default()
    };
    let config = VanetConfig {
        max_discovery_attempts: 64,
        ..VanetConfig::default()
    };
    let mut harness = Harness::new(simulation, config);
    harness.drain();

    assert_eq!(harness.reconciler.snapshot().len(), 4);
    assert_eq!(harness.reconciler.get_stats().devices_abandoned, 0);

    for _ in 0..10 {
        harness.tick();
    }

    assert_eq!(reported_ids(&harness), vec![1, 2, 3, 4]);
    for vehicle in harness.reconciler.snapshot().iter() {
        assert!((-1.0..=1.0).contains(&vehicle.speed));
        assert!((-1.0..=1.0).contains(&vehicle.heading));
        assert!(vehicle.has_front_reading());
    }
}

#[test]
fn test_values_stay_in_range_under_garbage() {
    let simulation = SimulationConfig {
        malformed_frame_percent: 40.0,
        ..SimulationConfig::reliable(2)
    };
    let mut harness = Harness::new(simulation, VanetConfig::default());
    harness.drain();

    for _ in 0..25 {
        harness.tick();
        for vehicle in harness.reconciler.snapshot().iter() {
            assert!((-1.0..=1.0).contains(&vehicle.speed));
            assert!((-1.0..=1.0).contains(&vehicle.heading));
        }
    }
    assert!(harness.fleet.lock().unwrap().get_stats().malformed_frames > 0);
    assert_eq!(harness.reconciler.get_stats().unknown_channel_drops, 0);
}

#[test]
fn test_claims_survive_churn() {
    let simulation = SimulationConfig {
        disconnect_percent: 15.0,
        ..SimulationConfig::reliable(3)
    };
    let mut harness = Harness::new(simulation, VanetConfig::default());
    harness.drain();

    let consumers: Vec<ConsumerKey> = (1..=4).map(|i| ConsumerKey::new(format!("node-{}", i))).collect();

    for _ in 0..60 {
        harness.tick();
        for key in &consumers {
            if harness.reconciler.claims().claim_for(key).is_none() {
                let _ = harness.reconciler.allocate(key);
            }
        }

        let snapshot = harness.reconciler.snapshot();
        let claimed = harness.reconciler.claimed();
        assert!(claimed.len() <= snapshot.len());
        assert!(claimed
            .iter()
            .all(|(_, vehicle)| snapshot.get(vehicle.handle()).is_some()));

        let mut handles: Vec<&DeviceHandle> = claimed.iter().map(|(_, vehicle)| vehicle.handle()).collect();
        handles.sort();
        handles.dedup();
        assert_eq!(handles.len(), claimed.len());
    }
    assert!(harness.reconciler.get_stats().devices_evicted > 0);
}

#[test]
fn test_more_consumers_than_vehicles() {
    let mut harness = Harness::new(SimulationConfig::reliable(2), VanetConfig::default());
    harness.drain();

    let outcomes: Vec<Allocation> = (1..=5)
        .map(|i| harness.reconciler.allocate(&ConsumerKey::new(format!("node-{}", i))))
        .collect();

    assert_eq!(outcomes.iter().filter(|a| a.is_allocated()).count(), 2);
    assert_eq!(
        outcomes.iter().filter(|a| **a == Allocation::NoneAvailable).count(),
        3
    );
}

#[tokio::test]
async fn test_drive_builds_vehicles() {
    let fleet = Arc::new(StdMutex::new(SimulatedFleet::new(SimulationConfig::reliable(3))));
    let (sender, events) = mpsc::unbounded_channel();
    let transport = SimulatedTransport::new(Arc::clone(&fleet), sender.clone());
    let shared = Arc::new(Mutex::new(ReconciliationLoop::new(VanetConfig::default(), transport)));
    shared.lock().await.start().unwrap();

    let pump = tokio::spawn(reconcile::drive(Arc::clone(&shared), events));

    let ready = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if shared.lock().await.snapshot().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(ready.is_ok());

    let produced = fleet.lock().unwrap().tick();
    let notifications = produced.len() as u64;
    for event in produced {
        sender.send(event).unwrap();
    }

    let applied = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let updates = shared.lock().await.get_stats().updates_applied;
            // Three devices, four initial reads each
            if updates >= 12 + notifications {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(applied.is_ok());

    shared.lock().await.stop();
    sender
        .send(TransportEvent::Disconnected {
            handle: DeviceHandle::new("sim-0001"),
        })
        .unwrap();

    let stats = pump.await.unwrap();
    assert_eq!(stats.vehicles_created, 3);
    assert_eq!(stats.devices_evicted, 0);
}
