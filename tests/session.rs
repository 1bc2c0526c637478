use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{channel, Sender};
use futures::SinkExt;
use tokio::sync::watch;
use uuid::Uuid;

use tintlink::device::samples::SensorChannel;
use tintlink::device::session::{Session, SessionHandle, SessionOptions};
use tintlink::device::transport::Transport;
use tintlink::device::types::{
    AttributeHandle, DeviceDescriptor, Phase, Role, Snapshot, Temperature, TransportEvent,
};
use tintlink::error::DeviceError;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
    Write(Uuid, Vec<u8>),
}

/// Records every issued operation and succeeds immediately. Outcomes are
/// injected by the test through the event channel, the same way the real
/// transport reports them.
struct MockTransport {
    calls: Arc<Mutex<Vec<Call>>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn start_scan(&mut self) -> Result<(), DeviceError> {
        self.calls.lock().unwrap().push(Call::StartScan);
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.calls.lock().unwrap().push(Call::StopScan);
        Ok(())
    }

    async fn connect(&mut self, id: &str) -> Result<(), DeviceError> {
        self.calls.lock().unwrap().push(Call::Connect(id.to_string()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.calls.lock().unwrap().push(Call::Disconnect);
        Ok(())
    }

    async fn write(&mut self, handle: AttributeHandle, payload: Vec<u8>) -> Result<(), DeviceError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Write(handle.uuid, payload));
        Ok(())
    }
}

struct Harness {
    handle: SessionHandle,
    events: Sender<TransportEvent>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Harness {
    fn spawn(options: SessionOptions) -> Harness {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport {
            calls: calls.clone(),
        };
        let (events_tx, events_rx) = channel(16);
        let (session, handle) = Session::new(Box::new(transport), events_rx, options);
        tokio::spawn(session.run());

        Harness {
            handle,
            events: events_tx,
            calls,
        }
    }

    async fn inject(&mut self, event: TransportEvent) {
        self.events.send(event).await.expect("session loop gone");
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

async fn wait_until(
    watch: &mut watch::Receiver<Snapshot>,
    pred: impl Fn(&Snapshot) -> bool,
) -> Snapshot {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let hit = {
                let snapshot = watch.borrow_and_update();
                pred(&snapshot)
            };
            if hit {
                return watch.borrow().clone();
            }
            watch.changed().await.expect("session loop gone");
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}

fn descriptor(id: &str, name: &str, rssi: i16) -> DeviceDescriptor {
    DeviceDescriptor {
        id: id.to_string(),
        name: Some(name.to_string()),
        rssi: Some(rssi),
    }
}

fn bound(roles: &[Role]) -> TransportEvent {
    TransportEvent::AttributesBound(
        roles
            .iter()
            .map(|role| (*role, AttributeHandle { uuid: role.uuid() }))
            .collect(),
    )
}

/// Connects the session to `id` with every role bound.
async fn connect_all(harness: &mut Harness, id: &str) {
    harness.handle.connect(id).await.unwrap();
    harness
        .inject(TransportEvent::Connected { id: id.to_string() })
        .await;
    harness.inject(bound(&Role::all())).await;
    let mut watch = harness.handle.watch();
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Connected).await;
}

#[tokio::test]
async fn scan_lists_and_dedupes_devices() {
    let mut harness = Harness::spawn(SessionOptions {
        scan_timeout: None,
        ..SessionOptions::default()
    });
    let mut watch = harness.handle.watch();

    harness.handle.start_scan().await.unwrap();
    wait_until(&mut watch, |snapshot| snapshot.scanning).await;
    assert_eq!(harness.calls(), vec![Call::StartScan]);

    harness
        .inject(TransportEvent::DeviceDiscovered(descriptor(
            "w1", "Tynt Window", -70,
        )))
        .await;
    harness
        .inject(TransportEvent::DeviceDiscovered(descriptor(
            "w2", "tynt-kitchen", -55,
        )))
        .await;
    // A repeat sighting refreshes signal strength instead of duplicating.
    harness
        .inject(TransportEvent::DeviceDiscovered(descriptor(
            "w1", "Tynt Window", -48,
        )))
        .await;

    let snapshot = wait_until(&mut watch, |snapshot| {
        snapshot.devices.len() == 2 && snapshot.devices[0].rssi == Some(-48)
    })
    .await;
    assert_eq!(snapshot.devices[0].id, "w1");
    assert_eq!(snapshot.devices[1].id, "w2");
    assert_eq!(snapshot.phase, Phase::Scanning);

    harness.handle.stop_scan().await.unwrap();
    let snapshot = wait_until(&mut watch, |snapshot| !snapshot.scanning).await;
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.devices.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn scan_stops_automatically_after_timeout() {
    let mut harness = Harness::spawn(SessionOptions {
        scan_timeout: Some(Duration::from_secs(10)),
        ..SessionOptions::default()
    });
    let mut watch = harness.handle.watch();

    harness.handle.start_scan().await.unwrap();
    wait_until(&mut watch, |snapshot| snapshot.scanning).await;

    wait_until(&mut watch, |snapshot| !snapshot.scanning).await;
    assert!(harness.calls().contains(&Call::StopScan));
}

#[tokio::test]
async fn removing_a_device_forgets_it() {
    let mut harness = Harness::spawn(SessionOptions::default());
    let mut watch = harness.handle.watch();

    harness.handle.start_scan().await.unwrap();
    harness
        .inject(TransportEvent::DeviceDiscovered(descriptor(
            "w1", "Tynt Window", -60,
        )))
        .await;
    wait_until(&mut watch, |snapshot| snapshot.devices.len() == 1).await;

    harness.handle.remove_device("w1").await.unwrap();
    wait_until(&mut watch, |snapshot| snapshot.devices.is_empty()).await;
}

#[tokio::test]
async fn connecting_stops_the_scan_first() {
    let mut harness = Harness::spawn(SessionOptions {
        scan_timeout: None,
        ..SessionOptions::default()
    });
    let mut watch = harness.handle.watch();

    harness.handle.start_scan().await.unwrap();
    wait_until(&mut watch, |snapshot| snapshot.scanning).await;

    harness.handle.connect("w1").await.unwrap();
    let snapshot = wait_until(&mut watch, |snapshot| {
        snapshot.phase == Phase::Connecting
    })
    .await;
    assert!(!snapshot.scanning);
    assert_eq!(
        harness.calls(),
        vec![
            Call::StartScan,
            Call::StopScan,
            Call::Connect("w1".to_string())
        ]
    );
}

#[tokio::test]
async fn notifications_update_the_snapshot() {
    let mut harness = Harness::spawn(SessionOptions::default());
    let mut watch = harness.handle.watch();
    connect_all(&mut harness, "w1").await;

    harness
        .inject(TransportEvent::Notification {
            role: Role::CurrentTint,
            payload: vec![42],
        })
        .await;
    harness
        .inject(TransportEvent::Notification {
            role: Role::Temperature,
            payload: vec![0x01, 0x80],
        })
        .await;
    harness
        .inject(TransportEvent::Notification {
            role: Role::Humidity,
            payload: vec![61],
        })
        .await;

    let snapshot = wait_until(&mut watch, |snapshot| snapshot.humidity.is_some()).await;
    assert_eq!(snapshot.tint, Some(42));
    assert_eq!(snapshot.temperature, Some(Temperature(-2767)));
    assert_eq!(snapshot.humidity, Some(61));
    assert_eq!(snapshot.connected.as_deref(), Some("w1"));
    assert_eq!(snapshot.history.len(SensorChannel::Temperature), 1);
    assert_eq!(snapshot.history.len(SensorChannel::Humidity), 1);
}

#[tokio::test]
async fn malformed_payload_leaves_previous_value() {
    let mut harness = Harness::spawn(SessionOptions::default());
    let mut watch = harness.handle.watch();
    connect_all(&mut harness, "w1").await;

    harness
        .inject(TransportEvent::Notification {
            role: Role::CurrentTint,
            payload: vec![30],
        })
        .await;
    wait_until(&mut watch, |snapshot| snapshot.tint == Some(30)).await;

    harness
        .inject(TransportEvent::Notification {
            role: Role::CurrentTint,
            payload: vec![1, 2, 3],
        })
        .await;
    harness
        .inject(TransportEvent::Notification {
            role: Role::Humidity,
            payload: vec![50],
        })
        .await;

    let snapshot = wait_until(&mut watch, |snapshot| snapshot.humidity == Some(50)).await;
    assert_eq!(snapshot.tint, Some(30));
}

#[tokio::test]
async fn acknowledged_write_resolves_after_ack() {
    let mut harness = Harness::spawn(SessionOptions::default());
    connect_all(&mut harness, "w1").await;

    let completion = harness.handle.write(Role::GoalTint, 55).await.unwrap();
    assert!(harness
        .calls()
        .contains(&Call::Write(Role::GoalTint.uuid(), vec![55])));

    harness
        .inject(TransportEvent::WriteAck { result: Ok(()) })
        .await;
    let result = tokio::time::timeout(Duration::from_secs(5), completion)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn second_write_is_rejected_while_one_is_pending() {
    let mut harness = Harness::spawn(SessionOptions::default());
    connect_all(&mut harness, "w1").await;

    let first = harness.handle.write(Role::GoalTint, 80).await.unwrap();
    let second = harness.handle.write(Role::GoalMotorOpen, 10).await.unwrap();

    let rejection = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(rejection, Err(DeviceError::WriteRejected)));

    // The original write is untouched and still resolves normally.
    harness
        .inject(TransportEvent::WriteAck { result: Ok(()) })
        .await;
    let result = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    let writes = harness
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::Write(..)))
        .count();
    assert_eq!(writes, 1);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_write_times_out() {
    let mut harness = Harness::spawn(SessionOptions::default());
    connect_all(&mut harness, "w1").await;

    let completion = harness.handle.write(Role::GoalTint, 60).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(60), completion)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(DeviceError::WriteTimeout)));

    // The channel accepts writes again after the timeout.
    let second = harness.handle.write(Role::GoalTint, 61).await.unwrap();
    harness
        .inject(TransportEvent::WriteAck { result: Ok(()) })
        .await;
    let result = tokio::time::timeout(Duration::from_secs(60), second)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn write_requires_a_connection() {
    let mut harness = Harness::spawn(SessionOptions::default());

    let result = harness.handle.write_and_wait(Role::GoalTint, 40).await;
    assert!(matches!(result, Err(DeviceError::NotConnected)));
    assert!(harness.calls().is_empty());
    assert_eq!(harness.handle.snapshot().phase, Phase::Idle);
}

#[tokio::test]
async fn write_to_a_read_only_role_is_refused() {
    let mut harness = Harness::spawn(SessionOptions::default());
    connect_all(&mut harness, "w1").await;

    let result = harness.handle.write_and_wait(Role::CurrentTint, 40).await;
    assert!(matches!(result, Err(DeviceError::NotWritable(Role::CurrentTint))));
    assert!(!harness
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Write(..))));
}

#[tokio::test]
async fn write_requires_the_role_to_be_bound() {
    let mut harness = Harness::spawn(SessionOptions::default());
    let mut watch = harness.handle.watch();

    harness.handle.connect("w1").await.unwrap();
    harness
        .inject(TransportEvent::Connected {
            id: "w1".to_string(),
        })
        .await;
    harness.inject(bound(&[Role::CurrentTint])).await;
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Connected).await;

    let result = harness.handle.write_and_wait(Role::GoalTint, 40).await;
    assert!(matches!(result, Err(DeviceError::NotConnected)));
}

#[tokio::test]
async fn disconnect_fails_the_pending_write_once() {
    let mut harness = Harness::spawn(SessionOptions::default());
    let mut watch = harness.handle.watch();
    connect_all(&mut harness, "w1").await;

    let completion = harness.handle.write(Role::GoalTint, 70).await.unwrap();
    harness.inject(TransportEvent::Disconnected).await;

    let result = tokio::time::timeout(Duration::from_secs(5), completion)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(DeviceError::NotConnected)));

    let snapshot =
        wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Disconnected).await;
    assert_eq!(snapshot.connected, None);

    // A late acknowledgment for the failed write is discarded, and new
    // writes are refused until a reconnect binds attributes again.
    harness
        .inject(TransportEvent::WriteAck { result: Ok(()) })
        .await;
    let result = harness.handle.write_and_wait(Role::GoalTint, 70).await;
    assert!(matches!(result, Err(DeviceError::NotConnected)));
}

#[tokio::test]
async fn disconnect_keeps_last_sensor_values() {
    let mut harness = Harness::spawn(SessionOptions::default());
    let mut watch = harness.handle.watch();
    connect_all(&mut harness, "w1").await;

    harness
        .inject(TransportEvent::Notification {
            role: Role::Humidity,
            payload: vec![45],
        })
        .await;
    wait_until(&mut watch, |snapshot| snapshot.humidity == Some(45)).await;

    harness.inject(TransportEvent::Disconnected).await;
    let snapshot =
        wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Disconnected).await;
    assert_eq!(snapshot.humidity, Some(45));
}

#[tokio::test]
async fn failed_connect_moves_to_failed_phase() {
    let mut harness = Harness::spawn(SessionOptions::default());
    let mut watch = harness.handle.watch();

    harness.handle.connect("w1").await.unwrap();
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Connecting).await;

    harness
        .inject(TransportEvent::ConnectFailed {
            id: "w1".to_string(),
            reason: "peripheral out of range".to_string(),
        })
        .await;
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Failed).await;
}

#[tokio::test]
async fn reconnect_targets_the_remembered_device() {
    let mut harness = Harness::spawn(SessionOptions {
        last_device: Some("w9".to_string()),
        ..SessionOptions::default()
    });
    let mut watch = harness.handle.watch();

    harness.handle.reconnect().await.unwrap();
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Connecting).await;
    assert_eq!(harness.calls(), vec![Call::Connect("w9".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_is_a_noop_while_connected() {
    let mut harness = Harness::spawn(SessionOptions {
        last_device: Some("w1".to_string()),
        ..SessionOptions::default()
    });
    connect_all(&mut harness, "w1").await;

    harness.handle.reconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let connects = harness
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::Connect(_)))
        .count();
    assert_eq!(connects, 1);
}

#[tokio::test]
async fn reconnect_after_a_failed_attempt_reaches_connecting() {
    let mut harness = Harness::spawn(SessionOptions {
        last_device: Some("w9".to_string()),
        ..SessionOptions::default()
    });
    let mut watch = harness.handle.watch();

    harness.handle.connect("w9").await.unwrap();
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Connecting).await;
    harness
        .inject(TransportEvent::ConnectFailed {
            id: "w9".to_string(),
            reason: "peripheral out of range".to_string(),
        })
        .await;
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Failed).await;

    harness.handle.reconnect().await.unwrap();
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Connecting).await;
    assert_eq!(
        harness.calls(),
        vec![
            Call::Connect("w9".to_string()),
            Call::Connect("w9".to_string())
        ]
    );
}

#[tokio::test]
async fn late_attribute_binding_after_disconnect_is_ignored() {
    let mut harness = Harness::spawn(SessionOptions::default());
    let mut watch = harness.handle.watch();
    connect_all(&mut harness, "w1").await;

    harness.inject(TransportEvent::Disconnected).await;
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Disconnected).await;

    // Discovery results from the torn-down link arrive after the fact.
    harness.inject(bound(&Role::all())).await;

    harness.handle.connect("w1").await.unwrap();
    harness
        .inject(TransportEvent::Connected {
            id: "w1".to_string(),
        })
        .await;
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Connected).await;

    // The new link has not bound anything yet, so writes must be refused
    // instead of going out through a stale handle.
    let result = harness.handle.write_and_wait(Role::GoalTint, 10).await;
    assert!(matches!(result, Err(DeviceError::NotConnected)));
}

#[tokio::test]
async fn connecting_elsewhere_tears_down_the_current_link() {
    let mut harness = Harness::spawn(SessionOptions::default());
    let mut watch = harness.handle.watch();
    connect_all(&mut harness, "w1").await;

    let completion = harness.handle.write(Role::GoalTint, 20).await.unwrap();
    harness.handle.connect("w2").await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), completion)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(DeviceError::NotConnected)));

    let snapshot =
        wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Connecting).await;
    assert_eq!(snapshot.connected, None);

    let calls = harness.calls();
    assert!(calls.contains(&Call::Disconnect));
    assert_eq!(calls.last(), Some(&Call::Connect("w2".to_string())));
}

#[tokio::test]
async fn switching_devices_survives_a_stale_disconnect_confirmation() {
    let mut harness = Harness::spawn(SessionOptions::default());
    let mut watch = harness.handle.watch();
    connect_all(&mut harness, "w1").await;

    harness.handle.connect("w2").await.unwrap();
    wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Connecting).await;

    // A queued confirmation of the old link's teardown must not abort the
    // attempt toward w2. The discovery event after it proves it was
    // processed before we check the phase.
    harness.inject(TransportEvent::Disconnected).await;
    harness
        .inject(TransportEvent::DeviceDiscovered(descriptor(
            "w3", "Tynt Window", -65,
        )))
        .await;
    let snapshot = wait_until(&mut watch, |snapshot| {
        snapshot.devices.iter().any(|device| device.id == "w3")
    })
    .await;
    assert_eq!(snapshot.phase, Phase::Connecting);

    harness
        .inject(TransportEvent::Connected {
            id: "w2".to_string(),
        })
        .await;
    harness.inject(bound(&Role::all())).await;
    let snapshot =
        wait_until(&mut watch, |snapshot| snapshot.phase == Phase::Connected).await;
    assert_eq!(snapshot.connected.as_deref(), Some("w2"));
}
