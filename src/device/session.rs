//! The session state machine and command channel.
//!
//! One tokio task owns a [`Session`] and everything it mutates: the
//! connection phase, the bound attribute table, the decoded sensor
//! snapshot and the single pending write. The task consumes an explicit
//! message stream, requests from [`SessionHandle`]s on one channel and
//! [`TransportEvent`]s from the transport on another, so there is no
//! concurrent mutation anywhere. Observers read the state through a
//! watch channel; each published [`Snapshot`] is replaced whole, before
//! the handling of the triggering message returns.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::channel::oneshot;
use futures::{SinkExt, StreamExt};
use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::codec;
use crate::device::constants::{DEFAULT_SCAN_TIMEOUT_SECS, WRITE_TIMEOUT_SECS};
use crate::device::samples::SensorChannel;
use crate::device::transport::Transport;
use crate::device::types::{
    AttributeHandle, DeviceDescriptor, Phase, Request, Role, Snapshot, TransportEvent,
};
use crate::error::DeviceError;

const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Deployment policy for a session.
pub struct SessionOptions {
    /// Stop an active scan after this long; `None` scans until told to
    /// stop.
    pub scan_timeout: Option<Duration>,
    /// Identity to try first on [`SessionHandle::reconnect`].
    pub last_device: Option<String>,
    /// When set, the connected identity is persisted here on every
    /// successful connect.
    pub store: Option<ConfigIO>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            scan_timeout: Some(Duration::from_secs(DEFAULT_SCAN_TIMEOUT_SECS)),
            last_device: None,
            store: None,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config, store: ConfigIO) -> Self {
        SessionOptions {
            scan_timeout: config.scan_timeout(),
            last_device: config.last_device.clone(),
            store: Some(store),
        }
    }
}

struct PendingWrite {
    role: Role,
    done: oneshot::Sender<Result<(), DeviceError>>,
    deadline: tokio::time::Instant,
}

/// Cloneable front door to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    requests: Sender<Request>,
    snapshot: watch::Receiver<Snapshot>,
}

impl SessionHandle {
    async fn send(&mut self, request: Request) -> Result<(), DeviceError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| DeviceError::SessionClosed)
    }

    pub async fn start_scan(&mut self) -> Result<(), DeviceError> {
        self.send(Request::StartScan).await
    }

    pub async fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.send(Request::StopScan).await
    }

    pub async fn connect(&mut self, id: impl Into<String>) -> Result<(), DeviceError> {
        self.send(Request::Connect(id.into())).await
    }

    pub async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.send(Request::Disconnect).await
    }

    pub async fn reconnect(&mut self) -> Result<(), DeviceError> {
        self.send(Request::Reconnect).await
    }

    pub async fn remove_device(&mut self, id: impl Into<String>) -> Result<(), DeviceError> {
        self.send(Request::RemoveDevice(id.into())).await
    }

    /// Issue an acknowledged write. The returned receiver resolves when
    /// the hardware acknowledgment arrives, or immediately when the
    /// session is not connected, the role is unbound, or another write is
    /// still pending. `value` must already be in the 0-100 domain.
    pub async fn write(
        &mut self,
        role: Role,
        value: u8,
    ) -> Result<oneshot::Receiver<Result<(), DeviceError>>, DeviceError> {
        let (done, completion) = oneshot::channel();
        self.send(Request::Write { role, value, done }).await?;
        Ok(completion)
    }

    /// [`write`](Self::write), awaited to completion.
    pub async fn write_and_wait(&mut self, role: Role, value: u8) -> Result<(), DeviceError> {
        self.write(role, value)
            .await?
            .await
            .map_err(|_| DeviceError::SessionClosed)?
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// A watch receiver for awaiting state changes.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }
}

/// The single active session. Construct with [`Session::new`] and drive
/// it by awaiting [`Session::run`] on its own task.
pub struct Session {
    transport: Box<dyn Transport>,
    requests: Receiver<Request>,
    events: Receiver<TransportEvent>,
    published: watch::Sender<Snapshot>,
    state: Snapshot,
    devices: IndexMap<String, DeviceDescriptor>,
    handles: HashMap<Role, AttributeHandle>,
    pending: Option<PendingWrite>,
    scan_deadline: Option<tokio::time::Instant>,
    options: SessionOptions,
}

impl Session {
    pub fn new(
        transport: Box<dyn Transport>,
        events: Receiver<TransportEvent>,
        options: SessionOptions,
    ) -> (Session, SessionHandle) {
        let (requests_tx, requests_rx) = channel(REQUEST_CHANNEL_CAPACITY);
        let (published, snapshot) = watch::channel(Snapshot::default());

        let session = Session {
            transport,
            requests: requests_rx,
            events,
            published,
            state: Snapshot::default(),
            devices: IndexMap::new(),
            handles: HashMap::new(),
            pending: None,
            scan_deadline: None,
            options,
        };

        let handle = SessionHandle {
            requests: requests_tx,
            snapshot,
        };

        (session, handle)
    }

    /// Run until every handle and the transport event sender are gone.
    pub async fn run(mut self) {
        loop {
            // select! evaluates branch expressions even when the guard is
            // false, so absent deadlines are substituted with a far-off one.
            let far_off = tokio::time::Instant::now() + Duration::from_secs(3600);
            let scan_deadline = self.scan_deadline.unwrap_or(far_off);
            let write_deadline = self
                .pending
                .as_ref()
                .map(|pending| pending.deadline)
                .unwrap_or(far_off);

            tokio::select! {
                request = self.requests.next() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                event = self.events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(scan_deadline), if self.scan_deadline.is_some() => {
                    info!("Scan timeout reached, stopping scan");
                    self.stop_scanning().await;
                },
                _ = tokio::time::sleep_until(write_deadline), if self.pending.is_some() => {
                    warn!("Write acknowledgment did not arrive in time");
                    self.fail_pending(DeviceError::WriteTimeout);
                },
            }
        }

        debug!("Session loop finished");
    }

    fn publish(&mut self) {
        self.state.devices = self.devices.values().cloned().collect();
        self.published.send_replace(self.state.clone());
    }

    fn fail_pending(&mut self, error: DeviceError) {
        if let Some(pending) = self.pending.take() {
            debug!("Failing pending {:?} write: {}", pending.role, error);
            let _ = pending.done.send(Err(error));
        }
    }

    /// Drop everything that is only valid while connected.
    fn invalidate_link(&mut self) {
        self.handles.clear();
        self.fail_pending(DeviceError::NotConnected);
        self.state.connected = None;
    }

    async fn stop_scanning(&mut self) {
        self.scan_deadline = None;
        if !self.state.scanning {
            return;
        }

        if let Err(err) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", err);
        }
        self.state.scanning = false;
        if self.state.phase == Phase::Scanning {
            self.state.phase = Phase::Idle;
        }
        self.publish();
    }

    async fn begin_connect(&mut self, id: String) {
        if self.state.scanning {
            self.stop_scanning().await;
        }

        if matches!(self.state.phase, Phase::Connected | Phase::Connecting) {
            info!("Tearing down previous session before connecting to {}", id);
            self.invalidate_link();
            if let Err(err) = self.transport.disconnect().await {
                warn!("Teardown disconnect failed: {}", err);
            }
        }

        self.state.phase = Phase::Connecting;
        self.publish();

        if let Err(err) = self.transport.connect(&id).await {
            warn!("Connect to {} failed immediately: {}", id, err);
            self.state.phase = Phase::Failed;
            self.publish();
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::StartScan => {
                if self.state.scanning {
                    debug!("Scan already active");
                    return;
                }

                self.devices.clear();
                if let Err(err) = self.transport.start_scan().await {
                    warn!("Failed to start scan: {}", err);
                    self.publish();
                    return;
                }

                self.state.scanning = true;
                if matches!(
                    self.state.phase,
                    Phase::Idle | Phase::Disconnected | Phase::Failed
                ) {
                    self.state.phase = Phase::Scanning;
                }
                self.scan_deadline = self
                    .options
                    .scan_timeout
                    .map(|timeout| tokio::time::Instant::now() + timeout);
                self.publish();
            }
            Request::StopScan => self.stop_scanning().await,
            Request::Connect(id) => self.begin_connect(id).await,
            Request::Disconnect => {
                self.invalidate_link();
                if let Err(err) = self.transport.disconnect().await {
                    warn!("Disconnect failed: {}", err);
                }
                self.state.phase = Phase::Disconnected;
                self.publish();
            }
            Request::Reconnect => {
                if matches!(self.state.phase, Phase::Connected | Phase::Connecting) {
                    debug!("Reconnect requested while {}; ignoring", self.state.phase);
                    return;
                }
                match self.options.last_device.clone() {
                    Some(id) => {
                        info!("Reconnecting to {}", id);
                        self.begin_connect(id).await;
                    }
                    None => {
                        info!("No persisted device to reconnect to; scan and select first");
                    }
                }
            }
            Request::RemoveDevice(id) => {
                self.devices.shift_remove(&id);
                self.publish();
            }
            Request::Write { role, value, done } => {
                if !role.is_writable() {
                    let _ = done.send(Err(DeviceError::NotWritable(role)));
                    return;
                }
                if self.state.phase != Phase::Connected {
                    let _ = done.send(Err(DeviceError::NotConnected));
                    return;
                }
                let handle = match self.handles.get(&role) {
                    Some(handle) => *handle,
                    None => {
                        let _ = done.send(Err(DeviceError::NotConnected));
                        return;
                    }
                };
                if self.pending.is_some() {
                    // The original completion stays pending; only the
                    // late arrival is refused.
                    let _ = done.send(Err(DeviceError::WriteRejected));
                    return;
                }

                let payload = codec::encode_byte(value as i64);
                match self.transport.write(handle, payload.to_vec()).await {
                    Ok(()) => {
                        let deadline = tokio::time::Instant::now()
                            + Duration::from_secs(WRITE_TIMEOUT_SECS);
                        self.pending = Some(PendingWrite { role, done, deadline });
                    }
                    Err(err) => {
                        let _ = done.send(Err(err));
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceDiscovered(descriptor) => {
                match self.devices.get_mut(&descriptor.id) {
                    Some(existing) => {
                        // Repeat sighting: refresh signal strength and a
                        // late-arriving name.
                        existing.rssi = descriptor.rssi;
                        if descriptor.name.is_some() {
                            existing.name = descriptor.name;
                        }
                    }
                    None => {
                        info!(
                            "Discovered {} ({:?}, rssi {:?})",
                            descriptor.id, descriptor.name, descriptor.rssi
                        );
                        self.devices.insert(descriptor.id.clone(), descriptor);
                    }
                }
                self.publish();
            }
            TransportEvent::ScanStopped => {
                self.scan_deadline = None;
                if self.state.scanning {
                    self.state.scanning = false;
                    if self.state.phase == Phase::Scanning {
                        self.state.phase = Phase::Idle;
                    }
                    self.publish();
                }
            }
            TransportEvent::Connected { id } => {
                info!("Connected to {}", id);
                self.state.phase = Phase::Connected;
                self.state.connected = Some(id.clone());
                self.options.last_device = Some(id.clone());
                self.persist_last_device(id).await;
                self.publish();
            }
            TransportEvent::ConnectFailed { id, reason } => {
                warn!("Connecting to {} failed: {}", id, reason);
                self.invalidate_link();
                self.state.phase = Phase::Failed;
                self.publish();
            }
            TransportEvent::AttributesBound(bound) => {
                if self.state.phase != Phase::Connected {
                    debug!("Ignoring attribute bindings outside a connected session");
                    return;
                }
                for (role, handle) in bound {
                    debug!("Bound {:?} to {}", role, handle.uuid);
                    self.handles.insert(role, handle);
                }
            }
            TransportEvent::Notification { role, payload } => {
                if self.apply_payload(role, &payload, Instant::now()) {
                    self.publish();
                }
            }
            TransportEvent::WriteAck { result } => match self.pending.take() {
                Some(pending) => {
                    let result =
                        result.map_err(|reason| DeviceError::Transport { reason });
                    let _ = pending.done.send(result);
                }
                None => debug!("Write acknowledgment with no pending write"),
            },
            TransportEvent::Disconnected => {
                // Only a live link can drop. While Connecting this would
                // be a stale confirmation of a previous teardown; the
                // current attempt resolves through Connected/ConnectFailed.
                if self.state.phase == Phase::Connected {
                    info!("Session disconnected");
                    self.invalidate_link();
                    self.state.phase = Phase::Disconnected;
                    self.publish();
                }
            }
        }
    }

    /// Decode one inbound payload into the snapshot. Malformed payloads
    /// are logged and dropped; the previous value stays. Returns whether
    /// anything changed.
    fn apply_payload(&mut self, role: Role, payload: &[u8], now: Instant) -> bool {
        let state = &mut self.state;
        let result = match role {
            Role::CurrentTint => {
                codec::decode_tint(role, payload).map(|value| state.tint = Some(value))
            }
            Role::GoalTint => {
                codec::decode_tint(role, payload).map(|value| state.goal_tint = Some(value))
            }
            Role::DriveState => codec::decode_drive_state(payload)
                .map(|value| state.drive_state = Some(value)),
            Role::AutoMode => codec::decode_percent(role, payload)
                .map(|value| state.auto_mode = Some(value)),
            Role::MotorOpen => codec::decode_percent(role, payload)
                .map(|value| state.motor_open = Some(value)),
            Role::GoalMotorOpen => codec::decode_percent(role, payload)
                .map(|value| state.goal_motor_open = Some(value)),
            Role::Temperature => codec::decode_temperature(payload).map(|value| {
                state.temperature = Some(value);
                state
                    .history
                    .record(SensorChannel::Temperature, value.celsius(), now);
            }),
            Role::Humidity => codec::decode_humidity(payload).map(|value| {
                state.humidity = Some(value);
                state
                    .history
                    .record(SensorChannel::Humidity, value as f32, now);
            }),
            Role::AmbientLight => codec::decode_illuminance(payload).map(|value| {
                state.light = Some(value);
                state
                    .history
                    .record(SensorChannel::InteriorLight, value.interior, now);
                state
                    .history
                    .record(SensorChannel::ExteriorLight, value.exterior, now);
                state.history.record(
                    SensorChannel::ExteriorTintedLight,
                    value.exterior_tinted,
                    now,
                );
            }),
            Role::Acceleration => {
                // Opaque payload, forwarded as-is.
                state.acceleration = Some(payload.to_vec());
                Ok(())
            }
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                warn!("Dropping malformed {:?} payload: {}", role, err);
                false
            }
        }
    }

    async fn persist_last_device(&mut self, id: String) {
        let store = match &self.options.store {
            Some(store) => store.clone(),
            None => return,
        };

        let mut config = match store.read().await {
            Ok(config) => config,
            Err(err) => {
                warn!("Could not read config before persisting device: {}", err);
                Config::default()
            }
        };
        config.last_device = Some(id);

        if let Err(err) = store.save(config).await {
            warn!("Failed to persist last connected device: {}", err);
        }
    }
}
