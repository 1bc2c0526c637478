//! The transport boundary between the session loop and the platform
//! Bluetooth stack.
//!
//! Session code never touches btleplug directly. It issues requests
//! through the [`Transport`] trait and consumes the resulting
//! [`TransportEvent`]s from a channel, so the whole state machine can be
//! driven by a scripted transport in tests. Trait methods return as soon
//! as the operation is issued; anything slow (connecting, discovery,
//! acknowledged writes) runs in a spawned task and reports back as an
//! event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::channel::mpsc::Sender;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{DEVICE_NAME_FRAGMENT, KNOWN_SERVICES};
use crate::device::types::{AttributeHandle, DeviceDescriptor, Role, TransportEvent};
use crate::error::DeviceError;

#[async_trait]
pub trait Transport: Send {
    /// Begin discovery. Matching devices arrive as
    /// [`TransportEvent::DeviceDiscovered`], repeated sightings included.
    async fn start_scan(&mut self) -> Result<(), DeviceError>;

    async fn stop_scan(&mut self) -> Result<(), DeviceError>;

    /// Begin connecting to a previously seen (or persisted) identity.
    /// Completion arrives as `Connected` + `AttributesBound`, or
    /// `ConnectFailed`.
    async fn connect(&mut self, id: &str) -> Result<(), DeviceError>;

    async fn disconnect(&mut self) -> Result<(), DeviceError>;

    /// Issue an acknowledged write. The hardware acknowledgment arrives
    /// later as [`TransportEvent::WriteAck`].
    async fn write(&mut self, handle: AttributeHandle, payload: Vec<u8>) -> Result<(), DeviceError>;
}

/// Production transport over btleplug.
pub struct BtleTransport {
    adapter: Adapter,
    events: Sender<TransportEvent>,
    discovered: Arc<Mutex<HashMap<String, Peripheral>>>,
    connected: Arc<Mutex<Option<Peripheral>>>,
    characteristics: Arc<Mutex<HashMap<Uuid, Characteristic>>>,
    scan_cancel: CancellationToken,
    link_cancel: CancellationToken,
}

impl BtleTransport {
    pub async fn new(events: Sender<TransportEvent>) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::Transport {
                reason: "No Bluetooth adapter found".to_string(),
            })?;

        Ok(Self {
            adapter,
            events,
            discovered: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(Mutex::new(None)),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            scan_cancel: CancellationToken::new(),
            link_cancel: CancellationToken::new(),
        })
    }

    fn is_tint_window(name: &str) -> bool {
        name.to_lowercase().contains(DEVICE_NAME_FRAGMENT)
    }

    async fn describe(peripheral: &Peripheral) -> Option<DeviceDescriptor> {
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => {
                debug!("Peripheral {} has no properties yet", peripheral.id());
                return None;
            }
            Err(err) => {
                warn!("Could not query peripheral for properties: {:?}", err);
                return None;
            }
        };

        let name = properties.local_name;
        match &name {
            Some(name) if Self::is_tint_window(name) => {}
            _ => return None,
        }

        Some(DeviceDescriptor {
            id: peripheral.id().to_string(),
            name,
            rssi: properties.rssi,
        })
    }

    /// Look the identity up among this run's discoveries first, then fall
    /// back to the adapter's known peripherals so a persisted identity can
    /// reconnect without a fresh scan.
    async fn find_peripheral(
        adapter: &Adapter,
        discovered: &Arc<Mutex<HashMap<String, Peripheral>>>,
        id: &str,
    ) -> Result<Peripheral, DeviceError> {
        if let Some(peripheral) = discovered.lock().unwrap().get(id).cloned() {
            return Ok(peripheral);
        }

        for peripheral in adapter.peripherals().await? {
            if peripheral.id().to_string() == id {
                return Ok(peripheral);
            }
        }

        Err(DeviceError::UnknownDevice(id.to_string()))
    }

    /// Connect, walk the two known service groups, subscribe and read.
    /// Runs on a spawned task; everything it learns goes out as events.
    async fn setup_link(
        peripheral: Peripheral,
        id: String,
        mut events: Sender<TransportEvent>,
        connected: Arc<Mutex<Option<Peripheral>>>,
        characteristics: Arc<Mutex<HashMap<Uuid, Characteristic>>>,
        cancel: CancellationToken,
    ) -> Result<(), DeviceError> {
        info!("Connecting to peripheral {}...", id);
        peripheral.connect().await?;

        info!("Connected; discovering services...");
        peripheral.discover_services().await?;

        let mut bound: Vec<(Role, AttributeHandle)> = Vec::new();
        let mut readable: Vec<(Role, Characteristic)> = Vec::new();

        for service in peripheral.services() {
            if !KNOWN_SERVICES.contains(&service.uuid) {
                debug!("Skipping unrelated service {}", service.uuid);
                continue;
            }

            for characteristic in &service.characteristics {
                let role = match Role::from_uuid(characteristic.uuid) {
                    Some(role) => role,
                    None => {
                        info!("Ignoring unrecognized attribute {}", characteristic.uuid);
                        continue;
                    }
                };

                if characteristic.properties.contains(CharPropFlags::NOTIFY) {
                    debug!("Subscribing to {:?} ({})", role, characteristic.uuid);
                    peripheral.subscribe(characteristic).await?;
                }
                if characteristic.properties.contains(CharPropFlags::READ) {
                    readable.push((role, characteristic.clone()));
                }

                bound.push((role, AttributeHandle { uuid: characteristic.uuid }));
                characteristics
                    .lock()
                    .unwrap()
                    .insert(characteristic.uuid, characteristic.clone());
            }
        }

        *connected.lock().unwrap() = Some(peripheral.clone());

        events
            .send(TransportEvent::Connected { id })
            .await
            .map_err(|_| DeviceError::SessionClosed)?;
        events
            .send(TransportEvent::AttributesBound(bound))
            .await
            .map_err(|_| DeviceError::SessionClosed)?;

        // One-shot reads give the session its initial values before the
        // first notification arrives.
        for (role, characteristic) in readable {
            match peripheral.read(&characteristic).await {
                Ok(payload) => {
                    events
                        .send(TransportEvent::Notification { role, payload })
                        .await
                        .map_err(|_| DeviceError::SessionClosed)?;
                }
                Err(err) => warn!("Initial read of {:?} failed: {:?}", role, err),
            }
        }

        Self::spawn_notification_pump(peripheral, events, cancel);
        Ok(())
    }

    fn spawn_notification_pump(
        peripheral: Peripheral,
        mut events: Sender<TransportEvent>,
        cancel: CancellationToken,
    ) {
        spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Failed to open notification stream: {:?}", err);
                    let _ = events.send(TransportEvent::Disconnected).await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Notification pump cancelled");
                        return;
                    },
                    notification = stream.next() => match notification {
                        Some(notification) => {
                            if let Some(role) = Role::from_uuid(notification.uuid) {
                                let event = TransportEvent::Notification {
                                    role,
                                    payload: notification.value,
                                };
                                if events.send(event).await.is_err() {
                                    return;
                                }
                            } else {
                                debug!("Notification from unbound attribute {}", notification.uuid);
                            }
                        },
                        None => {
                            info!("Notification stream ended; peripheral is gone");
                            let _ = events.send(TransportEvent::Disconnected).await;
                            return;
                        },
                    },
                }
            }
        });
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn start_scan(&mut self) -> Result<(), DeviceError> {
        self.discovered.lock().unwrap().clear();
        self.scan_cancel = CancellationToken::new();

        // Some backends ignore service filters in the scan request, so
        // matching happens on the advertised name instead.
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scan started");

        let adapter = self.adapter.clone();
        let discovered = self.discovered.clone();
        let mut events = self.events.clone();
        let cancel = self.scan_cancel.clone();

        spawn(async move {
            let mut central_events = match adapter.events().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Could not subscribe to adapter events: {:?}", err);
                    let _ = events.send(TransportEvent::ScanStopped).await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = central_events.next() => {
                        let peripheral_id = match event {
                            Some(CentralEvent::DeviceDiscovered(id))
                            | Some(CentralEvent::DeviceUpdated(id)) => id,
                            Some(_) => continue,
                            None => {
                                let _ = events.send(TransportEvent::ScanStopped).await;
                                return;
                            },
                        };

                        let peripheral = match adapter.peripheral(&peripheral_id).await {
                            Ok(peripheral) => peripheral,
                            Err(err) => {
                                debug!("Could not resolve peripheral {}: {:?}", peripheral_id, err);
                                continue;
                            },
                        };

                        if let Some(descriptor) = Self::describe(&peripheral).await {
                            discovered
                                .lock()
                                .unwrap()
                                .insert(descriptor.id.clone(), peripheral);
                            if events
                                .send(TransportEvent::DeviceDiscovered(descriptor))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    },
                }
            }
        });

        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.scan_cancel.cancel();
        self.adapter.stop_scan().await?;
        info!("Scan stopped");

        let mut events = self.events.clone();
        let _ = events.send(TransportEvent::ScanStopped).await;
        Ok(())
    }

    async fn connect(&mut self, id: &str) -> Result<(), DeviceError> {
        self.link_cancel = CancellationToken::new();

        let adapter = self.adapter.clone();
        let discovered = self.discovered.clone();
        let connected = self.connected.clone();
        let characteristics = self.characteristics.clone();
        let cancel = self.link_cancel.clone();
        let mut events = self.events.clone();
        let id = id.to_string();

        // Watch the adapter for involuntary disconnects of this identity.
        {
            let adapter = adapter.clone();
            let id = id.clone();
            let mut events = events.clone();
            let cancel = cancel.clone();
            spawn(async move {
                let mut central_events = match adapter.events().await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!("Disconnect watcher could not subscribe: {:?}", err);
                        return;
                    }
                };

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = central_events.next() => match event {
                            Some(CentralEvent::DeviceDisconnected(peripheral_id))
                                if peripheral_id.to_string() == id =>
                            {
                                info!("Peripheral {} disconnected", peripheral_id);
                                let _ = events.send(TransportEvent::Disconnected).await;
                                return;
                            },
                            Some(_) => continue,
                            None => return,
                        },
                    }
                }
            });
        }

        spawn(async move {
            let peripheral = match Self::find_peripheral(&adapter, &discovered, &id).await {
                Ok(peripheral) => peripheral,
                Err(err) => {
                    let _ = events
                        .send(TransportEvent::ConnectFailed {
                            id,
                            reason: err.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let result = Self::setup_link(
                peripheral,
                id.clone(),
                events.clone(),
                connected,
                characteristics,
                cancel,
            )
            .await;

            if let Err(err) = result {
                warn!("Connecting to peripheral failed: {:?}", err);
                let _ = events
                    .send(TransportEvent::ConnectFailed {
                        id,
                        reason: err.to_string(),
                    })
                    .await;
            }
        });

        Ok(())
    }

    // No Disconnected event here: the session sets its own phase when it
    // initiates the disconnect, and a confirmation could arrive after it
    // has already started connecting elsewhere. The watcher task reports
    // involuntary drops.
    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.link_cancel.cancel();
        self.characteristics.lock().unwrap().clear();

        let peripheral = self.connected.lock().unwrap().take();
        if let Some(peripheral) = peripheral {
            if let Err(err) = peripheral.disconnect().await {
                warn!("Disconnect failed: {:?}", err);
            }
        }

        Ok(())
    }

    async fn write(&mut self, handle: AttributeHandle, payload: Vec<u8>) -> Result<(), DeviceError> {
        let peripheral = self
            .connected
            .lock()
            .unwrap()
            .clone()
            .ok_or(DeviceError::NotConnected)?;
        let characteristic = self
            .characteristics
            .lock()
            .unwrap()
            .get(&handle.uuid)
            .cloned()
            .ok_or(DeviceError::NotConnected)?;

        let mut events = self.events.clone();
        spawn(async move {
            let result = peripheral
                .write(&characteristic, &payload, WriteType::WithResponse)
                .await;
            let _ = events
                .send(TransportEvent::WriteAck {
                    result: result.map_err(|err| err.to_string()),
                })
                .await;
        });

        Ok(())
    }
}
