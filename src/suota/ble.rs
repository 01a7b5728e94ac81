//! btleplug-backed `GattTransport`.
//!
//! Each request spawns a small task on the tokio runtime that awaits the
//! btleplug call and posts the outcome as a `TransportEvent`. Notifications
//! and adapter disconnects are forwarded by two long-lived tasks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{GattError, SuotaError, SuotaResult};
use super::transport::{ConnectionState, GattTransport, TransportEvent};

/// How often the peripheral list is checked while scanning.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl From<btleplug::Error> for SuotaError {
    fn from(e: btleplug::Error) -> Self {
        SuotaError::Bluetooth(e.to_string())
    }
}

fn gatt_error(e: btleplug::Error) -> GattError {
    match e {
        btleplug::Error::NotConnected => GattError::Disconnected,
        e => GattError::Failed(e.to_string()),
    }
}

/// A device seen while scanning.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}

/// Get the first Bluetooth adapter.
pub async fn get_adapter() -> SuotaResult<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| SuotaError::Bluetooth("No Bluetooth adapter found".into()))
}

/// Scan for `duration` and list every advertising device.
pub async fn scan(duration: Duration) -> SuotaResult<Vec<DiscoveredDevice>> {
    let adapter = get_adapter().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let mut devices = Vec::new();
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            devices.push(DiscoveredDevice {
                name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                address: peripheral.address().to_string(),
                rssi: props.rssi,
            });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

async fn find_device(adapter: &Adapter, target: &str, timeout: Duration) -> SuotaResult<Peripheral> {
    adapter.start_scan(ScanFilter::default()).await?;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        for peripheral in adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let name = props.local_name.unwrap_or_default();
            let address = peripheral.address().to_string();
            if name == target || address.eq_ignore_ascii_case(target) {
                info!("Found {} ({})", name, address);
                adapter.stop_scan().await?;
                return Ok(peripheral);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    }

    adapter.stop_scan().await?;
    Err(SuotaError::DeviceNotFound(target.to_string()))
}

/// Live link to one peripheral.
pub struct BleTransport {
    peripheral: Peripheral,
    state: Arc<Mutex<ConnectionState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    runtime: Handle,
}

impl BleTransport {
    /// Scan for a device by advertised name or address and connect to it.
    ///
    /// Must run inside a tokio runtime. Every callback of the returned
    /// transport arrives on the returned receiver.
    pub async fn connect(
        target: &str,
        scan_timeout: Duration,
    ) -> SuotaResult<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let adapter = get_adapter().await?;
        let peripheral = find_device(&adapter, target, scan_timeout).await?;

        info!("Connecting to {}", peripheral.address());
        peripheral.connect().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ConnectionState::Connected));
        let runtime = Handle::current();

        let mut notifications = peripheral.notifications().await?;
        let notify_tx = tx.clone();
        runtime.spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = TransportEvent::CharacteristicChanged {
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if notify_tx.send(event).is_err() {
                    break;
                }
            }
            debug!("Notification stream ended");
        });

        let mut central_events = adapter.events().await?;
        let id = peripheral.id();
        let watch_state = state.clone();
        let watch_tx = tx.clone();
        runtime.spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        warn!("Device disconnected");
                        mark_disconnected(&watch_state, &watch_tx);
                        break;
                    }
                }
            }
        });

        let _ = tx.send(TransportEvent::ConnectionStateChanged(
            ConnectionState::Connected,
        ));

        Ok((
            Self {
                peripheral,
                state,
                events: tx,
                runtime,
            },
            rx,
        ))
    }

    fn characteristic(&self, uuid: Uuid) -> SuotaResult<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(SuotaError::MissingCharacteristic(uuid))
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}

fn mark_disconnected(
    state: &Mutex<ConnectionState>,
    tx: &mpsc::UnboundedSender<TransportEvent>,
) {
    let changed = match state.lock() {
        Ok(mut current) => {
            let changed = *current != ConnectionState::Disconnected;
            *current = ConnectionState::Disconnected;
            changed
        }
        Err(_) => false,
    };
    if changed {
        let _ = tx.send(TransportEvent::ConnectionStateChanged(
            ConnectionState::Disconnected,
        ));
    }
}

impl GattTransport for BleTransport {
    fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn discover_services(&mut self) -> SuotaResult<()> {
        let peripheral = self.peripheral.clone();
        let tx = self.events.clone();
        self.runtime.spawn(async move {
            let result: Result<Vec<Uuid>, GattError> = peripheral
                .discover_services()
                .await
                .map(|_| peripheral.services().iter().map(|s| s.uuid).collect())
                .map_err(gatt_error);
            let _ = tx.send(TransportEvent::ServicesDiscovered(result));
        });
        Ok(())
    }

    fn discover_characteristics(&mut self, service: Uuid) -> SuotaResult<()> {
        // btleplug discovers characteristics together with services
        let result: Result<Vec<Uuid>, GattError> = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.iter().map(|c| c.uuid).collect())
            .ok_or_else(|| GattError::Failed(format!("service {} not discovered", service)));
        let _ = self
            .events
            .send(TransportEvent::CharacteristicsDiscovered { service, result });
        Ok(())
    }

    fn read_characteristic(&mut self, characteristic: Uuid) -> SuotaResult<()> {
        let target = self.characteristic(characteristic)?;
        let peripheral = self.peripheral.clone();
        let tx = self.events.clone();
        self.runtime.spawn(async move {
            let result = peripheral.read(&target).await.map_err(gatt_error);
            let _ = tx.send(TransportEvent::ReadComplete {
                characteristic,
                result,
            });
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> SuotaResult<()> {
        let target = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        let value = value.to_vec();
        let peripheral = self.peripheral.clone();
        let tx = self.events.clone();
        self.runtime.spawn(async move {
            let result = peripheral
                .write(&target, &value, write_type)
                .await
                .map_err(gatt_error);
            let _ = tx.send(TransportEvent::WriteComplete {
                characteristic,
                result,
            });
        });
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> SuotaResult<()> {
        let target = self
            .characteristic(characteristic)?
            .descriptors
            .into_iter()
            .find(|d| d.uuid == descriptor);
        let peripheral = self.peripheral.clone();
        let tx = self.events.clone();
        let value = value.to_vec();
        self.runtime.spawn(async move {
            let result = match target {
                Some(target) => peripheral
                    .write_descriptor(&target, &value)
                    .await
                    .map_err(gatt_error),
                None => {
                    // Some platforms hide the CCCD and set it on subscribe
                    debug!("Descriptor {} not exposed; managed by the platform", descriptor);
                    Ok(())
                }
            };
            let _ = tx.send(TransportEvent::DescriptorWriteComplete {
                characteristic,
                descriptor,
                result,
            });
        });
        Ok(())
    }

    fn set_notify(&mut self, characteristic: Uuid, enabled: bool) -> SuotaResult<()> {
        let target = self.characteristic(characteristic)?;
        let peripheral = self.peripheral.clone();
        let tx = self.events.clone();
        self.runtime.spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            let _ = tx.send(TransportEvent::NotificationStateChanged {
                characteristic,
                result: result.map(|_| enabled).map_err(gatt_error),
            });
        });
        Ok(())
    }

    fn disconnect(&mut self) -> SuotaResult<()> {
        if self.connection_state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.set_state(ConnectionState::Disconnecting);
        let peripheral = self.peripheral.clone();
        let state = self.state.clone();
        let tx = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
            mark_disconnected(&state, &tx);
        });
        Ok(())
    }
}
