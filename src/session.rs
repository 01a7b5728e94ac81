//! Tokio driver for a `TransferManager`.
//!
//! One task owns the manager. Transport callbacks, caller commands and a
//! periodic tick all arrive on that task, so the manager never needs a lock
//! and nothing inside it blocks.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::settings::SuotaConfig;
use crate::suota::config::DeviceInfoField;
use crate::suota::{
    ConnectionState, FirmwareImage, GattTransport, ProtocolState, SuotaError, SuotaEvent,
    SuotaInfo, SuotaResult, TransferManager, TransferSettings, TransportEvent,
};
use crate::traits::TokioClock;

/// How often timers are polled.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Requests accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    SetFirmware(FirmwareImage),
    LoadFirmware(PathBuf),
    ConfigureTransfer(TransferSettings),
    StartUpdate,
    SendReboot,
    DenyReboot,
    AbortUpdate,
    ReadCharacteristic(Uuid),
    ReadDeviceInfo,
    Disconnect,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub state: ProtocolState,
    pub ready: bool,
    pub suota_info: SuotaInfo,
    pub device_info: BTreeMap<DeviceInfoField, Vec<u8>>,
    pub avg_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub min_speed: Option<f64>,
}

impl SessionSnapshot {
    fn of(manager: &TransferManager) -> Self {
        Self {
            connection: manager.connection_state(),
            state: manager.state(),
            ready: manager.is_ready(),
            suota_info: manager.suota_info(),
            device_info: manager.device_info().clone(),
            avg_speed: manager.avg_speed(),
            max_speed: manager.max_speed(),
            min_speed: manager.min_speed(),
        }
    }
}

/// Caller side of a running session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> SuotaResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SuotaError::SessionClosed)
    }

    pub fn set_firmware(&self, firmware: FirmwareImage) -> SuotaResult<()> {
        self.send(SessionCommand::SetFirmware(firmware))
    }

    pub fn load_firmware(&self, path: impl Into<PathBuf>) -> SuotaResult<()> {
        self.send(SessionCommand::LoadFirmware(path.into()))
    }

    pub fn configure_transfer(&self, settings: TransferSettings) -> SuotaResult<()> {
        self.send(SessionCommand::ConfigureTransfer(settings))
    }

    pub fn start_update(&self) -> SuotaResult<()> {
        self.send(SessionCommand::StartUpdate)
    }

    pub fn send_reboot(&self) -> SuotaResult<()> {
        self.send(SessionCommand::SendReboot)
    }

    pub fn deny_reboot(&self) -> SuotaResult<()> {
        self.send(SessionCommand::DenyReboot)
    }

    pub fn abort_update(&self) -> SuotaResult<()> {
        self.send(SessionCommand::AbortUpdate)
    }

    pub fn read_characteristic(&self, characteristic: Uuid) -> SuotaResult<()> {
        self.send(SessionCommand::ReadCharacteristic(characteristic))
    }

    pub fn read_device_info(&self) -> SuotaResult<()> {
        self.send(SessionCommand::ReadDeviceInfo)
    }

    pub fn disconnect(&self) -> SuotaResult<()> {
        self.send(SessionCommand::Disconnect)
    }

    pub async fn snapshot(&self) -> SuotaResult<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx))?;
        rx.await.map_err(|_| SuotaError::SessionClosed)
    }

    /// Tear the session down (disconnecting the device) and wait for the task to end.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Session task ended abnormally: {}", e);
        }
    }
}

/// Start a session on the current tokio runtime.
///
/// `transport_events` must carry every callback `transport` produces. Events
/// for the caller arrive on the returned receiver, which closes once the
/// session ends.
pub fn spawn_session(
    transport: Box<dyn GattTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    config: Arc<SuotaConfig>,
) -> (SessionHandle, mpsc::UnboundedReceiver<SuotaEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let sink = Box::new(move |event: SuotaEvent| {
            let _ = event_tx.send(event);
        });
        let manager = TransferManager::new(transport, config, Arc::new(TokioClock), sink);
        run(manager, command_rx, transport_events).await;
    });

    (
        SessionHandle {
            commands: command_tx,
            task,
        },
        event_rx,
    )
}

async fn run(
    mut manager: TransferManager,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut transport_open = true;

    info!("Session started");
    loop {
        tokio::select! {
            command = commands.recv() => {
                let keep_running = match command {
                    Some(command) => apply(&mut manager, command),
                    None => false,
                };
                if !keep_running {
                    break;
                }
            }
            event = transport_events.recv(), if transport_open => match event {
                Some(event) => manager.handle_event(event),
                None => {
                    warn!("Transport event stream closed");
                    transport_open = false;
                    manager.handle_event(TransportEvent::ConnectionStateChanged(
                        ConnectionState::Disconnected,
                    ));
                }
            },
            _ = ticker.tick() => manager.tick(),
        }
    }

    manager.destroy();
    info!("Session ended");
}

/// Returns false when the session should stop.
fn apply(manager: &mut TransferManager, command: SessionCommand) -> bool {
    debug!("Session command: {:?}", command);
    match command {
        SessionCommand::SetFirmware(firmware) => {
            manager.set_firmware(firmware);
        }
        SessionCommand::LoadFirmware(path) => {
            // Reported to the caller as a failure event
            let _ = manager.load_firmware(path);
        }
        SessionCommand::ConfigureTransfer(settings) => {
            manager.configure_transfer(settings);
        }
        SessionCommand::StartUpdate => {
            manager.start_update();
        }
        SessionCommand::SendReboot => {
            manager.send_reboot();
        }
        SessionCommand::DenyReboot => {
            manager.deny_reboot();
        }
        SessionCommand::AbortUpdate => {
            manager.abort_update();
        }
        SessionCommand::ReadCharacteristic(characteristic) => {
            if let Err(e) = manager.read_characteristic(characteristic) {
                warn!("Read of {} not queued: {}", characteristic, e);
            }
        }
        SessionCommand::ReadDeviceInfo => {
            if let Err(e) = manager.read_device_info() {
                warn!("Device Information reads not queued: {}", e);
            }
        }
        SessionCommand::Disconnect => manager.disconnect(),
        SessionCommand::Snapshot(reply) => {
            let _ = reply.send(SessionSnapshot::of(manager));
        }
        SessionCommand::Shutdown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suota::config::{PATCH_DATA_UUID, SUOTA_MTU_UUID};
    use crate::test_helpers::{Request, SyntheticDevice};
    use tokio::time::{timeout, Instant};

    fn start(config: SuotaConfig) -> (SessionHandle, mpsc::UnboundedReceiver<SuotaEvent>, SyntheticDevice) {
        let device = SyntheticDevice::new();
        let (tx, rx) = mpsc::unbounded_channel();
        device.forward_to(tx);
        let (handle, events) = spawn_session(Box::new(device.clone()), rx, Arc::new(config));
        (handle, events, device)
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<SuotaEvent>,
        predicate: impl Fn(&SuotaEvent) -> bool,
    ) -> SuotaEvent {
        timeout(Duration::from_secs(120), async {
            loop {
                let event = events.recv().await.expect("session ended");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not seen in time")
    }

    fn firmware(size: usize) -> FirmwareImage {
        let data: Vec<u8> = (0..size).map(|i| (i % 249) as u8).collect();
        FirmwareImage::from_bytes("app.bin", data).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_runs_update() {
        let (handle, mut events, device) = start(SuotaConfig::default());
        wait_for(&mut events, |e| matches!(e, SuotaEvent::DeviceReady { .. })).await;

        let image = firmware(1000);
        let expected = image.upload_data().to_vec();
        handle.set_firmware(image).unwrap();
        handle.start_update().unwrap();

        wait_for(&mut events, |e| matches!(e, SuotaEvent::Success { .. })).await;
        wait_for(&mut events, |e| *e == SuotaEvent::RebootSent).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ProtocolState::Success);
        assert!(snapshot.avg_speed.is_some());
        assert_eq!(device.received_image(), expected);

        handle.shutdown().await;
        assert!(device.requests().contains(&Request::Disconnect));
        // The event stream closes with the session
        while events.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_after_setup() {
        let device = SyntheticDevice::new();
        device.set_value(SUOTA_MTU_UUID, 247u16.to_le_bytes().to_vec());
        let (tx, rx) = mpsc::unbounded_channel();
        device.forward_to(tx);
        let (handle, mut events) =
            spawn_session(Box::new(device.clone()), rx, Arc::new(SuotaConfig::default()));

        wait_for(&mut events, |e| matches!(e, SuotaEvent::DeviceReady { .. })).await;
        let snapshot = handle.snapshot().await.unwrap();

        assert!(snapshot.ready);
        assert_eq!(snapshot.connection, ConnectionState::Connected);
        assert_eq!(snapshot.state, ProtocolState::Idle);
        assert_eq!(snapshot.suota_info.mtu, 247);
        assert_eq!(
            snapshot.device_info.get(&DeviceInfoField::ModelNumber),
            Some(&b"DA14585".to_vec())
        );
        assert_eq!(snapshot.avg_speed, None);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_timeout_follows_tokio_time() {
        let (handle, mut events, device) = start(SuotaConfig::default());
        device.set_block_status(false);
        wait_for(&mut events, |e| matches!(e, SuotaEvent::DeviceReady { .. })).await;

        handle.set_firmware(firmware(1000)).unwrap();
        let started = Instant::now();
        handle.start_update().unwrap();

        let failure = wait_for(&mut events, SuotaEvent::is_outcome).await;
        assert_eq!(
            failure,
            SuotaEvent::Failure {
                code: 0xFFF9,
                description: "Upload timed out".into()
            }
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_through_handle() {
        let (handle, mut events, device) = start(SuotaConfig::default());
        device.set_block_status(false);
        wait_for(&mut events, |e| matches!(e, SuotaEvent::DeviceReady { .. })).await;

        handle.set_firmware(firmware(1000)).unwrap();
        handle.start_update().unwrap();
        wait_for(&mut events, |e| matches!(e, SuotaEvent::ChunkSent { .. })).await;
        handle.abort_update().unwrap();
        wait_for(&mut events, |e| *e == SuotaEvent::Aborted).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ProtocolState::Cancelled);
        let chunks = device
            .requests()
            .iter()
            .filter(|r| matches!(r, Request::Write { characteristic, .. } if *characteristic == PATCH_DATA_UUID))
            .count();
        assert!(chunks <= 12);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_after_shutdown_fail() {
        let (handle, mut events, _device) = start(SuotaConfig::default());
        wait_for(&mut events, |e| matches!(e, SuotaEvent::DeviceReady { .. })).await;

        handle.send(SessionCommand::Shutdown).unwrap();
        while events.recv().await.is_some() {}

        assert!(matches!(
            handle.start_update(),
            Err(SuotaError::SessionClosed)
        ));
        assert!(matches!(
            handle.snapshot().await,
            Err(SuotaError::SessionClosed)
        ));
    }
}
