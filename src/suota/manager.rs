//! Session orchestration.
//!
//! `TransferManager` owns the transport, the operation queue and at most one
//! `TransferProtocol`. It runs setup on connect (service discovery, SUOTA
//! capability reads, Device Information reads), holds the firmware image,
//! negotiates block and chunk sizes, and routes every transport callback to
//! whoever asked for it.
//!
//! The manager is synchronous: the host feeds it `TransportEvent`s and calls
//! `tick()` periodically. See `crate::session` for the tokio driver.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::byte_cursor::ByteCursor;
use super::config::{
    ApplicationError, DeviceInfoField, ATT_WRITE_OVERHEAD, DEFAULT_MTU, DEFAULT_PATCH_DATA_SIZE,
    DEVICE_INFO_SERVICE_UUID, MAX_BLOCK_SIZE, REQUIRED_SUOTA_CHARACTERISTICS, SERV_STATUS_UUID,
    SUOTA_INFO_CHARACTERISTICS, SUOTA_L2CAP_PSM_UUID, SUOTA_MTU_UUID,
    SUOTA_PATCH_DATA_CHAR_SIZE_UUID, SUOTA_SERVICE_UUID, SUOTA_VERSION_UUID,
};
use super::error::{FailureReason, GattError, SuotaError, SuotaResult};
use super::event::{
    CharacteristicGroup, DeviceInfoStatus, EventEmitter, EventSink, LogKind, SuotaEvent,
};
use super::firmware::FirmwareImage;
use super::operation::{Completion, GattOperation, GattOperationQueue, OperationTag};
use super::protocol::{Link, ProtocolState, TransferProtocol, TransferSettings};
use super::transport::{ConnectionState, GattTransport, TransportEvent};
use crate::settings::SuotaConfig;
use crate::traits::Clock;

/// SUOTA capabilities reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuotaInfo {
    /// SUOTA protocol version, 0 when not reported.
    pub version: u8,
    /// Largest patch data write the device accepts.
    pub patch_data_size: u16,
    pub mtu: u16,
    pub l2cap_psm: u16,
}

impl Default for SuotaInfo {
    fn default() -> Self {
        Self {
            version: 0,
            patch_data_size: DEFAULT_PATCH_DATA_SIZE,
            mtu: DEFAULT_MTU,
            l2cap_psm: 0,
        }
    }
}

/// Block and chunk sizes for a link.
///
/// The chunk is the smaller of the device's patch data size and the MTU
/// payload (falling back to the configured chunk size when the device reports
/// zero), never larger than a block. The block is the configured block size,
/// capped at [`MAX_BLOCK_SIZE`], rounded down to a whole number of chunks.
pub fn negotiate_segmentation(info: &SuotaInfo, config: &SuotaConfig) -> (usize, usize) {
    let mtu_payload = usize::from(info.mtu.saturating_sub(ATT_WRITE_OVERHEAD));
    let requested = match info.patch_data_size {
        0 => config.default_chunk_size,
        size => usize::from(size),
    };
    let block_size = config.default_block_size.clamp(1, MAX_BLOCK_SIZE);
    let chunk_size = requested.min(mtu_payload).min(block_size).max(1);
    ((block_size / chunk_size) * chunk_size, chunk_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discovery {
    NotStarted,
    Services,
    SuotaCharacteristics,
    DeviceInfoCharacteristics,
    Complete,
    Failed,
}

/// Orchestrates one device link.
pub struct TransferManager {
    transport: Box<dyn GattTransport>,
    config: Arc<SuotaConfig>,
    clock: Arc<dyn Clock>,
    events: EventEmitter,
    queue: GattOperationQueue,

    discovery: Discovery,
    has_device_info: bool,
    characteristics: HashSet<Uuid>,
    suota_info: SuotaInfo,
    /// A read in the current Device Information batch failed.
    device_info_read_failed: bool,
    device_info: BTreeMap<DeviceInfoField, Vec<u8>>,
    ready: bool,

    firmware: Option<FirmwareImage>,
    settings: TransferSettings,
    protocol: Option<TransferProtocol>,
    destroyed: bool,
}

impl TransferManager {
    /// Wrap a transport. Discovery starts right away when it is already connected.
    pub fn new(
        transport: Box<dyn GattTransport>,
        config: Arc<SuotaConfig>,
        clock: Arc<dyn Clock>,
        sink: EventSink,
    ) -> Self {
        let mut manager = Self {
            transport,
            queue: GattOperationQueue::new(config.gatt_operation_timeout()),
            events: EventEmitter::new(config.clone(), sink),
            settings: TransferSettings::from_config(&config),
            config,
            clock,
            discovery: Discovery::NotStarted,
            has_device_info: false,
            characteristics: HashSet::new(),
            suota_info: SuotaInfo::default(),
            device_info_read_failed: false,
            device_info: BTreeMap::new(),
            ready: false,
            firmware: None,
            protocol: None,
            destroyed: false,
        };
        if manager.transport.connection_state().is_connected() {
            manager.start_discovery();
        }
        manager
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// Feed one transport callback.
    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.destroyed {
            debug!("Ignoring {:?} after destroy", event);
            return;
        }
        match event {
            TransportEvent::ConnectionStateChanged(state) => self.on_connection_state(state),
            TransportEvent::ServicesDiscovered(result) => self.on_services(result),
            TransportEvent::CharacteristicsDiscovered { service, result } => {
                self.on_characteristics(service, result)
            }
            TransportEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                if characteristic == SERV_STATUS_UUID {
                    let (protocol, mut link) = self.parts();
                    match protocol {
                        Some(protocol) => protocol.on_status(&mut link, &value),
                        None => debug!("Status {:02X?} with no transfer", value),
                    }
                } else {
                    debug!("Notification from {}: {:02X?}", characteristic, value);
                }
            }
            event => {
                let now = self.clock.now();
                if !self.queue.handle_event(&event, &mut *self.transport, now) {
                    debug!("Ignoring unexpected transport callback {:?}", event);
                }
            }
        }
        self.drain_completions();
    }

    /// Advance timers: per-operation timeouts, the upload timeout and statistics.
    pub fn tick(&mut self) {
        if self.destroyed {
            return;
        }
        let now = self.clock.now();
        self.queue.poll_timeout(&mut *self.transport, now);
        self.drain_completions();
        let (protocol, mut link) = self.parts();
        if let Some(protocol) = protocol {
            protocol.tick(&mut link);
        }
        self.drain_completions();
    }

    // ------------------------------------------------------------------
    // Firmware and transfer control
    // ------------------------------------------------------------------

    /// Use `firmware` for the next update. Ignored while a transfer runs.
    pub fn set_firmware(&mut self, firmware: FirmwareImage) -> bool {
        if self.is_running() {
            warn!("Cannot change firmware during a transfer");
            return false;
        }
        info!(
            "Firmware {} loaded: {} bytes to upload, header {}",
            firmware.name(),
            firmware.upload_size(),
            firmware
                .header()
                .map_or("none", |header| header.kind().name())
        );
        self.firmware = Some(firmware);
        true
    }

    /// Load the image at `path` (image file or `.zip` package).
    ///
    /// A load error is also reported as a `FirmwareLoadFailed` failure event.
    pub fn load_firmware<P: AsRef<Path>>(&mut self, path: P) -> SuotaResult<()> {
        match FirmwareImage::from_path(path) {
            Ok(firmware) => {
                self.set_firmware(firmware);
                Ok(())
            }
            Err(e) => {
                warn!("Firmware load failed: {}", e);
                report_failure(
                    &mut self.events,
                    ApplicationError::FirmwareLoadFailed.into(),
                );
                Err(e)
            }
        }
    }

    /// Memory type, image bank and pins for the next update. Ignored while a transfer runs.
    pub fn configure_transfer(&mut self, settings: TransferSettings) -> bool {
        if self.is_running() {
            warn!("Cannot change transfer settings during a transfer");
            return false;
        }
        self.settings = settings;
        true
    }

    /// Start uploading the current firmware.
    ///
    /// Returns false without side effects when the link is down, no firmware is
    /// set, setup has not finished or a transfer is already running. A header
    /// checksum mismatch is reported as an `InvalidFirmwareCrc` failure.
    pub fn start_update(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        if !self.transport.connection_state().is_connected() {
            warn!("Cannot start update: device not connected");
            return false;
        }
        if !self.ready {
            warn!("Cannot start update: SUOTA setup has not finished");
            return false;
        }
        if self.is_running() {
            warn!("Cannot start update: transfer already running");
            return false;
        }
        let Some(firmware) = &self.firmware else {
            warn!("Cannot start update: no firmware set");
            return false;
        };

        if self.config.check_header_crc {
            if let Err(e) = firmware.verify_header_checksum() {
                warn!("Rejecting firmware {}: {}", firmware.name(), e);
                report_failure(&mut self.events, e.failure_reason());
                return false;
            }
        }
        if self.suota_info.mtu <= ATT_WRITE_OVERHEAD {
            warn!("Unusable MTU {}", self.suota_info.mtu);
            report_failure(&mut self.events, ApplicationError::MtuRequestFailed.into());
            return false;
        }

        let (block_size, chunk_size) = negotiate_segmentation(&self.suota_info, &self.config);
        let mut image = firmware.clone();
        if let Err(e) = image.set_segmentation(block_size, chunk_size) {
            warn!("Cannot segment firmware: {}", e);
            report_failure(&mut self.events, e.failure_reason());
            return false;
        }
        image.lock();
        info!(
            "Starting update: block size {}, chunk size {}, {} blocks",
            block_size,
            chunk_size,
            image.total_blocks()
        );

        let mut protocol = TransferProtocol::new(self.config.clone(), image, self.settings);
        let (_, mut link) = self.parts();
        protocol.start(&mut link);
        self.protocol = Some(protocol);
        self.drain_completions();
        true
    }

    /// Send the reboot command after a successful upload without auto-reboot.
    pub fn send_reboot(&mut self) -> bool {
        let (protocol, mut link) = self.parts();
        let sent = protocol.is_some_and(|protocol| protocol.send_reboot(&mut link));
        self.drain_completions();
        sent
    }

    /// Decline the pending reboot; drops the link when configured to.
    pub fn deny_reboot(&mut self) -> bool {
        let (protocol, mut link) = self.parts();
        let denied = protocol.is_some_and(|protocol| protocol.deny_reboot(&mut link));
        if denied && self.config.auto_disconnect_if_reboot_denied {
            self.disconnect();
        }
        denied
    }

    /// Abort a running transfer. Returns false when none is running.
    pub fn abort_update(&mut self) -> bool {
        let (protocol, mut link) = self.parts();
        let aborted = protocol.is_some_and(|protocol| protocol.abort(&mut link));
        self.drain_completions();
        aborted
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Queue a read of any discovered characteristic. The value arrives as an event.
    pub fn read_characteristic(&mut self, characteristic: Uuid) -> SuotaResult<()> {
        if !self.characteristics.contains(&characteristic) {
            return Err(SuotaError::MissingCharacteristic(characteristic));
        }
        self.enqueue(OperationTag::User, GattOperation::Read { characteristic })
    }

    pub fn read_device_info_field(&mut self, field: DeviceInfoField) -> SuotaResult<()> {
        self.read_characteristic(field.uuid())
    }

    /// Queue the configured Device Information reads as one batch.
    ///
    /// Returns how many reads were queued; `DeviceInfoReadCompleted` follows the last one.
    pub fn read_device_info(&mut self) -> SuotaResult<usize> {
        if !self.has_device_info {
            self.events.emit(SuotaEvent::DeviceInfoReadCompleted {
                status: DeviceInfoStatus::NoDeviceInfo,
            });
            return Ok(0);
        }
        let targets = self.device_info_targets();
        if self.queue.outstanding(OperationTag::DeviceInfo) == 0 {
            self.device_info_read_failed = false;
        }
        for &characteristic in &targets {
            self.enqueue(OperationTag::DeviceInfo, GattOperation::Read { characteristic })?;
        }
        if targets.is_empty() {
            self.events.emit(SuotaEvent::DeviceInfoReadCompleted {
                status: DeviceInfoStatus::Success,
            });
        }
        self.drain_completions();
        Ok(targets.len())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Stop everything and drop the link. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(protocol) = self.protocol.as_mut() {
            protocol.cancel();
        }
        self.queue.reset();
        if self.transport.connection_state() == ConnectionState::Disconnected {
            return;
        }
        info!("Disconnecting");
        if let Err(e) = self.transport.disconnect() {
            warn!("Disconnect failed: {}", e);
        }
    }

    /// Disconnect and ignore every later input. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.disconnect();
        self.destroyed = true;
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn state(&self) -> ProtocolState {
        self.protocol
            .as_ref()
            .map_or(ProtocolState::Idle, TransferProtocol::state)
    }

    pub fn is_running(&self) -> bool {
        self.protocol
            .as_ref()
            .is_some_and(TransferProtocol::is_running)
    }

    /// Setup finished; `start_update` may be called.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    pub fn suota_info(&self) -> SuotaInfo {
        self.suota_info
    }

    /// Device Information values read so far.
    pub fn device_info(&self) -> &BTreeMap<DeviceInfoField, Vec<u8>> {
        &self.device_info
    }

    pub fn firmware(&self) -> Option<&FirmwareImage> {
        self.firmware.as_ref()
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        self.settings
    }

    pub fn protocol(&self) -> Option<&TransferProtocol> {
        self.protocol.as_ref()
    }

    pub fn avg_speed(&self) -> Option<f64> {
        self.speeds().map(|s| s.avg())
    }

    pub fn max_speed(&self) -> Option<f64> {
        self.speeds().map(|s| s.max())
    }

    pub fn min_speed(&self) -> Option<f64> {
        self.speeds().map(|s| s.min())
    }

    fn speeds(&self) -> Option<&super::statistics::SpeedStatistics> {
        if !self.config.calculate_statistics {
            return None;
        }
        self.protocol.as_ref().map(TransferProtocol::statistics)
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    fn on_connection_state(&mut self, state: ConnectionState) {
        info!("Connection state: {:?}", state);
        self.events
            .emit(SuotaEvent::ConnectionStateChanged { state });
        match state {
            ConnectionState::Connected if self.discovery == Discovery::NotStarted => {
                self.start_discovery();
            }
            ConnectionState::Disconnected => {
                let (protocol, mut link) = self.parts();
                if let Some(protocol) = protocol {
                    protocol.on_disconnected(&mut link);
                }
                self.queue.reset();
                self.reset_setup();
            }
            _ => {}
        }
    }

    fn start_discovery(&mut self) {
        self.discovery = Discovery::Services;
        self.events.log(LogKind::Protocol, "Discovering services");
        if let Err(e) = self.transport.discover_services() {
            warn!("Service discovery failed to start: {}", e);
            self.setup_failed(ApplicationError::ServiceDiscoveryError);
        }
    }

    fn on_services(&mut self, result: Result<Vec<Uuid>, GattError>) {
        if self.discovery != Discovery::Services {
            warn!("Ignoring service discovery result in {:?}", self.discovery);
            return;
        }
        let services = match result {
            Ok(services) => services,
            Err(e) => {
                warn!("Service discovery failed: {}", e);
                self.setup_failed(ApplicationError::ServiceDiscoveryError);
                return;
            }
        };
        self.has_device_info = services.contains(&DEVICE_INFO_SERVICE_UUID);
        if !services.contains(&SUOTA_SERVICE_UUID) {
            warn!("Device has no SUOTA service");
            self.events.emit(SuotaEvent::ServicesDiscovered {
                suota: false,
                device_info: self.has_device_info,
            });
            self.setup_failed(ApplicationError::SuotaNotSupported);
            return;
        }
        self.discovery = Discovery::SuotaCharacteristics;
        if let Err(e) = self.transport.discover_characteristics(SUOTA_SERVICE_UUID) {
            warn!("Characteristic discovery failed to start: {}", e);
            self.setup_failed(ApplicationError::ServiceDiscoveryError);
        }
    }

    fn on_characteristics(&mut self, service: Uuid, result: Result<Vec<Uuid>, GattError>) {
        match (self.discovery, service) {
            (Discovery::SuotaCharacteristics, service) if service == SUOTA_SERVICE_UUID => {
                let characteristics = match result {
                    Ok(characteristics) => characteristics,
                    Err(e) => {
                        warn!("SUOTA characteristic discovery failed: {}", e);
                        self.setup_failed(ApplicationError::ServiceDiscoveryError);
                        return;
                    }
                };
                self.characteristics.extend(characteristics);
                if let Some(missing) = REQUIRED_SUOTA_CHARACTERISTICS
                    .iter()
                    .find(|c| !self.characteristics.contains(*c))
                {
                    warn!("Missing SUOTA characteristic {}", missing);
                    self.events.emit(SuotaEvent::ServicesDiscovered {
                        suota: false,
                        device_info: self.has_device_info,
                    });
                    self.setup_failed(ApplicationError::SuotaNotSupported);
                    return;
                }
                if !self.has_device_info {
                    self.complete_discovery();
                    return;
                }
                self.discovery = Discovery::DeviceInfoCharacteristics;
                if let Err(e) = self.transport.discover_characteristics(DEVICE_INFO_SERVICE_UUID) {
                    warn!("Device Information discovery failed to start: {}", e);
                    self.has_device_info = false;
                    self.complete_discovery();
                }
            }
            (Discovery::DeviceInfoCharacteristics, service) if service == DEVICE_INFO_SERVICE_UUID => {
                match result {
                    Ok(characteristics) => self.characteristics.extend(characteristics),
                    Err(e) => {
                        warn!("Device Information discovery failed: {}", e);
                        self.has_device_info = false;
                    }
                }
                self.complete_discovery();
            }
            (discovery, service) => {
                warn!("Ignoring characteristics of {} in {:?}", service, discovery);
            }
        }
    }

    fn complete_discovery(&mut self) {
        self.discovery = Discovery::Complete;
        self.events.emit(SuotaEvent::ServicesDiscovered {
            suota: true,
            device_info: self.has_device_info,
        });

        let suota_reads: Vec<Uuid> = SUOTA_INFO_CHARACTERISTICS
            .iter()
            .copied()
            .filter(|c| self.characteristics.contains(c))
            .collect();
        let info_reads = if self.config.auto_read_device_info {
            self.device_info_targets()
        } else {
            Vec::new()
        };

        let mut batches = vec![
            (OperationTag::SuotaInfo, suota_reads),
            (OperationTag::DeviceInfo, info_reads),
        ];
        if self.config.read_device_info_first {
            batches.reverse();
        }
        self.device_info_read_failed = false;
        for (tag, reads) in batches {
            for characteristic in reads {
                if let Err(e) = self.enqueue(tag, GattOperation::Read { characteristic }) {
                    warn!("Could not queue read of {}: {}", characteristic, e);
                }
            }
        }

        if self.config.auto_read_device_info
            && self.queue.outstanding(OperationTag::DeviceInfo) == 0
        {
            let status = if self.has_device_info {
                DeviceInfoStatus::Success
            } else {
                DeviceInfoStatus::NoDeviceInfo
            };
            self.events
                .emit(SuotaEvent::DeviceInfoReadCompleted { status });
        }
        self.check_ready();
    }

    /// Device Information characteristics to read, in configured order.
    fn device_info_targets(&self) -> Vec<Uuid> {
        if !self.has_device_info {
            return Vec::new();
        }
        self.config
            .device_info_fields()
            .iter()
            .map(DeviceInfoField::uuid)
            .filter(|c| self.characteristics.contains(c))
            .collect()
    }

    fn check_ready(&mut self) {
        if self.ready
            || self.discovery != Discovery::Complete
            || self.queue.outstanding(OperationTag::SuotaInfo) > 0
            || self.queue.outstanding(OperationTag::DeviceInfo) > 0
        {
            return;
        }
        self.ready = true;
        let info = self.suota_info;
        self.events.log(
            LogKind::Protocol,
            format!(
                "SUOTA version {}, patch data size {}, MTU {}, L2CAP PSM {}",
                info.version, info.patch_data_size, info.mtu, info.l2cap_psm
            ),
        );
        self.events.emit(SuotaEvent::DeviceReady { info });
    }

    fn setup_failed(&mut self, error: ApplicationError) {
        self.discovery = Discovery::Failed;
        report_failure(&mut self.events, error.into());
    }

    fn reset_setup(&mut self) {
        self.discovery = Discovery::NotStarted;
        self.has_device_info = false;
        self.characteristics.clear();
        self.suota_info = SuotaInfo::default();
        self.device_info_read_failed = false;
        self.ready = false;
    }

    // ------------------------------------------------------------------
    // Completion routing
    // ------------------------------------------------------------------

    fn drain_completions(&mut self) {
        while let Some(completion) = self.queue.next_completion() {
            match completion.tag {
                OperationTag::Protocol => {
                    let (protocol, mut link) = self.parts();
                    match protocol {
                        Some(protocol) => protocol.on_completion(&mut link, completion),
                        None => debug!("Protocol completion with no transfer"),
                    }
                }
                OperationTag::SuotaInfo => {
                    self.on_read(completion);
                    self.check_ready();
                }
                OperationTag::DeviceInfo => {
                    if !self.on_read(completion) {
                        self.device_info_read_failed = true;
                    }
                    if self.queue.outstanding(OperationTag::DeviceInfo) == 0 {
                        let status = if self.device_info_read_failed {
                            DeviceInfoStatus::ReadFailed
                        } else {
                            DeviceInfoStatus::Success
                        };
                        self.device_info_read_failed = false;
                        self.events
                            .emit(SuotaEvent::DeviceInfoReadCompleted { status });
                    }
                    self.check_ready();
                }
                OperationTag::User => {
                    self.on_read(completion);
                }
            }
        }
    }

    /// Apply a read result. Returns false when the read failed or its value was malformed.
    fn on_read(&mut self, completion: Completion) -> bool {
        let characteristic = completion.operation.characteristic();
        let value = match completion.result {
            Ok(value) => value,
            Err(e) => {
                warn!("Read of {} failed: {}", characteristic, e);
                self.events.emit(SuotaEvent::CharacteristicReadFailed {
                    characteristic,
                    reason: e.to_string(),
                });
                return false;
            }
        };

        let field = DeviceInfoField::from_uuid(characteristic);
        let group = if SUOTA_INFO_CHARACTERISTICS.contains(&characteristic) {
            if let Err(e) = self.apply_suota_info(characteristic, &value) {
                warn!("Malformed SUOTA info in {}: {}", characteristic, e);
                self.events.emit(SuotaEvent::CharacteristicReadFailed {
                    characteristic,
                    reason: e.to_string(),
                });
                return false;
            }
            CharacteristicGroup::SuotaInfo
        } else if let Some(field) = field {
            self.device_info.insert(field, value.clone());
            CharacteristicGroup::DeviceInfo
        } else {
            CharacteristicGroup::Other
        };

        debug!("Read {} ({:?}): {:02X?}", characteristic, group, value);
        self.events.emit(SuotaEvent::CharacteristicRead {
            group,
            characteristic,
            field,
            value,
        });
        true
    }

    fn apply_suota_info(&mut self, characteristic: Uuid, value: &[u8]) -> SuotaResult<()> {
        let mut cursor = ByteCursor::new(value);
        if characteristic == SUOTA_VERSION_UUID {
            self.suota_info.version = cursor.read_u8()?;
        } else if characteristic == SUOTA_PATCH_DATA_CHAR_SIZE_UUID {
            self.suota_info.patch_data_size = cursor.read_u16()?;
        } else if characteristic == SUOTA_MTU_UUID {
            self.suota_info.mtu = cursor.read_u16()?;
        } else if characteristic == SUOTA_L2CAP_PSM_UUID {
            self.suota_info.l2cap_psm = cursor.read_u16()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn enqueue(&mut self, tag: OperationTag, operation: GattOperation) -> SuotaResult<()> {
        let now = self.clock.now();
        self.queue
            .enqueue(tag, operation, &mut *self.transport, now)
    }

    /// The protocol plus everything it may touch, borrowed side by side.
    fn parts(&mut self) -> (Option<&mut TransferProtocol>, Link<'_>) {
        let now = self.clock.now();
        (
            self.protocol.as_mut(),
            Link {
                queue: &mut self.queue,
                transport: &mut *self.transport,
                events: &mut self.events,
                now,
            },
        )
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn report_failure(events: &mut EventEmitter, reason: FailureReason) {
    events.emit(SuotaEvent::Failure {
        code: reason.code(),
        description: reason.description(),
    });
}
