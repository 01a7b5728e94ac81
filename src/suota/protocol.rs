//! SUOTA transfer state machine.
//!
//! Drives one image upload through:
//! 1. EnableNotifications - subscribe to the service status characteristic
//! 2. SetMemoryDevice - select memory type and image bank
//! 3. SetGpioMap - describe the external memory pins
//! 4. SendBlock - per block: patch length, then all chunks, then wait for the
//!    device to confirm the block with a status notification
//! 5. EndSignal - write the end-of-transfer sentinel
//!
//! and ends in `Success` or `Error`. The protocol never blocks: each step
//! enqueues GATT operations and returns, and the manager feeds completions,
//! notifications and timer ticks back in through a [`Link`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::byte_cursor::{u32_le, ByteWriter};
use super::config::{
    ApplicationError, ImageBank, MemoryType, CLIENT_CONFIG_DESCRIPTOR_UUID, CURRENT_SPEED_INTERVAL,
    GPIO_MAP_UUID, IMAGE_STARTED, MEM_DEV_UUID, PATCH_DATA_UUID, PATCH_LEN_UUID,
    SERVICE_STATUS_OK, SERV_STATUS_UUID, STATISTICS_SNAPSHOT_INTERVAL, SUOTA_ABORT, SUOTA_END,
    SUOTA_REBOOT,
};
use super::error::{FailureReason, GattError, SuotaError, SuotaResult};
use super::event::{EventEmitter, LogKind, SuotaEvent};
use super::firmware::FirmwareImage;
use super::operation::{Completion, GattOperation, GattOperationQueue, OperationTag};
use super::statistics::SpeedStatistics;
use super::transport::GattTransport;
use crate::settings::{I2cPins, SpiPins, SuotaConfig};

/// Characteristic receiving the end, reboot and abort sentinels.
const SENTINEL_CHARACTERISTIC: Uuid = PATCH_LEN_UUID;

/// Client configuration descriptor value enabling notifications.
const NOTIFICATIONS_ENABLED: [u8; 2] = [0x01, 0x00];

/// Protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum ProtocolState {
    /// Created, not started.
    Idle,
    EnableNotifications,
    SetMemoryDevice,
    SetGpioMap,
    SendBlock,
    EndSignal,
    Success,
    Error(FailureReason),
    /// Torn down or aborted before an outcome.
    Cancelled,
}

impl ProtocolState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolState::Success | ProtocolState::Error(_) | ProtocolState::Cancelled
        )
    }

    pub fn is_running(&self) -> bool {
        !self.is_terminal() && *self != ProtocolState::Idle
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolState::Idle => write!(f, "Idle"),
            ProtocolState::EnableNotifications => write!(f, "Enable notifications"),
            ProtocolState::SetMemoryDevice => write!(f, "Set memory device"),
            ProtocolState::SetGpioMap => write!(f, "Set GPIO map"),
            ProtocolState::SendBlock => write!(f, "Send block"),
            ProtocolState::EndSignal => write!(f, "End signal"),
            ProtocolState::Success => write!(f, "Success"),
            ProtocolState::Error(reason) => write!(f, "Error (0x{:02X})", reason.code()),
            ProtocolState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Memory and pin configuration written before the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSettings {
    pub memory_type: MemoryType,
    pub image_bank: ImageBank,
    pub spi: SpiPins,
    pub i2c: I2cPins,
}

impl TransferSettings {
    pub fn from_config(config: &SuotaConfig) -> Self {
        Self {
            memory_type: config.default_memory_type,
            image_bank: config.default_image_bank,
            spi: config.spi,
            i2c: config.i2c,
        }
    }

    /// Memory device value: memory type in the top byte, image bank in the low byte.
    pub fn memory_device_value(&self) -> u32 {
        ((self.memory_type as u32) << 24) | self.image_bank as u32
    }

    /// GPIO map value for the selected memory type.
    pub fn gpio_map_value(&self) -> u32 {
        match self.memory_type {
            MemoryType::Spi => {
                (u32::from(self.spi.miso) << 24)
                    | (u32::from(self.spi.mosi) << 16)
                    | (u32::from(self.spi.cs) << 8)
                    | u32::from(self.spi.sck)
            }
            MemoryType::I2c => {
                (u32::from(self.i2c.device_address) << 16)
                    | (u32::from(self.i2c.scl) << 8)
                    | u32::from(self.i2c.sda)
            }
        }
    }
}

/// Reboot handling after a successful upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootState {
    NotReached,
    /// Waiting for the host to send or deny the reboot.
    Pending,
    Sent,
    Denied,
}

/// Where the current block is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockPhase {
    /// Patch length written, not yet confirmed.
    Length,
    /// Chunks queued.
    Chunks,
}

/// Everything the protocol needs from its owner for one step.
pub(crate) struct Link<'a> {
    pub queue: &'a mut GattOperationQueue,
    pub transport: &'a mut dyn GattTransport,
    pub events: &'a mut EventEmitter,
    pub now: Instant,
}

impl Link<'_> {
    fn enqueue(&mut self, operation: GattOperation) -> SuotaResult<()> {
        self.queue
            .enqueue(OperationTag::Protocol, operation, &mut *self.transport, self.now)
    }
}

/// One upload session. Owned by the manager.
#[derive(Debug)]
pub struct TransferProtocol {
    config: Arc<SuotaConfig>,
    firmware: FirmwareImage,
    settings: TransferSettings,
    state: ProtocolState,

    block: usize,
    block_phase: BlockPhase,
    chunks_pending: usize,
    block_acknowledged: bool,
    chunks_sent: usize,
    bytes_sent: usize,

    started_at: Option<Instant>,
    upload_started_at: Option<Instant>,
    block_started_at: Option<Instant>,
    finished_at: Option<Instant>,
    deadline: Option<Instant>,

    statistics: SpeedStatistics,
    next_snapshot: Option<Instant>,
    next_speed_sample: Option<Instant>,
    speed_sample_bytes: usize,
    speed_sample_at: Option<Instant>,

    reboot: RebootState,
}

impl TransferProtocol {
    /// Create a protocol for an image whose segmentation is already locked.
    pub fn new(config: Arc<SuotaConfig>, firmware: FirmwareImage, settings: TransferSettings) -> Self {
        Self {
            config,
            firmware,
            settings,
            state: ProtocolState::Idle,
            block: 0,
            block_phase: BlockPhase::Length,
            chunks_pending: 0,
            block_acknowledged: false,
            chunks_sent: 0,
            bytes_sent: 0,
            started_at: None,
            upload_started_at: None,
            block_started_at: None,
            finished_at: None,
            deadline: None,
            statistics: SpeedStatistics::new(),
            next_snapshot: None,
            next_speed_sample: None,
            speed_sample_bytes: 0,
            speed_sample_at: None,
            reboot: RebootState::NotReached,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn firmware(&self) -> &FirmwareImage {
        &self.firmware
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn current_block(&self) -> usize {
        self.block
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn statistics(&self) -> &SpeedStatistics {
        &self.statistics
    }

    pub fn reboot_state(&self) -> RebootState {
        self.reboot
    }

    /// Upload deadline while running.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Arm the upload timeout and subscribe to status notifications.
    pub(crate) fn start(&mut self, link: &mut Link<'_>) {
        if self.state != ProtocolState::Idle {
            warn!("Transfer already started ({})", self.state);
            return;
        }
        self.started_at = Some(link.now);
        self.deadline = Some(link.now + self.config.upload_timeout());
        self.statistics.reset();

        let segmentation = *self.firmware.segment();
        link.events.log(
            LogKind::Protocol,
            format!(
                "Starting upload of {}: {} bytes, {} blocks of {} bytes, chunk size {}",
                self.firmware.name(),
                self.firmware.upload_size(),
                segmentation.total_blocks,
                segmentation.block_size,
                segmentation.chunk_size
            ),
        );

        self.transition(link, ProtocolState::EnableNotifications);
        self.submit(
            link,
            GattOperation::SetNotification {
                characteristic: SERV_STATUS_UUID,
                enabled: true,
            },
        );
    }

    /// Handle a resolved protocol operation.
    pub(crate) fn on_completion(&mut self, link: &mut Link<'_>, completion: Completion) {
        if let GattOperation::RebootCommand { .. } = completion.operation {
            match completion.result {
                Ok(_) => {
                    self.reboot = RebootState::Sent;
                    link.events.log(LogKind::Protocol, "Reboot command sent");
                    link.events.emit(SuotaEvent::RebootSent);
                }
                Err(e) => warn!("Reboot command not confirmed: {}", e),
            }
            return;
        }
        if self.state.is_terminal() {
            debug!("Ignoring {} completion in state {}", completion.operation.name(), self.state);
            return;
        }

        if let Err(e) = completion.result {
            warn!("GATT {} failed: {}", completion.operation.name(), e);
            let reason = match e {
                GattError::Disconnected => ApplicationError::NotConnected,
                _ => ApplicationError::GattOperationError,
            };
            self.fail(link, reason.into());
            return;
        }

        match (self.state, &completion.operation) {
            (ProtocolState::EnableNotifications, GattOperation::SetNotification { .. }) => {
                self.submit(
                    link,
                    GattOperation::WriteDescriptor {
                        characteristic: SERV_STATUS_UUID,
                        descriptor: CLIENT_CONFIG_DESCRIPTOR_UUID,
                        value: NOTIFICATIONS_ENABLED.to_vec(),
                    },
                );
            }
            (ProtocolState::EnableNotifications, GattOperation::WriteDescriptor { .. }) => {
                link.events.log(LogKind::Protocol, "Status notifications enabled");
                self.transition(link, ProtocolState::SetMemoryDevice);
                let value = self.settings.memory_device_value();
                link.events.log(
                    LogKind::Protocol,
                    format!("Set memory device: 0x{:08X}", value),
                );
                self.submit(
                    link,
                    GattOperation::Write {
                        characteristic: MEM_DEV_UUID,
                        value: u32_le(value),
                    },
                );
            }
            (ProtocolState::SetMemoryDevice, GattOperation::Write { characteristic, .. })
                if *characteristic == MEM_DEV_UUID =>
            {
                self.transition(link, ProtocolState::SetGpioMap);
                let value = self.settings.gpio_map_value();
                link.events
                    .log(LogKind::Protocol, format!("Set GPIO map: 0x{:08X}", value));
                self.submit(
                    link,
                    GattOperation::Write {
                        characteristic: GPIO_MAP_UUID,
                        value: u32_le(value),
                    },
                );
            }
            (ProtocolState::SetGpioMap, GattOperation::Write { characteristic, .. })
                if *characteristic == GPIO_MAP_UUID =>
            {
                self.transition(link, ProtocolState::SendBlock);
                self.upload_started_at = Some(link.now);
                self.speed_sample_at = Some(link.now);
                self.speed_sample_bytes = 0;
                if self.config.calculate_statistics {
                    self.next_snapshot = Some(link.now + STATISTICS_SNAPSHOT_INTERVAL);
                    self.next_speed_sample = Some(link.now + CURRENT_SPEED_INTERVAL);
                }
                self.send_block(link);
            }
            (ProtocolState::SendBlock, GattOperation::Write { characteristic, .. })
                if *characteristic == PATCH_LEN_UUID =>
            {
                self.send_chunks(link);
            }
            (
                ProtocolState::SendBlock,
                GattOperation::WriteWithoutResponse {
                    characteristic,
                    value,
                },
            ) if *characteristic == PATCH_DATA_UUID => {
                let len = value.len();
                self.on_chunk_written(link, len);
            }
            (ProtocolState::EndSignal, GattOperation::Write { characteristic, .. })
                if *characteristic == SENTINEL_CHARACTERISTIC =>
            {
                self.finish(link);
            }
            (state, operation) => {
                warn!("Unexpected {} completion in state {}", operation.name(), state);
            }
        }
    }

    /// Handle a service status notification.
    pub(crate) fn on_status(&mut self, link: &mut Link<'_>, value: &[u8]) {
        if !self.state.is_running() {
            debug!("Ignoring status {:02X?} in state {}", value, self.state);
            return;
        }
        let Some(&status) = value.first() else {
            warn!("Empty status notification");
            self.fail(link, ApplicationError::ProtocolError.into());
            return;
        };

        match status {
            SERVICE_STATUS_OK | IMAGE_STARTED => {
                if self.state == ProtocolState::SendBlock && self.block_phase == BlockPhase::Chunks {
                    self.block_acknowledged = true;
                    self.maybe_finish_block(link);
                } else {
                    debug!("Status 0x{:02X} in state {}", status, self.state);
                }
            }
            code => {
                link.events.log(
                    LogKind::Protocol,
                    format!("Device reported error 0x{:02X}", code),
                );
                self.fail(link, FailureReason::Device(code));
            }
        }
    }

    /// Check the upload timeout and emit periodic speed statistics.
    pub(crate) fn tick(&mut self, link: &mut Link<'_>) {
        if !self.state.is_running() {
            return;
        }
        if self.deadline.is_some_and(|deadline| link.now >= deadline) {
            link.events.log(
                LogKind::Protocol,
                format!("Upload timed out after {} ms", self.config.upload_timeout_ms),
            );
            self.fail(link, ApplicationError::UploadTimeout.into());
            return;
        }

        if self.next_snapshot.is_some_and(|at| link.now >= at) {
            self.next_snapshot = Some(link.now + STATISTICS_SNAPSHOT_INTERVAL);
            link.events.emit(SuotaEvent::SpeedStatistics {
                current: self.statistics.current(),
                max: self.statistics.max(),
                min: self.statistics.min(),
                avg: self.statistics.avg(),
            });
        }

        if self.next_speed_sample.is_some_and(|at| link.now >= at) {
            self.next_speed_sample = Some(link.now + CURRENT_SPEED_INTERVAL);
            if let Some(since) = self.speed_sample_at {
                let secs = link.now.duration_since(since).as_secs_f64();
                if secs > 0.0 {
                    let bytes = self.bytes_sent - self.speed_sample_bytes;
                    link.events.emit(SuotaEvent::CurrentSpeed {
                        bytes_per_second: bytes as f64 / secs,
                    });
                }
            }
            self.speed_sample_at = Some(link.now);
            self.speed_sample_bytes = self.bytes_sent;
        }
    }

    /// Write the reboot sentinel after a successful upload without auto-reboot.
    pub(crate) fn send_reboot(&mut self, link: &mut Link<'_>) -> bool {
        if self.reboot != RebootState::Pending {
            return false;
        }
        self.enqueue_reboot(link);
        true
    }

    /// Decline the pending reboot.
    pub(crate) fn deny_reboot(&mut self, link: &mut Link<'_>) -> bool {
        if self.reboot != RebootState::Pending {
            return false;
        }
        self.reboot = RebootState::Denied;
        link.events.log(LogKind::Protocol, "Reboot denied");
        true
    }

    /// Stop a running transfer and tell the device to discard it.
    pub(crate) fn abort(&mut self, link: &mut Link<'_>) -> bool {
        if !self.state.is_running() {
            return false;
        }
        link.queue.cancel(OperationTag::Protocol);
        self.stop_timers(link.now);
        link.events.log(LogKind::Protocol, "Aborting upload");
        if let Err(e) = link.enqueue(GattOperation::Write {
            characteristic: SENTINEL_CHARACTERISTIC,
            value: u32_le(SUOTA_ABORT),
        }) {
            warn!("Abort sentinel not sent: {}", e);
        }
        self.transition(link, ProtocolState::Cancelled);
        link.events.emit(SuotaEvent::Aborted);
        true
    }

    /// The link dropped.
    pub(crate) fn on_disconnected(&mut self, link: &mut Link<'_>) {
        if self.state.is_running() {
            self.fail(link, ApplicationError::NotConnected.into());
        }
    }

    /// Silent teardown: stop timers and never transition again.
    pub(crate) fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = ProtocolState::Cancelled;
        }
        self.deadline = None;
        self.next_snapshot = None;
        self.next_speed_sample = None;
        if self.reboot == RebootState::Pending {
            self.reboot = RebootState::Denied;
        }
    }

    fn send_block(&mut self, link: &mut Link<'_>) {
        let len = match self.firmware.block_len(self.block) {
            Ok(len) => len,
            Err(e) => {
                warn!("Block {} unavailable: {}", self.block, e);
                self.fail(link, e.failure_reason());
                return;
            }
        };
        let Ok(patch_len) = u16::try_from(len) else {
            warn!("Block {} of {} bytes does not fit the patch length", self.block, len);
            let error = SuotaError::InvalidSegmentation {
                block_size: len,
                chunk_size: self.firmware.chunk_size(),
            };
            self.fail(link, error.failure_reason());
            return;
        };
        let total = self.firmware.total_blocks();
        self.block_phase = BlockPhase::Length;
        self.block_acknowledged = false;
        self.chunks_pending = 0;
        self.block_started_at = Some(link.now);

        link.events.log(
            LogKind::Block,
            format!("Sending block {} of {} ({} bytes)", self.block + 1, total, len),
        );
        let mut writer = ByteWriter::new();
        writer.put_u16(patch_len);
        self.submit(
            link,
            GattOperation::Write {
                characteristic: PATCH_LEN_UUID,
                value: writer.into_bytes(),
            },
        );
    }

    fn send_chunks(&mut self, link: &mut Link<'_>) {
        let chunks: Vec<Vec<u8>> = match self.firmware.block_at(self.block) {
            Ok(block) => block.chunks().map(<[u8]>::to_vec).collect(),
            Err(e) => {
                self.fail(link, e.failure_reason());
                return;
            }
        };
        self.block_phase = BlockPhase::Chunks;
        self.chunks_pending = chunks.len();
        for value in chunks {
            if self.state.is_terminal() {
                return;
            }
            self.submit(
                link,
                GattOperation::WriteWithoutResponse {
                    characteristic: PATCH_DATA_UUID,
                    value,
                },
            );
        }
    }

    fn on_chunk_written(&mut self, link: &mut Link<'_>, len: usize) {
        let Ok(chunks_in_block) = self.firmware.chunks_in_block(self.block) else {
            return;
        };
        self.chunks_pending = self.chunks_pending.saturating_sub(1);
        self.chunks_sent += 1;
        self.bytes_sent += len;
        let chunk = chunks_in_block - self.chunks_pending - 1;

        link.events.emit(SuotaEvent::ChunkSent {
            block: self.block,
            chunk,
            chunks_in_block,
            total_chunks_sent: self.chunks_sent,
            total_chunks: self.firmware.total_chunks(),
        });
        link.events.log(
            LogKind::Chunk,
            format!(
                "Chunk {} of {} in block {} sent ({} bytes)",
                chunk + 1,
                chunks_in_block,
                self.block + 1,
                len
            ),
        );
        link.events.emit(SuotaEvent::UploadProgress {
            percent: self.bytes_sent as f32 * 100.0 / self.firmware.upload_size() as f32,
        });

        if self.firmware.is_last_chunk_overall(self.chunks_sent - 1) {
            link.events.log(LogKind::Protocol, "All chunks sent");
        } else if self.firmware.is_last_chunk(self.block, chunk) {
            link.events.log(
                LogKind::Block,
                format!("Block {} written, waiting for confirmation", self.block + 1),
            );
        }
        self.maybe_finish_block(link);
    }

    fn maybe_finish_block(&mut self, link: &mut Link<'_>) {
        if self.chunks_pending > 0 || !self.block_acknowledged {
            return;
        }
        let total = self.firmware.total_blocks();
        if self.config.calculate_statistics {
            if let (Some(started), Ok(len)) =
                (self.block_started_at, self.firmware.block_len(self.block))
            {
                self.statistics.record(len, link.now.duration_since(started));
            }
        }
        link.events.emit(SuotaEvent::BlockSent {
            block: self.block,
            total_blocks: total,
        });
        link.events.log(
            LogKind::Block,
            format!("Block {} of {} confirmed", self.block + 1, total),
        );

        if self.firmware.is_last_block(self.block) {
            self.send_end_signal(link);
        } else {
            self.block += 1;
            self.send_block(link);
        }
    }

    fn send_end_signal(&mut self, link: &mut Link<'_>) {
        self.transition(link, ProtocolState::EndSignal);
        link.events.log(LogKind::Protocol, "Sending end signal");
        self.submit(
            link,
            GattOperation::Write {
                characteristic: SENTINEL_CHARACTERISTIC,
                value: u32_le(SUOTA_END),
            },
        );
    }

    fn finish(&mut self, link: &mut Link<'_>) {
        self.stop_timers(link.now);
        if self.config.auto_reboot {
            self.enqueue_reboot(link);
        } else {
            self.reboot = RebootState::Pending;
        }
        self.transition(link, ProtocolState::Success);

        let total = self.elapsed_since(self.started_at, link.now);
        let upload = self.elapsed_since(self.upload_started_at, link.now);
        link.events.log(
            LogKind::Protocol,
            format!("Upload complete: {} bytes in {:.2}s", self.bytes_sent, upload),
        );
        link.events.emit(SuotaEvent::Success {
            total_elapsed_secs: total,
            upload_elapsed_secs: upload,
        });
        if self.reboot == RebootState::Pending {
            link.events.emit(SuotaEvent::RebootPending);
        }
    }

    fn enqueue_reboot(&mut self, link: &mut Link<'_>) {
        link.events.log(LogKind::Protocol, "Sending reboot command");
        if let Err(e) = link.enqueue(GattOperation::RebootCommand {
            characteristic: SENTINEL_CHARACTERISTIC,
            value: u32_le(SUOTA_REBOOT),
        }) {
            warn!("Reboot command not sent: {}", e);
        }
    }

    fn fail(&mut self, link: &mut Link<'_>, reason: FailureReason) {
        if self.state.is_terminal() {
            return;
        }
        self.stop_timers(link.now);
        link.queue.cancel(OperationTag::Protocol);
        link.events.log(
            LogKind::Protocol,
            format!("Upload failed: {} (0x{:04X})", reason.description(), reason.code()),
        );
        self.transition(link, ProtocolState::Error(reason));
        link.events.emit(SuotaEvent::Failure {
            code: reason.code(),
            description: reason.description(),
        });
    }

    fn submit(&mut self, link: &mut Link<'_>, operation: GattOperation) {
        if let Err(e) = link.enqueue(operation) {
            warn!("Could not queue protocol operation: {}", e);
            self.fail(link, e.failure_reason());
        }
    }

    fn transition(&mut self, link: &mut Link<'_>, state: ProtocolState) {
        debug!("Protocol state {} -> {}", self.state, state);
        self.state = state;
        link.events.emit(SuotaEvent::StateChanged { state });
    }

    fn stop_timers(&mut self, now: Instant) {
        self.deadline = None;
        self.next_snapshot = None;
        self.next_speed_sample = None;
        self.finished_at = Some(now);
    }

    fn elapsed_since(&self, start: Option<Instant>, now: Instant) -> f64 {
        start.map_or(0.0, |start| now.duration_since(start).as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suota::transport::TransportEvent;
    use crate::test_helpers::{EventLog, ManualClock, Request, SyntheticDevice};
    use crate::traits::Clock;
    use std::time::Duration;

    struct Harness {
        device: SyntheticDevice,
        transport: SyntheticDevice,
        queue: GattOperationQueue,
        events: EventEmitter,
        log: EventLog,
        clock: ManualClock,
        protocol: TransferProtocol,
    }

    impl Harness {
        fn new(config: SuotaConfig, size: usize) -> Self {
            let config = Arc::new(config);
            let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
            let mut firmware = FirmwareImage::from_bytes("test.bin", data).unwrap();
            firmware.lock();
            let device = SyntheticDevice::new();
            let log = EventLog::new();
            Self {
                transport: device.clone(),
                device,
                queue: GattOperationQueue::new(config.gatt_operation_timeout()),
                events: EventEmitter::new(config.clone(), log.sink()),
                log,
                clock: ManualClock::new(),
                protocol: TransferProtocol::new(
                    config.clone(),
                    firmware,
                    TransferSettings::from_config(&config),
                ),
            }
        }

        fn start(&mut self) {
            let mut link = Link {
                queue: &mut self.queue,
                transport: &mut self.transport,
                events: &mut self.events,
                now: self.clock.now(),
            };
            self.protocol.start(&mut link);
        }

        fn tick(&mut self) {
            let mut link = Link {
                queue: &mut self.queue,
                transport: &mut self.transport,
                events: &mut self.events,
                now: self.clock.now(),
            };
            link.queue.poll_timeout(&mut *link.transport, link.now);
            self.protocol.tick(&mut link);
        }

        /// Deliver device events until the device goes quiet.
        fn run(&mut self) {
            while let Some(event) = self.device.next_event() {
                let mut link = Link {
                    queue: &mut self.queue,
                    transport: &mut self.transport,
                    events: &mut self.events,
                    now: self.clock.now(),
                };
                match event {
                    TransportEvent::CharacteristicChanged {
                        characteristic,
                        value,
                    } if characteristic == SERV_STATUS_UUID => {
                        self.protocol.on_status(&mut link, &value);
                    }
                    event => {
                        link.queue.handle_event(&event, &mut *link.transport, link.now);
                    }
                }
                while let Some(completion) = link.queue.next_completion() {
                    self.protocol.on_completion(&mut link, completion);
                }
            }
        }

        fn states(&self) -> Vec<ProtocolState> {
            self.log
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    SuotaEvent::StateChanged { state } => Some(state),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_transfer_settings_encoding() {
        let config = SuotaConfig::default();
        let mut settings = TransferSettings::from_config(&config);
        assert_eq!(settings.memory_device_value(), 0x1300_0000);
        assert_eq!(settings.gpio_map_value(), 0x0506_0300);

        settings.memory_type = MemoryType::I2c;
        settings.image_bank = ImageBank::Bank2;
        assert_eq!(settings.memory_device_value(), 0x1200_0002);
        assert_eq!(settings.gpio_map_value(), 0x0050_0203);
    }

    #[test]
    fn test_full_run_reaches_success() {
        let mut h = Harness::new(SuotaConfig::default(), 1000);
        h.start();
        h.run();

        assert_eq!(h.protocol.state(), ProtocolState::Success);
        assert_eq!(
            h.states(),
            vec![
                ProtocolState::EnableNotifications,
                ProtocolState::SetMemoryDevice,
                ProtocolState::SetGpioMap,
                ProtocolState::SendBlock,
                ProtocolState::EndSignal,
                ProtocolState::Success,
            ]
        );
        assert_eq!(h.protocol.bytes_sent(), 1000);
        assert_eq!(h.device.received_image(), h.protocol.firmware().upload_data());
        assert!(h.device.max_outstanding() <= 1);

        let events = h.log.events();
        assert_eq!(events.iter().filter(|e| e.is_outcome()).count(), 1);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SuotaEvent::BlockSent { .. }))
                .count(),
            5
        );
        assert!(events.contains(&SuotaEvent::RebootSent));
        assert_eq!(h.protocol.reboot_state(), RebootState::Sent);
    }

    #[test]
    fn test_wire_sequence() {
        let mut h = Harness::new(SuotaConfig::default(), 50);
        h.start();
        h.run();

        let requests = h.device.requests();
        assert_eq!(
            requests[0],
            Request::SetNotify {
                characteristic: SERV_STATUS_UUID,
                enabled: true
            }
        );
        assert_eq!(
            requests[1],
            Request::WriteDescriptor {
                characteristic: SERV_STATUS_UUID,
                descriptor: CLIENT_CONFIG_DESCRIPTOR_UUID,
                value: vec![0x01, 0x00]
            }
        );
        assert_eq!(
            requests[2],
            Request::Write {
                characteristic: MEM_DEV_UUID,
                value: vec![0x00, 0x00, 0x00, 0x13],
                with_response: true
            }
        );
        assert_eq!(
            requests[3],
            Request::Write {
                characteristic: GPIO_MAP_UUID,
                value: vec![0x00, 0x03, 0x06, 0x05],
                with_response: true
            }
        );
        assert_eq!(
            requests[4],
            Request::Write {
                characteristic: PATCH_LEN_UUID,
                value: vec![50, 0],
                with_response: true
            }
        );
        // 50 bytes -> chunks of 20, 20, 10 without response
        for (request, len) in requests[5..8].iter().zip([20, 20, 10]) {
            match request {
                Request::Write {
                    characteristic,
                    value,
                    with_response,
                } => {
                    assert_eq!(*characteristic, PATCH_DATA_UUID);
                    assert_eq!(value.len(), len);
                    assert!(!with_response);
                }
                other => panic!("Expected chunk write, got {:?}", other),
            }
        }
        assert_eq!(
            requests[8],
            Request::Write {
                characteristic: PATCH_LEN_UUID,
                value: vec![0x00, 0x00, 0x00, 0xFE],
                with_response: true
            }
        );
        assert_eq!(
            requests[9],
            Request::Write {
                characteristic: PATCH_LEN_UUID,
                value: vec![0x00, 0x00, 0x00, 0xFD],
                with_response: true
            }
        );
        assert_eq!(requests.len(), 10);
    }

    #[test]
    fn test_block_waits_for_status_notification() {
        let mut h = Harness::new(SuotaConfig::default(), 500);
        h.device.set_block_status(false);
        h.start();
        h.run();

        // First block fully written, but no confirmation yet
        assert_eq!(h.protocol.state(), ProtocolState::SendBlock);
        assert_eq!(h.protocol.current_block(), 0);
        assert_eq!(h.protocol.bytes_sent(), 240);
        let patch_len_writes = h
            .device
            .requests()
            .iter()
            .filter(|r| matches!(r, Request::Write { characteristic, .. } if *characteristic == PATCH_LEN_UUID))
            .count();
        assert_eq!(patch_len_writes, 1);

        h.device.notify_status(SERVICE_STATUS_OK);
        h.run();
        assert_eq!(h.protocol.current_block(), 1);
    }

    #[test]
    fn test_early_status_before_last_chunk_completion() {
        let mut h = Harness::new(SuotaConfig::default(), 40);
        h.device.set_status_before_write_complete(true);
        h.start();
        h.run();

        assert_eq!(h.protocol.state(), ProtocolState::Success);
    }

    #[test]
    fn test_crc_mismatch_during_send_block() {
        let mut h = Harness::new(SuotaConfig::default(), 1000);
        h.device.fail_block(2, 0x04);
        h.start();
        h.run();

        assert_eq!(
            h.protocol.state(),
            ProtocolState::Error(FailureReason::Device(0x04))
        );
        let writes_after_failure = h.device.requests().len();
        h.run();
        assert_eq!(h.device.requests().len(), writes_after_failure);

        let failures: Vec<SuotaEvent> = h
            .log
            .events()
            .into_iter()
            .filter(|e| e.is_outcome())
            .collect();
        assert_eq!(
            failures,
            vec![SuotaEvent::Failure {
                code: 0x04,
                description: "Overall patch CRC mismatch".into()
            }]
        );
        // Blocks 0 and 1 were confirmed, block 2 never was
        assert_eq!(h.protocol.current_block(), 2);
    }

    #[test]
    fn test_upload_timeout_not_before_budget() {
        let mut h = Harness::new(SuotaConfig::default(), 1000);
        h.device.set_block_status(false);
        h.start();
        h.run();
        assert_eq!(h.protocol.state(), ProtocolState::SendBlock);

        h.clock.advance(Duration::from_millis(29_999));
        h.tick();
        assert_eq!(h.protocol.state(), ProtocolState::SendBlock);

        h.clock.advance(Duration::from_millis(1));
        h.tick();
        assert_eq!(
            h.protocol.state(),
            ProtocolState::Error(FailureReason::Application(ApplicationError::UploadTimeout))
        );
        assert!(h.protocol.deadline().is_none());
    }

    #[test]
    fn test_write_failure_is_gatt_error() {
        let mut h = Harness::new(SuotaConfig::default(), 100);
        h.device.fail_writes_to(GPIO_MAP_UUID);
        h.start();
        h.run();

        assert_eq!(
            h.protocol.state(),
            ProtocolState::Error(FailureReason::Application(
                ApplicationError::GattOperationError
            ))
        );
    }

    #[test]
    fn test_empty_status_is_protocol_error() {
        let mut h = Harness::new(SuotaConfig::default(), 100);
        h.device.set_block_status(false);
        h.start();
        h.run();

        h.device.notify(SERV_STATUS_UUID, Vec::new());
        h.run();
        assert_eq!(
            h.protocol.state(),
            ProtocolState::Error(FailureReason::Application(ApplicationError::ProtocolError))
        );
    }

    #[test]
    fn test_manual_reboot() {
        let config = SuotaConfig {
            auto_reboot: false,
            ..SuotaConfig::default()
        };
        let mut h = Harness::new(config, 100);
        h.start();
        h.run();

        assert_eq!(h.protocol.state(), ProtocolState::Success);
        assert_eq!(h.protocol.reboot_state(), RebootState::Pending);
        assert!(h.log.events().contains(&SuotaEvent::RebootPending));

        let mut link = Link {
            queue: &mut h.queue,
            transport: &mut h.transport,
            events: &mut h.events,
            now: h.clock.now(),
        };
        assert!(h.protocol.send_reboot(&mut link));
        assert!(!h.protocol.send_reboot(&mut link));
        h.run();
        assert_eq!(h.protocol.reboot_state(), RebootState::Sent);
    }

    #[test]
    fn test_statistics_ticks() {
        let mut h = Harness::new(SuotaConfig::default(), 1000);
        h.device.set_block_status(false);
        h.start();
        h.run();

        h.clock.advance(Duration::from_millis(500));
        h.device.notify_status(SERVICE_STATUS_OK);
        h.run();
        h.tick();

        h.clock.advance(Duration::from_millis(500));
        h.tick();

        let events = h.log.events();
        let snapshots = events
            .iter()
            .filter(|e| matches!(e, SuotaEvent::SpeedStatistics { .. }))
            .count();
        assert_eq!(snapshots, 2);
        let speeds: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                SuotaEvent::CurrentSpeed { bytes_per_second } => Some(*bytes_per_second),
                _ => None,
            })
            .collect();
        // 480 bytes written during the first second
        assert_eq!(speeds, vec![480.0]);
        assert_eq!(h.protocol.statistics().samples(), &[480.0]);
    }

    #[test]
    fn test_abort_and_cancel() {
        let mut h = Harness::new(SuotaConfig::default(), 1000);
        h.device.set_block_status(false);
        h.start();
        h.run();

        let mut link = Link {
            queue: &mut h.queue,
            transport: &mut h.transport,
            events: &mut h.events,
            now: h.clock.now(),
        };
        assert!(h.protocol.abort(&mut link));
        assert!(!h.protocol.abort(&mut link));
        assert_eq!(h.protocol.state(), ProtocolState::Cancelled);
        h.run();

        assert_eq!(
            h.device.requests().last(),
            Some(&Request::Write {
                characteristic: PATCH_LEN_UUID,
                value: vec![0x00, 0x00, 0x00, 0xFF],
                with_response: true
            })
        );
        assert!(h.log.events().contains(&SuotaEvent::Aborted));
        assert!(!h.log.events().iter().any(|e| e.is_outcome()));

        h.protocol.cancel();
        h.clock.advance(Duration::from_secs(60));
        h.tick();
        assert_eq!(h.protocol.state(), ProtocolState::Cancelled);
    }
}
