//! Session events and their config-gated fan-out.
//!
//! Everything the updater reports to its host goes through one tagged enum,
//! `SuotaEvent`. `EventEmitter` applies the notification toggles from
//! `SuotaConfig` so components can emit unconditionally.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::config::DeviceInfoField;
use super::manager::SuotaInfo;
use super::protocol::ProtocolState;
use super::transport::ConnectionState;
use crate::settings::SuotaConfig;

/// Service a characteristic read belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CharacteristicGroup {
    SuotaInfo,
    DeviceInfo,
    Other,
}

/// Outcome of the Device Information batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceInfoStatus {
    Success,
    /// The device has no Device Information service.
    NoDeviceInfo,
    /// At least one read of the batch failed; the others were reported.
    ReadFailed,
}

/// Verbosity class of a protocol log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LogKind {
    Protocol,
    Block,
    Chunk,
}

/// Events reported by a SUOTA session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SuotaEvent {
    ConnectionStateChanged {
        state: ConnectionState,
    },
    /// Characteristic discovery finished.
    ServicesDiscovered {
        suota: bool,
        device_info: bool,
    },
    CharacteristicRead {
        group: CharacteristicGroup,
        characteristic: Uuid,
        field: Option<DeviceInfoField>,
        value: Vec<u8>,
    },
    CharacteristicReadFailed {
        characteristic: Uuid,
        reason: String,
    },
    DeviceInfoReadCompleted {
        status: DeviceInfoStatus,
    },
    /// SUOTA capabilities are known; an update may start.
    DeviceReady {
        info: SuotaInfo,
    },
    StateChanged {
        state: ProtocolState,
    },
    Log {
        kind: LogKind,
        message: String,
    },
    ChunkSent {
        block: usize,
        chunk: usize,
        chunks_in_block: usize,
        total_chunks_sent: usize,
        total_chunks: usize,
    },
    BlockSent {
        block: usize,
        total_blocks: usize,
    },
    UploadProgress {
        percent: f32,
    },
    /// Periodic throughput snapshot, bytes per second.
    SpeedStatistics {
        current: f64,
        max: f64,
        min: f64,
        avg: f64,
    },
    CurrentSpeed {
        bytes_per_second: f64,
    },
    Success {
        total_elapsed_secs: f64,
        upload_elapsed_secs: f64,
    },
    Failure {
        code: u16,
        description: String,
    },
    /// Transfer stopped on request; no outcome is reported after this.
    Aborted,
    RebootSent,
    /// Upload finished without auto-reboot; the host decides via send/deny reboot.
    RebootPending,
}

impl SuotaEvent {
    /// Success or Failure.
    pub fn is_outcome(&self) -> bool {
        matches!(self, SuotaEvent::Success { .. } | SuotaEvent::Failure { .. })
    }
}

impl fmt::Display for SuotaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuotaEvent::ConnectionStateChanged { state } => write!(f, "Connection: {:?}", state),
            SuotaEvent::ServicesDiscovered { suota, device_info } => write!(
                f,
                "Services discovered (SUOTA: {}, Device Information: {})",
                suota, device_info
            ),
            SuotaEvent::CharacteristicRead {
                field: Some(field),
                value,
                ..
            } if field.is_text() => write!(f, "{}: {}", field.label(), String::from_utf8_lossy(value)),
            SuotaEvent::CharacteristicRead {
                characteristic,
                value,
                ..
            } => write!(f, "Read {}: {:02X?}", characteristic, value),
            SuotaEvent::CharacteristicReadFailed {
                characteristic,
                reason,
            } => write!(f, "Read {} failed: {}", characteristic, reason),
            SuotaEvent::DeviceInfoReadCompleted { status } => {
                write!(f, "Device information read: {:?}", status)
            }
            SuotaEvent::DeviceReady { info } => write!(
                f,
                "Device ready (SUOTA v{}, patch data {} bytes, MTU {})",
                info.version, info.patch_data_size, info.mtu
            ),
            SuotaEvent::StateChanged { state } => write!(f, "State: {}", state),
            SuotaEvent::Log { message, .. } => write!(f, "{}", message),
            SuotaEvent::ChunkSent {
                total_chunks_sent,
                total_chunks,
                ..
            } => write!(f, "Chunk {}/{}", total_chunks_sent, total_chunks),
            SuotaEvent::BlockSent {
                block,
                total_blocks,
            } => write!(f, "Block {}/{} sent", block + 1, total_blocks),
            SuotaEvent::UploadProgress { percent } => write!(f, "Uploading... {:.0}%", percent),
            SuotaEvent::SpeedStatistics { current, avg, .. } => write!(
                f,
                "Speed: {:.0} B/s (avg {:.0} B/s)",
                current, avg
            ),
            SuotaEvent::CurrentSpeed { bytes_per_second } => {
                write!(f, "Current speed: {:.0} B/s", bytes_per_second)
            }
            SuotaEvent::Success {
                total_elapsed_secs,
                upload_elapsed_secs,
            } => write!(
                f,
                "Update complete in {:.1}s (upload {:.1}s)",
                total_elapsed_secs, upload_elapsed_secs
            ),
            SuotaEvent::Failure { code, description } => {
                write!(f, "Update failed: {} (0x{:04X})", description, code)
            }
            SuotaEvent::Aborted => write!(f, "Update aborted"),
            SuotaEvent::RebootSent => write!(f, "Reboot command sent"),
            SuotaEvent::RebootPending => write!(f, "Waiting for reboot decision"),
        }
    }
}

/// Receiver of session events.
pub type EventSink = Box<dyn FnMut(SuotaEvent) + Send>;

/// Applies the config's notification toggles and forwards to the sink.
pub struct EventEmitter {
    config: Arc<SuotaConfig>,
    sink: EventSink,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

impl EventEmitter {
    pub fn new(config: Arc<SuotaConfig>, sink: EventSink) -> Self {
        Self { config, sink }
    }

    pub fn emit(&mut self, event: SuotaEvent) {
        if self.is_enabled(&event) {
            (self.sink)(event);
        }
    }

    /// Trace a protocol log line and emit it when its kind is enabled.
    pub fn log(&mut self, kind: LogKind, message: impl Into<String>) {
        let message = message.into();
        match kind {
            LogKind::Protocol => info!("{}", message),
            LogKind::Block | LogKind::Chunk => debug!("{}", message),
        }
        self.emit(SuotaEvent::Log { kind, message });
    }

    /// Whether the config lets `event` through.
    pub fn is_enabled(&self, event: &SuotaEvent) -> bool {
        let config = &self.config;
        match event {
            SuotaEvent::CharacteristicRead {
                group: CharacteristicGroup::DeviceInfo,
                ..
            } => config.notify_device_info_read,
            SuotaEvent::DeviceInfoReadCompleted { .. } => config.notify_device_info_read_completed,
            SuotaEvent::StateChanged { .. } => config.notify_suota_log,
            SuotaEvent::Log { kind, .. } => match kind {
                LogKind::Protocol => config.notify_suota_log,
                LogKind::Block => config.notify_suota_log_block,
                LogKind::Chunk => config.notify_suota_log_chunk,
            },
            SuotaEvent::ChunkSent { .. } => config.notify_chunk_send,
            SuotaEvent::BlockSent { .. } => config.notify_block_sent,
            SuotaEvent::UploadProgress { .. } => config.notify_upload_progress,
            SuotaEvent::SpeedStatistics { .. } | SuotaEvent::CurrentSpeed { .. } => {
                config.calculate_statistics
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::EventLog;

    fn emitter(config: SuotaConfig) -> (EventEmitter, EventLog) {
        let log = EventLog::new();
        (EventEmitter::new(Arc::new(config), log.sink()), log)
    }

    #[test]
    fn test_default_gating() {
        let (mut emitter, log) = emitter(SuotaConfig::default());

        emitter.log(LogKind::Protocol, "protocol");
        emitter.log(LogKind::Block, "block");
        emitter.log(LogKind::Chunk, "chunk");
        emitter.emit(SuotaEvent::UploadProgress { percent: 10.0 });
        emitter.emit(SuotaEvent::BlockSent {
            block: 0,
            total_blocks: 2,
        });

        let events = log.events();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            SuotaEvent::Log {
                kind: LogKind::Protocol,
                message: "protocol".into()
            }
        );
    }

    #[test]
    fn test_disabled_toggles_suppress_events() {
        let config = SuotaConfig {
            notify_suota_log: false,
            notify_upload_progress: false,
            notify_device_info_read: false,
            calculate_statistics: false,
            ..SuotaConfig::default()
        };
        let (mut emitter, log) = emitter(config);

        emitter.log(LogKind::Protocol, "hidden");
        emitter.emit(SuotaEvent::StateChanged {
            state: ProtocolState::SendBlock,
        });
        emitter.emit(SuotaEvent::UploadProgress { percent: 50.0 });
        emitter.emit(SuotaEvent::CurrentSpeed {
            bytes_per_second: 1.0,
        });
        emitter.emit(SuotaEvent::CharacteristicRead {
            group: CharacteristicGroup::DeviceInfo,
            characteristic: DeviceInfoField::Manufacturer.uuid(),
            field: Some(DeviceInfoField::Manufacturer),
            value: b"Dialog".to_vec(),
        });
        // Outcomes are never gated
        emitter.emit(SuotaEvent::Failure {
            code: 4,
            description: "crc".into(),
        });

        assert_eq!(log.events().len(), 1);
        assert!(log.events()[0].is_outcome());
    }

    #[test]
    fn test_serialized_shape() {
        let event = SuotaEvent::BlockSent {
            block: 1,
            total_blocks: 5,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"blockSent","data":{"block":1,"total_blocks":5}}"#);

        let json = serde_json::to_string(&SuotaEvent::RebootSent).unwrap();
        assert_eq!(json, r#"{"event":"rebootSent"}"#);
    }

    #[test]
    fn test_display_messages() {
        let event = SuotaEvent::CharacteristicRead {
            group: CharacteristicGroup::DeviceInfo,
            characteristic: DeviceInfoField::Manufacturer.uuid(),
            field: Some(DeviceInfoField::Manufacturer),
            value: b"Dialog Semiconductor".to_vec(),
        };
        assert_eq!(event.to_string(), "Manufacturer: Dialog Semiconductor");

        let event = SuotaEvent::Failure {
            code: 0xFFF9,
            description: "Upload timed out".into(),
        };
        assert_eq!(event.to_string(), "Update failed: Upload timed out (0xFFF9)");
    }
}
