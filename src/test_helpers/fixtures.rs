use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::suota::byte_cursor::ByteWriter;
use crate::suota::event::{EventSink, SuotaEvent};
use crate::suota::header::{xor_checksum, HeaderKind, VERSION_LENGTH};
use crate::traits::Clock;

/// Builder for headered firmware images
pub struct ImageBuilder {
    kind: HeaderKind,
    version: String,
    timestamp: u32,
    payload: Vec<u8>,
    crc: Option<u32>,
    flags: u16,
    exec_location: u32,
    pointer_to_ivt: u32,
}

impl ImageBuilder {
    fn new(kind: HeaderKind) -> Self {
        Self {
            kind,
            version: "1.0.0".to_string(),
            timestamp: 1_700_000_000,
            payload: vec![0x55; 64],
            crc: None,
            flags: 0,
            exec_location: 0,
            pointer_to_ivt: 0x400,
        }
    }

    pub fn da1458x() -> Self {
        Self::new(HeaderKind::Da1458x)
    }

    pub fn da1468x() -> Self {
        Self::new(HeaderKind::Da1468x)
    }

    pub fn da1469x() -> Self {
        Self::new(HeaderKind::Da1469x)
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Store this CRC instead of the image's real checksum
    pub fn crc(mut self, crc: u32) -> Self {
        self.crc = Some(crc);
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn exec_location(mut self, exec_location: u32) -> Self {
        self.exec_location = exec_location;
        self
    }

    pub fn pointer_to_ivt(mut self, pointer_to_ivt: u32) -> Self {
        self.pointer_to_ivt = pointer_to_ivt;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let crc = self.crc.unwrap_or(0);
        let crc_offset = self.kind.crc_offset();
        let compute_crc = self.crc.is_none();
        let mut version = self.version.into_bytes();
        version.resize(VERSION_LENGTH, 0);
        let size = self.payload.len() as u32;

        let mut writer = ByteWriter::new();
        writer.put_bytes(&self.kind.signature());
        match self.kind {
            HeaderKind::Da1458x => {
                writer
                    .put_u8(0xAA)
                    .put_u8(0x01)
                    .put_u32(size)
                    .put_u32(crc)
                    .put_bytes(&version)
                    .put_u32(self.timestamp)
                    .put_u8(0x00)
                    .pad_to(64);
            }
            HeaderKind::Da1468x => {
                writer
                    .put_u16(self.flags)
                    .put_u32(size)
                    .put_u32(crc)
                    .put_bytes(&version)
                    .put_u32(self.timestamp)
                    .put_u32(self.exec_location);
            }
            HeaderKind::Da1469x => {
                writer
                    .put_u32(size)
                    .put_u32(crc)
                    .put_bytes(&version)
                    .put_u32(self.timestamp)
                    .put_u32(self.pointer_to_ivt)
                    .pad_to(self.pointer_to_ivt as usize);
            }
        }
        writer.put_bytes(&self.payload);
        let mut bytes = writer.into_bytes();
        if compute_crc {
            // CRC field is still zero, so it drops out of the XOR
            bytes[crc_offset] = xor_checksum(&bytes);
        }
        bytes
    }
}

/// Collects emitted events for assertions
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<SuotaEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> EventSink {
        let events = self.events.clone();
        Box::new(move |event| events.lock().unwrap().push(event))
    }

    pub fn events(&self) -> Vec<SuotaEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn count(&self, predicate: impl Fn(&SuotaEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

/// Clock that only moves when told to
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
