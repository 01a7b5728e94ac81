use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::suota::config::{
    DeviceInfoField, DEVICE_INFO_SERVICE_UUID, IMAGE_STARTED, MEM_DEV_UUID, PATCH_DATA_UUID,
    PATCH_LEN_UUID, REQUIRED_SUOTA_CHARACTERISTICS, SERVICE_STATUS_OK, SERV_STATUS_UUID,
    SUOTA_INFO_CHARACTERISTICS, SUOTA_L2CAP_PSM_UUID, SUOTA_MTU_UUID,
    SUOTA_PATCH_DATA_CHAR_SIZE_UUID, SUOTA_SERVICE_UUID, SUOTA_VERSION_UUID,
};
use crate::suota::error::{GattError, SuotaResult};
use crate::suota::transport::{ConnectionState, GattTransport, TransportEvent};

/// A request the device received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    DiscoverServices,
    DiscoverCharacteristics {
        service: Uuid,
    },
    Read {
        characteristic: Uuid,
    },
    Write {
        characteristic: Uuid,
        value: Vec<u8>,
        with_response: bool,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    SetNotify {
        characteristic: Uuid,
        enabled: bool,
    },
    Disconnect,
}

struct DeviceState {
    connection: ConnectionState,
    services: BTreeMap<Uuid, Vec<Uuid>>,
    values: HashMap<Uuid, Vec<u8>>,
    requests: Vec<Request>,
    outbox: VecDeque<TransportEvent>,
    forward: Option<UnboundedSender<TransportEvent>>,
    outstanding: usize,
    max_outstanding: usize,

    patch_len: usize,
    block_received: usize,
    block_index: usize,
    image: Vec<u8>,
    block_status: bool,
    status_first: bool,
    failing_blocks: HashMap<usize, u8>,
    failing_writes: HashSet<Uuid>,
    failing_reads: HashSet<Uuid>,
    unanswered: HashSet<Uuid>,
}

impl DeviceState {
    fn push(&mut self, event: TransportEvent) {
        match &self.forward {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => self.outbox.push_back(event),
        }
    }

    fn issued(&mut self, request: Request) {
        self.requests.push(request);
    }

    fn operation_issued(&mut self) {
        self.outstanding += 1;
        self.max_outstanding = self.max_outstanding.max(self.outstanding);
    }

    fn write_result(&self, characteristic: Uuid) -> Result<(), GattError> {
        if self.failing_writes.contains(&characteristic) {
            Err(GattError::Failed("write not permitted".into()))
        } else {
            Ok(())
        }
    }

    /// Emulates the SUOTA target: tracks patch length and received bytes per block.
    fn on_write(&mut self, characteristic: Uuid, value: &[u8]) -> Option<TransportEvent> {
        if characteristic == MEM_DEV_UUID {
            return Some(status(IMAGE_STARTED));
        }
        if characteristic == PATCH_LEN_UUID && value.len() == 2 {
            self.patch_len = usize::from(u16::from_le_bytes([value[0], value[1]]));
            self.block_received = 0;
            return None;
        }
        if characteristic != PATCH_DATA_UUID {
            return None;
        }
        self.image.extend_from_slice(value);
        self.block_received += value.len();
        if self.block_received < self.patch_len {
            return None;
        }
        let index = self.block_index;
        self.block_index += 1;
        self.block_received = 0;
        if let Some(code) = self.failing_blocks.get(&index) {
            return Some(status(*code));
        }
        self.block_status.then(|| status(SERVICE_STATUS_OK))
    }
}

fn status(code: u8) -> TransportEvent {
    TransportEvent::CharacteristicChanged {
        characteristic: SERV_STATUS_UUID,
        value: vec![code],
    }
}

/// Scripted SUOTA target.
///
/// Answers every request immediately by queueing the matching callback;
/// tests pull callbacks with `next_event` (or have them forwarded to a
/// channel). Clones share state, so one clone can be handed to the code
/// under test while the test keeps another.
#[derive(Clone)]
pub struct SyntheticDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SyntheticDevice {
    /// A connected device exposing SUOTA and Device Information.
    pub fn new() -> Self {
        let mut services = BTreeMap::new();
        let mut suota: Vec<Uuid> = REQUIRED_SUOTA_CHARACTERISTICS.to_vec();
        suota.extend_from_slice(SUOTA_INFO_CHARACTERISTICS);
        services.insert(SUOTA_SERVICE_UUID, suota);
        services.insert(
            DEVICE_INFO_SERVICE_UUID,
            DeviceInfoField::ALL.iter().map(DeviceInfoField::uuid).collect(),
        );

        let mut values = HashMap::new();
        values.insert(SUOTA_VERSION_UUID, vec![1]);
        values.insert(SUOTA_PATCH_DATA_CHAR_SIZE_UUID, 20u16.to_le_bytes().to_vec());
        values.insert(SUOTA_MTU_UUID, 23u16.to_le_bytes().to_vec());
        values.insert(SUOTA_L2CAP_PSM_UUID, 0u16.to_le_bytes().to_vec());
        values.insert(DeviceInfoField::Manufacturer.uuid(), b"Dialog Semiconductor".to_vec());
        values.insert(DeviceInfoField::ModelNumber.uuid(), b"DA14585".to_vec());
        values.insert(DeviceInfoField::FirmwareRevision.uuid(), b"6.0.14".to_vec());
        values.insert(DeviceInfoField::SoftwareRevision.uuid(), b"1.0.2".to_vec());

        Self {
            state: Arc::new(Mutex::new(DeviceState {
                connection: ConnectionState::Connected,
                services,
                values,
                requests: Vec::new(),
                outbox: VecDeque::new(),
                forward: None,
                outstanding: 0,
                max_outstanding: 0,
                patch_len: 0,
                block_received: 0,
                block_index: 0,
                image: Vec::new(),
                block_status: true,
                status_first: false,
                failing_blocks: HashMap::new(),
                failing_writes: HashSet::new(),
                failing_reads: HashSet::new(),
                unanswered: HashSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    /// Send callbacks to `tx` instead of keeping them for `next_event`
    pub fn forward_to(&self, tx: UnboundedSender<TransportEvent>) {
        let mut state = self.lock();
        for event in state.outbox.drain(..) {
            let _ = tx.send(event);
        }
        state.forward = Some(tx);
    }

    pub fn set_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.lock().values.insert(characteristic, value);
    }

    pub fn remove_service(&self, service: Uuid) {
        self.lock().services.remove(&service);
    }

    pub fn remove_characteristic(&self, characteristic: Uuid) {
        for characteristics in self.lock().services.values_mut() {
            characteristics.retain(|c| *c != characteristic);
        }
    }

    /// Whether completed blocks are confirmed with a status notification
    pub fn set_block_status(&self, enabled: bool) {
        self.lock().block_status = enabled;
    }

    /// Deliver the block status before the last chunk's write callback
    pub fn set_status_before_write_complete(&self, enabled: bool) {
        self.lock().status_first = enabled;
    }

    /// Answer block `index` with `code` instead of the OK status
    pub fn fail_block(&self, index: usize, code: u8) {
        self.lock().failing_blocks.insert(index, code);
    }

    pub fn fail_writes_to(&self, characteristic: Uuid) {
        self.lock().failing_writes.insert(characteristic);
    }

    pub fn fail_reads_of(&self, characteristic: Uuid) {
        self.lock().failing_reads.insert(characteristic);
    }

    pub fn allow_reads_of(&self, characteristic: Uuid) {
        self.lock().failing_reads.remove(&characteristic);
    }

    /// Accept requests on `characteristic` but never call back
    pub fn ignore_requests_to(&self, characteristic: Uuid) {
        self.lock().unanswered.insert(characteristic);
    }

    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        self.lock().push(TransportEvent::CharacteristicChanged {
            characteristic,
            value,
        });
    }

    pub fn notify_status(&self, code: u8) {
        self.lock().push(status(code));
    }

    /// The link drops on the device side
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.connection = ConnectionState::Disconnected;
        state.push(TransportEvent::ConnectionStateChanged(
            ConnectionState::Disconnected,
        ));
    }

    pub fn next_event(&self) -> Option<TransportEvent> {
        let mut state = self.lock();
        let event = state.outbox.pop_front()?;
        let answers_operation = !matches!(
            event,
            TransportEvent::CharacteristicChanged { .. }
                | TransportEvent::ConnectionStateChanged(_)
                | TransportEvent::ServicesDiscovered(_)
                | TransportEvent::CharacteristicsDiscovered { .. }
        );
        if answers_operation {
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        Some(event)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    /// Bytes received on the patch data characteristic, in order
    pub fn received_image(&self) -> Vec<u8> {
        self.lock().image.clone()
    }

    /// Most operations that were ever awaiting a callback at once
    pub fn max_outstanding(&self) -> usize {
        self.lock().max_outstanding
    }
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GattTransport for SyntheticDevice {
    fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    fn discover_services(&mut self) -> SuotaResult<()> {
        let mut state = self.lock();
        state.issued(Request::DiscoverServices);
        let services = state.services.keys().copied().collect();
        state.push(TransportEvent::ServicesDiscovered(Ok(services)));
        Ok(())
    }

    fn discover_characteristics(&mut self, service: Uuid) -> SuotaResult<()> {
        let mut state = self.lock();
        state.issued(Request::DiscoverCharacteristics { service });
        let result = state
            .services
            .get(&service)
            .cloned()
            .ok_or_else(|| GattError::Failed("unknown service".into()));
        state.push(TransportEvent::CharacteristicsDiscovered { service, result });
        Ok(())
    }

    fn read_characteristic(&mut self, characteristic: Uuid) -> SuotaResult<()> {
        let mut state = self.lock();
        state.issued(Request::Read { characteristic });
        state.operation_issued();
        if state.unanswered.contains(&characteristic) {
            return Ok(());
        }
        let result = if state.failing_reads.contains(&characteristic) {
            Err(GattError::Failed("read not permitted".into()))
        } else {
            state
                .values
                .get(&characteristic)
                .cloned()
                .ok_or_else(|| GattError::Failed("attribute not found".into()))
        };
        state.push(TransportEvent::ReadComplete {
            characteristic,
            result,
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> SuotaResult<()> {
        let mut state = self.lock();
        state.issued(Request::Write {
            characteristic,
            value: value.to_vec(),
            with_response,
        });
        state.operation_issued();
        if state.unanswered.contains(&characteristic) {
            return Ok(());
        }
        let result = state.write_result(characteristic);
        let notification = if result.is_ok() {
            state.on_write(characteristic, value)
        } else {
            None
        };
        let complete = TransportEvent::WriteComplete {
            characteristic,
            result,
        };
        match notification {
            Some(notification) if state.status_first => {
                state.push(notification);
                state.push(complete);
            }
            Some(notification) => {
                state.push(complete);
                state.push(notification);
            }
            None => state.push(complete),
        }
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> SuotaResult<()> {
        let mut state = self.lock();
        state.issued(Request::WriteDescriptor {
            characteristic,
            descriptor,
            value: value.to_vec(),
        });
        state.operation_issued();
        state.push(TransportEvent::DescriptorWriteComplete {
            characteristic,
            descriptor,
            result: Ok(()),
        });
        Ok(())
    }

    fn set_notify(&mut self, characteristic: Uuid, enabled: bool) -> SuotaResult<()> {
        let mut state = self.lock();
        state.issued(Request::SetNotify {
            characteristic,
            enabled,
        });
        state.operation_issued();
        if state.unanswered.contains(&characteristic) {
            return Ok(());
        }
        state.push(TransportEvent::NotificationStateChanged {
            characteristic,
            result: Ok(enabled),
        });
        Ok(())
    }

    fn disconnect(&mut self) -> SuotaResult<()> {
        let mut state = self.lock();
        state.issued(Request::Disconnect);
        if state.connection != ConnectionState::Disconnected {
            state.connection = ConnectionState::Disconnected;
            state.push(TransportEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ));
        }
        Ok(())
    }
}
