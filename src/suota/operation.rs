//! GATT operations and the single-flight queue that runs them.
//!
//! Many BLE stacks drop or corrupt concurrent GATT requests, so every read,
//! write and subscription goes through `GattOperationQueue`: operations run
//! strictly one at a time in submission order, and the next one starts only
//! after the transport reports the current one resolved (or it times out).
//! Discarding work never frees the link early: an in-flight operation that is
//! no longer wanted still holds the queue until its callback or timeout.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{GattError, SuotaError, SuotaResult};
use super::transport::{GattTransport, TransportEvent};

/// A single transport request. Consumed exactly once by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOperation {
    Read {
        characteristic: Uuid,
    },
    Write {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteWithoutResponse {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    SetNotification {
        characteristic: Uuid,
        enabled: bool,
    },
    /// Reboot sentinel write; the device may drop the link before confirming.
    RebootCommand {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl GattOperation {
    pub fn characteristic(&self) -> Uuid {
        match self {
            GattOperation::Read { characteristic }
            | GattOperation::Write { characteristic, .. }
            | GattOperation::WriteWithoutResponse { characteristic, .. }
            | GattOperation::WriteDescriptor { characteristic, .. }
            | GattOperation::SetNotification { characteristic, .. }
            | GattOperation::RebootCommand { characteristic, .. } => *characteristic,
        }
    }

    /// Payload carried by writes, empty otherwise.
    pub fn value(&self) -> &[u8] {
        match self {
            GattOperation::Write { value, .. }
            | GattOperation::WriteWithoutResponse { value, .. }
            | GattOperation::WriteDescriptor { value, .. }
            | GattOperation::RebootCommand { value, .. } => value,
            GattOperation::Read { .. } | GattOperation::SetNotification { .. } => &[],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GattOperation::Read { .. } => "read",
            GattOperation::Write { .. } => "write",
            GattOperation::WriteWithoutResponse { .. } => "write-without-response",
            GattOperation::WriteDescriptor { .. } => "write-descriptor",
            GattOperation::SetNotification { .. } => "set-notification",
            GattOperation::RebootCommand { .. } => "reboot-command",
        }
    }

    fn execute(&self, transport: &mut dyn GattTransport) -> SuotaResult<()> {
        match self {
            GattOperation::Read { characteristic } => transport.read_characteristic(*characteristic),
            GattOperation::Write {
                characteristic,
                value,
            }
            | GattOperation::RebootCommand {
                characteristic,
                value,
            } => transport.write_characteristic(*characteristic, value, true),
            GattOperation::WriteWithoutResponse {
                characteristic,
                value,
            } => transport.write_characteristic(*characteristic, value, false),
            GattOperation::WriteDescriptor {
                characteristic,
                descriptor,
                value,
            } => transport.write_descriptor(*characteristic, *descriptor, value),
            GattOperation::SetNotification {
                characteristic,
                enabled,
            } => transport.set_notify(*characteristic, *enabled),
        }
    }

    /// Outcome carried by `event` if it answers this operation.
    fn resolve(&self, event: &TransportEvent) -> Option<Result<Vec<u8>, GattError>> {
        match (self, event) {
            (
                GattOperation::Read { characteristic },
                TransportEvent::ReadComplete {
                    characteristic: c,
                    result,
                },
            ) if characteristic == c => Some(result.clone()),
            (
                GattOperation::Write { characteristic, .. }
                | GattOperation::WriteWithoutResponse { characteristic, .. }
                | GattOperation::RebootCommand { characteristic, .. },
                TransportEvent::WriteComplete {
                    characteristic: c,
                    result,
                },
            ) if characteristic == c => Some(result.clone().map(|_| Vec::new())),
            (
                GattOperation::WriteDescriptor {
                    characteristic,
                    descriptor,
                    ..
                },
                TransportEvent::DescriptorWriteComplete {
                    characteristic: c,
                    descriptor: d,
                    result,
                },
            ) if characteristic == c && descriptor == d => Some(result.clone().map(|_| Vec::new())),
            (
                GattOperation::SetNotification { characteristic, .. },
                TransportEvent::NotificationStateChanged {
                    characteristic: c,
                    result,
                },
            ) if characteristic == c => Some(result.clone().map(|enabled| vec![u8::from(enabled)])),
            _ => None,
        }
    }
}

/// Who asked for an operation; routes its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationTag {
    /// SUOTA capability read during setup.
    SuotaInfo,
    /// Device Information read.
    DeviceInfo,
    /// Read requested explicitly by the caller.
    User,
    /// Step of the transfer protocol.
    Protocol,
}

/// A resolved operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub tag: OperationTag,
    pub operation: GattOperation,
    /// Read value, or an empty buffer for writes. Set-notification yields `[enabled]`.
    pub result: Result<Vec<u8>, GattError>,
}

#[derive(Debug)]
struct InFlight {
    tag: OperationTag,
    operation: GattOperation,
    started_at: Instant,
    /// Result is dropped instead of reported.
    discarded: bool,
}

/// FIFO, single-flight executor of GATT operations.
#[derive(Debug)]
pub struct GattOperationQueue {
    pending: VecDeque<(OperationTag, GattOperation)>,
    in_flight: Option<InFlight>,
    completions: VecDeque<Completion>,
    operation_timeout: Duration,
}

impl GattOperationQueue {
    pub fn new(operation_timeout: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            completions: VecDeque::new(),
            operation_timeout,
        }
    }

    /// Submit an operation. Starts it right away when nothing is in flight.
    ///
    /// Fails with `NotConnected`, without queueing, when the link is down.
    pub fn enqueue(
        &mut self,
        tag: OperationTag,
        operation: GattOperation,
        transport: &mut dyn GattTransport,
        now: Instant,
    ) -> SuotaResult<()> {
        if !transport.connection_state().is_connected() {
            return Err(SuotaError::NotConnected);
        }
        self.pending.push_back((tag, operation));
        self.pump(transport, now);
        Ok(())
    }

    /// Offer a transport callback. Returns true when it resolved the in-flight operation.
    pub fn handle_event(
        &mut self,
        event: &TransportEvent,
        transport: &mut dyn GattTransport,
        now: Instant,
    ) -> bool {
        let result = match &self.in_flight {
            Some(in_flight) => match in_flight.operation.resolve(event) {
                Some(result) => result,
                None => return false,
            },
            None => return false,
        };
        self.finish(result);
        self.pump(transport, now);
        true
    }

    /// Resolve the in-flight operation as timed out once its budget is spent.
    pub fn poll_timeout(&mut self, transport: &mut dyn GattTransport, now: Instant) {
        let expired = self
            .in_flight
            .as_ref()
            .is_some_and(|f| now.duration_since(f.started_at) >= self.operation_timeout);
        if expired {
            if let Some(in_flight) = &self.in_flight {
                warn!(
                    "GATT {} on {} timed out",
                    in_flight.operation.name(),
                    in_flight.operation.characteristic()
                );
            }
            self.finish(Err(GattError::Timeout));
            self.pump(transport, now);
        }
    }

    /// Next resolved operation, in resolution order.
    pub fn next_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    /// Discard pending and unreported operations submitted with `tag`.
    /// Returns how many were discarded.
    ///
    /// A matching in-flight operation keeps the link until it resolves or
    /// times out; only its result is dropped.
    pub fn cancel(&mut self, tag: OperationTag) -> usize {
        let before = self.pending.len() + self.completions.len();
        self.pending.retain(|(t, _)| *t != tag);
        self.completions.retain(|c| c.tag != tag);
        let mut dropped = before - self.pending.len() - self.completions.len();
        if let Some(in_flight) = self.in_flight.as_mut() {
            if !in_flight.discarded && in_flight.tag == tag {
                in_flight.discarded = true;
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("Discarded {} queued GATT operations", dropped);
        }
        dropped
    }

    /// Forget everything, including the in-flight operation. Only for a link that is gone.
    pub fn reset(&mut self) {
        let dropped =
            self.pending.len() + usize::from(self.in_flight.is_some()) + self.completions.len();
        self.pending.clear();
        self.in_flight = None;
        self.completions.clear();
        if dropped > 0 {
            debug!("Dropped {} GATT operations with the link", dropped);
        }
    }

    /// Operations with `tag` that have not been handed out by `next_completion` yet.
    pub fn outstanding(&self, tag: OperationTag) -> usize {
        let in_flight = self
            .in_flight
            .as_ref()
            .is_some_and(|f| !f.discarded && f.tag == tag);
        self.pending.iter().filter(|(t, _)| *t == tag).count()
            + usize::from(in_flight)
            + self.completions.iter().filter(|c| c.tag == tag).count()
    }

    /// Operations waiting to start.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<&GattOperation> {
        self.in_flight.as_ref().map(|f| &f.operation)
    }

    fn finish(&mut self, result: Result<Vec<u8>, GattError>) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        if in_flight.discarded {
            debug!(
                "Dropped result of discarded GATT {} on {}",
                in_flight.operation.name(),
                in_flight.operation.characteristic()
            );
            return;
        }
        self.completions.push_back(Completion {
            tag: in_flight.tag,
            operation: in_flight.operation,
            result,
        });
    }

    fn pump(&mut self, transport: &mut dyn GattTransport, now: Instant) {
        while self.in_flight.is_none() {
            let Some((tag, operation)) = self.pending.pop_front() else {
                break;
            };
            debug!(
                "GATT {} on {} ({} bytes)",
                operation.name(),
                operation.characteristic(),
                operation.value().len()
            );
            match operation.execute(transport) {
                Ok(()) => {
                    self.in_flight = Some(InFlight {
                        tag,
                        operation,
                        started_at: now,
                        discarded: false,
                    });
                }
                Err(e) => {
                    warn!("GATT {} rejected: {}", operation.name(), e);
                    let error = match e {
                        SuotaError::Gatt(error) => error,
                        SuotaError::NotConnected => GattError::Disconnected,
                        other => GattError::Rejected(other.to_string()),
                    };
                    self.completions.push_back(Completion {
                        tag,
                        operation,
                        result: Err(error),
                    });
                }
            }
        }
    }
}
