//! GATT transport abstraction.
//!
//! The platform Bluetooth stack sits behind `GattTransport`. Every request
//! returns as soon as it is issued; its outcome comes back later as a
//! [`TransportEvent`] fed into the manager. This keeps the control task free
//! of blocking waits and lets tests script a device.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use super::error::{GattError, SuotaResult};

/// Link state as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Trait for GATT transport operations.
///
/// Characteristics are addressed by UUID; the SUOTA and Device Information
/// services never share one, so a UUID is a unique handle per link.
#[cfg_attr(test, automock)]
pub trait GattTransport: Send {
    /// Current link state.
    fn connection_state(&self) -> ConnectionState;

    /// Start primary service discovery. Completes with `ServicesDiscovered`.
    fn discover_services(&mut self) -> SuotaResult<()>;

    /// Start characteristic discovery of one service. Completes with `CharacteristicsDiscovered`.
    fn discover_characteristics(&mut self, service: Uuid) -> SuotaResult<()>;

    /// Start a read. Completes with `ReadComplete`.
    fn read_characteristic(&mut self, characteristic: Uuid) -> SuotaResult<()>;

    /// Start a write. Completes with `WriteComplete` for both write types.
    fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> SuotaResult<()>;

    /// Start a descriptor write. Completes with `DescriptorWriteComplete`.
    fn write_descriptor(
        &mut self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> SuotaResult<()>;

    /// Enable or disable notifications. Completes with `NotificationStateChanged`.
    fn set_notify(&mut self, characteristic: Uuid, enabled: bool) -> SuotaResult<()>;

    /// Drop the link. Completes with `ConnectionStateChanged`.
    fn disconnect(&mut self) -> SuotaResult<()>;
}

/// Asynchronous callbacks from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChanged(ConnectionState),
    ServicesDiscovered(Result<Vec<Uuid>, GattError>),
    CharacteristicsDiscovered {
        service: Uuid,
        result: Result<Vec<Uuid>, GattError>,
    },
    ReadComplete {
        characteristic: Uuid,
        result: Result<Vec<u8>, GattError>,
    },
    WriteComplete {
        characteristic: Uuid,
        result: Result<(), GattError>,
    },
    DescriptorWriteComplete {
        characteristic: Uuid,
        descriptor: Uuid,
        result: Result<(), GattError>,
    },
    NotificationStateChanged {
        characteristic: Uuid,
        result: Result<bool, GattError>,
    },
    /// Notification or indication from the device.
    CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
    }
}
