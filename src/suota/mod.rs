//! SUOTA (Software Update Over The Air) for Dialog/Renesas DA145xx/DA1468x/DA1469x.
//!
//! Firmware images are pushed to the device over BLE GATT through the SUOTA
//! service. The host never blocks: GATT calls are issued through a
//! single-flight operation queue and their outcomes come back as
//! `TransportEvent`s.
//!
//! # Protocol Overview
//!
//! The update process consists of:
//! 1. **Setup** - Discover the SUOTA and Device Information services, read
//!    SUOTA capabilities (version, patch data size, MTU, L2CAP PSM)
//! 2. **Enable Notifications** - Subscribe to the service status characteristic
//! 3. **Memory Device** - Select memory type and image bank
//! 4. **GPIO Map** - Tell the device which pins reach the external memory
//! 5. **Blocks** - Per block: write the patch length, stream the chunks, wait
//!    for the device's block status
//! 6. **End Signal** - Device validates the image CRC
//! 7. **Reboot** - Automatic, or on the host's request
//!
//! # Example
//!
//! ```ignore
//! use suota_updater::suota::{FirmwareImage, TransferManager};
//!
//! let mut manager = TransferManager::new(transport, config, clock, sink);
//! // ... feed transport events until DeviceReady
//! manager.set_firmware(FirmwareImage::from_path("app.img")?);
//! manager.start_update();
//! ```

pub mod byte_cursor;
pub mod config;
pub mod error;
pub mod event;
pub mod firmware;
pub mod header;
pub mod manager;
pub mod operation;
pub mod protocol;
pub mod statistics;
pub mod transport;

#[cfg(feature = "btleplug")]
pub mod ble;

pub use config::{DeviceInfoField, ImageBank, MemoryType};
pub use error::{FailureReason, GattError, SuotaError, SuotaResult};
pub use event::{EventSink, SuotaEvent};
pub use firmware::FirmwareImage;
pub use header::{FirmwareHeader, HeaderKind};
pub use manager::{negotiate_segmentation, SuotaInfo, TransferManager};
pub use protocol::{ProtocolState, RebootState, TransferSettings};
pub use transport::{ConnectionState, GattTransport, TransportEvent};
