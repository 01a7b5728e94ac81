//! SUOTA firmware updater for Dialog/Renesas Bluetooth LE devices.
//!
//! The `suota` module holds the transfer engine, `session` drives it on a
//! tokio task and `settings` persists the updater options.

pub mod session;
pub mod settings;
pub mod suota;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_helpers;
