//! `scan`: list advertising Bluetooth LE devices.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use suota_updater::suota::ble::{self, DiscoveredDevice};

/// Device entry as shown to the user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub label: String,
    pub address: String,
    pub rssi: Option<i16>,
}

/// Number devices that share a name ("DA14585 #1", "DA14585 #2").
fn label_devices(found: Vec<DiscoveredDevice>) -> Vec<Device> {
    let mut label_counts: HashMap<String, usize> = HashMap::new();
    for device in &found {
        *label_counts.entry(device.name.clone()).or_insert(0) += 1;
    }

    let mut label_indices: HashMap<String, usize> = HashMap::new();
    found
        .into_iter()
        .map(|device| {
            let label = match label_counts.get(&device.name) {
                Some(&count) if count > 1 => {
                    let index = label_indices.entry(device.name.clone()).or_insert(0);
                    *index += 1;
                    format!("{} #{}", device.name, index)
                }
                _ => device.name,
            };
            Device {
                label,
                address: device.address,
                rssi: device.rssi,
            }
        })
        .collect()
}

pub async fn scan(duration: Duration, json: bool) -> Result<(), String> {
    let found = ble::scan(duration)
        .await
        .map_err(|e| format!("Scan failed: {}", e))?;
    let mut devices = label_devices(found);
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));

    if json {
        let text = serde_json::to_string_pretty(&devices)
            .map_err(|e| format!("Failed to encode device list: {}", e))?;
        println!("{}", text);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices found");
    }
    for device in devices {
        let rssi = device
            .rssi
            .map_or_else(|| "-".to_string(), |r| format!("{} dBm", r));
        println!("{:<32} {:<20} {}", device.label, device.address, rssi);
    }
    Ok(())
}
