//! `flash`: connect to a device and run a full SUOTA update.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use suota_updater::session::{spawn_session, SessionHandle};
use suota_updater::settings::SuotaConfig;
use suota_updater::suota::ble::BleTransport;
use suota_updater::suota::event::LogKind;
use suota_updater::suota::{
    ConnectionState, FirmwareImage, ImageBank, MemoryType, SuotaEvent, TransferSettings,
};

pub struct FlashOptions {
    pub device: String,
    pub firmware: PathBuf,
    pub scan_timeout: Duration,
    pub memory_type: Option<MemoryType>,
    pub image_bank: Option<ImageBank>,
    pub json: bool,
}

/// What the event loop should do after an event.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    Continue,
    Start,
    AskReboot,
    Finish(Result<(), String>),
}

/// Decide the next step from one session event.
fn next_step(event: &SuotaEvent, config: &SuotaConfig, succeeded: bool) -> Next {
    match event {
        SuotaEvent::DeviceReady { .. } if !succeeded => Next::Start,
        SuotaEvent::Failure { code, description } => Next::Finish(Err(format!(
            "Update failed (0x{:04X}): {}",
            code, description
        ))),
        SuotaEvent::Success { .. } if config.auto_reboot => Next::Continue,
        SuotaEvent::Success { .. } if !config.allow_dialog_display => Next::Finish(Ok(())),
        SuotaEvent::RebootPending if config.allow_dialog_display => Next::AskReboot,
        SuotaEvent::RebootSent => Next::Finish(Ok(())),
        SuotaEvent::ConnectionStateChanged {
            state: ConnectionState::Disconnected,
        } => Next::Finish(if succeeded {
            Ok(())
        } else {
            Err("Device disconnected".to_string())
        }),
        _ => Next::Continue,
    }
}

fn print_event(event: &SuotaEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
        return;
    }
    match event {
        SuotaEvent::ChunkSent { .. }
        | SuotaEvent::CurrentSpeed { .. }
        | SuotaEvent::Log {
            kind: LogKind::Chunk,
            ..
        } => debug!("{}", event),
        _ => println!("{}", event),
    }
}

async fn confirm(question: &'static str) -> bool {
    tokio::task::spawn_blocking(move || {
        print!("{} [y/N] ", question);
        let _ = io::stdout().flush();
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
            Err(_) => false,
        }
    })
    .await
    .unwrap_or(false)
}

pub async fn run(config: SuotaConfig, options: FlashOptions) -> Result<(), String> {
    let firmware = FirmwareImage::from_path(&options.firmware)
        .map_err(|e| format!("Failed to load firmware [{}]: {}", e.error_code(), e))?;
    info!(
        "Loaded {} ({} bytes to upload)",
        firmware.name(),
        firmware.upload_size()
    );

    let (transport, transport_events) =
        BleTransport::connect(&options.device, options.scan_timeout)
            .await
            .map_err(|e| format!("Failed to connect to {}: {}", options.device, e))?;

    let config = Arc::new(config);
    let mut settings = TransferSettings::from_config(&config);
    if let Some(memory_type) = options.memory_type {
        settings.memory_type = memory_type;
    }
    if let Some(image_bank) = options.image_bank {
        settings.image_bank = image_bank;
    }

    let (session, mut events) = spawn_session(Box::new(transport), transport_events, config.clone());
    let result = drive(&session, &mut events, &config, firmware, settings, options.json).await;
    session.shutdown().await;
    result
}

async fn drive(
    session: &SessionHandle,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<SuotaEvent>,
    config: &SuotaConfig,
    firmware: FirmwareImage,
    settings: TransferSettings,
    json: bool,
) -> Result<(), String> {
    let send_error = |e: suota_updater::suota::SuotaError| format!("Session error: {}", e);
    session.set_firmware(firmware).map_err(send_error)?;
    session.configure_transfer(settings).map_err(send_error)?;

    let mut succeeded = false;
    while let Some(event) = events.recv().await {
        print_event(&event, json);
        if matches!(event, SuotaEvent::Success { .. }) {
            succeeded = true;
        }
        match next_step(&event, config, succeeded) {
            Next::Continue => {}
            Next::Start => session.start_update().map_err(send_error)?,
            Next::AskReboot => {
                if confirm("Reboot the device now?").await {
                    session.send_reboot().map_err(send_error)?;
                } else {
                    session.deny_reboot().map_err(send_error)?;
                    return Ok(());
                }
            }
            Next::Finish(result) => return result,
        }
    }
    Err("Session ended before the update finished".to_string())
}
