use clap::Parser;
use moslime_bridge::bridge::{SessionConfig, SessionSupervisor};
use moslime_bridge::domain::models::{AppEvent, MessageSeverity, SensorId, MAX_TRACKERS};
use moslime_bridge::domain::settings::SettingsService;
use moslime_bridge::infrastructure::bluetooth::PeripheralTransport;
use moslime_bridge::infrastructure::logging;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Forward BLE motion-capture pucks to a full-body-tracking server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Connect only this tracker (0-5) on its own thread; repeatable.
    /// Without it all trackers connect one after another.
    #[arg(short, long = "tracker", value_parser = clap::value_parser!(u8).range(0..MAX_TRACKERS as i64))]
    trackers: Vec<SensorId>,

    /// Tracker server address, overriding the configuration
    #[arg(short, long)]
    server: Option<String>,
}

#[cfg(windows)]
fn create_transport(
    settings: &moslime_bridge::domain::settings::Settings,
) -> anyhow::Result<Arc<dyn PeripheralTransport>> {
    use anyhow::Context;
    use moslime_bridge::infrastructure::bluetooth::protocol::GattConfig;
    use moslime_bridge::infrastructure::bluetooth::WinRtTransport;

    let transport = WinRtTransport::new(&GattConfig::from(&settings.connection))
        .context("Invalid characteristic configuration")?;
    Ok(Arc::new(transport))
}

#[cfg(not(windows))]
fn create_transport(
    _settings: &moslime_bridge::domain::settings::Settings,
) -> anyhow::Result<Arc<dyn PeripheralTransport>> {
    anyhow::bail!("No Bluetooth transport is available on this platform")
}

fn log_event(event: AppEvent) {
    match event {
        AppEvent::TrackerStatus { sensor_id, status } => {
            info!(sensor_id, "Tracker #{} {}", sensor_id + 1, status);
        }
        AppEvent::TrackerData {
            sensor_id,
            orientation,
        } => {
            trace!(sensor_id, "Tracker #{} orientation {:?}", sensor_id + 1, orientation);
        }
        AppEvent::LogMessage(message) => match message.severity {
            MessageSeverity::Error => error!("{}", message.message),
            MessageSeverity::Warning => warn!("{}", message.message),
            MessageSeverity::Info | MessageSeverity::Success => info!("{}", message.message),
        },
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings_service = match &args.config {
        Some(path) => SettingsService::open(path.clone())?,
        None => SettingsService::new()?,
    };

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {:#}", e))
        .ok();

    info!("Starting MoSlime bridge");

    if !settings_service.path().exists() {
        let trackers = settings_service.get().tracker_list();
        settings_service.get_mut().set_trackers(&trackers);
        if let Err(e) = settings_service.save() {
            warn!("Could not write default configuration: {:#}", e);
        }
    }

    if let Some(server) = args.server {
        settings_service.get_mut().server.address = server;
    }

    let settings = settings_service.get();
    let config = SessionConfig::from_settings(settings)?;
    let transport = create_transport(settings)?;
    info!(
        "Forwarding to {} using the {} transport",
        config.server,
        transport.name()
    );

    let trackers = settings.tracker_list();
    for tracker in &trackers {
        debug!(
            sensor_id = tracker.sensor_id,
            "Tracker #{}: {}",
            tracker.sensor_id + 1,
            tracker.address
        );
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut supervisor = SessionSupervisor::new(transport, config, trackers, events_tx);

    if args.trackers.is_empty() {
        supervisor.start_all()?;
    } else {
        for sensor_id in &args.trackers {
            supervisor.start_single(*sensor_id)?;
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            Some(event) = events_rx.recv() => log_event(event),
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down");
    supervisor.shutdown();
    while let Ok(event) = events_rx.try_recv() {
        log_event(event);
    }

    Ok(())
}
