//! Example: Monitoring a Sensor Session
//!
//! This example scans for a Dexcom G7 family sensor, keeps the link alive,
//! and prints every session event along with the sensor's lifecycle state.
//! Session state is restored from and persisted to the configured state
//! file, so a restarted process picks up the same sensor.
//!
//! Run with: `cargo run --example monitor_sensor -- [CONFIG_PATH]`
//!
//! Set `RUST_LOG=g7_core=debug` for connection details.

use std::env;

use anyhow::Context;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use g7_core::{BtleplugTransport, Config, SensorMonitor, SessionEvent, SessionState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "g7.toml".to_string());
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path))?;
    config.validate()?;

    let state = match &config.session.state_path {
        Some(path) => SessionState::load(path)
            .with_context(|| format!("restoring session from {}", path.display()))?,
        None => SessionState::new(),
    };
    if let Some(sensor) = &state.sensor_id {
        println!("Resuming session for {} ({})", sensor, state.variant);
    } else {
        println!("No paired sensor, scanning for one...");
    }

    let (transport, events) = BtleplugTransport::new(64)
        .await
        .context("opening Bluetooth adapter")?;
    let monitor = SensorMonitor::start(transport, events, state, &config).await?;
    let mut rx = monitor.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping");
                break;
            }
            event = rx.recv() => match event {
                Ok(event) => print_event(&monitor, &event),
                Err(RecvError::Lagged(skipped)) => eprintln!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    monitor.shutdown();
    Ok(())
}

fn print_event(monitor: &SensorMonitor, event: &SessionEvent) {
    match event {
        SessionEvent::Connected { sensor } => {
            println!("Connected to {}", sensor.name.as_deref().unwrap_or(&sensor.id));
        }
        SessionEvent::ConnectionError { error, .. } => println!("Connection error: {}", error),
        SessionEvent::SensorAdopted {
            sensor,
            activated_at,
        } => {
            println!(
                "Paired {} ({}), activated {}",
                sensor.name.as_deref().unwrap_or(&sensor.id),
                sensor.variant.unwrap_or_default(),
                activated_at
            );
        }
        SessionEvent::NewReading { reading, .. } => {
            let glucose = reading
                .glucose
                .map_or_else(|| "---".to_string(), |g| g.to_string());
            let trend = reading
                .trend()
                .map_or_else(String::new, |t| format!(" ({:+.1} mg/dL/min)", t));
            let lifecycle = monitor.lifecycle(OffsetDateTime::now_utc());
            println!(
                "Glucose: {} mg/dL{} [{}] - {}",
                glucose,
                trend,
                reading.algorithm_state.category(),
                lifecycle.state
            );
            if let Some(progress) = lifecycle.progress {
                println!("  {:?} {:.0}%", progress.phase, progress.fraction * 100.0);
            }
        }
        SessionEvent::Backfill { records, .. } => {
            println!("Backfilled {} readings", records.len());
        }
        SessionEvent::ExtendedVersion { version, .. } => {
            println!(
                "Session length {}, warmup {}",
                version.lifetime(),
                version.warmup_length
            );
        }
        _ => {}
    }
}
