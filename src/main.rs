mod api;
mod config;
mod database;
mod error;
mod scanner;
mod session;
mod station;
mod sync;
mod utils;

use anyhow::Result;
use api::HttpAttendanceApi;
use config::Config;
use database::ScanQueue;
use scanner::{LineCamera, ScannerNotice, SupervisorConfig};
use station::{ScanStation, StationEvent, StationParts};
use std::sync::Arc;
use sync::{Connectivity, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utils::format::{
    format_attendance_list, format_error_message, format_info_message, format_pending_badge,
    format_session, format_success_message,
};
use utils::time::SystemClock;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "qr_attendance=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    let pool = database::create_connection(&config.database_url).await?;
    let api = Arc::new(HttpAttendanceApi::new(
        &config.api_base_url,
        config.api_token.clone(),
    )?);
    let connectivity = Connectivity::new(api.ping().await);
    let camera = Arc::new(LineCamera::new(
        config.scanner_device.clone(),
        config.scanner_fallback_device.clone(),
    ));

    let (station, mut events) = ScanStation::spawn(StationParts {
        queue: ScanQueue::new(pool),
        api: api.clone(),
        camera,
        connectivity: connectivity.clone(),
        clock: Arc::new(SystemClock),
        supervisor: SupervisorConfig::default(),
        sync: SyncConfig {
            interval: config.sync_interval,
            ..SyncConfig::default()
        },
    });

    let shutdown = CancellationToken::new();
    let probe_api = api.clone();
    tokio::spawn(connectivity.clone().run_probe(
        config.connectivity_probe_interval,
        move || {
            let api = probe_api.clone();
            async move { api.ping().await }
        },
        shutdown.clone(),
    ));

    match station.auto_select(config.session_id).await {
        Ok(session) => println!(
            "{}",
            format_info_message(&format!("Session {}", format_session(&session)))
        ),
        Err(e) => println!(
            "{}",
            format_error_message(&format!("No session to scan for: {}", e))
        ),
    }

    tracing::info!("Starting scanner...");
    if let Err(e) = station.start_scanning().await {
        println!("{}", format_error_message(&e.to_string()));
    }

    let mut pending = station.sync_engine().pending();
    let mut attendance = station.sync_engine().attendance();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
            Some(event) = events.recv() => report_event(event),
            Ok(()) = pending.changed() => {
                let count = *pending.borrow_and_update();
                match format_pending_badge(count) {
                    Some(badge) => println!("{}", format_info_message(&badge)),
                    None => println!("{}", format_success_message("All scans synced")),
                }
            }
            Ok(()) = attendance.changed() => {
                let entries = attendance.borrow_and_update().clone();
                println!("{}", format_attendance_list(&entries));
            }
        }
    }

    station.shutdown().await;
    shutdown.cancel();

    match station.pending_count().await {
        Ok(count) if count > 0 => tracing::warn!("{} scans remain queued for the next run", count),
        Ok(_) => {
            if let Err(e) = station.cleanup_synced().await {
                tracing::warn!("Failed to clean up synced scans: {}", e);
            }
        }
        Err(e) => tracing::error!("Failed to read the scan queue: {}", e),
    }

    Ok(())
}

fn report_event(event: StationEvent) {
    match event {
        StationEvent::Scanned { code, pending, .. } => {
            let mut message = format!("Scanned {}", code);
            if let Some(badge) = format_pending_badge(pending) {
                message.push_str(&format!(" ({})", badge));
            }
            println!("{}", format_success_message(&message));
        }
        StationEvent::SaveFailed { code, error } => {
            println!(
                "{}",
                format_error_message(&format!("Failed to save {}: {}", code, error))
            );
        }
        StationEvent::ScanRejected(reason) => println!("{}", format_error_message(&reason)),
        StationEvent::Scanner(ScannerNotice::Recovered(facing)) => {
            println!(
                "{}",
                format_info_message(&format!("Scanner recovered ({} camera)", facing))
            );
        }
        StationEvent::Scanner(ScannerNotice::Failed(reason)) => {
            println!(
                "{}",
                format_error_message(&format!("Scanner stopped: {}", reason))
            );
        }
    }
}
