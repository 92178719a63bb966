//! Controller entry point: resolves the data directory next to the
//! executable, boots the engine (factory-resetting a fresh or mismatched
//! store), and drives the control loop — a 1 ms flow sub-tick and a
//! once-per-second engine tick — until a signal or a reboot request.
//!
//! Safety behavior:
//! - SIGTERM/SIGINT → all stations off before exit
//! - reboot requests persist their cause first; the service manager restarts
//!   the unit

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use sprinklerd::clock::Clock;
use sprinklerd::config::ConfigStore;
use sprinklerd::engine::Engine;
use sprinklerd::events::TracingSink;
use sprinklerd::weather::LoggingWeatherFetch;
use sprinklerd::{gpio, http};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory holding the configuration files and logs.
    /// Defaults to `data/` next to the executable.
    #[arg(short = 'd', long = "data-dir")]
    data_dir: Option<PathBuf>,
}

/// Resolve the runtime path once: next to the executable on Linux, the
/// working directory otherwise.
fn default_data_dir() -> PathBuf {
    std::fs::read_link("/proc/self/exe")
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("data")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    info!(data_dir = %data_dir.display(), "starting");

    let store = ConfigStore::new(&data_dir)?;
    let gpio = gpio::open().context("failed to initialize GPIO backend")?;
    let http = http::spawn_dispatcher();

    let mut engine = Engine::new(
        store,
        gpio,
        http,
        Box::new(TracingSink),
        Box::new(LoggingWeatherFetch),
    )?;

    let clock = Clock::new();

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // ── Control loop ────────────────────────────────────────────────
    // The flow sub-tick polls at 1 ms (maximum pulse rate 1/(2·1 ms) =
    // 500 Hz); the engine tick fires when the wall-clock second changes.
    let mut ticker = tokio::time::interval(Duration::from_millis(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_ms: i64 = -1;
    let mut last_second: i64 = 0;
    let exit_reason: &str;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now_ms = clock.now_ms();
                if now_ms > last_ms {
                    last_ms = now_ms;
                    engine.flow_poll(now_ms);
                }

                let now = clock.localized_now(engine.timezone_index());
                if now != last_second {
                    last_second = now;
                    engine.tick(now);

                    if let Some(cause) = engine.reboot_requested() {
                        warn!(?cause, "reboot requested, shutting down");
                        exit_reason = "reboot";
                        break;
                    }
                }
            }

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown: all stations off ─────────────────────────
    warn!(reason = exit_reason, "shutting down, turning all stations off");
    let now = clock.localized_now(engine.timezone_index());
    engine.reset_all_stations_immediate(now);

    info!("shutdown complete");
    Ok(())
}
