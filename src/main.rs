// =============================================================================
// Sentinel Guardian — Main Entry Point
// =============================================================================
//
// Watches every open USDⓈ-M futures position on the account, force-closes any
// whose unrealized loss reaches the configured cap, and warns the operator
// about positions that carry no stop-loss order.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod api;
mod binance;
mod commands;
mod exchange;
mod guardian;
mod monitor;
mod runtime_config;
mod stop_loss;
mod telegram;
mod throttle;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::{AlertSink, LogSink};
use crate::binance::client::FuturesClient;
use crate::guardian::{spawn_supervised, GuardianController};
use crate::runtime_config::{Credentials, RuntimeConfig};
use crate::telegram::TelegramNotifier;

const CONFIG_PATH_ENV: &str = "GUARDIAN_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "guardian_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Sentinel Guardian — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = RuntimeConfig::resolve(&config_path)?;
    let credentials = Credentials::from_env()?;

    info!(
        max_loss_usdt = %config.max_loss_usdt,
        poll_interval_secs = config.poll_interval_secs,
        stop_loss_check_interval_secs = config.stop_loss_check_interval_secs,
        dry_run = config.dry_run,
        base_url = %config.base_url,
        "Configuration loaded"
    );
    if config.dry_run {
        warn!("DRY RUN — positions will be reported but never closed");
    }

    // ── 2. Exchange client ───────────────────────────────────────────────
    let client = Arc::new(FuturesClient::new(
        &credentials.api_key,
        credentials.api_secret.clone(),
        &config.base_url,
        config.recv_window_ms,
        config.request_timeout(),
    )?);

    match client.sync_server_time().await {
        Ok(offset_ms) => info!(offset_ms, "Server time synchronised"),
        Err(e) => warn!(error = %e, "Server time sync failed — using local clock"),
    }

    // ── 3. Alert transport ───────────────────────────────────────────────
    let notifier = match &credentials.telegram {
        Some(tg) => Some(Arc::new(TelegramNotifier::new(&tg.bot_token, tg.chat_id))),
        None => {
            warn!("Telegram not configured — alerts go to the log only");
            None
        }
    };
    let sink: Arc<dyn AlertSink> = match &notifier {
        Some(n) => n.clone() as Arc<dyn AlertSink>,
        None => Arc::new(LogSink),
    };

    // ── 4. Guardian ──────────────────────────────────────────────────────
    let bind_addr = config.health_bind_addr.clone();
    let controller = Arc::new(
        GuardianController::new(config, client.clone(), sink)
            .with_rate_limits(client.rate_limits()),
    );
    let _tasks = controller.spawn();

    // ── 5. Operator commands ─────────────────────────────────────────────
    if let Some(notifier) = notifier {
        let c = controller.clone();
        spawn_supervised("telegram-commands", Duration::from_secs(5), move || {
            notifier.clone().run_command_loop(c.clone())
        });
    }

    // ── 6. Health server ─────────────────────────────────────────────────
    let app = api::health::router(controller.clone());
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to bind health server");
                return;
            }
        };
        info!(addr = %bind_addr, "Health server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Health server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");
    info!("Sentinel Guardian shut down complete.");
    Ok(())
}
