// =============================================================================
// Guardian — shared state and composition root
// =============================================================================
//
// GuardianState is the single place where the monitor, the detector and the
// command / health collaborators meet:
//   - the position snapshot (written by the monitor only),
//   - the pause flag (written by pause()/resume() only),
//   - tick bookkeeping for health reporting.
//
// Thread safety:
//   - AtomicBool / AtomicU32 for the flag and the error counter.
//   - parking_lot::RwLock for composite values, always replaced whole.
// =============================================================================

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alerts::AlertSink;
use crate::binance::rate_limit::{RateLimitSnapshot, RateLimitTracker};
use crate::exchange::FuturesExchange;
use crate::monitor::{MonitorSettings, PositionMonitor};
use crate::runtime_config::RuntimeConfig;
use crate::stop_loss::{ProtectionState, StopLossDetector};
use crate::throttle::{Clock, NotificationThrottle, SystemClock};
use crate::types::{Position, PositionSide};

/// Maximum number of recent tick errors to retain.
const MAX_RECENT_ERRORS: usize = 20;

/// Backoff before a crashed background task is respawned.
const RESTART_BACKOFF: Duration = Duration::from_secs(5);

// =============================================================================
// GuardianState
// =============================================================================

/// Positions as of one monitor tick.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub positions: Vec<Position>,
    pub taken_at: DateTime<Utc>,
}

/// A recorded tick failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: DateTime<Utc>,
}

pub struct GuardianState {
    paused: AtomicBool,
    snapshot: RwLock<Option<Arc<PositionSnapshot>>>,
    consecutive_errors: AtomicU32,
    last_tick_ok: RwLock<Option<DateTime<Utc>>>,
    recent_errors: RwLock<VecDeque<ErrorRecord>>,
    started_at: DateTime<Utc>,
}

impl GuardianState {
    /// Fresh state: active (not paused), no snapshot yet.
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            snapshot: RwLock::new(None),
            consecutive_errors: AtomicU32::new(0),
            last_tick_ok: RwLock::new(None),
            recent_errors: RwLock::new(VecDeque::new()),
            started_at: Utc::now(),
        }
    }

    // ── Pause flag ──────────────────────────────────────────────────────

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    /// Replace the snapshot wholesale and return it.
    pub fn publish_snapshot(&self, positions: Vec<Position>) -> Arc<PositionSnapshot> {
        let snapshot = Arc::new(PositionSnapshot {
            positions,
            taken_at: Utc::now(),
        });
        *self.snapshot.write() = Some(snapshot.clone());
        snapshot
    }

    pub fn snapshot(&self) -> Option<Arc<PositionSnapshot>> {
        self.snapshot.read().clone()
    }

    // ── Tick bookkeeping ────────────────────────────────────────────────

    pub fn record_tick_ok(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
        *self.last_tick_ok.write() = Some(Utc::now());
    }

    /// Count a failed tick and return the new consecutive-error count.
    pub fn record_tick_error(&self, message: String) -> u32 {
        let mut errors = self.recent_errors.write();
        errors.push_back(ErrorRecord {
            message,
            at: Utc::now(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_errors(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn last_tick_ok(&self) -> Option<DateTime<Utc>> {
        *self.last_tick_ok.read()
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().cloned().collect()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl Default for GuardianState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PositionStatus {
    pub symbol: String,
    pub side: PositionSide,
    pub amount: Decimal,
    pub unrealized_pnl: Decimal,
    pub protection: ProtectionState,
    pub protection_checked_at: Option<DateTime<Utc>>,
    pub loss_cap_breached: bool,
}

/// Everything the command transport renders for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub paused: bool,
    pub dry_run: bool,
    pub max_loss_usdt: Decimal,
    pub positions: Vec<PositionStatus>,
    pub snapshot_taken_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Payload published by the health responder.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub paused: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub uptime_secs: i64,
    pub rate_limit: Option<RateLimitSnapshot>,
}

// =============================================================================
// GuardianController
// =============================================================================

pub struct GuardianController {
    config: RuntimeConfig,
    state: Arc<GuardianState>,
    monitor: Arc<PositionMonitor>,
    detector: Arc<StopLossDetector>,
    rate_limits: Option<Arc<RateLimitTracker>>,
}

impl GuardianController {
    pub fn new(
        config: RuntimeConfig,
        exchange: Arc<dyn FuturesExchange>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self::with_clock(config, exchange, alerts, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RuntimeConfig,
        exchange: Arc<dyn FuturesExchange>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = Arc::new(GuardianState::new());

        let monitor = Arc::new(PositionMonitor::new(
            exchange.clone(),
            alerts.clone(),
            state.clone(),
            MonitorSettings::from(&config),
        ));

        let throttle = NotificationThrottle::new(config.notification_interval(), clock);
        let detector = Arc::new(StopLossDetector::new(exchange, alerts, throttle));

        Self {
            config,
            state,
            monitor,
            detector,
            rate_limits: None,
        }
    }

    /// Attach the exchange client's rate-limit counters to health reports.
    pub fn with_rate_limits(mut self, tracker: Arc<RateLimitTracker>) -> Self {
        self.rate_limits = Some(tracker);
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> Arc<GuardianState> {
        self.state.clone()
    }

    // ── Commands ────────────────────────────────────────────────────────

    pub fn pause(&self) {
        self.state.pause();
        warn!("guardian PAUSED — loss-cap closes are suspended");
    }

    pub fn resume(&self) {
        self.state.resume();
        info!("guardian RESUMED — loss-cap closes are active");
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    // ── Reporting ───────────────────────────────────────────────────────

    pub fn status(&self) -> StatusSnapshot {
        let snapshot = self.state.snapshot();
        let max_loss = self.config.max_loss_usdt;

        let positions = snapshot
            .as_ref()
            .map(|s| {
                s.positions
                    .iter()
                    .map(|p| PositionStatus {
                        symbol: p.symbol.clone(),
                        side: p.side(),
                        amount: p.amount,
                        unrealized_pnl: p.unrealized_pnl,
                        protection: self.detector.protection(&p.symbol),
                        protection_checked_at: self
                            .detector
                            .record(&p.symbol)
                            .map(|r| r.checked_at),
                        loss_cap_breached: p.breaches_loss_cap(max_loss),
                    })
                    .collect()
            })
            .unwrap_or_default();

        StatusSnapshot {
            paused: self.state.is_paused(),
            dry_run: self.config.dry_run,
            max_loss_usdt: max_loss,
            positions,
            snapshot_taken_at: snapshot.map(|s| s.taken_at),
            last_tick_at: self.state.last_tick_ok(),
            consecutive_errors: self.state.consecutive_errors(),
            recent_errors: self.state.recent_errors(),
        }
    }

    /// Healthy when the last successful tick is recent and the error streak
    /// is below the cooldown threshold. Before the first tick the start-up
    /// time stands in for it.
    pub fn is_healthy(&self) -> bool {
        let stale_after = chrono::Duration::from_std(self.config.health_stale_after())
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let reference = self
            .state
            .last_tick_ok()
            .unwrap_or_else(|| self.state.started_at());

        Utc::now() - reference <= stale_after
            && self.state.consecutive_errors() < self.config.max_consecutive_errors
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            healthy: self.is_healthy(),
            paused: self.state.is_paused(),
            last_tick_at: self.state.last_tick_ok(),
            consecutive_errors: self.state.consecutive_errors(),
            uptime_secs: (Utc::now() - self.state.started_at()).num_seconds(),
            rate_limit: self.rate_limits.as_ref().map(|t| t.snapshot()),
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────────

    /// Start the monitor and detector loops under supervision.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let monitor = self.monitor.clone();
        let detector = self.detector.clone();
        let state = self.state.clone();
        let check_every = self.config.stop_loss_check_interval();

        vec![
            spawn_supervised("position-monitor", RESTART_BACKOFF, move || {
                monitor.clone().run()
            }),
            spawn_supervised("stop-loss-detector", RESTART_BACKOFF, move || {
                detector.clone().run(state.clone(), check_every)
            }),
        ]
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `make()` as a task and respawn it after `backoff` whenever it panics or
/// returns, indefinitely. Aborting the returned handle also aborts the child.
pub fn spawn_supervised<F, Fut>(name: &'static str, backoff: Duration, make: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut child = AbortOnDrop(tokio::spawn(make()));
            match (&mut child.0).await {
                Ok(()) => warn!(task = name, "task exited — restarting"),
                Err(e) if e.is_panic() => error!(task = name, "task panicked — restarting"),
                Err(_) => {
                    info!(task = name, "task cancelled — supervisor stopping");
                    return;
                }
            }
            tokio::time::sleep(backoff).await;
        }
    })
}
