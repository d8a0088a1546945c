// =============================================================================
// Stop-Loss Detector — is every open position covered by a protective order?
// =============================================================================
//
// Per symbol:  Unknown ──check ok──▶ Protected | Unprotected
//              any    ──fetch err─▶ Unknown
//              any    ──vanished──▶ (evicted)
//
// A failed order-list fetch is never evidence of absence: it yields Unknown,
// which does not alert. Only two successful, match-free fetches yield
// Unprotected.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alerts::{self, AlertSink};
use crate::exchange::FuturesExchange;
use crate::guardian::GuardianState;
use crate::throttle::NotificationThrottle;
use crate::types::Position;

/// Three-valued protection verdict. Deliberately not a `bool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtectionState {
    Protected,
    Unprotected,
    /// Not yet checked, or the last check could not see both order lists.
    Unknown,
}

impl ProtectionState {
    pub fn glyph(self) -> &'static str {
        match self {
            Self::Protected => "🛡",
            Self::Unprotected => "⚠️",
            Self::Unknown => "❔",
        }
    }
}

impl std::fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protected => write!(f, "protected"),
            Self::Unprotected => write!(f, "unprotected"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Last verdict for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProtectionRecord {
    pub state: ProtectionState,
    pub checked_at: DateTime<Utc>,
}

pub struct StopLossDetector {
    exchange: Arc<dyn FuturesExchange>,
    alerts: Arc<dyn AlertSink>,
    throttle: NotificationThrottle,
    states: RwLock<HashMap<String, ProtectionRecord>>,
}

impl StopLossDetector {
    pub fn new(
        exchange: Arc<dyn FuturesExchange>,
        alerts: Arc<dyn AlertSink>,
        throttle: NotificationThrottle,
    ) -> Self {
        Self {
            exchange,
            alerts,
            throttle,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Check one position against the exchange. Conditional orders are
    /// consulted first; a match there skips the conventional listing.
    pub async fn detect(&self, position: &Position) -> ProtectionState {
        let symbol = position.symbol.as_str();
        let protective_side = position.side().closing_side();
        let mut fetch_failed = false;

        match self.exchange.fetch_conditional_orders(symbol).await {
            Ok(orders) => {
                if let Some(order) = orders.iter().find(|o| o.protects(protective_side)) {
                    debug!(symbol, order_id = order.id, kind = %order.kind, source = ?order.source, "stop-loss found");
                    return ProtectionState::Protected;
                }
            }
            Err(e) => {
                warn!(symbol, error = %e, "conditional order fetch failed");
                fetch_failed = true;
            }
        }

        match self.exchange.fetch_conventional_orders(symbol).await {
            Ok(orders) => {
                if let Some(order) = orders.iter().find(|o| o.protects(protective_side)) {
                    if fetch_failed {
                        // Still reported as Unknown: the cycle could not see both lists.
                        debug!(symbol, order_id = order.id, "conventional stop found after partial fetch");
                    } else {
                        debug!(symbol, order_id = order.id, kind = %order.kind, source = ?order.source, "stop-loss found");
                        return ProtectionState::Protected;
                    }
                }
            }
            Err(e) => {
                warn!(symbol, error = %e, "conventional order fetch failed");
                fetch_failed = true;
            }
        }

        if fetch_failed {
            ProtectionState::Unknown
        } else {
            ProtectionState::Unprotected
        }
    }

    /// One detection pass over `positions`, the monitor's latest snapshot.
    pub async fn run_cycle(&self, positions: &[Position]) {
        let live: HashSet<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();

        {
            let mut states = self.states.write();
            states.retain(|symbol, _| {
                let keep = live.contains(symbol.as_str());
                if !keep {
                    debug!(symbol = %symbol, "position gone — protection entry evicted");
                }
                keep
            });
        }
        self.throttle.retain(|symbol| live.contains(symbol));

        for position in positions {
            let verdict = self.detect(position).await;
            let previous = self
                .states
                .write()
                .insert(
                    position.symbol.clone(),
                    ProtectionRecord {
                        state: verdict,
                        checked_at: Utc::now(),
                    },
                )
                .map(|r| r.state);

            if previous != Some(verdict) {
                info!(
                    symbol = %position.symbol,
                    from = %previous.unwrap_or(ProtectionState::Unknown),
                    to = %verdict,
                    "protection state changed"
                );
            }

            match verdict {
                ProtectionState::Protected => self.throttle.clear(&position.symbol),
                ProtectionState::Unprotected => {
                    if self.throttle.should_notify(&position.symbol) {
                        warn!(symbol = %position.symbol, "position has no stop-loss — alerting");
                        alerts::dispatch(
                            self.alerts.as_ref(),
                            &alerts::missing_stop_loss(position),
                            &alerts::status_controls(),
                        )
                        .await;
                    }
                }
                ProtectionState::Unknown => {}
            }
        }
    }

    /// Latest verdict for `symbol`; Unknown when never checked.
    pub fn protection(&self, symbol: &str) -> ProtectionState {
        self.record(symbol)
            .map(|r| r.state)
            .unwrap_or(ProtectionState::Unknown)
    }

    pub fn record(&self, symbol: &str) -> Option<ProtectionRecord> {
        self.states.read().get(symbol).copied()
    }

    /// Run forever on its own timer, reading the monitor's snapshot.
    pub async fn run(self: Arc<Self>, state: Arc<GuardianState>, every: Duration) {
        info!(interval_secs = every.as_secs(), "stop-loss detector started");

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match state.snapshot() {
                Some(snapshot) => self.run_cycle(&snapshot.positions).await,
                None => debug!("no position snapshot yet — detection deferred"),
            }
        }
    }
}
