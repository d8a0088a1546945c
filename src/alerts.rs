// =============================================================================
// Alerts — outbound operator notifications
// =============================================================================
//
// The guardian only needs "send this text, optionally with buttons". The
// Telegram transport implements it; when no chat is configured alerts go to
// the log instead.
// =============================================================================

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::warn;

use crate::types::{OrderSide, Position};

/// An interactive button attached to an alert. `command` is delivered back
/// to the command dispatcher when pressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertControl {
    pub label: String,
    pub command: String,
}

impl AlertControl {
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, message: &str, controls: &[AlertControl]) -> anyhow::Result<()>;
}

/// Fallback sink that writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn send(&self, message: &str, _controls: &[AlertControl]) -> anyhow::Result<()> {
        warn!(target: "alert", "{message}");
        Ok(())
    }
}

/// Send and swallow failures: an alert that cannot be delivered must never
/// interrupt the caller.
pub async fn dispatch(sink: &dyn AlertSink, message: &str, controls: &[AlertControl]) {
    if let Err(e) = sink.send(message, controls).await {
        warn!(error = %e, "alert delivery failed");
    }
}

// -----------------------------------------------------------------------------
// Message builders
// -----------------------------------------------------------------------------

pub fn status_controls() -> Vec<AlertControl> {
    vec![
        AlertControl::new("📊 Status", "/status"),
        AlertControl::new("⏸ Pause", "/pause"),
        AlertControl::new("▶️ Resume", "/resume"),
    ]
}

pub fn missing_stop_loss(position: &Position) -> String {
    format!(
        "⚠️ <b>No stop-loss</b> on {} {}\nAmount: {}\nUnrealized PnL: {} USDT",
        position.side(),
        position.symbol,
        position.amount,
        position.unrealized_pnl.round_dp(2),
    )
}

pub fn close_filled(position: &Position, order_id: u64) -> String {
    format!(
        "✅ <b>Position closed</b> {} {}\nLoss at trigger: {} USDT\nOrder #{order_id} FILLED",
        position.side(),
        position.symbol,
        position.unrealized_pnl.round_dp(2),
    )
}

pub fn close_not_full(position: &Position, order_id: u64, status: &str) -> String {
    format!(
        "🟠 <b>Position NOT fully closed</b> {} {}\nOrder #{order_id} status {status}. \
         Residual exposure may remain; it is re-checked next tick.",
        position.side(),
        position.symbol,
    )
}

pub fn close_unexpected(position: &Position, order_id: u64, status: &str) -> String {
    format!(
        "❓ <b>Unexpected close status</b> {} {}\nOrder #{order_id} returned {status}. Check the account.",
        position.side(),
        position.symbol,
    )
}

pub fn close_exhausted(position: &Position, attempts: u32, error: &str) -> String {
    format!(
        "🚨 <b>Close FAILED</b> {} {} after {attempts} attempts\nLoss: {} USDT\nLast error: {error}\n\
         The position is still open and will be retried next tick.",
        position.side(),
        position.symbol,
        position.unrealized_pnl.round_dp(2),
    )
}

pub fn close_dry_run(position: &Position, side: OrderSide, quantity: Decimal) -> String {
    format!(
        "🧪 <b>Dry run</b>: would close {} {} with reduce-only MARKET {side} {quantity} (PnL {} USDT)",
        position.side(),
        position.symbol,
        position.unrealized_pnl.round_dp(2),
    )
}
