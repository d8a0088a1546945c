// =============================================================================
// Position Monitor — loss-cap enforcement loop
// =============================================================================
//
// Each tick:
//   1. Fetch every open position and publish the snapshot wholesale.
//   2. Log the position table.
//   3. Flag positions whose unrealized loss reached the cap.
//   4. Unless paused, run the close protocol for each flagged position.
//
// Close protocol (per position, strictly in this order):
//   1. Cancel all conventional orders          — best-effort
//   2. Cancel every active conditional order   — best-effort
//   3. Round |amount| to the symbol precision
//   4. Reduce-only MARKET close                — mandatory, bounded retries
//   5. Classify FILLED / not fully closed / unexpected and alert
//
// Ticks never overlap: the loop awaits each tick before waiting for the next
// one, and missed ticks are skipped rather than bunched.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerts::{self, AlertSink};
use crate::binance::error::ExchangeError;
use crate::exchange::FuturesExchange;
use crate::guardian::GuardianState;
use crate::runtime_config::RuntimeConfig;
use crate::types::{CloseOrderAck, CloseStatus, OrderSide, Position};

/// Tunables the monitor reads from [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub max_loss: Decimal,
    pub dry_run: bool,
    pub close_max_attempts: u32,
    pub close_retry_delay: Duration,
    pub max_consecutive_errors: u32,
    pub error_cooldown: Duration,
}

impl From<&RuntimeConfig> for MonitorSettings {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            max_loss: cfg.max_loss_usdt,
            dry_run: cfg.dry_run,
            close_max_attempts: cfg.close_max_attempts,
            close_retry_delay: cfg.close_retry_delay(),
            max_consecutive_errors: cfg.max_consecutive_errors,
            error_cooldown: cfg.error_cooldown(),
        }
    }
}

/// Result of one close protocol run.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Filled { order_id: u64 },
    /// `PARTIALLY_FILLED` or `NEW`: residual exposure may remain.
    NotFullyClosed { order_id: u64, status: String },
    Unexpected { order_id: u64, status: String },
    /// Every submission attempt failed; the position is still open.
    Exhausted { attempts: u32, last_error: String },
    DryRun { side: OrderSide, quantity: Decimal },
}

/// What one tick observed and did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub positions: usize,
    pub triggered: Vec<String>,
    pub closes: Vec<(String, CloseOutcome)>,
    pub skipped_paused: bool,
}

pub struct PositionMonitor {
    exchange: Arc<dyn FuturesExchange>,
    alerts: Arc<dyn AlertSink>,
    state: Arc<GuardianState>,
    settings: MonitorSettings,
}

impl PositionMonitor {
    pub fn new(
        exchange: Arc<dyn FuturesExchange>,
        alerts: Arc<dyn AlertSink>,
        state: Arc<GuardianState>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            exchange,
            alerts,
            state,
            settings,
        }
    }

    // -------------------------------------------------------------------------
    // Loop
    // -------------------------------------------------------------------------

    /// Run forever. Tick errors are counted and logged; after
    /// `max_consecutive_errors` in a row the loop sleeps one extended
    /// cooldown, resets the counter and carries on.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.settings.poll_interval.as_secs(),
            max_loss = %self.settings.max_loss,
            dry_run = self.settings.dry_run,
            "position monitor started"
        );

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            match self.tick().await {
                Ok(report) => {
                    self.state.record_tick_ok();
                    debug!(
                        positions = report.positions,
                        triggered = report.triggered.len(),
                        "tick complete"
                    );
                }
                Err(e) => {
                    let errors = self.state.record_tick_error(e.to_string());
                    error!(error = %e, consecutive_errors = errors, "monitor tick failed");

                    if errors >= self.settings.max_consecutive_errors {
                        warn!(
                            consecutive_errors = errors,
                            cooldown_secs = self.settings.error_cooldown.as_secs(),
                            "too many consecutive errors — cooling down"
                        );
                        sleep(self.settings.error_cooldown).await;
                        self.state.reset_errors();
                        ticker.reset();
                    }
                }
            }
        }
    }

    /// One evaluation cycle. Only the position fetch can fail a tick; close
    /// protocol failures are reported through [`CloseOutcome`].
    pub async fn tick(&self) -> Result<TickReport, ExchangeError> {
        let positions = self.exchange.fetch_positions().await?;
        let snapshot = self.state.publish_snapshot(positions);

        log_positions(&snapshot.positions, self.settings.max_loss);

        let mut report = TickReport {
            positions: snapshot.positions.len(),
            ..TickReport::default()
        };

        for position in &snapshot.positions {
            if !position.breaches_loss_cap(self.settings.max_loss) {
                continue;
            }
            report.triggered.push(position.symbol.clone());

            if self.state.is_paused() {
                warn!(
                    symbol = %position.symbol,
                    pnl = %position.unrealized_pnl,
                    "loss cap breached but guardian is paused — not closing"
                );
                report.skipped_paused = true;
                continue;
            }

            warn!(
                symbol = %position.symbol,
                side = %position.side(),
                pnl = %position.unrealized_pnl,
                max_loss = %self.settings.max_loss,
                "LOSS CAP BREACHED — closing position"
            );
            let outcome = self.close_position(position).await;
            report.closes.push((position.symbol.clone(), outcome));
        }

        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Close protocol
    // -------------------------------------------------------------------------

    pub async fn close_position(&self, position: &Position) -> CloseOutcome {
        let symbol = position.symbol.as_str();
        let side = position.side().closing_side();
        let quantity = self
            .exchange
            .round_quantity(symbol, position.amount.abs())
            .await;

        if self.settings.dry_run {
            info!(symbol, side = %side, %quantity, "dry run — close not submitted");
            let outcome = CloseOutcome::DryRun { side, quantity };
            self.report(position, &outcome).await;
            return outcome;
        }

        // Protective orders are only cancelled when a close will be submitted.
        if quantity.is_zero() {
            let outcome = CloseOutcome::Exhausted {
                attempts: 0,
                last_error: format!("amount {} rounds to zero", position.amount),
            };
            error!(symbol, amount = %position.amount, "close quantity rounds to zero");
            self.report(position, &outcome).await;
            return outcome;
        }

        self.cancel_protective_orders(symbol).await;

        let outcome = match self.submit_with_retry(symbol, side, quantity).await {
            Ok(ack) => match CloseStatus::classify(&ack.status) {
                CloseStatus::Filled => CloseOutcome::Filled {
                    order_id: ack.order_id,
                },
                CloseStatus::NotFullyClosed => CloseOutcome::NotFullyClosed {
                    order_id: ack.order_id,
                    status: ack.status,
                },
                CloseStatus::Unexpected => CloseOutcome::Unexpected {
                    order_id: ack.order_id,
                    status: ack.status,
                },
            },
            Err(e) => CloseOutcome::Exhausted {
                attempts: self.settings.close_max_attempts,
                last_error: e.to_string(),
            },
        };

        self.report(position, &outcome).await;
        outcome
    }

    /// Steps 1–2. Failures are logged and never abort the close.
    async fn cancel_protective_orders(&self, symbol: &str) {
        if let Err(e) = self.exchange.cancel_all_conventional(symbol).await {
            warn!(symbol, error = %e, "cancel of conventional orders failed — continuing");
        }

        match self.exchange.fetch_conditional_orders(symbol).await {
            Ok(orders) => {
                for order in orders.iter().filter(|o| o.is_active()) {
                    if let Err(e) = self.exchange.cancel_conditional(symbol, order.id).await {
                        warn!(symbol, order_id = order.id, error = %e, "conditional cancel failed — continuing");
                    }
                }
            }
            Err(e) => {
                warn!(symbol, error = %e, "could not list conditional orders — continuing");
            }
        }
    }

    /// Step 4. Up to `close_max_attempts` tries with a fixed delay in between.
    async fn submit_with_retry(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<CloseOrderAck, ExchangeError> {
        let attempts = self.settings.close_max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self
                .exchange
                .submit_reduce_only_market_close(symbol, side, quantity)
                .await
            {
                Ok(ack) => return Ok(ack),
                Err(e) if attempt < attempts => {
                    warn!(symbol, attempt, max_attempts = attempts, error = %e, "close submission failed — retrying");
                    sleep(self.settings.close_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(symbol, attempts, error = %e, "close submission failed — giving up for this tick");
                    return Err(e);
                }
            }
        }
    }

    async fn report(&self, position: &Position, outcome: &CloseOutcome) {
        let message = match outcome {
            CloseOutcome::Filled { order_id } => {
                info!(symbol = %position.symbol, order_id, "position closed");
                alerts::close_filled(position, *order_id)
            }
            CloseOutcome::NotFullyClosed { order_id, status } => {
                warn!(symbol = %position.symbol, order_id, status = %status, "position not fully closed");
                alerts::close_not_full(position, *order_id, status)
            }
            CloseOutcome::Unexpected { order_id, status } => {
                warn!(symbol = %position.symbol, order_id, status = %status, "unexpected close status");
                alerts::close_unexpected(position, *order_id, status)
            }
            CloseOutcome::Exhausted { attempts, last_error } => {
                alerts::close_exhausted(position, *attempts, last_error)
            }
            CloseOutcome::DryRun { side, quantity } => {
                alerts::close_dry_run(position, *side, *quantity)
            }
        };
        alerts::dispatch(self.alerts.as_ref(), &message, &[]).await;
    }
}

fn log_positions(positions: &[Position], max_loss: Decimal) {
    if positions.is_empty() {
        debug!("no open positions");
        return;
    }
    for p in positions {
        info!(
            symbol = %p.symbol,
            side = %p.side(),
            amount = %p.amount,
            pnl = %p.unrealized_pnl.round_dp(2),
            mark = %p.mark_price,
            breach = p.breaches_loss_cap(max_loss),
            "position"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::recording::RecordingSink;
    use crate::exchange::mock::{Call, MockExchange};
    use crate::types::{OpenOrder, OrderSource};
    use rust_decimal_macros::dec;

    fn position(symbol: &str, amount: Decimal, pnl: Decimal) -> Position {
        Position {
            symbol: symbol.into(),
            amount,
            unrealized_pnl: pnl,
            entry_price: Decimal::ZERO,
            mark_price: Decimal::ZERO,
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_secs(10),
            max_loss: dec!(100),
            dry_run: false,
            close_max_attempts: 3,
            close_retry_delay: Duration::from_secs(1),
            max_consecutive_errors: 3,
            error_cooldown: Duration::from_secs(60),
        }
    }

    struct Fixture {
        exchange: Arc<MockExchange>,
        sink: Arc<RecordingSink>,
        state: Arc<GuardianState>,
        monitor: Arc<PositionMonitor>,
    }

    fn fixture_with(settings: MonitorSettings) -> Fixture {
        let exchange = Arc::new(MockExchange::new());
        let sink = Arc::new(RecordingSink::default());
        let state = Arc::new(GuardianState::new());
        let monitor = Arc::new(PositionMonitor::new(
            exchange.clone(),
            sink.clone(),
            state.clone(),
            settings,
        ));
        Fixture {
            exchange,
            sink,
            state,
            monitor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(settings())
    }

    fn is_submit(c: &Call) -> bool {
        matches!(c, Call::SubmitClose(..))
    }

    fn is_mutation(c: &Call) -> bool {
        matches!(
            c,
            Call::SubmitClose(..) | Call::CancelAllConventional(_) | Call::CancelConditional(..)
        )
    }

    #[tokio::test]
    async fn profitable_or_small_losses_never_close() {
        let f = fixture();
        f.exchange.push_positions(Ok(vec![
            position("BTCUSDT", dec!(0.1), dec!(250)),
            position("ETHUSDT", dec!(1), dec!(0)),
            position("SOLUSDT", dec!(-5), dec!(-99.99)),
        ]));

        let report = f.monitor.tick().await.unwrap();
        assert_eq!(report.positions, 3);
        assert!(report.triggered.is_empty());
        assert_eq!(f.exchange.count(is_mutation), 0);
    }

    #[tokio::test]
    async fn long_breach_closes_with_sell_of_rounded_amount() {
        let f = fixture();
        f.exchange.set_precision("BTCUSDT", 3);
        f.exchange.push_positions(Ok(vec![position("BTCUSDT", dec!(0.1), dec!(-150))]));

        let report = f.monitor.tick().await.unwrap();

        assert_eq!(report.triggered, vec!["BTCUSDT".to_string()]);
        assert_eq!(report.closes[0].1, CloseOutcome::Filled { order_id: 42 });
        assert!(f
            .exchange
            .calls()
            .contains(&Call::SubmitClose("BTCUSDT".into(), OrderSide::Sell, dec!(0.100))));
        assert!(f.sink.messages()[0].contains("Position closed"));
    }

    #[tokio::test]
    async fn short_breach_closes_with_buy() {
        let f = fixture();
        f.exchange.push_positions(Ok(vec![position("ETHUSDT", dec!(-2.5), dec!(-100))]));

        f.monitor.tick().await.unwrap();
        assert!(f
            .exchange
            .calls()
            .contains(&Call::SubmitClose("ETHUSDT".into(), OrderSide::Buy, dec!(2.5))));
    }

    #[tokio::test]
    async fn cancellations_precede_submission() {
        let f = fixture();
        let stop = OpenOrder {
            id: 77,
            symbol: "BTCUSDT".into(),
            side: OrderSide::Sell,
            quantity: Decimal::ZERO,
            kind: "STOP_MARKET".into(),
            status: "NEW".into(),
            close_position: true,
            source: OrderSource::Conditional,
        };
        let done = OpenOrder {
            id: 78,
            status: "FINISHED".into(),
            ..stop.clone()
        };
        f.exchange.set_conditional("BTCUSDT", Ok(vec![stop, done]));
        f.exchange.push_positions(Ok(vec![position("BTCUSDT", dec!(0.1), dec!(-150))]));

        f.monitor.tick().await.unwrap();

        let calls = f.exchange.calls();
        let cancel_all = calls
            .iter()
            .position(|c| matches!(c, Call::CancelAllConventional(_)))
            .unwrap();
        let cancel_algo = calls
            .iter()
            .position(|c| *c == Call::CancelConditional("BTCUSDT".into(), 77))
            .unwrap();
        let submit = calls.iter().position(is_submit).unwrap();
        assert!(cancel_all < cancel_algo && cancel_algo < submit);
        // Inactive conditional orders are left alone.
        assert!(!calls.contains(&Call::CancelConditional("BTCUSDT".into(), 78)));
    }

    #[tokio::test]
    async fn cancel_failures_do_not_block_close() {
        let f = fixture();
        f.exchange.fail_cancel_all(ExchangeError::http_status(500, "oops"));
        f.exchange.set_conditional("BTCUSDT", Err(ExchangeError::Network("reset".into())));
        f.exchange.push_positions(Ok(vec![position("BTCUSDT", dec!(0.1), dec!(-150))]));

        let report = f.monitor.tick().await.unwrap();
        assert_eq!(report.closes[0].1, CloseOutcome::Filled { order_id: 42 });
    }

    #[tokio::test]
    async fn each_qualifying_tick_closes_once() {
        let f = fixture();
        f.exchange.push_positions(Ok(vec![position("BTCUSDT", dec!(0.1), dec!(-150))]));

        f.monitor.tick().await.unwrap();
        assert_eq!(f.exchange.count(is_submit), 1);
        f.monitor.tick().await.unwrap();
        assert_eq!(f.exchange.count(is_submit), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_retries_then_succeeds() {
        let f = fixture();
        f.exchange.push_close(Err(ExchangeError::Network("timeout".into())));
        f.exchange.push_close(Err(ExchangeError::http_status(503, "busy")));
        f.exchange.push_positions(Ok(vec![position("BTCUSDT", dec!(0.1), dec!(-150))]));

        let report = f.monitor.tick().await.unwrap();
        assert_eq!(f.exchange.count(is_submit), 3);
        assert_eq!(report.closes[0].1, CloseOutcome::Filled { order_id: 42 });
    }

    #[tokio::test(start_paused = true)]
    async fn close_exhaustion_is_reported_not_fatal() {
        let f = fixture();
        for _ in 0..3 {
            f.exchange.push_close(Err(ExchangeError::Network("down".into())));
        }
        f.exchange.push_positions(Ok(vec![position("BTCUSDT", dec!(0.1), dec!(-150))]));

        let report = f.monitor.tick().await.unwrap();
        assert_eq!(f.exchange.count(is_submit), 3);
        assert!(matches!(
            report.closes[0].1,
            CloseOutcome::Exhausted { attempts: 3, .. }
        ));
        assert!(f.sink.messages()[0].contains("Close FAILED"));
    }

    #[tokio::test]
    async fn partial_and_unexpected_statuses_stay_distinct() {
        let f = fixture();
        f.exchange.push_close(Ok(CloseOrderAck {
            order_id: 1,
            status: "PARTIALLY_FILLED".into(),
        }));
        f.exchange.push_close(Ok(CloseOrderAck {
            order_id: 2,
            status: "NEW".into(),
        }));
        f.exchange.push_close(Ok(CloseOrderAck {
            order_id: 3,
            status: "EXPIRED".into(),
        }));
        f.exchange.push_positions(Ok(vec![
            position("AUSDT", dec!(1), dec!(-200)),
            position("BUSDT", dec!(1), dec!(-200)),
            position("CUSDT", dec!(1), dec!(-200)),
        ]));

        let report = f.monitor.tick().await.unwrap();
        let outcomes: Vec<_> = report.closes.into_iter().map(|(_, o)| o).collect();
        assert!(matches!(outcomes[0], CloseOutcome::NotFullyClosed { order_id: 1, .. }));
        assert!(matches!(outcomes[1], CloseOutcome::NotFullyClosed { order_id: 2, .. }));
        assert!(matches!(outcomes[2], CloseOutcome::Unexpected { order_id: 3, .. }));

        let messages = f.sink.messages();
        assert!(messages[0].contains("NOT fully closed"));
        assert!(messages[2].contains("Unexpected close status"));
    }

    #[tokio::test]
    async fn paused_guardian_reports_but_never_mutates() {
        let f = fixture();
        f.state.pause();
        f.exchange.push_positions(Ok(vec![position("BTCUSDT", dec!(0.1), dec!(-150))]));

        let report = f.monitor.tick().await.unwrap();
        assert!(report.skipped_paused);
        assert_eq!(f.exchange.count(is_mutation), 0);

        let snapshot = f.state.snapshot().unwrap();
        assert_eq!(snapshot.positions[0].unrealized_pnl, dec!(-150));

        f.state.resume();
        f.monitor.tick().await.unwrap();
        assert_eq!(f.exchange.count(is_submit), 1);
    }

    #[tokio::test]
    async fn dry_run_performs_no_mutation() {
        let f = fixture_with(MonitorSettings {
            dry_run: true,
            ..settings()
        });
        f.exchange.push_positions(Ok(vec![position("BTCUSDT", dec!(0.1), dec!(-150))]));

        let report = f.monitor.tick().await.unwrap();
        assert!(matches!(report.closes[0].1, CloseOutcome::DryRun { side: OrderSide::Sell, .. }));
        assert_eq!(f.exchange.count(is_mutation), 0);
        assert!(f.sink.messages()[0].contains("Dry run"));
    }

    #[tokio::test]
    async fn zero_rounded_quantity_keeps_protective_orders() {
        let f = fixture();
        f.exchange.set_precision("DOGEUSDT", 0);
        f.exchange.push_positions(Ok(vec![position("DOGEUSDT", dec!(0.5), dec!(-150))]));

        let report = f.monitor.tick().await.unwrap();

        assert!(matches!(
            report.closes[0].1,
            CloseOutcome::Exhausted { attempts: 0, .. }
        ));
        assert_eq!(f.exchange.count(is_mutation), 0);
        assert_eq!(f.exchange.calls(), vec![Call::FetchPositions]);
        assert!(f.sink.messages()[0].contains("Close FAILED"));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_snapshot() {
        let f = fixture();
        f.exchange.push_positions(Ok(vec![position("BTCUSDT", dec!(0.1), dec!(-10))]));
        f.exchange.push_positions(Err(ExchangeError::Network("reset".into())));

        f.monitor.tick().await.unwrap();
        assert!(f.monitor.tick().await.is_err());
        assert_eq!(f.state.snapshot().unwrap().positions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_counts_errors_and_cools_down() {
        let f = fixture();
        f.exchange.push_positions(Err(ExchangeError::Network("down".into())));

        let handle = tokio::spawn(f.monitor.clone().run());

        // Ticks at t=0, 10, 20 fail; the third reaches the threshold.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(f.exchange.count(|c| *c == Call::FetchPositions), 3);

        // During the 60 s cooldown no further ticks happen.
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(f.exchange.count(|c| *c == Call::FetchPositions), 3);
        assert_eq!(f.state.consecutive_errors(), 3);

        // After the cooldown the counter is reset and polling resumes.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(f.exchange.count(|c| *c == Call::FetchPositions) > 3);
        assert!(f.state.consecutive_errors() < 3);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn successful_tick_resets_error_counter() {
        let f = fixture();
        f.exchange.push_positions(Err(ExchangeError::Network("blip".into())));
        f.exchange.push_positions(Ok(vec![]));

        let handle = tokio::spawn(f.monitor.clone().run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.state.consecutive_errors(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.state.consecutive_errors(), 0);
        assert!(f.state.last_tick_ok().is_some());

        handle.abort();
    }
}
