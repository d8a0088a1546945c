// =============================================================================
// Exchange seam — everything the guardian needs from a futures venue
// =============================================================================

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::binance::error::ExchangeError;
use crate::types::{CloseOrderAck, OpenOrder, OrderSide, Position};

/// Futures venue operations used by the monitor and the stop-loss detector.
#[async_trait]
pub trait FuturesExchange: Send + Sync {
    /// All open positions; zero-amount entries are filtered out.
    async fn fetch_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// Open conditional (algo) orders for `symbol`.
    async fn fetch_conditional_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    /// Open conventional orders for `symbol`.
    async fn fetch_conventional_orders(&self, symbol: &str)
        -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn cancel_all_conventional(&self, symbol: &str) -> Result<(), ExchangeError>;

    async fn cancel_conditional(&self, symbol: &str, id: u64) -> Result<(), ExchangeError>;

    /// Reduce-only market order of `quantity` on `side`.
    async fn submit_reduce_only_market_close(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<CloseOrderAck, ExchangeError>;

    /// Round `quantity` to the precision the exchange accepts for `symbol`.
    async fn round_quantity(&self, symbol: &str, quantity: Decimal) -> Decimal;
}

// =============================================================================
// Scriptable in-memory exchange for monitor / detector tests
// =============================================================================
#[cfg(test)]
pub mod mock {
    use std::collections::{HashMap, VecDeque};

    use parking_lot::Mutex;

    use super::*;
    use crate::binance::precision::{round_to_precision, DEFAULT_PRECISION};

    /// One recorded call, in order.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        FetchPositions,
        FetchConditional(String),
        FetchConventional(String),
        CancelAllConventional(String),
        CancelConditional(String, u64),
        SubmitClose(String, OrderSide, Decimal),
    }

    #[derive(Default)]
    struct Script {
        positions: VecDeque<Result<Vec<Position>, ExchangeError>>,
        conditional: HashMap<String, Result<Vec<OpenOrder>, ExchangeError>>,
        conventional: HashMap<String, Result<Vec<OpenOrder>, ExchangeError>>,
        cancel_all_error: Option<ExchangeError>,
        close_results: VecDeque<Result<CloseOrderAck, ExchangeError>>,
        precision: HashMap<String, u32>,
    }

    #[derive(Default)]
    pub struct MockExchange {
        script: Mutex<Script>,
        calls: Mutex<Vec<Call>>,
    }

    impl MockExchange {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a positions response. The last queued response repeats.
        pub fn push_positions(&self, result: Result<Vec<Position>, ExchangeError>) {
            self.script.lock().positions.push_back(result);
        }

        pub fn set_conditional(&self, symbol: &str, result: Result<Vec<OpenOrder>, ExchangeError>) {
            self.script.lock().conditional.insert(symbol.to_string(), result);
        }

        pub fn set_conventional(&self, symbol: &str, result: Result<Vec<OpenOrder>, ExchangeError>) {
            self.script.lock().conventional.insert(symbol.to_string(), result);
        }

        pub fn fail_cancel_all(&self, err: ExchangeError) {
            self.script.lock().cancel_all_error = Some(err);
        }

        /// Queue a close response. When the queue is empty closes are FILLED.
        pub fn push_close(&self, result: Result<CloseOrderAck, ExchangeError>) {
            self.script.lock().close_results.push_back(result);
        }

        pub fn set_precision(&self, symbol: &str, precision: u32) {
            self.script.lock().precision.insert(symbol.to_string(), precision);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.lock().iter().filter(|c| pred(c)).count()
        }

        fn record(&self, call: Call) {
            self.calls.lock().push(call);
        }
    }

    #[async_trait]
    impl FuturesExchange for MockExchange {
        async fn fetch_positions(&self) -> Result<Vec<Position>, ExchangeError> {
            self.record(Call::FetchPositions);
            let mut script = self.script.lock();
            if script.positions.len() > 1 {
                script.positions.pop_front().unwrap_or(Ok(Vec::new()))
            } else {
                script.positions.front().cloned().unwrap_or(Ok(Vec::new()))
            }
        }

        async fn fetch_conditional_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
            self.record(Call::FetchConditional(symbol.to_string()));
            self.script.lock().conditional.get(symbol).cloned().unwrap_or(Ok(Vec::new()))
        }

        async fn fetch_conventional_orders(
            &self,
            symbol: &str,
        ) -> Result<Vec<OpenOrder>, ExchangeError> {
            self.record(Call::FetchConventional(symbol.to_string()));
            self.script.lock().conventional.get(symbol).cloned().unwrap_or(Ok(Vec::new()))
        }

        async fn cancel_all_conventional(&self, symbol: &str) -> Result<(), ExchangeError> {
            self.record(Call::CancelAllConventional(symbol.to_string()));
            match self.script.lock().cancel_all_error.clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn cancel_conditional(&self, symbol: &str, id: u64) -> Result<(), ExchangeError> {
            self.record(Call::CancelConditional(symbol.to_string(), id));
            Ok(())
        }

        async fn submit_reduce_only_market_close(
            &self,
            symbol: &str,
            side: OrderSide,
            quantity: Decimal,
        ) -> Result<CloseOrderAck, ExchangeError> {
            self.record(Call::SubmitClose(symbol.to_string(), side, quantity));
            self.script.lock().close_results.pop_front().unwrap_or_else(|| {
                Ok(CloseOrderAck {
                    order_id: 42,
                    status: "FILLED".into(),
                })
            })
        }

        async fn round_quantity(&self, symbol: &str, quantity: Decimal) -> Decimal {
            let precision = self
                .script
                .lock()
                .precision
                .get(symbol)
                .copied()
                .unwrap_or(DEFAULT_PRECISION);
            round_to_precision(quantity, precision)
        }
    }
}
