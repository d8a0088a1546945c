// =============================================================================
// Symbol quantity precision — derived from each instrument's LOT_SIZE step
// =============================================================================
//
// The exchange rejects quantities with more fractional digits than the
// instrument's step size allows, so every close quantity is truncated to the
// cached precision before submission. The metadata is fetched once per process
// and never invalidated.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;

use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Precision used for symbols missing from the exchange metadata.
pub const DEFAULT_PRECISION: u32 = 6;

/// Number of significant fractional digits in a step size such as
/// `"0.00100000"` (→ 3) or `"1"` (→ 0).
pub fn precision_from_step(step: &str) -> Option<u32> {
    let step: Decimal = step.trim().parse().ok()?;
    if step <= Decimal::ZERO {
        return None;
    }
    Some(step.normalize().scale())
}

/// Truncate `qty` toward zero to `precision` fractional digits.
pub fn round_to_precision(qty: Decimal, precision: u32) -> Decimal {
    qty.round_dp_with_strategy(precision, RoundingStrategy::ToZero)
}

/// Extract `symbol → precision` from an `exchangeInfo` payload.
pub fn parse_exchange_info(body: &Value) -> HashMap<String, u32> {
    let mut out = HashMap::new();

    let Some(symbols) = body["symbols"].as_array() else {
        warn!("exchangeInfo payload has no 'symbols' array");
        return out;
    };

    for entry in symbols {
        let Some(symbol) = entry["symbol"].as_str() else {
            continue;
        };
        let step = entry["filters"]
            .as_array()
            .and_then(|filters| {
                filters
                    .iter()
                    .find(|f| f["filterType"].as_str() == Some("LOT_SIZE"))
            })
            .and_then(|f| f["stepSize"].as_str())
            .and_then(precision_from_step);

        if let Some(precision) = step {
            out.insert(symbol.to_string(), precision);
        }
    }

    debug!(count = out.len(), "symbol precisions parsed");
    out
}

/// Lazily-populated `symbol → precision` map.
#[derive(Debug, Default)]
pub struct SymbolPrecisionCache {
    cell: OnceCell<HashMap<String, u32>>,
}

impl SymbolPrecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Precision for `symbol`, loading the metadata through `load` the first
    /// time. A failed load leaves the cache empty so the next call retries,
    /// and this call falls back to [`DEFAULT_PRECISION`].
    pub async fn precision<F, Fut, E>(&self, symbol: &str, load: F) -> u32
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HashMap<String, u32>, E>>,
        E: std::fmt::Display,
    {
        match self.cell.get_or_try_init(load).await {
            Ok(map) => map.get(symbol).copied().unwrap_or_else(|| {
                debug!(symbol, default = DEFAULT_PRECISION, "symbol not in exchange metadata");
                DEFAULT_PRECISION
            }),
            Err(e) => {
                warn!(symbol, error = %e, "failed to load symbol precision — using default");
                DEFAULT_PRECISION
            }
        }
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn step_size_to_precision() {
        assert_eq!(precision_from_step("0.00100000"), Some(3));
        assert_eq!(precision_from_step("0.001"), Some(3));
        assert_eq!(precision_from_step("1"), Some(0));
        assert_eq!(precision_from_step("1.00000000"), Some(0));
        assert_eq!(precision_from_step("0.1"), Some(1));
        assert_eq!(precision_from_step("0"), None);
        assert_eq!(precision_from_step("abc"), None);
    }

    #[test]
    fn rounding_truncates_and_is_idempotent() {
        assert_eq!(round_to_precision(dec!(0.1239), 3), dec!(0.123));
        assert_eq!(round_to_precision(dec!(12.9), 0), dec!(12));
        let once = round_to_precision(dec!(0.987654321), 6);
        assert_eq!(once, dec!(0.987654));
        assert_eq!(round_to_precision(once, 6), once);
    }

    #[test]
    fn parses_lot_size_from_exchange_info() {
        let body = serde_json::json!({
            "symbols": [
                {
                    "symbol": "BTCUSDT",
                    "filters": [
                        { "filterType": "PRICE_FILTER", "tickSize": "0.10" },
                        { "filterType": "LOT_SIZE", "stepSize": "0.001" }
                    ]
                },
                {
                    "symbol": "DOGEUSDT",
                    "filters": [{ "filterType": "LOT_SIZE", "stepSize": "1" }]
                },
                { "symbol": "NOFILTERS" }
            ]
        });
        let map = parse_exchange_info(&body);
        assert_eq!(map.get("BTCUSDT"), Some(&3));
        assert_eq!(map.get("DOGEUSDT"), Some(&0));
        assert!(!map.contains_key("NOFILTERS"));
    }

    #[tokio::test]
    async fn cache_loads_once_and_defaults_unknown_symbols() {
        let cache = SymbolPrecisionCache::new();
        let loads = AtomicU32::new(0);

        for _ in 0..3 {
            let p = cache
                .precision("BTCUSDT", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(HashMap::from([("BTCUSDT".to_string(), 3)]))
                })
                .await;
            assert_eq!(p, 3);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let unknown = cache
            .precision("ETHUSDT", || async { Ok::<_, String>(HashMap::new()) })
            .await;
        assert_eq!(unknown, DEFAULT_PRECISION);
    }

    #[tokio::test]
    async fn failed_load_is_retried_on_next_call() {
        let cache = SymbolPrecisionCache::new();

        let p = cache
            .precision("BTCUSDT", || async { Err::<HashMap<String, u32>, _>("offline") })
            .await;
        assert_eq!(p, DEFAULT_PRECISION);
        assert!(!cache.is_loaded());

        let p = cache
            .precision("BTCUSDT", || async {
                Ok::<_, String>(HashMap::from([("BTCUSDT".to_string(), 3)]))
            })
            .await;
        assert_eq!(p, 3);
        assert!(cache.is_loaded());
    }
}
