// =============================================================================
// Shared types used across the guardian
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an open position, derived from the sign of its amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The order side that reduces a position of this direction.
    pub fn closing_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Exchange order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Parse the exchange's wire representation (case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Position
// =============================================================================

/// One open futures position as reported by the position-risk endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed amount; positive is long, negative is short.
    pub amount: Decimal,
    /// Unrealized PnL in quote currency.
    pub unrealized_pnl: Decimal,
    #[serde(default)]
    pub entry_price: Decimal,
    #[serde(default)]
    pub mark_price: Decimal,
}

impl Position {
    pub fn side(&self) -> PositionSide {
        if self.amount > Decimal::ZERO {
            PositionSide::Long
        } else {
            PositionSide::Short
        }
    }

    /// Whether the unrealized loss has reached `max_loss` (a positive amount).
    pub fn breaches_loss_cap(&self, max_loss: Decimal) -> bool {
        self.unrealized_pnl < Decimal::ZERO && self.unrealized_pnl.abs() >= max_loss
    }
}

// =============================================================================
// Open orders (conditional / conventional)
// =============================================================================

/// Which order book an open order was listed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSource {
    /// Algo / conditional order service.
    Conditional,
    /// Regular open orders.
    Conventional,
}

/// Order statuses that still rest on the exchange.
const ACTIVE_STATUSES: &[&str] = &["NEW", "ACTIVE", "WORKING", "PARTIALLY_FILLED"];

/// Order types that act as a stop-loss.
const STOP_KINDS: &[&str] = &["STOP", "STOP_MARKET"];

/// An open order from either the conditional or the conventional listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    /// Exchange order type, e.g. `STOP_MARKET`.
    pub kind: String,
    pub status: String,
    pub close_position: bool,
    pub source: OrderSource,
}

impl OpenOrder {
    pub fn is_active(&self) -> bool {
        ACTIVE_STATUSES.contains(&self.status.to_ascii_uppercase().as_str())
    }

    pub fn is_stop_kind(&self) -> bool {
        STOP_KINDS.contains(&self.kind.to_ascii_uppercase().as_str())
    }

    /// True when this order would stop out a position whose reducing side is
    /// `protective_side`.
    pub fn protects(&self, protective_side: OrderSide) -> bool {
        self.is_active()
            && self.side == protective_side
            && self.is_stop_kind()
            && (self.close_position || self.quantity > Decimal::ZERO)
    }
}

// =============================================================================
// Close order acknowledgement
// =============================================================================

/// Response to a reduce-only market close submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseOrderAck {
    pub order_id: u64,
    pub status: String,
}

/// Classification of a close order's resulting status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseStatus {
    Filled,
    /// `PARTIALLY_FILLED` or `NEW`: the position may still carry risk.
    NotFullyClosed,
    Unexpected,
}

impl CloseStatus {
    pub fn classify(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "FILLED" => Self::Filled,
            "PARTIALLY_FILLED" | "NEW" => Self::NotFullyClosed,
            _ => Self::Unexpected,
        }
    }
}
