//! Market-data primitives shared by the detector and the stream layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order book side.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    /// Stable index for per-side storage.
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            Side::Bid => 0,
            Side::Ask => 1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Bid => write!(f, "BID"),
            Side::Ask => write!(f, "ASK"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BID" | "BUY" => Ok(Side::Bid),
            "ASK" | "SELL" => Ok(Side::Ask),
            _ => Err(format!("invalid side: '{}'", s)),
        }
    }
}

/// Aggressor side of an executed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buyer,
    Seller,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buyer => write!(f, "buyer"),
            TradeSide::Seller => write!(f, "seller"),
        }
    }
}

/// A single price level in an order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting quantity in lots.
    pub quantity: u64,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: u64) -> Self {
        Self { price, quantity }
    }

    /// Notional value of the level.
    #[inline]
    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

/// An executed trade print.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Upstream instrument identifier.
    pub instrument_id: String,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity in lots.
    pub quantity: u64,
    /// Aggressor side, when the venue reports one.
    pub side: Option<TradeSide>,
    /// Wall-clock timestamp from the venue.
    pub at: DateTime<Utc>,
}

/// Resolved instrument metadata.
///
/// Produced once per symbol by the instrument resolver; tick size and price
/// scale may change across trading sessions, so the supervisor re-resolves on
/// every reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    /// Upstream instrument identifier.
    pub instrument_id: String,
    /// Human-facing ticker symbol.
    pub symbol: String,
    /// Minimum price increment.
    pub tick_size: Decimal,
    /// Number of decimal places carried by prices of this instrument.
    pub price_scale: u32,
}

/// Convert a price into its bit-exact integer key, `price * 10^price_scale`.
///
/// Returns `None` when the price does not fit the instrument's scale (an
/// off-grid price) or overflows `i64`. Keying prices as scaled integers keeps
/// map lookups and trade-volume matching exact.
pub fn scaled_price(price: Decimal, price_scale: u32) -> Option<i64> {
    let mut rescaled = price;
    rescaled.rescale(price_scale);
    if rescaled != price {
        return None;
    }
    i64::try_from(rescaled.mantissa()).ok()
}
