//! Immutable order-book snapshot and the statistics the detector consults.
//!
//! The detector only ever looks at the top-N region of one side at a time:
//! a sorted vector plus a handful of queries is all the structure needed.
//! `depth` is bounded upstream (≤ 50 typical), so sorting per snapshot is
//! cheap.

use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;

use wall_common::{PriceLevel, Side};

/// Snapshot integrity violations. A frame that fails validation is dropped;
/// the next valid snapshot re-synchronizes detector state.
#[derive(Debug, Error)]
pub enum BookError {
    #[error("duplicate {side} level at {price}")]
    DuplicateLevel { side: Side, price: Decimal },

    #[error("crossed book: best bid {bid} >= best ask {ask}")]
    CrossedBook { bid: Decimal, ask: Decimal },

    #[error("{side} side has {len} levels, depth limit is {depth}")]
    DepthExceeded { side: Side, len: usize, depth: usize },

    #[error("price {price} is not a multiple of tick size {tick_size}")]
    OffTickPrice { price: Decimal, tick_size: Decimal },

    #[error("tick size {tick_size} is not positive")]
    BadTickSize { tick_size: Decimal },
}

/// A full snapshot of the top-N levels of one instrument's book.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub symbol: String,
    pub instrument_id: String,
    pub tick_size: Decimal,
    pub price_scale: u32,
    /// Bid levels, best (highest) first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best (lowest) first.
    pub asks: Vec<PriceLevel>,
    /// Depth requested upstream; each side carries at most this many levels.
    pub depth: usize,
    /// Monotonic receipt time, assigned by the supervisor.
    pub received_at: Instant,
    /// Venue wall-clock timestamp, carried for display only.
    pub at: DateTime<Utc>,
}

impl BookSnapshot {
    /// Build a snapshot from raw levels. Sides are sorted into canonical
    /// order (bids descending, asks ascending); integrity checks live in
    /// [`BookSnapshot::validate`] and run per frame.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        instrument_id: impl Into<String>,
        tick_size: Decimal,
        price_scale: u32,
        mut bids: Vec<PriceLevel>,
        mut asks: Vec<PriceLevel>,
        depth: usize,
        received_at: Instant,
        at: DateTime<Utc>,
    ) -> Self {
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        Self {
            symbol: symbol.into(),
            instrument_id: instrument_id.into(),
            tick_size,
            price_scale,
            bids,
            asks,
            depth,
            received_at,
            at,
        }
    }

    pub fn side_levels(&self, side: Side) -> &[PriceLevel] {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    /// Best price on a side, if the side is non-empty.
    pub fn best_price(&self, side: Side) -> Option<Decimal> {
        self.side_levels(side).first().map(|l| l.price)
    }

    /// Median quantity over the top `top_n` levels of a side, excluding
    /// empty levels. With fewer than two populated levels this is the only
    /// present quantity, or zero.
    pub fn median_quantity(&self, side: Side, top_n: usize) -> Decimal {
        let levels = self.side_levels(side);
        let mut quantities: Vec<u64> = levels
            .iter()
            .take(top_n)
            .filter(|l| l.quantity > 0)
            .map(|l| l.quantity)
            .collect();
        match quantities.len() {
            0 => Decimal::ZERO,
            1 => Decimal::from(quantities[0]),
            n => {
                quantities.sort_unstable();
                if n % 2 == 1 {
                    Decimal::from(quantities[n / 2])
                } else {
                    let lower = Decimal::from(quantities[n / 2 - 1]);
                    let upper = Decimal::from(quantities[n / 2]);
                    (lower + upper) / Decimal::TWO
                }
            }
        }
    }

    /// Distance in ticks from the best price on `side` to `price`.
    ///
    /// Bids measure downward (lower price, positive distance); asks measure
    /// upward. Returns `None` for a price on the wrong side of best or one
    /// that is off the tick grid.
    pub fn distance_ticks(&self, side: Side, price: Decimal) -> Option<u64> {
        let best = self.best_price(side)?;
        let diff = match side {
            Side::Bid => best - price,
            Side::Ask => price - best,
        };
        if diff.is_sign_negative() {
            return None;
        }
        let ticks = diff / self.tick_size;
        if !ticks.fract().is_zero() {
            return None;
        }
        ticks.to_u64()
    }

    /// Resting quantity at an exact price, zero when absent.
    pub fn level_quantity(&self, side: Side, price: Decimal) -> u64 {
        self.side_levels(side)
            .iter()
            .find(|l| l.price == price)
            .map(|l| l.quantity)
            .unwrap_or(0)
    }

    /// Check the snapshot invariants: positive tick, per-side depth bound,
    /// no duplicate prices, no crossed book, prices on the tick grid.
    pub fn validate(&self) -> Result<(), BookError> {
        if self.tick_size <= Decimal::ZERO {
            return Err(BookError::BadTickSize {
                tick_size: self.tick_size,
            });
        }
        for side in [Side::Bid, Side::Ask] {
            let levels = self.side_levels(side);
            if levels.len() > self.depth {
                return Err(BookError::DepthExceeded {
                    side,
                    len: levels.len(),
                    depth: self.depth,
                });
            }
            for pair in levels.windows(2) {
                if pair[0].price == pair[1].price {
                    return Err(BookError::DuplicateLevel {
                        side,
                        price: pair[0].price,
                    });
                }
            }
            for level in levels {
                if !(level.price % self.tick_size).is_zero() {
                    return Err(BookError::OffTickPrice {
                        price: level.price,
                        tick_size: self.tick_size,
                    });
                }
            }
        }
        if let (Some(bid), Some(ask)) = (self.best_price(Side::Bid), self.best_price(Side::Ask))
            && bid >= ask
        {
            return Err(BookError::CrossedBook { bid, ask });
        }
        Ok(())
    }
}
