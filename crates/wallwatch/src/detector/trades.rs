//! Rolling window over executed trades, keyed by exact price.
//!
//! Answers "how much volume traded at price P in the last W seconds".
//! Prices are compared as scaled integers (`wall_common::scaled_price`), so
//! matching is bit-exact. Entries older than the retention window are
//! trimmed on every insert, which bounds memory to
//! `retention * expected trade rate`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct TradeEntry {
    recorded_at: Instant,
    price_key: i64,
    quantity: u64,
}

/// Time-bounded aggregator of executed volume.
#[derive(Debug, Clone)]
pub struct TradeWindow {
    entries: VecDeque<TradeEntry>,
    retention: Duration,
}

impl TradeWindow {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
        }
    }

    /// Record an execution and trim anything past retention.
    pub fn record(&mut self, price_key: i64, quantity: u64, now: Instant) {
        self.entries.push_back(TradeEntry {
            recorded_at: now,
            price_key,
            quantity,
        });
        self.trim(now);
    }

    /// Total volume executed at exactly `price_key` within `window` of `now`.
    pub fn volume_at_price(&self, price_key: i64, window: Duration, now: Instant) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.price_key == price_key && now.saturating_duration_since(e.recorded_at) <= window)
            .map(|e| e.quantity)
            .sum()
    }

    /// Total volume executed at any price within `window` of `now`.
    pub fn volume_in_window(&self, window: Duration, now: Instant) -> u64 {
        self.entries
            .iter()
            .filter(|e| now.saturating_duration_since(e.recorded_at) <= window)
            .map(|e| e.quantity)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn trim(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.recorded_at) > self.retention {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}
