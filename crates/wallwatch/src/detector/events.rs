//! Wall lifecycle events.
//!
//! The event stream is heterogeneous, so each kind is a distinct variant
//! with its own payload; sinks pattern-match rather than digging through a
//! generic bag.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use wall_common::Side;

/// Detector state a tracked wall can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WallState {
    Candidate,
    Confirmed,
    Consuming,
}

impl std::fmt::Display for WallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WallState::Candidate => write!(f, "candidate"),
            WallState::Confirmed => write!(f, "confirmed"),
            WallState::Consuming => write!(f, "consuming"),
        }
    }
}

/// Event kind, used for cooldown bookkeeping and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WallCandidate,
    WallConfirmed,
    WallConsuming,
    WallLost,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WallCandidate => "wall_candidate",
            EventKind::WallConfirmed => "wall_confirmed",
            EventKind::WallConsuming => "wall_consuming",
            EventKind::WallLost => "wall_lost",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A level newly qualifying as a wall candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallCandidateEvent {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: u64,
    pub distance_ticks: u64,
    pub at: DateTime<Utc>,
}

/// A candidate that survived its dwell and still dominates the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallConfirmedEvent {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: u64,
    pub dwell_seconds: f64,
    pub at: DateTime<Utc>,
}

/// A confirmed wall shrinking while real volume executes at its price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallConsumingEvent {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity_before: u64,
    pub quantity_now: u64,
    pub drop_pct: Decimal,
    pub executed_volume: u64,
    pub at: DateTime<Utc>,
}

/// A confirmed or consuming wall vanished from the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallLostEvent {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub last_quantity: u64,
    pub age_seconds: f64,
    pub previous_state: WallState,
    pub at: DateTime<Utc>,
}

/// Tagged wall lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WallEvent {
    WallCandidate(WallCandidateEvent),
    WallConfirmed(WallConfirmedEvent),
    WallConsuming(WallConsumingEvent),
    WallLost(WallLostEvent),
}

impl WallEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WallEvent::WallCandidate(_) => EventKind::WallCandidate,
            WallEvent::WallConfirmed(_) => EventKind::WallConfirmed,
            WallEvent::WallConsuming(_) => EventKind::WallConsuming,
            WallEvent::WallLost(_) => EventKind::WallLost,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            WallEvent::WallCandidate(e) => &e.symbol,
            WallEvent::WallConfirmed(e) => &e.symbol,
            WallEvent::WallConsuming(e) => &e.symbol,
            WallEvent::WallLost(e) => &e.symbol,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            WallEvent::WallCandidate(e) => e.side,
            WallEvent::WallConfirmed(e) => e.side,
            WallEvent::WallConsuming(e) => e.side,
            WallEvent::WallLost(e) => e.side,
        }
    }

    pub fn price(&self) -> Decimal {
        match self {
            WallEvent::WallCandidate(e) => e.price,
            WallEvent::WallConfirmed(e) => e.price,
            WallEvent::WallConsuming(e) => e.price,
            WallEvent::WallLost(e) => e.price,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            WallEvent::WallCandidate(e) => e.at,
            WallEvent::WallConfirmed(e) => e.at,
            WallEvent::WallConsuming(e) => e.at,
            WallEvent::WallLost(e) => e.at,
        }
    }
}

impl std::fmt::Display for WallEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WallEvent::WallCandidate(e) => write!(
                f,
                "wall_candidate {} {} {} qty={} dist={}",
                e.symbol, e.side, e.price, e.quantity, e.distance_ticks
            ),
            WallEvent::WallConfirmed(e) => write!(
                f,
                "wall_confirmed {} {} {} qty={} dwell={:.1}s",
                e.symbol, e.side, e.price, e.quantity, e.dwell_seconds
            ),
            WallEvent::WallConsuming(e) => write!(
                f,
                "wall_consuming {} {} {} {}->{} drop={} exec={}",
                e.symbol, e.side, e.price, e.quantity_before, e.quantity_now, e.drop_pct,
                e.executed_volume
            ),
            WallEvent::WallLost(e) => write!(
                f,
                "wall_lost {} {} {} last_qty={} age={:.1}s was={}",
                e.symbol, e.side, e.price, e.last_quantity, e.age_seconds, e.previous_state
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candidate() -> WallEvent {
        WallEvent::WallCandidate(WallCandidateEvent {
            symbol: "SBER".to_string(),
            side: Side::Ask,
            price: dec!(100.03),
            quantity: 500,
            distance_ticks: 2,
            at: Utc::now(),
        })
    }

    #[test]
    fn test_kind_accessors() {
        let event = candidate();
        assert_eq!(event.kind(), EventKind::WallCandidate);
        assert_eq!(event.symbol(), "SBER");
        assert_eq!(event.side(), Side::Ask);
        assert_eq!(event.price(), dec!(100.03));
    }

    #[test]
    fn test_serde_tag() {
        let json = serde_json::to_string(&candidate()).unwrap();
        assert!(json.contains("\"event\":\"wall_candidate\""));
        let parsed: WallEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind(), EventKind::WallCandidate);
    }

    #[test]
    fn test_display_is_line_oriented() {
        let line = candidate().to_string();
        assert!(line.starts_with("wall_candidate SBER ASK 100.03"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_kind_names_match_config_keys() {
        assert_eq!(EventKind::WallCandidate.as_str(), "wall_candidate");
        assert_eq!(EventKind::WallLost.as_str(), "wall_lost");
    }
}
