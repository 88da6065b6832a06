//! Wall detection: a pure per-symbol state machine over book snapshots and
//! trade prints.
//!
//! The machine runs ABSENT → CANDIDATE → CONFIRMED → CONSUMING per resting
//! level, with lost and teleport transitions back to ABSENT. All timing uses
//! a monotonic `Instant` passed in by the caller; the detector itself never
//! reads a clock and performs no I/O, so replaying the same inputs yields
//! the same events.

pub mod engine;
pub mod events;
pub mod trades;

pub use engine::{SymbolState, WallCandidate};
pub use events::{
    EventKind, WallCandidateEvent, WallConfirmedEvent, WallConsumingEvent, WallEvent,
    WallLostEvent, WallState,
};
pub use trades::TradeWindow;
