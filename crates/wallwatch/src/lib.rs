//! Order-book wall monitor.
//!
//! Watches depth-of-book streams for large resting limit orders ("walls"),
//! cross-references them against trade flow, and emits lifecycle alerts:
//! candidate, confirmed, consuming, lost.
//!
//! ## Architecture
//!
//! - `detector`: pure per-symbol state machine; all timing injected
//! - `stream`: transport seam plus the supervising ingestion loop with
//!   reconnect and backoff
//! - `sink`: fan-out of events to delivery backends over bounded queues
//! - `book`: snapshot model and the statistics the detector consults
//! - `config`: TOML + environment configuration with legacy aliases

pub mod book;
pub mod config;
pub mod detector;
pub mod sink;
pub mod stream;

pub use book::{BookError, BookSnapshot};
pub use config::{ConfigError, DetectorConfig, WatchConfig};
pub use detector::{
    EventKind, SymbolState, WallCandidateEvent, WallConfirmedEvent, WallConsumingEvent, WallEvent,
    WallLostEvent, WallState,
};
pub use sink::{spawn_sink_worker, AlertSink, ConsoleSink, SinkError, SinkStats};
pub use stream::replay::ReplayFeed;
pub use stream::supervisor::{
    StatusSnapshot, StreamState, Supervisor, SupervisorError, SupervisorHandle, SymbolCommand,
};
pub use stream::{
    DepthFrame, FeedError, Frame, FrameStream, InstrumentResolver, MarketFeed, ResolveError,
    StaticResolver, TradeFrame,
};
