//! Transport seam: typed frames and the traits the supervisor consumes.
//!
//! The upstream transport is opaque to the core. Implementations only have
//! to resolve symbols to instruments and yield tagged depth/trade frames;
//! everything else (reconnects, dispatch, detector state) lives in the
//! supervisor.

pub mod replay;
pub mod script;
pub mod supervisor;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use wall_common::{InstrumentInfo, PriceLevel, TradeSide};

/// A full snapshot of the top-N levels for one instrument.
///
/// Depth frames are always complete snapshots, never incremental deltas;
/// the supervisor replaces its view of the book wholesale on each frame.
#[derive(Debug, Clone)]
pub struct DepthFrame {
    pub instrument_id: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Venue wall-clock timestamp.
    pub at: DateTime<Utc>,
}

/// One executed trade print.
#[derive(Debug, Clone)]
pub struct TradeFrame {
    pub instrument_id: String,
    pub price: Decimal,
    pub quantity: u64,
    pub side: Option<TradeSide>,
    pub at: DateTime<Utc>,
}

/// Tagged transport frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Depth(DepthFrame),
    Trade(TradeFrame),
}

impl Frame {
    pub fn instrument_id(&self) -> &str {
        match self {
            Frame::Depth(f) => &f.instrument_id,
            Frame::Trade(f) => &f.instrument_id,
        }
    }
}

/// Instrument resolution failures. Fatal at startup (all-or-nothing);
/// retried with backoff when hit during a reconnect.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("instrument not found for symbol {symbol}")]
    NotFound { symbol: String },

    #[error("resolver transport failure: {0}")]
    Transport(String),
}

/// Transport failures.
///
/// Everything except `AuthRejected` and `Fatal` is recovered locally via
/// reconnect with exponential backoff.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("stream ended")]
    StreamEnded,

    #[error("deadline exceeded")]
    Timeout,

    #[error("authentication expired")]
    AuthExpired,

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("unrecoverable transport failure: {0}")]
    Fatal(String),
}

impl FeedError {
    /// Whether the supervisor should back off and reconnect.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FeedError::AuthRejected(_) | FeedError::Fatal(_))
    }
}

/// Resolves a ticker symbol to instrument metadata.
#[async_trait]
pub trait InstrumentResolver: Send + Sync {
    async fn resolve(&self, symbol: &str) -> Result<InstrumentInfo, ResolveError>;
}

/// An open multiplexed subscription yielding frames for all instruments.
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame. `Ok(None)` means the source is deliberately exhausted
    /// (replay completed); a dropped connection surfaces as
    /// `Err(FeedError::StreamEnded)` so the supervisor reconnects.
    async fn next_frame(&mut self) -> Result<Option<Frame>, FeedError>;

    /// Release transport resources. Idempotent.
    async fn close(&mut self) {}
}

/// Opens subscriptions. One `open` call covers all instruments; the
/// supervisor closes and reopens to change the set.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn open(
        &self,
        instruments: &[InstrumentInfo],
        depth: usize,
    ) -> Result<Box<dyn FrameStream>, FeedError>;
}

/// Table-backed resolver over the configured instrument list. Serves the
/// replay transport and tests; a live transport brings its own resolver.
pub struct StaticResolver {
    table: HashMap<String, InstrumentInfo>,
}

impl StaticResolver {
    pub fn new(instruments: impl IntoIterator<Item = InstrumentInfo>) -> Self {
        let table = instruments
            .into_iter()
            .map(|info| (info.symbol.to_uppercase(), info))
            .collect();
        Self { table }
    }
}

#[async_trait]
impl InstrumentResolver for StaticResolver {
    async fn resolve(&self, symbol: &str) -> Result<InstrumentInfo, ResolveError> {
        self.table
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                symbol: symbol.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn info(symbol: &str) -> InstrumentInfo {
        InstrumentInfo {
            instrument_id: format!("uid-{symbol}"),
            symbol: symbol.to_string(),
            tick_size: dec!(0.01),
            price_scale: 2,
        }
    }

    #[tokio::test]
    async fn test_static_resolver_is_case_insensitive() {
        let resolver = StaticResolver::new(vec![info("SBER")]);
        let resolved = resolver.resolve("sber").await.unwrap();
        assert_eq!(resolved.instrument_id, "uid-SBER");

        let missing = resolver.resolve("GAZP").await;
        assert!(matches!(missing, Err(ResolveError::NotFound { .. })));
    }

    #[test]
    fn test_feed_error_retryability() {
        assert!(FeedError::Connection("refused".into()).is_retryable());
        assert!(FeedError::StreamEnded.is_retryable());
        assert!(FeedError::Timeout.is_retryable());
        assert!(FeedError::AuthExpired.is_retryable());
        assert!(!FeedError::AuthRejected("bad token".into()).is_retryable());
        assert!(!FeedError::Fatal("proto mismatch".into()).is_retryable());
    }

    #[test]
    fn test_frame_instrument_id() {
        let frame = Frame::Trade(TradeFrame {
            instrument_id: "uid-1".to_string(),
            price: dec!(100.03),
            quantity: 60,
            side: Some(TradeSide::Seller),
            at: Utc::now(),
        });
        assert_eq!(frame.instrument_id(), "uid-1");
    }
}
