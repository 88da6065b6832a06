//! JSONL replay transport.
//!
//! Reads captured depth/trade records from a file and serves them through
//! the same `MarketFeed` trait as a live transport, optionally paced by the
//! recorded timestamps. The stream ends with `Ok(None)` when the capture is
//! exhausted, which shuts the pipeline down cleanly.
//!
//! Record format, one JSON object per line:
//!
//! ```text
//! {"type":"depth","instrument_id":"uid-1","ts_ms":1712000000000,
//!  "bids":[["99.99",10]],"asks":[["100.01",10],["100.03",500]]}
//! {"type":"trade","instrument_id":"uid-1","ts_ms":1712000000100,
//!  "price":"100.03","qty":60,"side":"seller"}
//! ```

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use wall_common::{InstrumentInfo, PriceLevel, TradeSide};

use super::{DepthFrame, FeedError, Frame, FrameStream, MarketFeed, TradeFrame};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplayRecord {
    Depth {
        instrument_id: String,
        ts_ms: i64,
        bids: Vec<(Decimal, u64)>,
        asks: Vec<(Decimal, u64)>,
    },
    Trade {
        instrument_id: String,
        ts_ms: i64,
        price: Decimal,
        #[serde(rename = "qty")]
        quantity: u64,
        #[serde(default)]
        side: Option<TradeSide>,
    },
}

/// File-backed replay feed.
pub struct ReplayFeed {
    path: PathBuf,
    /// Playback speed multiplier; 0 disables pacing and replays flat out.
    speed: f64,
}

impl ReplayFeed {
    pub fn new(path: impl Into<PathBuf>, speed: f64) -> Self {
        Self {
            path: path.into(),
            speed,
        }
    }
}

#[async_trait]
impl MarketFeed for ReplayFeed {
    async fn open(
        &self,
        instruments: &[InstrumentInfo],
        depth: usize,
    ) -> Result<Box<dyn FrameStream>, FeedError> {
        let subscribed: HashSet<&str> = instruments
            .iter()
            .map(|i| i.instrument_id.as_str())
            .collect();
        let frames = load_frames(&self.path, &subscribed, depth)?;
        debug!(path = %self.path.display(), frames = frames.len(), "replay capture loaded");
        Ok(Box::new(ReplayStream {
            frames,
            speed: self.speed,
            last_ts: None,
        }))
    }
}

struct ReplayStream {
    frames: VecDeque<Frame>,
    speed: f64,
    last_ts: Option<DateTime<Utc>>,
}

#[async_trait]
impl FrameStream for ReplayStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>, FeedError> {
        let Some(frame) = self.frames.pop_front() else {
            return Ok(None);
        };
        let at = match &frame {
            Frame::Depth(f) => f.at,
            Frame::Trade(f) => f.at,
        };
        if self.speed > 0.0
            && let Some(prev) = self.last_ts
        {
            let gap_ms = (at - prev).num_milliseconds().max(0) as f64;
            let paced = Duration::from_millis((gap_ms / self.speed) as u64);
            if !paced.is_zero() {
                tokio::time::sleep(paced).await;
            }
        }
        self.last_ts = Some(at);
        Ok(Some(frame))
    }
}

fn load_frames(
    path: &Path,
    subscribed: &HashSet<&str>,
    depth: usize,
) -> Result<VecDeque<Frame>, FeedError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FeedError::Connection(format!("{}: {e}", path.display())))?;
    let mut frames = VecDeque::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: ReplayRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = lineno + 1, error = %e, "skipping malformed replay record");
                continue;
            }
        };
        match record {
            ReplayRecord::Depth {
                instrument_id,
                ts_ms,
                bids,
                asks,
            } => {
                if !subscribed.contains(instrument_id.as_str()) {
                    continue;
                }
                let Some(at) = millis_to_utc(ts_ms) else {
                    warn!(line = lineno + 1, ts_ms, "skipping record with bad timestamp");
                    continue;
                };
                frames.push_back(Frame::Depth(DepthFrame {
                    instrument_id,
                    bids: to_levels(bids, depth),
                    asks: to_levels(asks, depth),
                    at,
                }));
            }
            ReplayRecord::Trade {
                instrument_id,
                ts_ms,
                price,
                quantity,
                side,
            } => {
                if !subscribed.contains(instrument_id.as_str()) {
                    continue;
                }
                let Some(at) = millis_to_utc(ts_ms) else {
                    warn!(line = lineno + 1, ts_ms, "skipping record with bad timestamp");
                    continue;
                };
                frames.push_back(Frame::Trade(TradeFrame {
                    instrument_id,
                    price,
                    quantity,
                    side,
                    at,
                }));
            }
        }
    }
    Ok(frames)
}

fn to_levels(raw: Vec<(Decimal, u64)>, depth: usize) -> Vec<PriceLevel> {
    raw.into_iter()
        .take(depth)
        .map(|(price, quantity)| PriceLevel::new(price, quantity))
        .collect()
}

fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn instrument() -> InstrumentInfo {
        InstrumentInfo {
            instrument_id: "uid-1".to_string(),
            symbol: "SBER".to_string(),
            tick_size: dec!(0.01),
            price_scale: 2,
        }
    }

    fn write_capture(lines: &[&str]) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "wallwatch-replay-{}-{:?}.jsonl",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    #[tokio::test]
    async fn test_replay_yields_frames_then_ends() {
        let path = write_capture(&[
            r#"{"type":"depth","instrument_id":"uid-1","ts_ms":1712000000000,"bids":[["99.99",10]],"asks":[["100.01",10],["100.03",500]]}"#,
            r#"{"type":"trade","instrument_id":"uid-1","ts_ms":1712000000100,"price":"100.03","qty":60,"side":"seller"}"#,
        ]);
        let feed = ReplayFeed::new(&path, 0.0);
        let mut stream = feed.open(&[instrument()], 20).await.unwrap();

        match stream.next_frame().await.unwrap() {
            Some(Frame::Depth(depth)) => {
                assert_eq!(depth.instrument_id, "uid-1");
                assert_eq!(depth.asks.len(), 2);
                assert_eq!(depth.asks[1].price, dec!(100.03));
            }
            other => panic!("expected depth frame, got {other:?}"),
        }
        match stream.next_frame().await.unwrap() {
            Some(Frame::Trade(trade)) => {
                assert_eq!(trade.quantity, 60);
                assert_eq!(trade.side, Some(TradeSide::Seller));
            }
            other => panic!("expected trade frame, got {other:?}"),
        }
        assert!(stream.next_frame().await.unwrap().is_none());
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_replay_skips_malformed_and_foreign_records() {
        let path = write_capture(&[
            r#"not json at all"#,
            r#"{"type":"trade","instrument_id":"uid-other","ts_ms":1712000000000,"price":"1.00","qty":5}"#,
            r#"{"type":"trade","instrument_id":"uid-1","ts_ms":1712000000000,"price":"100.03","qty":5}"#,
        ]);
        let feed = ReplayFeed::new(&path, 0.0);
        let mut stream = feed.open(&[instrument()], 20).await.unwrap();

        match stream.next_frame().await.unwrap() {
            Some(Frame::Trade(trade)) => assert_eq!(trade.price, dec!(100.03)),
            other => panic!("expected trade frame, got {other:?}"),
        }
        assert!(stream.next_frame().await.unwrap().is_none());
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_replay_truncates_levels_to_depth() {
        let path = write_capture(&[
            r#"{"type":"depth","instrument_id":"uid-1","ts_ms":1712000000000,"bids":[["99.99",1],["99.98",1],["99.97",1]],"asks":[]}"#,
        ]);
        let feed = ReplayFeed::new(&path, 0.0);
        let mut stream = feed.open(&[instrument()], 2).await.unwrap();
        match stream.next_frame().await.unwrap() {
            Some(Frame::Depth(depth)) => assert_eq!(depth.bids.len(), 2),
            other => panic!("expected depth frame, got {other:?}"),
        }
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_missing_file_is_connection_error() {
        let feed = ReplayFeed::new("/nonexistent/capture.jsonl", 0.0);
        let err = feed.open(&[instrument()], 20).await.err().unwrap();
        assert!(matches!(err, FeedError::Connection(_)));
    }
}
