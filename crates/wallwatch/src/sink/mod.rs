//! Alert sinks: the push boundary for emitted wall events.
//!
//! Each registered sink gets its own worker task fed from the supervisor's
//! bounded event broadcast. A sink that cannot keep up loses the oldest
//! events (the receiver lags) and the loss is counted; a sink that fails to
//! deliver is logged and counted. Neither can stall or kill ingestion.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::detector::WallEvent;

/// Delivery failures. Swallowed by the worker; never propagated upstream.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// A destination for wall events.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &WallEvent) -> Result<(), SinkError>;
}

/// Per-sink delivery counters, returned when the worker finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Spawn a worker that forwards events from `events` into `sink` until the
/// channel closes or `shutdown` fires. Delivery order matches emission
/// order; when the sink falls a full queue behind, the oldest events are
/// dropped and counted.
pub fn spawn_sink_worker(
    sink: std::sync::Arc<dyn AlertSink>,
    mut events: broadcast::Receiver<WallEvent>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<SinkStats> {
    tokio::spawn(async move {
        let mut stats = SinkStats::default();
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => match sink.deliver(&event).await {
                        Ok(()) => stats.delivered += 1,
                        Err(e) => {
                            stats.failed += 1;
                            warn!(sink = sink.name(), error = %e, "sink delivery failed");
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        stats.dropped += n;
                        warn!(sink = sink.name(), dropped = n, "sink lagging, oldest events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => {
                    debug!(sink = sink.name(), "sink worker shutting down");
                    break;
                }
            }
        }
        info!(
            sink = sink.name(),
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            "sink worker finished"
        );
        stats
    })
}

/// Line-oriented sink writing one key=value record per event to stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink;

#[async_trait]
impl AlertSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&self, event: &WallEvent) -> Result<(), SinkError> {
        println!("{}", format_event(event));
        Ok(())
    }
}

fn format_event(event: &WallEvent) -> String {
    match event {
        WallEvent::WallCandidate(e) => format!(
            "event=wall_candidate symbol={} side={} price={} qty={} distance_ticks={} at={}",
            e.symbol,
            e.side,
            e.price,
            e.quantity,
            e.distance_ticks,
            e.at.to_rfc3339()
        ),
        WallEvent::WallConfirmed(e) => format!(
            "event=wall_confirmed symbol={} side={} price={} qty={} dwell={:.1}s at={}",
            e.symbol,
            e.side,
            e.price,
            e.quantity,
            e.dwell_seconds,
            e.at.to_rfc3339()
        ),
        WallEvent::WallConsuming(e) => format!(
            "event=wall_consuming symbol={} side={} price={} qty_before={} qty_now={} drop={} executed={} at={}",
            e.symbol,
            e.side,
            e.price,
            e.quantity_before,
            e.quantity_now,
            e.drop_pct,
            e.executed_volume,
            e.at.to_rfc3339()
        ),
        WallEvent::WallLost(e) => format!(
            "event=wall_lost symbol={} side={} price={} last_qty={} age={:.1}s was={} at={}",
            e.symbol,
            e.side,
            e.price,
            e.last_quantity,
            e.age_seconds,
            e.previous_state,
            e.at.to_rfc3339()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{WallCandidateEvent, WallState};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use wall_common::Side;

    fn candidate(symbol: &str) -> WallEvent {
        WallEvent::WallCandidate(WallCandidateEvent {
            symbol: symbol.to_string(),
            side: Side::Ask,
            price: dec!(100.03),
            quantity: 500,
            distance_ticks: 2,
            at: Utc::now(),
        })
    }

    struct CountingSink {
        seen: AtomicU64,
    }

    #[async_trait]
    impl AlertSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn deliver(&self, _event: &WallEvent) -> Result<(), SinkError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _event: &WallEvent) -> Result<(), SinkError> {
            Err(SinkError::Delivery("downstream unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_worker_delivers_in_order_and_stops_on_close() {
        let (tx, rx) = broadcast::channel(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let sink = Arc::new(CountingSink {
            seen: AtomicU64::new(0),
        });
        let worker = spawn_sink_worker(sink.clone(), rx, shutdown_rx);

        for i in 0..5 {
            tx.send(candidate(&format!("SYM{i}"))).unwrap();
        }
        drop(tx);

        let stats = worker.await.unwrap();
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.dropped, 0);
        assert_eq!(sink.seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed_and_counted() {
        let (tx, rx) = broadcast::channel(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let worker = spawn_sink_worker(Arc::new(FailingSink), rx, shutdown_rx);

        tx.send(candidate("SBER")).unwrap();
        tx.send(candidate("GAZP")).unwrap();
        drop(tx);

        let stats = worker.await.unwrap();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn test_lagging_receiver_drops_oldest_and_counts() {
        // Fill the channel past capacity before the worker starts: the
        // receiver is guaranteed to observe a lag.
        let (tx, rx) = broadcast::channel(4);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        for i in 0..7 {
            tx.send(candidate(&format!("SYM{i}"))).unwrap();
        }
        drop(tx);

        let sink = Arc::new(CountingSink {
            seen: AtomicU64::new(0),
        });
        let worker = spawn_sink_worker(sink.clone(), rx, shutdown_rx);
        let stats = worker.await.unwrap();
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.delivered, 4);
        assert_eq!(sink.seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let (_tx, rx) = broadcast::channel::<WallEvent>(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let sink = Arc::new(CountingSink {
            seen: AtomicU64::new(0),
        });
        let worker = spawn_sink_worker(sink, rx, shutdown_rx);
        shutdown_tx.send(()).unwrap();
        let stats = worker.await.unwrap();
        assert_eq!(stats.delivered, 0);
    }

    #[test]
    fn test_console_format_is_single_line() {
        let line = format_event(&candidate("SBER"));
        assert!(line.starts_with("event=wall_candidate symbol=SBER side=ASK price=100.03"));
        assert!(!line.contains('\n'));

        let lost = WallEvent::WallLost(crate::detector::WallLostEvent {
            symbol: "SBER".to_string(),
            side: Side::Bid,
            price: dec!(99.99),
            last_quantity: 300,
            age_seconds: 12.5,
            previous_state: WallState::Confirmed,
            at: Utc::now(),
        });
        assert!(format_event(&lost).contains("was=confirmed"));
    }
}
