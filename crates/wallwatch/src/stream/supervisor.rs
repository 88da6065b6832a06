//! Stream supervisor: owns the subscription, the per-symbol detector
//! states, and the reconnect policy.
//!
//! One task runs the whole pipeline. Frames are dispatched synchronously
//! into the detector with `now` stamped at receipt from the monotonic
//! clock, so per-symbol calls are serialized and monotonic. Detector state
//! is kept across reconnects: a wall observed before a brief disconnect
//! keeps its dwell.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, error, info, warn};

use wall_common::{InstrumentInfo, Trade};

use crate::book::BookSnapshot;
use crate::config::{DetectorConfig, StreamSettings, WatchConfig};
use crate::detector::{SymbolState, WallEvent};

use super::{FeedError, Frame, FrameStream, InstrumentResolver, MarketFeed, ResolveError};

/// Coarse connection state, published for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Backoff,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::Connecting => write!(f, "connecting"),
            StreamState::Connected => write!(f, "connected"),
            StreamState::Backoff => write!(f, "backoff"),
        }
    }
}

/// Read-only copy of the supervisor's summary fields.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub stream_state: StreamState,
    pub symbols: Vec<String>,
    pub rx_depth_frames: u64,
    pub rx_trade_frames: u64,
    pub events_emitted: u64,
    pub last_error: Option<String>,
}

/// Subscription mutation, applied at the next safe point by reopening the
/// subscription with the new set.
#[derive(Debug, Clone)]
pub enum SymbolCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Terminal supervisor failures. Everything else is retried internally.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("instrument resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("unrecoverable transport failure: {0}")]
    Transport(String),
}

impl SupervisorError {
    fn from_feed(error: FeedError) -> Self {
        match error {
            FeedError::AuthRejected(message) => SupervisorError::AuthRejected(message),
            other => SupervisorError::Transport(other.to_string()),
        }
    }
}

/// Control handle held by the binary and by sinks that mutate the watch
/// list.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<SymbolCommand>,
    status: watch::Receiver<StatusSnapshot>,
    shutdown: broadcast::Sender<()>,
}

impl SupervisorHandle {
    pub async fn subscribe(&self, symbol: impl Into<String>) -> bool {
        self.commands
            .send(SymbolCommand::Subscribe(symbol.into()))
            .await
            .is_ok()
    }

    pub async fn unsubscribe(&self, symbol: impl Into<String>) -> bool {
        self.commands
            .send(SymbolCommand::Unsubscribe(symbol.into()))
            .await
            .is_ok()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// New receiver on the shutdown channel, for sink workers and other
    /// tasks that stop with the supervisor.
    pub fn shutdown_subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

enum SessionEnd {
    Finished,
    Failed(FeedError),
    Idle,
    Restart,
    Shutdown,
}

enum SessionInput {
    Frame(Frame),
    Finished,
    Failed(FeedError),
    Idle,
    Command(SymbolCommand),
    Shutdown,
}

/// The ingestion loop.
pub struct Supervisor {
    resolver: Arc<dyn InstrumentResolver>,
    feed: Arc<dyn MarketFeed>,
    detector_config: DetectorConfig,
    settings: StreamSettings,
    depth: usize,
    max_symbols: usize,
    symbols: Vec<String>,
    states: HashMap<String, SymbolState>,
    instrument_index: HashMap<String, String>,
    events_tx: broadcast::Sender<WallEvent>,
    status_tx: watch::Sender<StatusSnapshot>,
    commands_rx: mpsc::Receiver<SymbolCommand>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Supervisor {
    pub fn new(
        resolver: Arc<dyn InstrumentResolver>,
        feed: Arc<dyn MarketFeed>,
        config: &WatchConfig,
    ) -> (Self, SupervisorHandle) {
        let mut symbols = config.normalized_symbols();
        if symbols.len() > config.max_symbols {
            warn!(
                requested = symbols.len(),
                max = config.max_symbols,
                "too many symbols, truncating"
            );
            symbols.truncate(config.max_symbols);
        }

        let (events_tx, _) = broadcast::channel(config.sink.queue_capacity);
        let (status_tx, status_rx) = watch::channel(StatusSnapshot {
            symbols: symbols.clone(),
            ..StatusSnapshot::default()
        });
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);

        let supervisor = Self {
            resolver,
            feed,
            detector_config: config.detector.clone(),
            settings: config.stream.clone(),
            depth: config.detector.depth,
            max_symbols: config.max_symbols,
            symbols,
            states: HashMap::new(),
            instrument_index: HashMap::new(),
            events_tx,
            status_tx,
            commands_rx,
            shutdown_rx,
        };
        let handle = SupervisorHandle {
            commands: commands_tx,
            status: status_rx,
            shutdown: shutdown_tx,
        };
        (supervisor, handle)
    }

    /// New receiver on the event broadcast. Subscribe before calling `run`;
    /// a receiver that falls `queue_capacity` behind loses oldest events.
    pub fn events(&self) -> broadcast::Receiver<WallEvent> {
        self.events_tx.subscribe()
    }

    /// Run until the source is exhausted, shutdown is requested, or a fatal
    /// error occurs. Transient failures reconnect with exponential backoff;
    /// detector states survive every reconnect.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let mut backoff = self.settings.retry_backoff_initial();
        let mut failures: u32 = 0;
        let mut startup = true;

        loop {
            self.drain_commands();

            if self.symbols.is_empty() {
                self.set_state(StreamState::Idle, Some("no symbols".to_string()));
                match self.idle_wait().await {
                    IdleOutcome::Shutdown => return Ok(()),
                    IdleOutcome::Continue => continue,
                    IdleOutcome::Command(_) => continue,
                }
            }

            self.set_state(StreamState::Connecting, None);
            let infos = match self.resolve_all().await {
                Ok(infos) => infos,
                Err(e) if startup => return Err(SupervisorError::Resolve(e)),
                Err(e) => {
                    self.log_failure(failures, &format!("re-resolution failed: {e}"));
                    if self.backoff_sleep(&mut backoff, &mut failures, &e.to_string()).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            startup = false;
            self.sync_states(&infos);

            let mut stream = match self.feed.open(&infos, self.depth).await {
                Ok(stream) => stream,
                Err(e) if e.is_retryable() => {
                    self.log_failure(failures, &format!("subscribe failed: {e}"));
                    if self.backoff_sleep(&mut backoff, &mut failures, &e.to_string()).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(SupervisorError::from_feed(e)),
            };

            let end = self
                .run_session(stream.as_mut(), &mut backoff, &mut failures)
                .await;
            stream.close().await;

            match end {
                SessionEnd::Shutdown => {
                    info!("shutdown requested, closing subscription");
                    return Ok(());
                }
                SessionEnd::Finished => {
                    info!("stream source exhausted");
                    return Ok(());
                }
                SessionEnd::Restart => {
                    debug!("subscription set changed, reopening");
                }
                SessionEnd::Idle => {
                    self.log_failure(
                        failures,
                        "no frames within the idle window, forcing reconnect",
                    );
                    if self
                        .backoff_sleep(&mut backoff, &mut failures, "idle guard")
                        .await
                    {
                        return Ok(());
                    }
                }
                SessionEnd::Failed(e) if e.is_retryable() => {
                    self.log_failure(failures, &format!("stream failed: {e}"));
                    if self.backoff_sleep(&mut backoff, &mut failures, &e.to_string()).await {
                        return Ok(());
                    }
                }
                SessionEnd::Failed(e) => return Err(SupervisorError::from_feed(e)),
            }
        }
    }

    async fn run_session(
        &mut self,
        stream: &mut dyn FrameStream,
        backoff: &mut Duration,
        failures: &mut u32,
    ) -> SessionEnd {
        let idle = self.settings.idle_timeout();
        let mut idle_deadline = TokioInstant::now() + idle;
        let mut connected = false;

        loop {
            let input = tokio::select! {
                res = stream.next_frame() => match res {
                    Ok(Some(frame)) => SessionInput::Frame(frame),
                    Ok(None) => SessionInput::Finished,
                    Err(e) => SessionInput::Failed(e),
                },
                _ = tokio::time::sleep_until(idle_deadline) => SessionInput::Idle,
                cmd = Self::wait_command(&mut self.commands_rx) => SessionInput::Command(cmd),
                _ = Self::wait_shutdown(&mut self.shutdown_rx) => SessionInput::Shutdown,
            };

            match input {
                SessionInput::Frame(frame) => {
                    idle_deadline = TokioInstant::now() + idle;
                    if !connected {
                        connected = true;
                        *backoff = self.settings.retry_backoff_initial();
                        *failures = 0;
                        self.set_state(StreamState::Connected, None);
                        info!(symbols = self.symbols.len(), "stream connected");
                    }
                    self.dispatch(frame);
                }
                SessionInput::Finished => return SessionEnd::Finished,
                SessionInput::Failed(e) => return SessionEnd::Failed(e),
                SessionInput::Idle => return SessionEnd::Idle,
                SessionInput::Command(cmd) => {
                    self.apply_command(cmd);
                    return SessionEnd::Restart;
                }
                SessionInput::Shutdown => return SessionEnd::Shutdown,
            }
        }
    }

    /// Convert a frame, locate the owning symbol state, advance the
    /// detector, and broadcast whatever it emitted.
    fn dispatch(&mut self, frame: Frame) {
        let now = Instant::now();
        let Some(symbol) = self.instrument_index.get(frame.instrument_id()).cloned() else {
            debug!(
                instrument_id = frame.instrument_id(),
                "frame for unsubscribed instrument, ignoring"
            );
            return;
        };
        let Some(state) = self.states.get_mut(&symbol) else {
            return;
        };

        match frame {
            Frame::Depth(depth) => {
                let book = BookSnapshot::new(
                    state.symbol(),
                    state.instrument_id(),
                    state.tick_size(),
                    state.price_scale(),
                    depth.bids,
                    depth.asks,
                    self.depth,
                    now,
                    depth.at,
                );
                match state.on_book(&book, now) {
                    Ok(events) => {
                        let count = events.len() as u64;
                        for event in events {
                            debug!(%event, "wall event");
                            let _ = self.events_tx.send(event);
                        }
                        self.status_tx.send_modify(|s| {
                            s.rx_depth_frames += 1;
                            s.events_emitted += count;
                        });
                    }
                    Err(e) => {
                        error!(symbol = %symbol, error = %e, "invalid depth frame dropped");
                        self.status_tx.send_modify(|s| {
                            s.rx_depth_frames += 1;
                            s.last_error = Some(e.to_string());
                        });
                    }
                }
            }
            Frame::Trade(trade) => {
                state.on_trade(
                    &Trade {
                        instrument_id: trade.instrument_id,
                        price: trade.price,
                        quantity: trade.quantity,
                        side: trade.side,
                        at: trade.at,
                    },
                    now,
                );
                self.status_tx.send_modify(|s| s.rx_trade_frames += 1);
            }
        }
    }

    async fn resolve_all(&self) -> Result<Vec<InstrumentInfo>, ResolveError> {
        // All-or-nothing: one unresolvable symbol fails the whole set.
        let mut infos = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            infos.push(self.resolver.resolve(symbol).await?);
        }
        Ok(infos)
    }

    /// Reconcile per-symbol states with a fresh resolution. Existing states
    /// are updated in place so candidates and cooldowns survive; only
    /// states for dropped symbols are discarded.
    fn sync_states(&mut self, infos: &[InstrumentInfo]) {
        self.instrument_index.clear();
        for info in infos {
            self.instrument_index
                .insert(info.instrument_id.clone(), info.symbol.clone());
            match self.states.get_mut(&info.symbol) {
                Some(state) => state.update_instrument(info),
                None => {
                    self.states.insert(
                        info.symbol.clone(),
                        SymbolState::new(info, self.detector_config.clone()),
                    );
                }
            }
        }
        let watched: HashSet<&String> = self.symbols.iter().collect();
        self.states.retain(|symbol, _| watched.contains(symbol));
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands_rx.try_recv() {
            self.apply_command(cmd);
        }
    }

    fn apply_command(&mut self, cmd: SymbolCommand) {
        match cmd {
            SymbolCommand::Subscribe(symbol) => {
                let symbol = symbol.trim().to_uppercase();
                if symbol.is_empty() || self.symbols.contains(&symbol) {
                    return;
                }
                if self.symbols.len() >= self.max_symbols {
                    warn!(%symbol, max = self.max_symbols, "symbol cap reached, ignoring subscribe");
                    return;
                }
                info!(%symbol, "subscribing");
                self.symbols.push(symbol);
            }
            SymbolCommand::Unsubscribe(symbol) => {
                let symbol = symbol.trim().to_uppercase();
                if let Some(pos) = self.symbols.iter().position(|s| s == &symbol) {
                    info!(%symbol, "unsubscribing");
                    self.symbols.remove(pos);
                    self.states.remove(&symbol);
                }
            }
        }
        let symbols = self.symbols.clone();
        self.status_tx.send_modify(|s| s.symbols = symbols);
    }

    async fn idle_wait(&mut self) -> IdleOutcome {
        let outcome = tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => IdleOutcome::Continue,
            cmd = Self::wait_command(&mut self.commands_rx) => {
                IdleOutcome::Command(cmd)
            }
            _ = Self::wait_shutdown(&mut self.shutdown_rx) => IdleOutcome::Shutdown,
        };
        match outcome {
            IdleOutcome::Command(cmd) => {
                self.apply_command(cmd);
                IdleOutcome::Continue
            }
            other => other,
        }
    }

    /// Sleep for the current backoff, doubling it up to the cap. Returns
    /// true when shutdown arrived during the sleep.
    async fn backoff_sleep(
        &mut self,
        backoff: &mut Duration,
        failures: &mut u32,
        reason: &str,
    ) -> bool {
        *failures += 1;
        self.set_state(StreamState::Backoff, Some(reason.to_string()));
        let delay = *backoff;
        *backoff = (*backoff * 2).min(self.settings.retry_backoff_max());
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = Self::wait_shutdown(&mut self.shutdown_rx) => true,
        }
    }

    /// First failure after a healthy stream logs at WARN; consecutive
    /// retries drop to INFO.
    fn log_failure(&self, failures: u32, message: &str) {
        if failures == 0 {
            warn!("{message}");
        } else {
            info!(attempt = failures + 1, "{message}");
        }
    }

    fn set_state(&self, state: StreamState, error: Option<String>) {
        let symbols = self.symbols.clone();
        self.status_tx.send_modify(|s| {
            s.stream_state = state;
            s.symbols = symbols;
            if let Some(e) = error {
                s.last_error = Some(e);
            }
        });
    }

    async fn wait_command(rx: &mut mpsc::Receiver<SymbolCommand>) -> SymbolCommand {
        loop {
            match rx.recv().await {
                Some(cmd) => return cmd,
                // All senders dropped: nobody will ever command us again.
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn wait_shutdown(rx: &mut broadcast::Receiver<()>) {
        loop {
            match rx.recv().await {
                Ok(()) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}

enum IdleOutcome {
    Continue,
    Command(SymbolCommand),
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::stream::script::ScriptedFeed;
    use crate::stream::StaticResolver;

    fn harness(max_symbols: usize, symbols: &[&str]) -> (Supervisor, SupervisorHandle) {
        let config = WatchConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            max_symbols,
            ..WatchConfig::default()
        };
        let resolver = Arc::new(StaticResolver::new(Vec::new()));
        let feed = Arc::new(ScriptedFeed::new(Vec::new()));
        Supervisor::new(resolver, feed, &config)
    }

    #[test]
    fn test_initial_symbols_truncated_to_cap() {
        let (supervisor, _handle) = harness(2, &["aaa", "bbb", "ccc"]);
        assert_eq!(supervisor.symbols, vec!["AAA", "BBB"]);
    }

    #[test]
    fn test_subscribe_respects_cap_and_dedupes() {
        let (mut supervisor, _handle) = harness(2, &["aaa"]);
        supervisor.apply_command(SymbolCommand::Subscribe("aaa".to_string()));
        supervisor.apply_command(SymbolCommand::Subscribe("bbb".to_string()));
        supervisor.apply_command(SymbolCommand::Subscribe("ccc".to_string()));
        assert_eq!(supervisor.symbols, vec!["AAA", "BBB"]);
    }

    #[test]
    fn test_unsubscribe_updates_status() {
        let (mut supervisor, handle) = harness(5, &["aaa", "bbb"]);
        supervisor.apply_command(SymbolCommand::Unsubscribe("aaa".to_string()));
        assert_eq!(supervisor.symbols, vec!["BBB"]);
        assert_eq!(handle.status().symbols, vec!["BBB"]);
    }

    #[test]
    fn test_supervisor_error_mapping() {
        let auth = SupervisorError::from_feed(FeedError::AuthRejected("denied".to_string()));
        assert!(matches!(auth, SupervisorError::AuthRejected(_)));
        let fatal = SupervisorError::from_feed(FeedError::Fatal("broken".to_string()));
        assert!(matches!(fatal, SupervisorError::Transport(_)));
    }
}
