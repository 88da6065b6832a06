//! Per-symbol wall state machine.
//!
//! For every resting level the machine runs:
//!
//! ```text
//! ABSENT -> CANDIDATE -> CONFIRMED -> CONSUMING
//!    ^          |            |            |
//!    +----------+------------+------------+   (level disappears or teleport)
//! ```
//!
//! A lost transition emits `wall_lost` only when the wall had reached
//! CONFIRMED; an unconfirmed candidate drops silently. All transitions are
//! evaluated against an injected monotonic `now`, which makes the machine a
//! pure function of its input sequence.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use rust_decimal::Decimal;
use tracing::{debug, trace};

use wall_common::{scaled_price, InstrumentInfo, Side, Trade};

use crate::book::{BookError, BookSnapshot};
use crate::config::DetectorConfig;

use super::events::{
    EventKind, WallCandidateEvent, WallConfirmedEvent, WallConsumingEvent, WallEvent,
    WallLostEvent, WallState,
};
use super::trades::TradeWindow;

/// A tracked resting level, keyed by `(side, scaled price)`.
#[derive(Debug, Clone)]
pub struct WallCandidate {
    pub side: Side,
    pub price: Decimal,
    pub price_key: i64,
    pub quantity_initial: u64,
    pub quantity_current: u64,
    pub first_seen_at: Instant,
    pub last_seen_at: Instant,
    pub state: WallState,
    pub state_entered_at: Instant,
    pub distance_ticks_at_first_seen: u64,
    /// Observed sizes within the consume window; basis for the drop ratio.
    size_history: VecDeque<(Instant, u64)>,
    /// Whether the confirmation actually reached the event stream. A
    /// consuming alert is only emitted after its confirmed alert went out.
    confirmed_announced: bool,
}

/// Detector state for one subscribed symbol.
///
/// Owned exclusively by the supervisor task; survives reconnects.
#[derive(Debug)]
pub struct SymbolState {
    symbol: String,
    instrument_id: String,
    tick_size: Decimal,
    price_scale: u32,
    config: DetectorConfig,
    latest_book: Option<BookSnapshot>,
    trades: TradeWindow,
    candidates: BTreeMap<(Side, i64), WallCandidate>,
    last_event_at: HashMap<(EventKind, Side, i64), Instant>,
    prev_best: [Option<Decimal>; 2],
}

impl SymbolState {
    pub fn new(info: &InstrumentInfo, config: DetectorConfig) -> Self {
        let trades = TradeWindow::new(config.trades_window());
        Self {
            symbol: info.symbol.clone(),
            instrument_id: info.instrument_id.clone(),
            tick_size: info.tick_size,
            price_scale: info.price_scale,
            config,
            latest_book: None,
            trades,
            candidates: BTreeMap::new(),
            last_event_at: HashMap::new(),
            prev_best: [None, None],
        }
    }

    /// Refresh instrument metadata after a re-resolve. Tick size and scale
    /// can change across sessions; candidates and cooldowns are kept.
    pub fn update_instrument(&mut self, info: &InstrumentInfo) {
        self.instrument_id = info.instrument_id.clone();
        self.tick_size = info.tick_size;
        self.price_scale = info.price_scale;
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    pub fn tick_size(&self) -> Decimal {
        self.tick_size
    }

    pub fn price_scale(&self) -> u32 {
        self.price_scale
    }

    pub fn latest_book(&self) -> Option<&BookSnapshot> {
        self.latest_book.as_ref()
    }

    pub fn tracked_walls(&self) -> impl Iterator<Item = &WallCandidate> {
        self.candidates.values()
    }

    pub fn tracked_wall_count(&self) -> usize {
        self.candidates.len()
    }

    /// Feed a trade print into the rolling execution window.
    pub fn on_trade(&mut self, trade: &Trade, now: Instant) {
        match scaled_price(trade.price, self.price_scale) {
            Some(key) => self.trades.record(key, trade.quantity, now),
            None => trace!(
                symbol = %self.symbol,
                price = %trade.price,
                "trade price off the instrument scale, ignored"
            ),
        }
    }

    /// Advance the state machine with a fresh book snapshot.
    ///
    /// Returns the lifecycle events this snapshot produced, in emission
    /// order: lost, candidate, confirmed, consuming. An invalid snapshot is
    /// rejected wholesale and changes no state.
    pub fn on_book(&mut self, book: &BookSnapshot, now: Instant) -> Result<Vec<WallEvent>, BookError> {
        book.validate()?;
        let at = book.at;
        let mut events = Vec::new();

        self.apply_teleport_reset(book);

        // Refresh tracked walls against the snapshot; collect vanished ones.
        let consume_window = self.config.consume_window();
        let mut lost: Vec<WallCandidate> = Vec::new();
        self.candidates.retain(|&(side, _), wall| {
            let quantity = book.level_quantity(side, wall.price);
            if quantity == 0 {
                lost.push(wall.clone());
                return false;
            }
            wall.quantity_current = quantity;
            wall.last_seen_at = now;
            wall.size_history.push_back((now, quantity));
            while let Some(&(ts, _)) = wall.size_history.front() {
                if now.saturating_duration_since(ts) > consume_window {
                    wall.size_history.pop_front();
                } else {
                    break;
                }
            }
            true
        });
        for wall in lost {
            if matches!(wall.state, WallState::Confirmed | WallState::Consuming) {
                let event = WallEvent::WallLost(WallLostEvent {
                    symbol: self.symbol.clone(),
                    side: wall.side,
                    price: wall.price,
                    last_quantity: wall.quantity_current,
                    age_seconds: now.saturating_duration_since(wall.first_seen_at).as_secs_f64(),
                    previous_state: wall.state,
                    at,
                });
                self.emit(&mut events, EventKind::WallLost, wall.side, wall.price_key, now, event);
            }
        }

        let medians = [
            book.median_quantity(Side::Bid, self.config.top_n_levels),
            book.median_quantity(Side::Ask, self.config.top_n_levels),
        ];

        // New candidates, largest quantity first.
        let mut fresh: Vec<(Side, Decimal, i64, u64, u64)> = Vec::new();
        for side in [Side::Bid, Side::Ask] {
            let median = medians[side.index()];
            for level in book.side_levels(side) {
                if level.quantity == 0 {
                    continue;
                }
                let Some(distance) = book.distance_ticks(side, level.price) else {
                    continue;
                };
                if distance > self.config.candidate_max_distance_ticks {
                    continue;
                }
                if !self.candidate_qualifies(level.quantity, median) {
                    continue;
                }
                let Some(key) = scaled_price(level.price, self.price_scale) else {
                    continue;
                };
                if self.candidates.contains_key(&(side, key)) {
                    continue;
                }
                fresh.push((side, level.price, key, level.quantity, distance));
            }
        }
        fresh.sort_by(|a, b| b.3.cmp(&a.3).then(a.0.cmp(&b.0)).then(a.2.cmp(&b.2)));
        let cap = 2 * self.config.depth;
        for (side, price, key, quantity, distance) in fresh {
            if self.candidates.len() >= cap {
                debug!(symbol = %self.symbol, cap, "candidate cap reached, skipping remainder");
                break;
            }
            let mut size_history = VecDeque::new();
            size_history.push_back((now, quantity));
            self.candidates.insert(
                (side, key),
                WallCandidate {
                    side,
                    price,
                    price_key: key,
                    quantity_initial: quantity,
                    quantity_current: quantity,
                    first_seen_at: now,
                    last_seen_at: now,
                    state: WallState::Candidate,
                    state_entered_at: now,
                    distance_ticks_at_first_seen: distance,
                    size_history,
                    confirmed_announced: false,
                },
            );
            let event = WallEvent::WallCandidate(WallCandidateEvent {
                symbol: self.symbol.clone(),
                side,
                price,
                quantity,
                distance_ticks: distance,
                at,
            });
            self.emit(&mut events, EventKind::WallCandidate, side, key, now, event);
        }

        // Confirm pass.
        let confirm_dwell = self.config.confirm_dwell();
        let mut pending: Vec<(Side, i64, WallEvent)> = Vec::new();
        for (&(side, key), wall) in self.candidates.iter_mut() {
            if wall.state != WallState::Candidate {
                continue;
            }
            let dwell = now.saturating_duration_since(wall.state_entered_at);
            if dwell < confirm_dwell {
                continue;
            }
            let Some(distance) = book.distance_ticks(side, wall.price) else {
                continue;
            };
            if distance > self.config.confirm_max_distance_ticks {
                continue;
            }
            let floor = self.config.candidate_ratio_to_median
                * medians[side.index()]
                * (Decimal::ONE - self.config.confirm_shrink_tolerance);
            if Decimal::from(wall.quantity_current) < floor {
                continue;
            }
            wall.state = WallState::Confirmed;
            wall.state_entered_at = now;
            pending.push((
                side,
                key,
                WallEvent::WallConfirmed(WallConfirmedEvent {
                    symbol: self.symbol.clone(),
                    side,
                    price: wall.price,
                    quantity: wall.quantity_current,
                    dwell_seconds: dwell.as_secs_f64(),
                    at,
                }),
            ));
        }
        for (side, key, event) in pending.drain(..) {
            if self.emit(&mut events, EventKind::WallConfirmed, side, key, now, event)
                && let Some(wall) = self.candidates.get_mut(&(side, key))
            {
                wall.confirmed_announced = true;
            }
        }

        // Consuming pass.
        for (&(side, key), wall) in self.candidates.iter_mut() {
            if wall.state != WallState::Confirmed {
                continue;
            }
            let q_ref = wall
                .size_history
                .iter()
                .filter(|&&(ts, _)| now.saturating_duration_since(ts) <= consume_window)
                .map(|&(_, q)| q)
                .max()
                .unwrap_or(0);
            if q_ref == 0 || wall.quantity_current >= q_ref {
                continue;
            }
            let drop_pct = Decimal::from(q_ref - wall.quantity_current) / Decimal::from(q_ref);
            if drop_pct < self.config.consume_drop_pct {
                continue;
            }
            let executed = self.trades.volume_at_price(key, consume_window, now);
            if executed < self.config.min_exec_confirm {
                continue;
            }
            wall.state = WallState::Consuming;
            wall.state_entered_at = now;
            if wall.confirmed_announced {
                pending.push((
                    side,
                    key,
                    WallEvent::WallConsuming(WallConsumingEvent {
                        symbol: self.symbol.clone(),
                        side,
                        price: wall.price,
                        quantity_before: q_ref,
                        quantity_now: wall.quantity_current,
                        drop_pct,
                        executed_volume: executed,
                        at,
                    }),
                ));
            }
        }
        for (side, key, event) in pending {
            self.emit(&mut events, EventKind::WallConsuming, side, key, now, event);
        }

        self.latest_book = Some(book.clone());
        Ok(events)
    }

    /// Candidate predicate of the ratio-to-median model. A zero median makes
    /// the ratio test unsatisfiable; only an absolute floor can qualify a
    /// level then.
    fn candidate_qualifies(&self, quantity: u64, median: Decimal) -> bool {
        let cfg = &self.config;
        if median.is_zero() {
            return cfg.abs_qty_threshold > 0 && quantity >= cfg.abs_qty_threshold;
        }
        Decimal::from(quantity) >= cfg.candidate_ratio_to_median * median
            && quantity >= cfg.abs_qty_threshold
    }

    /// Discard a side's candidates without alerts when its top of book jumps
    /// discontinuously (session gap or stale-data hole). Prevents spurious
    /// lost-events on snapshots that do not describe the same market regime.
    fn apply_teleport_reset(&mut self, book: &BookSnapshot) {
        let threshold =
            Decimal::from(std::cmp::max(5, 2 * self.config.candidate_max_distance_ticks));
        for side in [Side::Bid, Side::Ask] {
            let best = book.best_price(side);
            if self.config.teleport_reset
                && let (Some(prev), Some(current)) = (self.prev_best[side.index()], best)
            {
                let jump = (current - prev).abs() / book.tick_size;
                if jump > threshold {
                    debug!(
                        symbol = %self.symbol,
                        %side,
                        from = %prev,
                        to = %current,
                        "top of book teleported, discarding side candidates"
                    );
                    self.candidates.retain(|&(s, _), _| s != side);
                }
            }
            self.prev_best[side.index()] = best;
        }
    }

    /// Cooldown gate. The state transition has already happened by the time
    /// this runs; only the emission is suppressed. Returns whether the event
    /// went out.
    fn emit(
        &mut self,
        out: &mut Vec<WallEvent>,
        kind: EventKind,
        side: Side,
        price_key: i64,
        now: Instant,
        event: WallEvent,
    ) -> bool {
        let cooldown = self.config.cooldown_seconds.duration_for(kind);
        let gate = (kind, side, price_key);
        if let Some(&last) = self.last_event_at.get(&gate)
            && now.saturating_duration_since(last) < cooldown
        {
            trace!(symbol = %self.symbol, kind = %kind, price_key, "suppressed by cooldown");
            return false;
        }
        self.last_event_at.insert(gate, now);
        out.push(event);
        true
    }
}
