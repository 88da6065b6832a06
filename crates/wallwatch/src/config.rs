//! Configuration for wallwatch.
//!
//! Loads from a TOML file with environment-variable overrides for the
//! runtime knobs. Detector thresholds accept the older parameter names as
//! aliases so existing config files keep working.

use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use wall_common::InstrumentInfo;

use crate::detector::EventKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Symbols to watch at startup.
    pub symbols: Vec<String>,

    /// Hard cap on concurrent subscriptions.
    pub max_symbols: usize,

    /// Logging level: trace, debug, info, warn, error.
    pub log_level: String,

    /// Detector thresholds.
    pub detector: DetectorConfig,

    /// Stream supervisor settings.
    pub stream: StreamSettings,

    /// Sink fan-out settings.
    pub sink: SinkSettings,

    /// Static instrument table used by the replay transport and tests.
    pub instruments: Vec<InstrumentEntry>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            max_symbols: 10,
            log_level: "info".to_string(),
            detector: DetectorConfig::default(),
            stream: StreamSettings::default(),
            sink: SinkSettings::default(),
            instruments: Vec::new(),
        }
    }
}

impl WatchConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let mut config: WatchConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: display,
                source,
            })?;
        config.detector.apply_legacy_aliases();
        Ok(config)
    }

    /// Apply environment overrides for the runtime knobs.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(level) = std::env::var("WALLWATCH_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(value) = parse_f64_env("WALLWATCH_RETRY_BACKOFF_INITIAL_SECONDS")? {
            self.stream.retry_backoff_initial_seconds = value;
        }
        if let Some(value) = parse_f64_env("WALLWATCH_RETRY_BACKOFF_MAX_SECONDS")? {
            self.stream.retry_backoff_max_seconds = value;
        }
        if let Some(value) = parse_f64_env("WALLWATCH_STREAM_IDLE_SLEEP_SECONDS")? {
            self.stream.stream_idle_sleep_seconds = value;
        }
        Ok(())
    }

    /// Symbols uppercased with duplicates removed, original order kept.
    pub fn normalized_symbols(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for symbol in &self.symbols {
            let upper = symbol.trim().to_uppercase();
            if !upper.is_empty() && !seen.contains(&upper) {
                seen.push(upper);
            }
        }
        seen
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_symbols == 0 {
            return Err(ConfigError::Invalid("max_symbols must be at least 1".into()));
        }
        self.detector.validate()?;
        self.stream.validate()?;
        if self.sink.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "sink.queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Detector thresholds. Field names follow the current parameter surface;
/// the original names are accepted as aliases.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Top-N depth requested upstream.
    pub depth: usize,

    /// Levels used for the reference median.
    pub top_n_levels: usize,

    /// Quantity threshold as a multiple of the side's median.
    #[serde(alias = "k_ratio")]
    pub candidate_ratio_to_median: Decimal,

    /// Maximum distance from best for a candidate, in ticks.
    #[serde(alias = "distance_ticks")]
    pub candidate_max_distance_ticks: u64,

    /// Absolute quantity floor, in lots.
    pub abs_qty_threshold: u64,

    /// Dwell before a candidate may confirm.
    #[serde(alias = "dwell_seconds")]
    pub confirm_dwell_seconds: f64,

    /// Maximum distance from best to allow confirmation.
    pub confirm_max_distance_ticks: u64,

    /// Tolerated fractional shrink of the ratio floor at confirmation.
    pub confirm_shrink_tolerance: Decimal,

    /// Window for the consuming drop measurement.
    #[serde(alias = "consuming_window_seconds")]
    pub consume_window_seconds: f64,

    /// Fractional drop that flags a confirmed wall as consuming.
    #[serde(alias = "consuming_drop_pct")]
    pub consume_drop_pct: Decimal,

    /// Minimum executed volume at the wall price, in lots.
    pub min_exec_confirm: u64,

    /// Discard a side's candidates on discontinuous top-of-book jumps.
    pub teleport_reset: bool,

    /// Retention of the rolling trade window.
    pub trades_window_seconds: f64,

    /// Per-kind emission cooldowns.
    pub cooldown_seconds: CooldownSeconds,

    // Older flat cooldown keys, folded into `cooldown_seconds`.
    cooldown_confirmed_seconds: Option<f64>,
    cooldown_consuming_seconds: Option<f64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            depth: 20,
            top_n_levels: 5,
            candidate_ratio_to_median: Decimal::new(10, 0),
            candidate_max_distance_ticks: 10,
            abs_qty_threshold: 0,
            confirm_dwell_seconds: 30.0,
            confirm_max_distance_ticks: 1,
            confirm_shrink_tolerance: Decimal::new(10, 2),
            consume_window_seconds: 8.0,
            consume_drop_pct: Decimal::new(20, 2),
            min_exec_confirm: 50,
            teleport_reset: true,
            trades_window_seconds: 20.0,
            cooldown_seconds: CooldownSeconds::default(),
            cooldown_confirmed_seconds: None,
            cooldown_consuming_seconds: None,
        }
    }
}

impl DetectorConfig {
    pub fn confirm_dwell(&self) -> Duration {
        Duration::from_secs_f64(self.confirm_dwell_seconds)
    }

    pub fn consume_window(&self) -> Duration {
        Duration::from_secs_f64(self.consume_window_seconds)
    }

    pub fn trades_window(&self) -> Duration {
        Duration::from_secs_f64(self.trades_window_seconds)
    }

    fn apply_legacy_aliases(&mut self) {
        if let Some(value) = self.cooldown_confirmed_seconds.take() {
            self.cooldown_seconds.wall_confirmed = value;
        }
        if let Some(value) = self.cooldown_consuming_seconds.take() {
            self.cooldown_seconds.wall_consuming = value;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.depth == 0 {
            return Err(ConfigError::Invalid("detector.depth must be at least 1".into()));
        }
        if self.top_n_levels == 0 {
            return Err(ConfigError::Invalid(
                "detector.top_n_levels must be at least 1".into(),
            ));
        }
        if self.candidate_ratio_to_median <= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "detector.candidate_ratio_to_median must be positive".into(),
            ));
        }
        if self.consume_drop_pct <= Decimal::ZERO || self.consume_drop_pct > Decimal::ONE {
            return Err(ConfigError::Invalid(
                "detector.consume_drop_pct must be in (0, 1]".into(),
            ));
        }
        if self.confirm_shrink_tolerance < Decimal::ZERO
            || self.confirm_shrink_tolerance >= Decimal::ONE
        {
            return Err(ConfigError::Invalid(
                "detector.confirm_shrink_tolerance must be in [0, 1)".into(),
            ));
        }
        for (name, value) in [
            ("confirm_dwell_seconds", self.confirm_dwell_seconds),
            ("consume_window_seconds", self.consume_window_seconds),
            ("trades_window_seconds", self.trades_window_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "detector.{name} must be a non-negative number"
                )));
            }
        }
        // The trade window is the retention the consuming check queries
        // against; a shorter retention would trim executions before they
        // can be counted.
        if self.trades_window_seconds < self.consume_window_seconds {
            return Err(ConfigError::Invalid(
                "detector.trades_window_seconds must be at least consume_window_seconds".into(),
            ));
        }
        self.cooldown_seconds.validate()
    }
}

/// Per-kind emission cooldowns, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CooldownSeconds {
    pub wall_candidate: f64,
    pub wall_lost: f64,
    pub wall_confirmed: f64,
    pub wall_consuming: f64,
}

impl Default for CooldownSeconds {
    fn default() -> Self {
        Self {
            wall_candidate: 60.0,
            wall_lost: 0.0,
            wall_confirmed: 120.0,
            wall_consuming: 45.0,
        }
    }
}

impl CooldownSeconds {
    pub fn duration_for(&self, kind: EventKind) -> Duration {
        let seconds = match kind {
            EventKind::WallCandidate => self.wall_candidate,
            EventKind::WallLost => self.wall_lost,
            EventKind::WallConfirmed => self.wall_confirmed,
            EventKind::WallConsuming => self.wall_consuming,
        };
        Duration::from_secs_f64(seconds)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("wall_candidate", self.wall_candidate),
            ("wall_lost", self.wall_lost),
            ("wall_confirmed", self.wall_confirmed),
            ("wall_consuming", self.wall_consuming),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "detector.cooldown_seconds.{name} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

/// Supervisor reconnect and liveness settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub retry_backoff_initial_seconds: f64,
    pub retry_backoff_max_seconds: f64,
    /// Force a reconnect after this long without any frame.
    pub stream_idle_sleep_seconds: f64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            retry_backoff_initial_seconds: 1.0,
            retry_backoff_max_seconds: 30.0,
            stream_idle_sleep_seconds: 3600.0,
        }
    }
}

impl StreamSettings {
    pub fn retry_backoff_initial(&self) -> Duration {
        Duration::from_secs_f64(self.retry_backoff_initial_seconds)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_secs_f64(self.retry_backoff_max_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stream_idle_sleep_seconds)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("retry_backoff_initial_seconds", self.retry_backoff_initial_seconds),
            ("retry_backoff_max_seconds", self.retry_backoff_max_seconds),
            ("stream_idle_sleep_seconds", self.stream_idle_sleep_seconds),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "stream.{name} must be a positive number"
                )));
            }
        }
        if self.retry_backoff_initial_seconds > self.retry_backoff_max_seconds {
            return Err(ConfigError::Invalid(
                "stream.retry_backoff_initial_seconds exceeds retry_backoff_max_seconds".into(),
            ));
        }
        Ok(())
    }
}

/// Sink fan-out settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    /// Bounded event-queue capacity per sink; the oldest events are dropped
    /// when a sink falls this far behind.
    pub queue_capacity: usize,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

/// One row of the static instrument table.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentEntry {
    pub symbol: String,
    pub instrument_id: String,
    pub tick_size: Decimal,
    pub price_scale: u32,
}

impl InstrumentEntry {
    pub fn to_info(&self) -> InstrumentInfo {
        InstrumentInfo {
            instrument_id: self.instrument_id.clone(),
            symbol: self.symbol.to_uppercase(),
            tick_size: self.tick_size,
            price_scale: self.price_scale,
        }
    }
}

fn parse_f64_env(name: &str) -> Result<Option<f64>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<f64>()
                .map(Some)
                .map_err(|_| ConfigError::Invalid(format!("{name} must be a number, got {raw:?}")))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_match_documented_table() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.max_symbols, 10);
        assert_eq!(cfg.detector.depth, 20);
        assert_eq!(cfg.detector.top_n_levels, 5);
        assert_eq!(cfg.detector.candidate_ratio_to_median, dec!(10));
        assert_eq!(cfg.detector.candidate_max_distance_ticks, 10);
        assert_eq!(cfg.detector.abs_qty_threshold, 0);
        assert_eq!(cfg.detector.confirm_dwell_seconds, 30.0);
        assert_eq!(cfg.detector.confirm_max_distance_ticks, 1);
        assert_eq!(cfg.detector.confirm_shrink_tolerance, dec!(0.10));
        assert_eq!(cfg.detector.consume_window_seconds, 8.0);
        assert_eq!(cfg.detector.consume_drop_pct, dec!(0.20));
        assert_eq!(cfg.detector.min_exec_confirm, 50);
        assert!(cfg.detector.teleport_reset);
        assert_eq!(cfg.detector.cooldown_seconds.wall_candidate, 60.0);
        assert_eq!(cfg.detector.cooldown_seconds.wall_lost, 0.0);
        assert_eq!(cfg.detector.cooldown_seconds.wall_confirmed, 120.0);
        assert_eq!(cfg.detector.cooldown_seconds.wall_consuming, 45.0);
        assert_eq!(cfg.stream.retry_backoff_initial_seconds, 1.0);
        assert_eq!(cfg.stream.retry_backoff_max_seconds, 30.0);
        assert_eq!(cfg.stream.stream_idle_sleep_seconds, 3600.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_current_keys() {
        let cfg: WatchConfig = toml::from_str(
            r#"
            symbols = ["sber", "gazp"]

            [detector]
            candidate_ratio_to_median = 8.0
            confirm_dwell_seconds = 12.5

            [detector.cooldown_seconds]
            wall_candidate = 30.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.normalized_symbols(), vec!["SBER", "GAZP"]);
        assert_eq!(cfg.detector.candidate_ratio_to_median, dec!(8.0));
        assert_eq!(cfg.detector.confirm_dwell_seconds, 12.5);
        assert_eq!(cfg.detector.cooldown_seconds.wall_candidate, 30.0);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.detector.cooldown_seconds.wall_confirmed, 120.0);
    }

    #[test]
    fn test_legacy_aliases_accepted() {
        let mut cfg: WatchConfig = toml::from_str(
            r#"
            [detector]
            k_ratio = 7.0
            dwell_seconds = 15.0
            distance_ticks = 4
            consuming_drop_pct = 0.35
            consuming_window_seconds = 6.0
            cooldown_confirmed_seconds = 90.0
            cooldown_consuming_seconds = 20.0
            "#,
        )
        .unwrap();
        cfg.detector.apply_legacy_aliases();
        assert_eq!(cfg.detector.candidate_ratio_to_median, dec!(7.0));
        assert_eq!(cfg.detector.confirm_dwell_seconds, 15.0);
        assert_eq!(cfg.detector.candidate_max_distance_ticks, 4);
        assert_eq!(cfg.detector.consume_drop_pct, dec!(0.35));
        assert_eq!(cfg.detector.consume_window_seconds, 6.0);
        assert_eq!(cfg.detector.cooldown_seconds.wall_confirmed, 90.0);
        assert_eq!(cfg.detector.cooldown_seconds.wall_consuming, 20.0);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        // Parameters from the oldest surface with no modern counterpart.
        let cfg: Result<WatchConfig, _> = toml::from_str(
            r#"
            [detector]
            Emin = 200.0
            Amin = 0.2
            cancel_share_max = 0.7
            reposition_ticks = 1
            vref_levels = 10
            "#,
        );
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_normalized_symbols_dedupes() {
        let cfg = WatchConfig {
            symbols: vec![
                "sber".to_string(),
                "SBER".to_string(),
                " gazp ".to_string(),
                "".to_string(),
            ],
            ..WatchConfig::default()
        };
        assert_eq!(cfg.normalized_symbols(), vec!["SBER", "GAZP"]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = WatchConfig::default();
        cfg.detector.consume_drop_pct = dec!(0);
        assert!(cfg.validate().is_err());

        let mut cfg = WatchConfig::default();
        cfg.stream.retry_backoff_initial_seconds = 60.0;
        assert!(cfg.validate().is_err());

        let mut cfg = WatchConfig::default();
        cfg.max_symbols = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = WatchConfig::default();
        cfg.detector.confirm_shrink_tolerance = dec!(1);
        assert!(cfg.validate().is_err());

        // Consume window longer than the trade-window retention would trim
        // executions before the consuming check sees them.
        let mut cfg = WatchConfig::default();
        cfg.detector.consume_window_seconds = 30.0;
        assert!(cfg.validate().is_err());
        cfg.detector.trades_window_seconds = 30.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = WatchConfig::default();
        // SAFETY: test-only, no concurrent env access to these names.
        unsafe {
            std::env::set_var("WALLWATCH_RETRY_BACKOFF_INITIAL_SECONDS", "2.5");
            std::env::set_var("WALLWATCH_LOG_LEVEL", "debug");
        }
        cfg.apply_env_overrides().unwrap();
        unsafe {
            std::env::remove_var("WALLWATCH_RETRY_BACKOFF_INITIAL_SECONDS");
            std::env::remove_var("WALLWATCH_LOG_LEVEL");
        }
        assert_eq!(cfg.stream.retry_backoff_initial_seconds, 2.5);
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn test_instrument_entry_to_info() {
        let entry = InstrumentEntry {
            symbol: "sber".to_string(),
            instrument_id: "uid-1".to_string(),
            tick_size: dec!(0.01),
            price_scale: 2,
        };
        let info = entry.to_info();
        assert_eq!(info.symbol, "SBER");
        assert_eq!(info.tick_size, dec!(0.01));
    }
}
