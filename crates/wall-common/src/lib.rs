//! Shared types for the wallwatch order-book monitor.
//!
//! All prices use `rust_decimal::Decimal`; quantities are integer lots.
//! Never use f64 for price math.

pub mod types;

pub use types::{scaled_price, InstrumentInfo, PriceLevel, Side, Trade, TradeSide};
