//! Concrete data services.

pub mod price;

pub use price::{MARKET_DATA, PriceFeed, PriceSnapshot};
