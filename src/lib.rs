//! tollgate: a metering reverse proxy for AI-model providers.
//!
//! Requests are forwarded to an upstream chosen per request, the response
//! body is captured and decoded, token usage is extracted and priced, and
//! one append-only usage record is written per completed exchange. Two read
//! endpoints report daily and per-service rollups over the record set.

pub mod aggregate;
pub mod config;
pub mod costing;
pub mod decode;
mod error;
pub mod http;
pub mod pricing;
pub mod proxy;
pub mod routing;
pub mod store;
mod store_types;
pub mod usage;

pub use config::ServerConfig;
pub use error::{Result, TollgateError};
pub use http::{AppState, router};
pub use store_types::{PricingRateRow, UsageRecord};

/// Time source injected into components that age state, so tests can
/// control the clock.
pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

/// Wall-clock milliseconds since the unix epoch; stamps usage records at
/// write time.
pub fn now_epoch_millis() -> u64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_secs(0));
    now.as_millis() as u64
}
