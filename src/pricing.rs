//! TTL-bound pricing cache with single-flight refresh.
//!
//! The cache moves through {Empty, Fresh, Stale, Loading}. A resolve
//! against an Empty or Stale cache triggers one reload from the rate
//! source; concurrent resolvers arriving while that reload is in flight
//! wait on it instead of starting their own. A failed reload keeps the
//! previous contents (served stale) and is reported, never propagated to
//! the request that observed it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::Clock;
use crate::costing::{self, PricingRate};

pub const DEFAULT_TTL_SECONDS: u64 = 300;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("pricing reload failed: {message}")]
    Load { message: String },
}

/// Loads the full rate set from the record store (or a test double).
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn load_rates(&self) -> Result<Vec<PricingRate>, PricingError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Empty,
    Fresh,
    Stale,
    Loading,
}

#[derive(Clone, Default)]
struct Snapshot {
    rates: Arc<HashMap<String, PricingRate>>,
    loaded_at: Option<u64>,
}

pub struct PricingCache {
    source: Arc<dyn RateSource>,
    clock: Arc<dyn Clock>,
    ttl_seconds: u64,
    snapshot: RwLock<Snapshot>,
    // Held across a reload; waiting on it is what makes refresh
    // single-flight.
    reload: Mutex<()>,
    loading: AtomicBool,
}

impl PricingCache {
    pub fn new(source: Arc<dyn RateSource>, ttl_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            ttl_seconds,
            snapshot: RwLock::new(Snapshot::default()),
            reload: Mutex::new(()),
            loading: AtomicBool::new(false),
        }
    }

    /// Looks up a rate for (model, tier, category), refreshing the cache
    /// first if it is empty or past its TTL. Tier and category default to
    /// "standard"/"text". Returns None after all key fallbacks miss.
    pub async fn resolve(
        &self,
        model: &str,
        tier: Option<&str>,
        category: Option<&str>,
    ) -> Option<PricingRate> {
        self.refresh_if_stale().await;

        let tier = tier.unwrap_or(costing::DEFAULT_TIER);
        let category = category.unwrap_or(costing::DEFAULT_CATEGORY);
        let snapshot = self.snapshot.read().await;
        for key in costing::candidate_keys(model, tier, category) {
            if let Some(rate) = snapshot.rates.get(&key) {
                return Some(rate.clone());
            }
        }
        tracing::warn!(
            key = %costing::rate_key(model, tier, category),
            "no pricing rate resolved; cost will be zero"
        );
        None
    }

    pub async fn state(&self) -> CacheState {
        if self.loading.load(Ordering::Acquire) {
            return CacheState::Loading;
        }
        let snapshot = self.snapshot.read().await;
        match snapshot.loaded_at {
            None => CacheState::Empty,
            Some(loaded_at) => {
                let age = self.clock.now_epoch_seconds().saturating_sub(loaded_at);
                if age >= self.ttl_seconds {
                    CacheState::Stale
                } else {
                    CacheState::Fresh
                }
            }
        }
    }

    async fn refresh_if_stale(&self) {
        if self.is_fresh().await {
            return;
        }

        let _guard = self.reload.lock().await;
        // Whoever held the lock before us may have finished the reload.
        if self.is_fresh().await {
            return;
        }

        self.loading.store(true, Ordering::Release);
        match self.source.load_rates().await {
            Ok(rates) => {
                let mut table = HashMap::with_capacity(rates.len());
                for rate in rates {
                    table.insert(rate.key(), rate);
                }
                let mut snapshot = self.snapshot.write().await;
                // The whole table is replaced atomically; entries are never
                // invalidated one at a time.
                *snapshot = Snapshot {
                    rates: Arc::new(table),
                    loaded_at: Some(self.clock.now_epoch_seconds()),
                };
            }
            Err(err) => {
                tracing::warn!("pricing reload failed, serving previous rates: {err}");
            }
        }
        self.loading.store(false, Ordering::Release);
    }

    async fn is_fresh(&self) -> bool {
        let snapshot = self.snapshot.read().await;
        let Some(loaded_at) = snapshot.loaded_at else {
            return false;
        };
        self.clock.now_epoch_seconds().saturating_sub(loaded_at) < self.ttl_seconds
    }
}

/// Adapts the record store's pricing collection to the cache's loader
/// seam, converting per-million rows to per-token rates.
pub struct StoreRateSource {
    store: Arc<dyn crate::store::UsageStore>,
}

impl StoreRateSource {
    pub fn new(store: Arc<dyn crate::store::UsageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RateSource for StoreRateSource {
    async fn load_rates(&self) -> Result<Vec<PricingRate>, PricingError> {
        let rows = self
            .store
            .load_rates()
            .await
            .map_err(|err| PricingError::Load {
                message: err.to_string(),
            })?;
        Ok(rows.into_iter().map(PricingRate::from).collect())
    }
}
