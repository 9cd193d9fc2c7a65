//! Fiat↔crypto price cache.
//!
//! A short-TTL memoizing layer in front of a pluggable [`QuoteSource`]. Reads
//! can overlap; a refresh takes the write lock just long enough to replace
//! the cached entry, so concurrent `get` calls never block on network I/O
//! more than once per TTL window.

use crate::domain::Currency;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;

/// External quote provider, e.g. an HTTP call to a price aggregator.
/// Abstracted out per the specification's external collaborators (§6.2).
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch(&self, currency: Currency) -> Result<Decimal>;
}

/// Real quote source hitting CoinGecko's simple-price endpoint.
pub struct CoinGeckoQuoteSource {
    client: reqwest::Client,
    api_url: String,
}

impl CoinGeckoQuoteSource {
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }
}

#[async_trait]
impl QuoteSource for CoinGeckoQuoteSource {
    async fn fetch(&self, currency: Currency) -> Result<Decimal> {
        let id = currency.coingecko_id();
        let url = format!("{}?ids={}&vs_currencies=usd", self.api_url, id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::QuoteUnavailable(e.to_string()))?;

        let body: HashMap<String, HashMap<String, f64>> = response
            .json()
            .await
            .map_err(|e| Error::QuoteUnavailable(e.to_string()))?;

        let usd = body
            .get(id)
            .and_then(|m| m.get("usd"))
            .ok_or_else(|| Error::QuoteUnavailable(format!("no usd price for {id}")))?;

        Decimal::try_from(*usd).map_err(|e| Error::QuoteUnavailable(e.to_string()))
    }
}

#[derive(Clone, Copy, Debug)]
struct CachedPrice {
    price: Decimal,
    fetched_at: Instant,
}

/// Process-wide, lock-guarded memoizing price cache.
pub struct QuoteCache {
    source: Box<dyn QuoteSource>,
    ttl: Duration,
    request_timeout: Duration,
    entries: RwLock<HashMap<Currency, CachedPrice>>,
}

impl QuoteCache {
    pub fn new(source: Box<dyn QuoteSource>, ttl: Duration, request_timeout: Duration) -> Self {
        Self {
            source,
            ttl,
            request_timeout,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a price for `currency`, refreshing it if stale. Never fails:
    /// infrastructure failures degrade to a stale cached value or, failing
    /// that, the currency's hard-coded fallback constant.
    pub async fn get(&self, currency: Currency) -> Decimal {
        if let Some(price) = self.fresh_cached(currency).await {
            return price;
        }

        match timeout(self.request_timeout, self.source.fetch(currency)).await {
            Ok(Ok(price)) => {
                self.entries.write().await.insert(
                    currency,
                    CachedPrice {
                        price,
                        fetched_at: Instant::now(),
                    },
                );
                price
            }
            Ok(Err(err)) => self.degrade(currency, err).await,
            Err(_) => self
                .degrade(currency, Error::QuoteUnavailable("request timed out".into()))
                .await,
        }
    }

    async fn fresh_cached(&self, currency: Currency) -> Option<Decimal> {
        let entries = self.entries.read().await;
        entries.get(&currency).and_then(|c| {
            if c.fetched_at.elapsed() < self.ttl {
                Some(c.price)
            } else {
                None
            }
        })
    }

    async fn degrade(&self, currency: Currency, err: Error) -> Decimal {
        if let Some(cached) = self.entries.read().await.get(&currency) {
            tracing::warn!(%currency, error = %err, "quote fetch failed, using stale cache");
            return cached.price;
        }
        tracing::warn!(%currency, error = %err, "quote fetch failed, using fallback price");
        currency.fallback_price()
    }

    /// Fetches all supported currencies concurrently. Per-currency failures
    /// degrade individually; this call itself never fails.
    pub async fn get_all(&self) -> HashMap<Currency, Decimal> {
        let futures = Currency::ALL.iter().map(|c| async move { (*c, self.get(*c).await) });
        join_all(futures).await.into_iter().collect()
    }
}

/// `usd_to_crypto` / `crypto_to_usd` conversion helpers (§4.2).
pub fn usd_to_crypto(usd: Decimal, price: Decimal) -> Decimal {
    usd / price
}

pub fn crypto_to_usd(crypto: Decimal, price: Decimal) -> Decimal {
    crypto * price
}
