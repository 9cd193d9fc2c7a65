//! Environment-driven configuration for the crash round engine.
//!
//! Every variable named in the specification's configuration section has a
//! field here with the same default. Loading never panics: bad or missing
//! values fall back to the default and the reason is logged.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level configuration, constructed once at startup and shared via `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub frontend_url: String,
    pub mongodb_uri: String,
    pub coingecko_api_url: String,

    pub price_cache_duration: Duration,
    pub price_request_timeout: Duration,
    pub house_edge: Decimal,
    pub multiplier_tick: Duration,
    pub wait_duration: Duration,
    pub post_crash_duration: Duration,
    pub max_bet_usd: Decimal,
    pub rate_limit_per_min: u32,
    pub store_timeout: Duration,
    pub crash_settlement_max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("valid default bind addr"),
            frontend_url: "http://localhost:3000".to_string(),
            mongodb_uri: "mongodb://localhost:27017/crash".to_string(),
            coingecko_api_url: "https://api.coingecko.com/api/v3/simple/price".to_string(),

            price_cache_duration: Duration::from_millis(10_000),
            price_request_timeout: Duration::from_millis(5_000),
            house_edge: dec!(0.04),
            multiplier_tick: Duration::from_millis(100),
            wait_duration: Duration::from_millis(5_000),
            post_crash_duration: Duration::from_millis(5_000),
            max_bet_usd: dec!(10000.00),
            rate_limit_per_min: 100,
            store_timeout: Duration::from_millis(2_000),
            crash_settlement_max_retries: 5,
        }
    }
}

impl Config {
    /// Load configuration from the process environment, falling back to
    /// defaults for anything unset or malformed.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(val) = env::var("BIND_ADDR") {
            match val.parse() {
                Ok(addr) => config.bind_addr = addr,
                Err(_) => tracing::warn!(value = %val, "invalid BIND_ADDR, keeping default"),
            }
        }
        if let Ok(val) = env::var("FRONTEND_URL") {
            config.frontend_url = val;
        }
        if let Ok(val) = env::var("MONGODB_URI") {
            config.mongodb_uri = val;
        }
        if let Ok(val) = env::var("COINGECKO_API_URL") {
            config.coingecko_api_url = val;
        }

        set_millis(&mut config.price_cache_duration, "PRICE_CACHE_DURATION_MS");
        set_millis(&mut config.price_request_timeout, "PRICE_REQUEST_TIMEOUT_MS");
        set_decimal(&mut config.house_edge, "HOUSE_EDGE");
        set_millis(&mut config.multiplier_tick, "MULTIPLIER_TICK_MS");
        set_millis(&mut config.wait_duration, "WAIT_MS");
        set_millis(&mut config.post_crash_duration, "POST_CRASH_MS");
        set_decimal(&mut config.max_bet_usd, "MAX_BET_USD");
        set_millis(&mut config.store_timeout, "STORE_TIMEOUT_MS");

        if let Ok(val) = env::var("RATE_LIMIT_PER_MIN") {
            match val.parse() {
                Ok(n) => config.rate_limit_per_min = n,
                Err(_) => tracing::warn!(value = %val, "invalid RATE_LIMIT_PER_MIN, keeping default"),
            }
        }
        if let Ok(val) = env::var("CRASH_SETTLEMENT_MAX_RETRIES") {
            match val.parse() {
                Ok(n) => config.crash_settlement_max_retries = n,
                Err(_) => tracing::warn!(
                    value = %val,
                    "invalid CRASH_SETTLEMENT_MAX_RETRIES, keeping default"
                ),
            }
        }

        config
    }
}

fn set_millis(target: &mut Duration, var: &str) {
    if let Ok(val) = env::var(var) {
        match val.parse::<u64>() {
            Ok(ms) => *target = Duration::from_millis(ms),
            Err(_) => tracing::warn!(value = %val, var, "invalid duration override, keeping default"),
        }
    }
}

fn set_decimal(target: &mut Decimal, var: &str) {
    if let Ok(val) = env::var(var) {
        match val.parse::<Decimal>() {
            Ok(d) => *target = d,
            Err(_) => tracing::warn!(value = %val, var, "invalid decimal override, keeping default"),
        }
    }
}
