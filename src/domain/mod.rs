//! Shared domain types: currencies, rounds, bets, and user wallets.
//!
//! These types are intentionally free of any I/O or engine logic; the
//! engine, ledger, and repository modules all operate on them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Supported wager currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Btc,
    Eth,
    Ltc,
    Ada,
    Dot,
}

impl Currency {
    pub const ALL: [Currency; 5] = [
        Currency::Btc,
        Currency::Eth,
        Currency::Ltc,
        Currency::Ada,
        Currency::Dot,
    ];

    /// CoinGecko's asset id for this currency, used as the quote source key.
    pub fn coingecko_id(&self) -> &'static str {
        match self {
            Currency::Btc => "bitcoin",
            Currency::Eth => "ethereum",
            Currency::Ltc => "litecoin",
            Currency::Ada => "cardano",
            Currency::Dot => "polkadot",
        }
    }

    /// Last-resort price used when the quote source is unreachable and no
    /// cached value exists yet.
    pub fn fallback_price(&self) -> Decimal {
        use rust_decimal_macros::dec;
        match self {
            Currency::Btc => dec!(45000),
            Currency::Eth => dec!(3000),
            Currency::Ltc => dec!(100),
            Currency::Ada => dec!(0.5),
            Currency::Dot => dec!(7),
        }
    }

    /// Starting balance credited to a brand-new wallet.
    pub fn initial_balance(&self) -> Decimal {
        use rust_decimal_macros::dec;
        match self {
            Currency::Btc => dec!(0.001),
            Currency::Eth => dec!(0.01),
            Currency::Ltc | Currency::Ada | Currency::Dot => dec!(1),
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Currency::Btc => "BTC",
            Currency::Eth => "ETH",
            Currency::Ltc => "LTC",
            Currency::Ada => "ADA",
            Currency::Dot => "DOT",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Currency {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Ok(Currency::Btc),
            "ETH" => Ok(Currency::Eth),
            "LTC" => Ok(Currency::Ltc),
            "ADA" => Ok(Currency::Ada),
            "DOT" => Ok(Currency::Dot),
            _ => Err(()),
        }
    }
}

/// Per-currency wallet balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub balance: Decimal,
    /// Advisory USD value at last price refresh; not authoritative.
    pub usd_value: Decimal,
}

pub type UserId = String;

/// Lifetime aggregates and per-currency wallets for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    pub username: String,
    pub wallets: HashMap<Currency, Wallet>,
    pub total_bets: u64,
    pub total_wins: u64,
    pub total_profit: Decimal,
}

impl UserAccount {
    /// A brand-new account, seeded with the starting balances from §4.3.
    pub fn new(user_id: UserId, username: String) -> Self {
        let mut wallets = HashMap::new();
        for currency in Currency::ALL {
            wallets.insert(
                currency,
                Wallet {
                    balance: currency.initial_balance(),
                    usd_value: Decimal::ZERO,
                },
            );
        }
        Self {
            user_id,
            username,
            wallets,
            total_bets: 0,
            total_wins: 0,
            total_profit: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoundStatus {
    Waiting,
    Running,
    Crashed,
    /// Crashed, but the repository write that should have durably recorded
    /// it exhausted its retries (§7: infrastructure errors that are
    /// "ultimately fatal"). The round's in-memory settlement already
    /// happened; only the durable audit record is missing.
    Degraded,
}

/// One accepted wager within a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub user_id: UserId,
    pub username: String,
    pub usd_amount: Decimal,
    pub currency: Currency,
    pub price_at_time: Decimal,
    pub crypto_amount: Decimal,
    pub auto_cash_out: Option<Decimal>,
    pub cashed_out: bool,
    pub cashed_out_at: Option<Decimal>,
    pub payout_usd: Option<Decimal>,
    pub profit_usd: Option<Decimal>,
    pub placed_at: i64,
}

impl Bet {
    /// True while the bet is still exposed to the crash (I4: at most one
    /// cashout, only during RUNNING).
    pub fn is_active(&self) -> bool {
        !self.cashed_out
    }
}

/// One instance of the game cycle from WAITING through CRASHED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub round_id: String,
    pub round_number: u64,
    #[serde(with = "hex_seed")]
    pub seed: [u8; 32],
    pub hash: String,
    pub crash_point: Decimal,
    pub status: RoundStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub crashed_at: Option<i64>,
    pub current_multiplier: Decimal,
    pub bets: Vec<Bet>,
}

pub(crate) mod hex_seed {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(seed: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(seed))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("seed must be 32 bytes"))
    }
}
