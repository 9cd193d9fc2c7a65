//! Wire protocol: the JSON envelopes exchanged with connected clients.

use crate::domain::{Currency, Round, RoundStatus};
use crate::engine::EngineEvent;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Inbound client messages, tagged by `type` per §6.1.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    PlaceBet {
        usd_amount: Decimal,
        currency: String,
        auto_cash_out: Option<Decimal>,
    },
    Cashout {},
    GetGameHistory {
        limit: Option<usize>,
    },
    GetUserStats {},
    Ping {},
}

/// Outbound server events, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    GameState {
        round_id: String,
        round_number: u64,
        status: RoundStatus,
        current_multiplier: Decimal,
        hash: String,
    },
    NewRound {
        round_id: String,
        hash: String,
        status: RoundStatus,
    },
    GameStarted {
        round_id: String,
        started_at: i64,
    },
    MultiplierUpdate {
        round_id: String,
        multiplier: Decimal,
        timestamp: i64,
    },
    BetPlaced {
        round_id: String,
        username: String,
        usd_amount: Decimal,
        currency: Currency,
        auto_cash_out: Option<Decimal>,
    },
    PlayerCashout {
        round_id: String,
        username: String,
        multiplier: Decimal,
        usd_payout: Decimal,
        profit: Decimal,
        is_auto: bool,
    },
    GameCrashed {
        round_id: String,
        crash_point: Decimal,
        #[serde(with = "crate::domain::hex_seed")]
        seed: [u8; 32],
        timestamp: i64,
    },
    GameHistory {
        rounds: Vec<Round>,
    },
    UserStats {
        username: String,
        wallets: std::collections::HashMap<Currency, Decimal>,
        total_bets: u64,
        total_wins: u64,
        total_profit: Decimal,
    },
    Pong {},
    Error {
        message: String,
    },
}

impl From<EngineEvent> for ServerEvent {
    fn from(event: EngineEvent) -> Self {
        match event {
            EngineEvent::NewRound { round_id, hash } => ServerEvent::NewRound {
                round_id,
                hash,
                status: RoundStatus::Waiting,
            },
            EngineEvent::GameStarted { round_id, started_at } => {
                ServerEvent::GameStarted { round_id, started_at }
            }
            EngineEvent::MultiplierUpdate {
                round_id,
                multiplier,
                timestamp,
            } => ServerEvent::MultiplierUpdate {
                round_id,
                multiplier,
                timestamp,
            },
            EngineEvent::BetPlaced {
                round_id,
                username,
                usd_amount,
                currency,
                auto_cash_out,
            } => ServerEvent::BetPlaced {
                round_id,
                username,
                usd_amount,
                currency,
                auto_cash_out,
            },
            EngineEvent::PlayerCashout {
                round_id,
                username,
                multiplier,
                usd_payout,
                profit,
                is_auto,
            } => ServerEvent::PlayerCashout {
                round_id,
                username,
                multiplier,
                usd_payout,
                profit,
                is_auto,
            },
            EngineEvent::GameCrashed {
                round_id,
                crash_point,
                seed,
                timestamp,
            } => ServerEvent::GameCrashed {
                round_id,
                crash_point,
                seed,
                timestamp,
            },
            EngineEvent::RoundAborted { reason, .. } => ServerEvent::Error { message: reason },
        }
    }
}
