//! Persisted round history.
//!
//! Bounded, idempotent storage of completed rounds, queried for the
//! `game_history` response and for fairness challenges against past rounds.

use crate::domain::Round;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default and maximum number of rounds the in-memory store retains (§4.5).
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;
pub const MAX_HISTORY_CAPACITY: usize = 200;

#[async_trait]
pub trait RoundRepository: Send + Sync {
    /// Persists `round`. Saving a `round_id` already present overwrites it
    /// in place rather than duplicating, so a settlement retry is safe to
    /// call more than once.
    async fn save(&self, round: Round) -> Result<()>;

    /// Most recent rounds, newest first, capped at `limit`.
    async fn recent(&self, limit: usize) -> Result<Vec<Round>>;

    async fn find_by_id(&self, round_id: &str) -> Result<Option<Round>>;
}

pub struct InMemoryRoundRepository {
    capacity: usize,
    rounds: Mutex<VecDeque<Round>>,
}

impl InMemoryRoundRepository {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(MAX_HISTORY_CAPACITY),
            rounds: Mutex::new(VecDeque::new()),
        }
    }
}

impl Default for InMemoryRoundRepository {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[async_trait]
impl RoundRepository for InMemoryRoundRepository {
    async fn save(&self, round: Round) -> Result<()> {
        let mut rounds = self.rounds.lock().expect("round history lock poisoned");

        if let Some(existing) = rounds.iter_mut().find(|r| r.round_id == round.round_id) {
            *existing = round;
            return Ok(());
        }

        rounds.push_front(round);
        while rounds.len() > self.capacity {
            rounds.pop_back();
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Round>> {
        let rounds = self.rounds.lock().expect("round history lock poisoned");
        Ok(rounds.iter().take(limit).cloned().collect())
    }

    async fn find_by_id(&self, round_id: &str) -> Result<Option<Round>> {
        let rounds = self.rounds.lock().expect("round history lock poisoned");
        Ok(rounds.iter().find(|r| r.round_id == round_id).cloned())
    }
}
