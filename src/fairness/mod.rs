//! Provably-fair crash point generation and verification.
//!
//! Pure and deterministic given a seed: the only impurity is seed generation
//! itself, which draws from the OS CSPRNG. Everything downstream of a seed
//! (`crash_point`, `verify`) is a pure function, which is what lets any
//! client recompute and check the server's claim after the seed is revealed.

use rand::RngCore;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

/// Lower/upper bounds on a crash point, per the data model.
pub const MIN_CRASH_POINT: &str = "1.01";
pub const MAX_CRASH_POINT: &str = "1000.00";

/// Everything needed to start a new round: the committed hash is public
/// immediately; the seed stays secret until the round crashes.
#[derive(Debug, Clone)]
pub struct RoundSeed {
    pub round_id: String,
    pub seed: [u8; 32],
    pub hash: String,
    pub crash_point: Decimal,
}

#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub valid: bool,
    pub reason: Option<String>,
}

/// Stateless provably-fair generator, configured once with the house edge.
#[derive(Debug, Clone)]
pub struct FairnessEngine {
    house_edge: Decimal,
}

impl FairnessEngine {
    pub fn new(house_edge: Decimal) -> Self {
        Self { house_edge }
    }

    /// Commits a fresh seed and its crash point for `round_number`.
    ///
    /// The seed is 32 cryptographically-random bytes; the hash is
    /// published before betting closes (I1), the seed only at crash time.
    pub fn new_round(&self, round_number: u64) -> RoundSeed {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let hash = Self::hash_seed(&seed);
        let crash_point = self.crash_point(&seed, round_number);
        let round_id = Self::new_round_id(round_number);

        RoundSeed {
            round_id,
            seed,
            hash,
            crash_point,
        }
    }

    fn new_round_id(round_number: u64) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        format!("{millis}-{round_number}")
    }

    fn hash_seed(seed: &[u8; 32]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hex::encode(hasher.finalize())
    }

    /// Derives the crash point from `(seed, round_number)`.
    ///
    /// Implements the formula from the specification literally:
    /// `r = (M - x) / (M - x*e)`, where `x` is the first 8 hex chars of
    /// `SHA256(seed || round_number)` read as a u32 and `M = 2^32 - 1`.
    /// This is not the conventional crash-curve formula (see DESIGN.md) but
    /// is preserved as specified rather than "corrected".
    pub fn crash_point(&self, seed: &[u8; 32], round_number: u64) -> Decimal {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(round_number.to_string().as_bytes());
        let digest = hasher.finalize();

        let x = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as u64;
        let m = u32::MAX as u64;

        let numerator = Decimal::from(m - x);
        let denominator = Decimal::from(m) - Decimal::from(x) * self.house_edge;

        let raw = if denominator.is_zero() || denominator.is_sign_negative() {
            Decimal::from_str(MAX_CRASH_POINT).expect("valid constant")
        } else {
            numerator / denominator
        };

        Self::clamp_and_truncate(raw)
    }

    fn clamp_and_truncate(raw: Decimal) -> Decimal {
        let min = Decimal::from_str(MIN_CRASH_POINT).expect("valid constant");
        let max = Decimal::from_str(MAX_CRASH_POINT).expect("valid constant");
        let clamped = raw.max(min).min(max);
        clamped.trunc_with_scale(2)
    }

    /// Recomputes the hash and crash point and checks them against a claim,
    /// within 0.01 of tolerance on the crash point.
    pub fn verify(
        &self,
        seed: &[u8; 32],
        hash: &str,
        round_number: u64,
        claimed_crash_point: Decimal,
    ) -> VerifyResult {
        let recomputed_hash = Self::hash_seed(seed);
        if recomputed_hash != hash {
            return VerifyResult {
                valid: false,
                reason: Some("hash does not match seed".to_string()),
            };
        }

        let recomputed = self.crash_point(seed, round_number);
        let tolerance = Decimal::new(1, 2); // 0.01
        if (recomputed - claimed_crash_point).abs() > tolerance {
            return VerifyResult {
                valid: false,
                reason: Some(format!(
                    "crash point mismatch: recomputed {recomputed}, claimed {claimed_crash_point}"
                )),
            };
        }

        VerifyResult {
            valid: true,
            reason: None,
        }
    }
}
