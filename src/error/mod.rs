//! Error types for the crash round engine.
//!
//! Mirrors the taxonomy in the specification: validation errors never
//! mutate state, state errors are idempotent rejections, accounting errors
//! refuse the triggering operation outright, and infrastructure errors are
//! retried internally before ever reaching a client.

use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories, used to decide retry behavior and client visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Validation,
    State,
    Accounting,
    Infrastructure,
    Auth,
}

#[derive(Debug, Error)]
pub enum Error {
    // --- Validation: surfaced to the originating socket, no state change ---
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),
    #[error("invalid auto cashout: {0}")]
    InvalidAutoCashout(String),
    #[error("bad request: {0}")]
    BadRequest(String),

    // --- State: idempotent rejections ---
    #[error("round is not open for bets")]
    RoundNotOpen,
    #[error("round is not running")]
    RoundNotRunning,
    #[error("no active bet for user")]
    NoActiveBet,

    // --- Accounting: bet refused, no debit occurs ---
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: String, available: String },

    // --- Infrastructure: retried internally, may ultimately degrade or abort ---
    #[error("quote source unavailable: {0}")]
    QuoteUnavailable(String),
    #[error("store operation timed out after {0}ms")]
    StoreTimeout(u64),
    #[error("store error: {0}")]
    StoreError(String),

    // --- Auth: connection is closed ---
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("rate limited")]
    RateLimited,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidAmount(_)
            | Error::UnsupportedCurrency(_)
            | Error::InvalidAutoCashout(_)
            | Error::BadRequest(_) => ErrorCategory::Validation,

            Error::RoundNotOpen | Error::RoundNotRunning | Error::NoActiveBet => {
                ErrorCategory::State
            }

            Error::InsufficientBalance { .. } => ErrorCategory::Accounting,

            Error::QuoteUnavailable(_) | Error::StoreTimeout(_) | Error::StoreError(_) => {
                ErrorCategory::Infrastructure
            }

            Error::Unauthenticated | Error::RateLimited => ErrorCategory::Auth,
        }
    }

    /// Validation and state errors are never retried; infrastructure errors
    /// are, per the specification's propagation policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Infrastructure)
    }

    /// Machine-readable code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidAmount(_) => "INVALID_AMOUNT",
            Error::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            Error::InvalidAutoCashout(_) => "INVALID_AUTO_CASHOUT",
            Error::BadRequest(_) => "BAD_REQUEST",
            Error::RoundNotOpen => "ROUND_NOT_OPEN",
            Error::RoundNotRunning => "ROUND_NOT_RUNNING",
            Error::NoActiveBet => "NO_ACTIVE_BET",
            Error::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Error::QuoteUnavailable(_) => "QUOTE_UNAVAILABLE",
            Error::StoreTimeout(_) => "STORE_TIMEOUT",
            Error::StoreError(_) => "STORE_ERROR",
            Error::Unauthenticated => "UNAUTHENTICATED",
            Error::RateLimited => "RATE_LIMITED",
        }
    }
}
