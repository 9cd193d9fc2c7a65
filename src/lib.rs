//! Authoritative round engine and session gateway for a real-time
//! multiplayer crash wagering game.

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fairness;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod quotes;
pub mod repository;

pub use error::{Error, Result};
