//! Entry point: wires configuration, the round engine, and the HTTP/WebSocket
//! gateway together and serves until signalled to stop.

use clap::Parser;
use crash_round_engine::config::Config;
use crash_round_engine::engine::RoundEngine;
use crash_round_engine::gateway::{self, AppState, TrustingSessionVerifier};
use crash_round_engine::ledger::{InMemoryUserRepository, Ledger};
use crash_round_engine::quotes::{CoinGeckoQuoteSource, QuoteCache};
use crash_round_engine::repository::InMemoryRoundRepository;
use crash_round_engine::Result;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Override the socket address to bind to, e.g. 0.0.0.0:8080.
    #[arg(long)]
    bind_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    crash_round_engine::logging::init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(bind_addr) = args.bind_addr {
        match bind_addr.parse() {
            Ok(addr) => config.bind_addr = addr,
            Err(_) => tracing::warn!(value = %bind_addr, "invalid --bind-addr, keeping configured value"),
        }
    }

    tracing::info!(bind_addr = %config.bind_addr, "starting crash round engine");

    let ledger = Arc::new(Ledger::new(Arc::new(InMemoryUserRepository::default())));
    let repository: Arc<InMemoryRoundRepository> = Arc::new(InMemoryRoundRepository::default());
    let quote_source = Box::new(CoinGeckoQuoteSource::new(config.coingecko_api_url.clone()));
    let quotes = Arc::new(QuoteCache::new(
        quote_source,
        config.price_cache_duration,
        config.price_request_timeout,
    ));

    let (engine, handle) = RoundEngine::new(config.clone(), ledger.clone(), repository.clone(), quotes);
    tokio::spawn(engine.run());

    let state = AppState {
        config: config.clone(),
        engine: handle,
        ledger,
        repository,
        sessions: Arc::new(TrustingSessionVerifier),
    };
    let app = gateway::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| crash_round_engine::Error::StoreError(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| crash_round_engine::Error::StoreError(e.to_string()))?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
