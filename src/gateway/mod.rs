//! Session gateway: the per-connection WebSocket handler and HTTP routes.
//!
//! Each connection runs its own `tokio::select!` loop between the engine's
//! broadcast event stream and inbound socket frames, mirroring how the rest
//! of this codebase fans a shared event stream out to many sockets.

pub mod protocol;

use crate::config::Config;
use crate::domain::{Currency, UserId};
use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::repository::RoundRepository;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use protocol::{ClientMessage, ServerEvent};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Verifies a connection's session token and resolves it to a user identity.
/// The real implementation (JWT, opaque session store, ...) lives outside
/// this crate's scope; this is the seam it plugs into.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<(UserId, String)>;
}

/// Accepts any non-empty token and derives a user id from it. Stands in for
/// a real session store in tests and local runs.
pub struct TrustingSessionVerifier;

#[async_trait]
impl SessionVerifier for TrustingSessionVerifier {
    async fn verify(&self, token: &str) -> Result<(UserId, String)> {
        if token.is_empty() {
            return Err(Error::Unauthenticated);
        }
        Ok((token.to_string(), format!("player-{}", &token[..token.len().min(6)])))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub ledger: Arc<Ledger>,
    pub repository: Arc<dyn RoundRepository>,
    pub sessions: Arc<dyn SessionVerifier>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(serde::Deserialize)]
struct ConnectParams {
    token: String,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    axum::extract::Query(params): axum::extract::Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, params.token))
}

/// Sliding-window rate limiter: at most `limit` operations per `window`.
struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    async fn allow(&self) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        while hits.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            hits.pop_front();
        }
        if hits.len() as u32 >= self.limit {
            return false;
        }
        hits.push_back(now);
        true
    }
}

async fn handle_connection(mut socket: WebSocket, state: AppState, token: String) {
    let (user_id, username) = match state.sessions.verify(&token).await {
        Ok(identity) => identity,
        Err(e) => {
            let _ = send_event(&mut socket, ServerEvent::Error { message: e.to_string() }).await;
            return;
        }
    };

    let connection_id = uuid::Uuid::new_v4().to_string();
    let span = crate::logging::connection_span(&connection_id, &user_id);
    let _enter = span.enter();

    if let Err(e) = state.ledger.get_or_create(&user_id, &username).await {
        let _ = send_event(&mut socket, ServerEvent::Error { message: e.to_string() }).await;
        return;
    }

    if let Ok(round) = state.engine.snapshot().await {
        let snapshot = ServerEvent::GameState {
            round_id: round.round_id,
            round_number: round.round_number,
            status: round.status,
            current_multiplier: round.current_multiplier,
            hash: round.hash,
        };
        if send_event(&mut socket, snapshot).await.is_err() {
            return;
        }
    }

    let mut events = state.engine.subscribe();
    let rate_limiter = RateLimiter::new(state.config.rate_limit_per_min, Duration::from_secs(60));

    loop {
        tokio::select! {
            Ok(event) = events.recv() => {
                if send_event(&mut socket, ServerEvent::from(event)).await.is_err() {
                    break;
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !rate_limiter.allow().await {
                            let _ = send_event(&mut socket, ServerEvent::Error {
                                message: Error::RateLimited.to_string(),
                            }).await;
                            break;
                        }
                        if dispatch(&mut socket, &state, &user_id, &username, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            else => break,
        }
    }
}

async fn dispatch(
    socket: &mut WebSocket,
    state: &AppState,
    user_id: &UserId,
    username: &str,
    text: &str,
) -> std::result::Result<(), axum::Error> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            return send_event(
                socket,
                ServerEvent::Error {
                    message: Error::BadRequest(e.to_string()).to_string(),
                },
            )
            .await;
        }
    };

    match message {
        ClientMessage::PlaceBet {
            usd_amount,
            currency,
            auto_cash_out,
        } => match state
            .engine
            .place_bet(user_id.clone(), username.to_string(), usd_amount, currency, auto_cash_out)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => send_event(socket, ServerEvent::Error { message: e.to_string() }).await,
        },
        ClientMessage::Cashout {} => match state.engine.cashout(user_id.clone()).await {
            Ok(_) => Ok(()),
            Err(e) => send_event(socket, ServerEvent::Error { message: e.to_string() }).await,
        },
        ClientMessage::GetGameHistory { limit } => {
            let limit = limit.unwrap_or(crate::repository::DEFAULT_HISTORY_CAPACITY);
            let rounds = state.repository.recent(limit).await.unwrap_or_default();
            send_event(socket, ServerEvent::GameHistory { rounds }).await
        }
        ClientMessage::GetUserStats {} => {
            match state.ledger.get_or_create(user_id, username).await {
                Ok(account) => {
                    let wallets: std::collections::HashMap<Currency, Decimal> = account
                        .wallets
                        .iter()
                        .map(|(c, w)| (*c, w.balance))
                        .collect();
                    send_event(
                        socket,
                        ServerEvent::UserStats {
                            username: account.username,
                            wallets,
                            total_bets: account.total_bets,
                            total_wins: account.total_wins,
                            total_profit: account.total_profit,
                        },
                    )
                    .await
                }
                Err(e) => send_event(socket, ServerEvent::Error { message: e.to_string() }).await,
            }
        }
        ClientMessage::Ping {} => send_event(socket, ServerEvent::Pong {}).await,
    }
}

async fn send_event(socket: &mut WebSocket, event: ServerEvent) -> std::result::Result<(), axum::Error> {
    let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_up_to_the_configured_cap() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.allow().await);
        assert!(limiter.allow().await);
        assert!(limiter.allow().await);
        assert!(!limiter.allow().await);
    }

    #[tokio::test]
    async fn rate_limiter_forgets_hits_outside_the_window() {
        let limiter = RateLimiter::new(1, Duration::from_millis(0));
        assert!(limiter.allow().await);
        // The window is effectively instantaneous, so the first hit is
        // already stale by the time the second call checks it.
        assert!(limiter.allow().await);
    }

    #[tokio::test]
    async fn trusting_verifier_rejects_empty_token() {
        let verifier = TrustingSessionVerifier;
        let result = verifier.verify("").await;
        assert!(matches!(result, Err(Error::Unauthenticated)));
    }

    #[tokio::test]
    async fn trusting_verifier_derives_identity_from_token() {
        let verifier = TrustingSessionVerifier;
        let (user_id, username) = verifier.verify("player-token-123").await.unwrap();
        assert_eq!(user_id, "player-token-123");
        assert!(username.starts_with("player-"));
    }
}
