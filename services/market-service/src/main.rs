use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use cm_api_types::{ErrorResponse, SessionResponse, TxResponse, TxStatus};
use cm_chain_client::{TxReceipt, WalletProvider};
use cm_chain_rpc::{RpcClient, RpcWalletProvider};
use cm_devnet::Devnet;
use cm_market_core::submit::failure_reason;
use cm_market_core::{
    Backend, ListingFeed, MarketAction, MarketActions, MarketConfig, MarketError, RefreshHook, RefreshSets, Session,
    SessionManager, TransactionSubmitter, status_message,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

mod cards;
mod market;
mod seed;
mod submissions;

use crate::submissions::{SubmissionLog, TrackedAction};

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    service: &'static str,
    version: &'static str,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Clone)]
struct AppState {
    sessions: Arc<SessionManager>,
    listings: Arc<ListingFeed>,
    actions: MarketActions,
    submissions: Arc<SubmissionLog>,
}

impl AppState {
    fn new(provider: Arc<dyn WalletProvider>, config: MarketConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(provider, config));
        let listings = Arc::new(ListingFeed::follow(sessions.subscribe()));
        // Owned cards are read from the chain per request; only the listing
        // feed keeps state worth refreshing.
        let refresh = RefreshSets {
            listings: vec![Arc::clone(&listings) as Arc<dyn RefreshHook>],
            owned_cards: Vec::new(),
        };

        Self {
            sessions,
            listings,
            actions: MarketActions::new(Arc::new(TransactionSubmitter::new())).with_refresh(refresh),
            submissions: Arc::new(SubmissionLog::default()),
        }
    }

    fn require_session(&self) -> Result<Arc<Session>, ApiError> {
        self.sessions.require_session().map_err(market_error)
    }

    /// Starts a submission for `action` and makes it visible under `/status`.
    fn track(&self, action: MarketAction) -> TrackedAction {
        let submission = self.actions.submitter().begin();
        let tracked = TrackedAction {
            action,
            actions: self.actions.tracked(&submission),
            submission,
        };
        self.submissions.record(tracked.clone());
        tracked
    }

    /// Runs a tracked action and reports the state its submission ended in.
    async fn run_action(
        &self,
        tracked: &TrackedAction,
        pending: impl Future<Output = cm_market_core::Result<TxReceipt>>,
    ) -> ApiResult<TxResponse> {
        match pending.await {
            Ok(_) => Ok(Json(tracked.response())),
            Err(err) => {
                let status = match tracked.submission.status() {
                    failed @ TxStatus::Failed { .. } => failed,
                    other => {
                        // Rejected before anything was signed.
                        if other == TxStatus::Idle {
                            self.submissions.forget(tracked.submission.id());
                        }
                        failed_status(&err)
                    }
                };
                Err(status_error(&err, tracked.action, &status))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = MarketConfig::from_env().context("invalid market configuration")?;

    let provider: Arc<dyn WalletProvider> = match config.backend {
        Backend::Devnet => {
            let devnet = Devnet::new()?;
            config.registry.address = devnet.registry_address();
            config.marketplace.address = devnet.marketplace_address();
            if config.mint_sample_cards {
                seed::mint_sample_cards(&devnet, &config).await?;
            }
            Arc::new(devnet)
        }
        Backend::Rpc => {
            if config.mint_sample_cards {
                warn!("MINT_SAMPLE_CARDS only applies to the devnet backend; ignoring");
            }
            let client = Arc::new(RpcClient::new(Some(config.rpc_url.clone())));
            info!("using JSON-RPC node at {}", client.endpoint());
            Arc::new(RpcWalletProvider::new(client, config.polling.events))
        }
    };

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("MARKET_LISTEN_ADDR `{}` is not a socket address", config.listen_addr))?;
    let app = router(AppState::new(provider, config));

    info!("market-service listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/session", get(session))
        .route("/session/connect", post(connect))
        .route("/status", get(submissions::latest))
        .route("/status/{id}", get(submissions::by_id))
        .route("/listings", get(market::listings).post(market::list_card))
        .route("/listings/{token_id}/buy", post(market::buy_card))
        .route("/listings/{token_id}/bid", post(market::place_bid))
        .route("/listings/{token_id}/end", post(market::end_auction))
        .route("/withdraw", post(market::withdraw))
        .route("/withdrawals/pending", get(market::pending_withdrawal))
        .route("/cards/owned", get(cards::owned_cards))
        .route("/cards/collection", get(cards::collection))
        .route("/cards/mint", post(cards::mint_card))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "market-service",
        status: "ok",
    })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        service: "market-service",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn session_response(session: Option<&Session>) -> SessionResponse {
    SessionResponse {
        connected: session.is_some(),
        account: session.map(|session| session.account),
        chain_id: session.map(|session| session.chain_id),
    }
}

async fn session(State(state): State<AppState>) -> Json<SessionResponse> {
    Json(session_response(state.sessions.current().as_deref()))
}

async fn connect(State(state): State<AppState>) -> ApiResult<SessionResponse> {
    let session = state.sessions.connect().await.map_err(market_error)?;
    info!(account = %session.account, chain_id = session.chain_id, "wallet connected");
    Ok(Json(session_response(Some(&session))))
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

fn market_status(err: &MarketError) -> StatusCode {
    match err {
        MarketError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        MarketError::NotConnected => StatusCode::UNAUTHORIZED,
        MarketError::UserRejected => StatusCode::FORBIDDEN,
        MarketError::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        MarketError::SessionExpired | MarketError::StaleListing(_) => StatusCode::CONFLICT,
        MarketError::TransactionReverted(_) => StatusCode::UNPROCESSABLE_ENTITY,
        MarketError::EnumerationUnsupported => StatusCode::NOT_IMPLEMENTED,
        MarketError::NoWalletDetected => StatusCode::SERVICE_UNAVAILABLE,
        MarketError::NetworkQueryFailed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn market_error(err: MarketError) -> ApiError {
    (
        market_status(&err),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn failed_status(err: &MarketError) -> TxStatus {
    TxStatus::Failed {
        reason: failure_reason(err),
        message: err.to_string(),
    }
}

fn status_error(err: &MarketError, action: MarketAction, status: &TxStatus) -> ApiError {
    (
        market_status(err),
        Json(ErrorResponse {
            error: status_message(action, status),
        }),
    )
}

fn action_error(action: MarketAction, err: MarketError) -> ApiError {
    status_error(&err, action, &failed_status(&err))
}
