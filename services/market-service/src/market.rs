use alloy_primitives::U256;
use axum::{
    Json,
    extract::{Path, State},
};
use cm_api_types::{
    BuyCardRequest, DEFAULT_AUCTION_DURATION, ListCardRequest, ListingsResponse, PendingWithdrawalResponse,
    PlaceBidRequest, TxResponse, display_ether,
};
use cm_market_core::{ListingTerms, MarketAction, pending_withdrawal as read_pending_withdrawal};

use crate::{ApiError, ApiResult, AppState, action_error, bad_request, market_error};

fn parse_token_id(raw: &str) -> Result<U256, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| bad_request("token_id must be a decimal or 0x-prefixed integer"))
}

pub(crate) async fn listings(State(state): State<AppState>) -> Json<ListingsResponse> {
    let snapshot = state.listings.latest();
    Json(ListingsResponse {
        listings: snapshot.listings,
        error: snapshot.error,
        refreshed_at: snapshot.refreshed_at,
    })
}

pub(crate) async fn list_card(
    State(state): State<AppState>,
    Json(request): Json<ListCardRequest>,
) -> ApiResult<TxResponse> {
    let session = state.require_session()?;
    let terms = if request.is_auction {
        ListingTerms::auction(request.duration_seconds.unwrap_or(DEFAULT_AUCTION_DURATION))
            .map_err(|err| action_error(MarketAction::List, err))?
    } else {
        ListingTerms::FixedPrice
    };

    let tracked = state.track(MarketAction::List);
    state
        .run_action(
            &tracked,
            tracked.actions.list_card(&session.handles, request.token_id, &request.price, terms),
        )
        .await
}

pub(crate) async fn buy_card(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
    Json(request): Json<BuyCardRequest>,
) -> ApiResult<TxResponse> {
    let token_id = parse_token_id(&token_id)?;
    let session = state.require_session()?;
    let tracked = state.track(MarketAction::Buy);
    state
        .run_action(&tracked, tracked.actions.buy_card(&session.handles, token_id, &request.price))
        .await
}

pub(crate) async fn place_bid(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
    Json(request): Json<PlaceBidRequest>,
) -> ApiResult<TxResponse> {
    let token_id = parse_token_id(&token_id)?;
    let session = state.require_session()?;
    let tracked = state.track(MarketAction::Bid);
    state
        .run_action(&tracked, tracked.actions.place_bid(&session.handles, token_id, &request.amount))
        .await
}

pub(crate) async fn end_auction(State(state): State<AppState>, Path(token_id): Path<String>) -> ApiResult<TxResponse> {
    let token_id = parse_token_id(&token_id)?;
    let session = state.require_session()?;
    let tracked = state.track(MarketAction::EndAuction);
    state
        .run_action(&tracked, tracked.actions.end_auction(&session.handles, token_id))
        .await
}

pub(crate) async fn withdraw(State(state): State<AppState>) -> ApiResult<TxResponse> {
    let session = state.require_session()?;
    let tracked = state.track(MarketAction::Withdraw);
    state
        .run_action(&tracked, tracked.actions.withdraw(&session.handles))
        .await
}

pub(crate) async fn pending_withdrawal(State(state): State<AppState>) -> ApiResult<PendingWithdrawalResponse> {
    let session = state.require_session()?;
    let amount = read_pending_withdrawal(&session.handles, session.account)
        .await
        .map_err(market_error)?;

    Ok(Json(PendingWithdrawalResponse {
        account: session.account,
        amount,
        amount_eth: display_ether(amount),
    }))
}
