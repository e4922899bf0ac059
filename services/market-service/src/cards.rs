use axum::{Json, extract::State};
use cm_api_types::{CardMetadata, CardsResponse, MintRequest, TxResponse};
use cm_market_core::{MarketAction, list_collection, list_owned_cards};

use crate::{ApiResult, AppState, market_error};

pub(crate) async fn owned_cards(State(state): State<AppState>) -> ApiResult<CardsResponse> {
    let session = state.require_session()?;
    let owner = session.account;
    let cards = list_owned_cards(&session.handles, owner).await.map_err(market_error)?;
    Ok(Json(CardsResponse { owner, cards }))
}

pub(crate) async fn collection(State(state): State<AppState>) -> ApiResult<CardsResponse> {
    let session = state.require_session()?;
    let cards = list_collection(&session.handles, session.account)
        .await
        .map_err(market_error)?;
    Ok(Json(CardsResponse {
        owner: session.account,
        cards,
    }))
}

pub(crate) async fn mint_card(State(state): State<AppState>, Json(request): Json<MintRequest>) -> ApiResult<TxResponse> {
    let session = state.require_session()?;
    let metadata = CardMetadata {
        uri: request.uri,
        card_type: request.card_type,
        rarity: request.rarity,
    };
    let tracked = state.track(MarketAction::Mint);
    state
        .run_action(&tracked, tracked.actions.mint(&session.handles, session.account, &metadata))
        .await
}
