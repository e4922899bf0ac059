use alloy_primitives::{Address, U256};
use cm_api_types::{CardMetadata, MetadataSource, OwnedCard};
use tracing::{debug, warn};

use crate::error::{MarketError, Result};
use crate::handles::MarketHandles;

/// Metadata lookups in the order they are tried. A card whose lookups all
/// fail is shown with the placeholder image.
const METADATA_LOOKUPS: [MetadataLookup; 2] = [MetadataLookup::CardInfo, MetadataLookup::TokenUri];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetadataLookup {
    CardInfo,
    TokenUri,
}

impl MetadataLookup {
    async fn run(self, handles: &MarketHandles, token_id: U256) -> Result<CardMetadata> {
        match self {
            MetadataLookup::CardInfo => handles.card_info(token_id).await,
            MetadataLookup::TokenUri => handles.token_uri(token_id).await.map(CardMetadata::uri_only),
        }
    }

    fn source(self) -> MetadataSource {
        match self {
            MetadataLookup::CardInfo => MetadataSource::CardInfo,
            MetadataLookup::TokenUri => MetadataSource::TokenUri,
        }
    }
}

pub async fn resolve_metadata(handles: &MarketHandles, token_id: U256) -> (CardMetadata, MetadataSource) {
    for lookup in METADATA_LOOKUPS {
        match lookup.run(handles, token_id).await {
            Ok(metadata) => return (metadata, lookup.source()),
            Err(err) => debug!(%token_id, ?lookup, "metadata lookup failed: {err}"),
        }
    }
    warn!("{}", MarketError::MetadataUnavailable(token_id));
    (CardMetadata::placeholder(), MetadataSource::Placeholder)
}

/// Token ids held by `owner`, via the registry's enumerable extension.
pub async fn owned_token_ids(handles: &MarketHandles, owner: Address) -> Result<Vec<U256>> {
    if !handles.registry.has_function("tokenOfOwnerByIndex") {
        return Err(MarketError::EnumerationUnsupported);
    }

    let balance = handles.balance_of(owner).await?;
    let count: u64 = balance.saturating_to();
    let mut token_ids = Vec::new();
    for index in 0..count {
        let token_id = handles
            .token_of_owner_by_index(owner, U256::from(index))
            .await
            .map_err(|err| match err {
                MarketError::TransactionReverted(_) | MarketError::UnknownMethod(_) | MarketError::Decode(_) => {
                    MarketError::EnumerationUnsupported
                }
                other => other,
            })?;
        token_ids.push(token_id);
    }
    Ok(token_ids)
}

/// Cards held by `owner` that are not currently listed. A card whose
/// listing check fails is kept.
pub async fn list_owned_cards(handles: &MarketHandles, owner: Address) -> Result<Vec<OwnedCard>> {
    let mut cards = Vec::new();
    for token_id in owned_token_ids(handles, owner).await? {
        let listed = match handles.listing(token_id).await {
            Ok(record) => record.is_open(),
            Err(err) => {
                warn!(%token_id, "listing check failed: {err}");
                false
            }
        };
        if listed {
            continue;
        }
        cards.push(owned_card(handles, token_id).await);
    }
    Ok(cards)
}

/// Every card held by `owner`, listed or not.
pub async fn list_collection(handles: &MarketHandles, owner: Address) -> Result<Vec<OwnedCard>> {
    let mut cards = Vec::new();
    for token_id in owned_token_ids(handles, owner).await? {
        cards.push(owned_card(handles, token_id).await);
    }
    Ok(cards)
}

async fn owned_card(handles: &MarketHandles, token_id: U256) -> OwnedCard {
    let (metadata, metadata_source) = resolve_metadata(handles, token_id).await;
    OwnedCard {
        token_id,
        metadata,
        metadata_source,
    }
}
