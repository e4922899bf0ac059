use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod interfaces;

pub const PLACEHOLDER_IMAGE_URI: &str = "https://via.placeholder.com/200?text=Card+Image";
pub const UNKNOWN_ATTRIBUTE: &str = "Unknown";

/// Auction durations offered by the listing form, in seconds.
pub const AUCTION_DURATION_PRESETS: [u64; 4] = [3_600, 86_400, 172_800, 604_800];
pub const DEFAULT_AUCTION_DURATION: u64 = 86_400;

const WEI_PER_ETHER: u64 = 1_000_000_000_000_000_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardMetadata {
    pub uri: String,
    #[serde(rename = "type")]
    pub card_type: String,
    pub rarity: String,
}

impl CardMetadata {
    pub fn placeholder() -> Self {
        Self::uri_only(PLACEHOLDER_IMAGE_URI)
    }

    pub fn uri_only(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            card_type: UNKNOWN_ATTRIBUTE.to_owned(),
            rarity: UNKNOWN_ATTRIBUTE.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    CardInfo,
    TokenUri,
    Placeholder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnedCard {
    pub token_id: U256,
    #[serde(flatten)]
    pub metadata: CardMetadata,
    pub metadata_source: MetadataSource,
}

/// Marketplace `listings(tokenId)` record as stored on chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ListingRecord {
    pub seller: Address,
    pub price: U256,
    pub is_auction: bool,
    pub highest_bid: U256,
    pub highest_bidder: Address,
    pub end_time: u64,
}

impl ListingRecord {
    pub fn is_open(&self) -> bool {
        self.seller != Address::ZERO
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuctionView {
    pub highest_bid: U256,
    pub highest_bid_eth: String,
    pub highest_bidder: Option<Address>,
    pub end_time: DateTime<Utc>,
    pub has_ended: bool,
}

/// An active listing as shown to buyers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingView {
    pub token_id: U256,
    pub seller: Address,
    pub price: U256,
    pub price_eth: String,
    pub is_auction: bool,
    #[serde(flatten)]
    pub metadata: CardMetadata,
    pub auction: Option<AuctionView>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MarketEventKind {
    Listed,
    Purchased,
    BidPlaced,
    AuctionEnded,
}

impl MarketEventKind {
    pub const ALL: [MarketEventKind; 4] = [
        MarketEventKind::Listed,
        MarketEventKind::Purchased,
        MarketEventKind::BidPlaced,
        MarketEventKind::AuctionEnded,
    ];

    pub fn event_name(self) -> &'static str {
        match self {
            MarketEventKind::Listed => "Listed",
            MarketEventKind::Purchased => "Purchased",
            MarketEventKind::BidPlaced => "BidPlaced",
            MarketEventKind::AuctionEnded => "AuctionEnded",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.event_name() == name)
    }

    /// Purchases and settled auctions move cards between owners.
    pub fn affects_ownership(self) -> bool {
        matches!(self, MarketEventKind::Purchased | MarketEventKind::AuctionEnded)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UserRejected,
    InsufficientFunds,
    Reverted,
    Network,
    SessionExpired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TxStatus {
    #[default]
    Idle,
    AwaitingSignature,
    Pending {
        tx_hash: B256,
    },
    Confirmed {
        tx_hash: B256,
        block_number: u64,
    },
    Failed {
        reason: FailureReason,
        message: String,
    },
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed { .. } | TxStatus::Failed { .. })
    }
}

/// Formats a wei amount as ether, keeping at least one fractional digit
/// (`1.0`, `0.25`, `0.000000000000000001`).
pub fn display_ether(wei: U256) -> String {
    let unit = U256::from(WEI_PER_ETHER);
    let whole = wei / unit;
    let fraction: u64 = (wei % unit).saturating_to();
    let fraction = format!("{fraction:018}");
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        format!("{whole}.0")
    } else {
        format!("{whole}.{fraction}")
    }
}

// ── HTTP request/response bodies ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub connected: bool,
    pub account: Option<Address>,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintRequest {
    pub uri: String,
    #[serde(rename = "type")]
    pub card_type: String,
    pub rarity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListCardRequest {
    pub token_id: U256,
    /// Ether amount as typed by the seller, e.g. `"0.01"`.
    pub price: String,
    #[serde(default)]
    pub is_auction: bool,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyCardRequest {
    pub price: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBidRequest {
    pub amount: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxResponse {
    /// `None` while no action has been submitted.
    pub submission_id: Option<u64>,
    pub status: TxStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingsResponse {
    pub listings: Vec<ListingView>,
    pub error: Option<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardsResponse {
    pub owner: Address,
    pub cards: Vec<OwnedCard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingWithdrawalResponse {
    pub account: Address,
    pub amount: U256,
    pub amount_eth: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_ether_trims_trailing_zeros() {
        let one = U256::from(WEI_PER_ETHER);
        assert_eq!(display_ether(one), "1.0");
        assert_eq!(display_ether(one / U256::from(2)), "0.5");
        assert_eq!(display_ether(U256::from(1)), "0.000000000000000001");
        assert_eq!(display_ether(U256::ZERO), "0.0");
        assert_eq!(display_ether(one * U256::from(12) + one / U256::from(100)), "12.01");
    }

    #[test]
    fn placeholder_metadata_uses_unknown_attributes() {
        let metadata = CardMetadata::placeholder();
        assert_eq!(metadata.uri, PLACEHOLDER_IMAGE_URI);
        assert_eq!(metadata.card_type, UNKNOWN_ATTRIBUTE);
        assert_eq!(metadata.rarity, UNKNOWN_ATTRIBUTE);
    }

    #[test]
    fn only_purchases_and_settlements_move_ownership() {
        assert!(!MarketEventKind::Listed.affects_ownership());
        assert!(!MarketEventKind::BidPlaced.affects_ownership());
        assert!(MarketEventKind::Purchased.affects_ownership());
        assert!(MarketEventKind::AuctionEnded.affects_ownership());
        assert_eq!(MarketEventKind::from_event_name("BidPlaced"), Some(MarketEventKind::BidPlaced));
        assert_eq!(MarketEventKind::from_event_name("Transfer"), None);
    }

    #[test]
    fn tx_status_serializes_with_state_tag() {
        let status = TxStatus::Failed {
            reason: FailureReason::UserRejected,
            message: "declined".to_owned(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "user_rejected");

        let metadata = serde_json::to_value(CardMetadata::placeholder()).unwrap();
        assert_eq!(metadata["type"], UNKNOWN_ATTRIBUTE);
    }
}
