//! Marketplace operations exposed to the user, each a thin
//! parameterization of the transaction submitter.

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::utils::parse_ether;
use alloy_primitives::{Address, U256};
use cm_api_types::{AUCTION_DURATION_PRESETS, CardMetadata, FailureReason, TxStatus};
use cm_chain_client::TxReceipt;
use std::sync::Arc;
use tracing::info;

use crate::error::{MarketError, Result};
use crate::handles::{MarketHandles, uint};
use crate::submit::{RefreshHook, Submission, TransactionSubmitter, TxCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketAction {
    Mint,
    Approve,
    List,
    Buy,
    Bid,
    EndAuction,
    Withdraw,
}

impl MarketAction {
    /// Shown while the wallet prompt is open.
    pub fn prompt(self) -> &'static str {
        match self {
            MarketAction::Mint => "Minting card, please confirm transaction...",
            MarketAction::Approve => "Approving marketplace to transfer your card...",
            MarketAction::List => "Listing card on marketplace...",
            MarketAction::Buy => "Buying card, please confirm transaction...",
            MarketAction::Bid => "Placing bid, please confirm transaction...",
            MarketAction::EndAuction => "Ending auction, please confirm transaction...",
            MarketAction::Withdraw => "Withdrawing funds, please confirm transaction...",
        }
    }

    pub fn success(self) -> &'static str {
        match self {
            MarketAction::Mint => "Card minted!",
            MarketAction::Approve => "Marketplace approved to transfer your cards.",
            MarketAction::List => "Card successfully listed!",
            MarketAction::Buy => "Card purchased successfully!",
            MarketAction::Bid => "Bid placed successfully!",
            MarketAction::EndAuction => "Auction ended successfully!",
            MarketAction::Withdraw => "Funds withdrawn successfully!",
        }
    }

    fn fallback_error(self) -> &'static str {
        match self {
            MarketAction::Mint => "Failed to mint card.",
            MarketAction::Approve => "Failed to approve marketplace.",
            MarketAction::List => "Failed to list card.",
            MarketAction::Buy => "Failed to buy card.",
            MarketAction::Bid => "Failed to place bid.",
            MarketAction::EndAuction => "Failed to end auction.",
            MarketAction::Withdraw => "Failed to withdraw funds.",
        }
    }
}

/// User-facing text for the state of an action's transaction.
pub fn status_message(action: MarketAction, status: &TxStatus) -> String {
    match status {
        TxStatus::Idle => String::new(),
        TxStatus::AwaitingSignature => action.prompt().to_owned(),
        TxStatus::Pending { .. } => "Transaction submitted, waiting for confirmation...".to_owned(),
        TxStatus::Confirmed { .. } => action.success().to_owned(),
        TxStatus::Failed { reason, message } => match reason {
            FailureReason::UserRejected => "Error: Transaction rejected in wallet.".to_owned(),
            _ if message.is_empty() => format!("Error: {}", action.fallback_error()),
            _ => format!("Error: {message}"),
        },
    }
}

/// Parses an ether amount typed by the user (`"0.05"`) into wei.
pub fn parse_amount(input: &str, field: &str) -> Result<U256> {
    let input = input.trim();
    if input.is_empty() {
        return Err(MarketError::InvalidInput(format!("Please enter a {field}.")));
    }
    let wei = parse_ether(input).map_err(|err| MarketError::InvalidInput(format!("{field} `{input}` is not an ether amount: {err}")))?;
    if wei.is_zero() {
        return Err(MarketError::InvalidInput(format!("{field} must be greater than zero")));
    }
    Ok(wei)
}

fn validate_metadata(metadata: &CardMetadata) -> Result<()> {
    for (field, value) in [("uri", &metadata.uri), ("type", &metadata.card_type), ("rarity", &metadata.rarity)] {
        if value.trim().is_empty() {
            return Err(MarketError::InvalidInput(format!("card {field} cannot be empty")));
        }
    }
    Ok(())
}

/// How a card is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingTerms {
    FixedPrice,
    Auction { duration_seconds: u64 },
}

impl ListingTerms {
    pub fn auction(duration_seconds: u64) -> Result<Self> {
        if !AUCTION_DURATION_PRESETS.contains(&duration_seconds) {
            return Err(MarketError::InvalidInput(format!(
                "auction duration must be one of {AUCTION_DURATION_PRESETS:?} seconds"
            )));
        }
        Ok(Self::Auction { duration_seconds })
    }
}

/// Views an action may invalidate.
#[derive(Clone, Default)]
pub struct RefreshSets {
    pub listings: Vec<Arc<dyn RefreshHook>>,
    pub owned_cards: Vec<Arc<dyn RefreshHook>>,
}

impl RefreshSets {
    fn listings(&self) -> Vec<Arc<dyn RefreshHook>> {
        self.listings.clone()
    }

    fn owned_cards(&self) -> Vec<Arc<dyn RefreshHook>> {
        self.owned_cards.clone()
    }

    fn both(&self) -> Vec<Arc<dyn RefreshHook>> {
        self.listings.iter().chain(&self.owned_cards).cloned().collect()
    }
}

#[derive(Clone)]
pub struct MarketActions {
    submitter: Arc<TransactionSubmitter>,
    refresh: RefreshSets,
    submission: Option<Submission>,
}

impl MarketActions {
    pub fn new(submitter: Arc<TransactionSubmitter>) -> Self {
        Self {
            submitter,
            refresh: RefreshSets::default(),
            submission: None,
        }
    }

    pub fn with_refresh(mut self, refresh: RefreshSets) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn submitter(&self) -> &Arc<TransactionSubmitter> {
        &self.submitter
    }

    /// Actions whose transactions report into `submission` instead of a
    /// fresh one each.
    pub fn tracked(&self, submission: &Submission) -> Self {
        Self {
            submission: Some(submission.clone()),
            ..self.clone()
        }
    }

    async fn submit(&self, call: TxCall) -> Result<TxReceipt> {
        match &self.submission {
            Some(submission) => self.submitter.submit_tracked(call, submission).await,
            None => self.submitter.submit(call).await,
        }
    }

    /// Owner-only on the registry; anyone else's mint reverts.
    pub async fn mint(&self, handles: &MarketHandles, recipient: Address, metadata: &CardMetadata) -> Result<TxReceipt> {
        validate_metadata(metadata)?;
        let call = TxCall::new(&handles.registry, "mintCard", vec![
            DynSolValue::Address(recipient),
            DynSolValue::String(metadata.uri.clone()),
            DynSolValue::String(metadata.card_type.clone()),
            DynSolValue::String(metadata.rarity.clone()),
        ])
        .refreshing(self.refresh.owned_cards());
        self.submit(call).await
    }

    pub async fn approve_marketplace(&self, handles: &MarketHandles) -> Result<TxReceipt> {
        let call = TxCall::new(&handles.registry, "setApprovalForAll", vec![
            DynSolValue::Address(handles.marketplace.address()),
            DynSolValue::Bool(true),
        ]);
        self.submit(call).await
    }

    /// Approves the marketplace, waits for that to confirm, then lists.
    pub async fn list_card(
        &self,
        handles: &MarketHandles,
        token_id: U256,
        price: &str,
        terms: ListingTerms,
    ) -> Result<TxReceipt> {
        let price = parse_amount(price, "price")?;
        let (is_auction, duration) = match terms {
            ListingTerms::FixedPrice => (false, 0),
            ListingTerms::Auction { duration_seconds } => (true, duration_seconds),
        };

        info!(%token_id, %price, is_auction, "{}", MarketAction::Approve.prompt());
        self.approve_marketplace(handles).await?;

        info!(%token_id, "{}", MarketAction::List.prompt());
        let call = TxCall::new(&handles.marketplace, "listCard", vec![
            uint(token_id),
            uint(price),
            DynSolValue::Bool(is_auction),
            uint(U256::from(duration)),
        ])
        .refreshing(self.refresh.both());
        self.submit(call).await
    }

    pub async fn buy_card(&self, handles: &MarketHandles, token_id: U256, price: &str) -> Result<TxReceipt> {
        let price = parse_amount(price, "price")?;
        let call = TxCall::new(&handles.marketplace, "buyCard", vec![uint(token_id)])
            .with_value(price)
            .refreshing(self.refresh.both());
        self.submit(call).await
    }

    pub async fn place_bid(&self, handles: &MarketHandles, token_id: U256, amount: &str) -> Result<TxReceipt> {
        let amount = parse_amount(amount, "bid amount")?;
        let call = TxCall::new(&handles.marketplace, "placeBid", vec![uint(token_id)])
            .with_value(amount)
            .refreshing(self.refresh.listings());
        self.submit(call).await
    }

    pub async fn end_auction(&self, handles: &MarketHandles, token_id: U256) -> Result<TxReceipt> {
        let call = TxCall::new(&handles.marketplace, "endAuction", vec![uint(token_id)]).refreshing(self.refresh.both());
        self.submit(call).await
    }

    pub async fn withdraw(&self, handles: &MarketHandles) -> Result<TxReceipt> {
        let call = TxCall::new(&handles.marketplace, "withdraw", Vec::new());
        self.submit(call).await
    }
}

/// Proceeds and refunds the marketplace holds for `account`.
pub async fn pending_withdrawal(handles: &MarketHandles, account: Address) -> Result<U256> {
    handles.pending_withdrawal(account).await
}
