use alloy_dyn_abi::DynSolValue;
use alloy_primitives::U256;
use async_trait::async_trait;
use cm_api_types::{FailureReason, TxStatus};
use cm_chain_client::TxReceipt;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{MarketError, Result};
use crate::handles::ContractHandle;

/// Runs after a transaction confirms, e.g. to reload listings or owned cards.
#[async_trait]
pub trait RefreshHook: Send + Sync {
    async fn refresh(&self);
}

/// A single contract mutation and the views to reload once it confirms.
#[derive(Clone)]
pub struct TxCall {
    pub handle: ContractHandle,
    pub method: &'static str,
    pub args: Vec<DynSolValue>,
    pub value: U256,
    pub refresh: Vec<Arc<dyn RefreshHook>>,
}

impl fmt::Debug for TxCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxCall")
            .field("contract", &self.handle.label())
            .field("method", &self.method)
            .field("args", &self.args)
            .field("value", &self.value)
            .field("refresh", &self.refresh.len())
            .finish()
    }
}

impl TxCall {
    pub fn new(handle: &ContractHandle, method: &'static str, args: Vec<DynSolValue>) -> Self {
        Self {
            handle: handle.clone(),
            method,
            args,
            value: U256::ZERO,
            refresh: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn refreshing(mut self, hooks: impl IntoIterator<Item = Arc<dyn RefreshHook>>) -> Self {
        self.refresh.extend(hooks);
        self
    }
}

pub fn failure_reason(err: &MarketError) -> FailureReason {
    match err {
        MarketError::UserRejected => FailureReason::UserRejected,
        MarketError::InsufficientFunds => FailureReason::InsufficientFunds,
        MarketError::TransactionReverted(_) => FailureReason::Reverted,
        MarketError::SessionExpired => FailureReason::SessionExpired,
        _ => FailureReason::Network,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Status channel of one submission:
/// `Idle -> AwaitingSignature -> Pending -> Confirmed | Failed`.
///
/// Sequential transactions of a single user action (approve, then list)
/// may share one submission; concurrent actions never do.
#[derive(Debug, Clone)]
pub struct Submission {
    id: SubmissionId,
    status: Arc<watch::Sender<TxStatus>>,
}

impl Submission {
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn status(&self) -> TxStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TxStatus> {
        self.status.subscribe()
    }

    fn publish(&self, status: TxStatus) {
        self.status.send_replace(status);
    }

    fn fail(&self, method: &str, err: MarketError) -> MarketError {
        warn!(submission = %self.id, method, "transaction failed: {err}");
        self.publish(TxStatus::Failed {
            reason: failure_reason(&err),
            message: err.to_string(),
        });
        err
    }
}

/// Signs, broadcasts and tracks transactions. Each submission publishes its
/// own state, so concurrent submissions never overwrite each other.
#[derive(Debug, Default)]
pub struct TransactionSubmitter {
    next_id: AtomicU64,
}

impl TransactionSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh submission in the `Idle` state.
    pub fn begin(&self) -> Submission {
        let (status, _) = watch::channel(TxStatus::Idle);
        Submission {
            id: SubmissionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1),
            status: Arc::new(status),
        }
    }

    pub async fn submit(&self, call: TxCall) -> Result<TxReceipt> {
        self.submit_tracked(call, &self.begin()).await
    }

    pub async fn submit_tracked(&self, call: TxCall, submission: &Submission) -> Result<TxReceipt> {
        let TxCall {
            handle,
            method,
            args,
            value,
            refresh,
        } = call;

        submission.publish(TxStatus::AwaitingSignature);
        let tx_hash = match handle.send(method, &args, value).await {
            Ok(tx_hash) => tx_hash,
            Err(err) => return Err(submission.fail(method, err)),
        };

        submission.publish(TxStatus::Pending { tx_hash });
        info!(submission = %submission.id, contract = handle.label(), method, %tx_hash, "transaction submitted");

        let receipt = handle.wait_for_receipt(tx_hash).await;
        if !receipt.success {
            let err = MarketError::TransactionReverted(format!("{method} reverted in block {}", receipt.block_number));
            return Err(submission.fail(method, err));
        }

        submission.publish(TxStatus::Confirmed {
            tx_hash,
            block_number: receipt.block_number,
        });
        info!(submission = %submission.id, method, %tx_hash, block = receipt.block_number, "transaction confirmed");

        for hook in refresh {
            hook.refresh().await;
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::{SessionGuard, build_handles, uint};
    use crate::testing::{CountingHook, FlakyReceipts, devnet_handles, fast_config, list_for_sale, mint_card};
    use cm_chain_client::AccountSigner;
    use cm_devnet::{Devnet, ether};

    fn approval(handles: &crate::handles::MarketHandles, devnet: &Devnet) -> TxCall {
        TxCall::new(&handles.registry, "setApprovalForAll", vec![
            DynSolValue::Address(devnet.marketplace_address()),
            DynSolValue::Bool(true),
        ])
    }

    #[tokio::test]
    async fn confirmed_transaction_runs_its_refresh_set() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let handles = devnet_handles(&devnet, devnet.accounts()[1])?;
        let (listings, owned) = (Arc::new(CountingHook::default()), Arc::new(CountingHook::default()));
        let submitter = TransactionSubmitter::new();
        let submission = submitter.begin();
        let mut updates = submission.subscribe();

        let call = approval(&handles, &devnet).refreshing([listings.clone() as Arc<dyn RefreshHook>]);
        let receipt = submitter.submit_tracked(call.clone(), &submission).await?;

        assert!(updates.has_changed()?);
        assert_eq!(
            *updates.borrow_and_update(),
            TxStatus::Confirmed {
                tx_hash: receipt.tx_hash,
                block_number: receipt.block_number,
            }
        );
        assert_eq!((listings.count(), owned.count()), (1, 0));

        submitter.submit(approval(&handles, &devnet)).await?;
        assert_eq!((listings.count(), owned.count()), (1, 0));
        Ok(())
    }

    #[tokio::test]
    async fn submissions_track_their_own_state() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let handles = devnet_handles(&devnet, devnet.accounts()[1])?;
        let submitter = Arc::new(TransactionSubmitter::new());
        devnet.set_automine(false).await;

        let first = submitter.begin();
        let second = submitter.begin();
        assert_ne!(first.id(), second.id());
        let mut first_updates = first.subscribe();

        let pending = tokio::spawn({
            let submitter = Arc::clone(&submitter);
            let (call, first) = (approval(&handles, &devnet), first.clone());
            async move { submitter.submit_tracked(call, &first).await }
        });
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            first_updates.wait_for(|status| matches!(status, TxStatus::Pending { .. })),
        )
        .await??;

        devnet.set_reject_signatures(true).await;
        let err = submitter
            .submit_tracked(approval(&handles, &devnet), &second)
            .await
            .unwrap_err();
        assert_eq!(err, MarketError::UserRejected);
        assert!(matches!(second.status(), TxStatus::Failed { reason: FailureReason::UserRejected, .. }));
        assert!(matches!(first.status(), TxStatus::Pending { .. }));

        assert_eq!(devnet.mine().await, 1);
        assert!(pending.await??.success);
        assert!(matches!(first.status(), TxStatus::Confirmed { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn declined_signature_is_user_rejected() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let handles = devnet_handles(&devnet, devnet.accounts()[1])?;
        let submitter = TransactionSubmitter::new();
        let submission = submitter.begin();
        devnet.set_reject_signatures(true).await;

        let err = submitter
            .submit_tracked(approval(&handles, &devnet), &submission)
            .await
            .unwrap_err();
        assert_eq!(err, MarketError::UserRejected);
        assert!(matches!(
            submission.status(),
            TxStatus::Failed { reason: FailureReason::UserRejected, .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unaffordable_payment_is_insufficient_funds() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let handles = devnet_handles(&devnet, devnet.accounts()[2])?;
        let submitter = TransactionSubmitter::new();
        let submission = submitter.begin();

        let call = TxCall::new(&handles.marketplace, "buyCard", vec![uint(U256::from(1))]).with_value(ether(1_000_000));
        assert_eq!(
            submitter.submit_tracked(call, &submission).await.unwrap_err(),
            MarketError::InsufficientFunds
        );
        assert!(matches!(
            submission.status(),
            TxStatus::Failed { reason: FailureReason::InsufficientFunds, .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn reverted_receipt_fails_without_refresh() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let seller = devnet.accounts()[1];
        let handles = devnet_handles(&devnet, seller)?;
        let token_id = mint_card(&devnet, seller, "Fairy", "Common").await?;
        let hook = Arc::new(CountingHook::default());
        let submitter = TransactionSubmitter::new();
        let submission = submitter.begin();

        // Listing without approving the marketplace first reverts on chain.
        let call = TxCall::new(&handles.marketplace, "listCard", vec![
            uint(token_id),
            uint(ether(1)),
            DynSolValue::Bool(false),
            uint(U256::ZERO),
        ])
        .refreshing([hook.clone() as Arc<dyn RefreshHook>]);
        let err = submitter.submit_tracked(call, &submission).await.unwrap_err();
        assert!(matches!(err, MarketError::TransactionReverted(_)));
        assert!(matches!(submission.status(), TxStatus::Failed { reason: FailureReason::Reverted, .. }));
        assert_eq!(hook.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_receipt_polls_keep_the_transaction_pending() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let (seller, buyer) = (devnet.accounts()[1], devnet.accounts()[2]);
        let token_id = mint_card(&devnet, seller, "Psychic", "Rare").await?;
        list_for_sale(&devnet_handles(&devnet, seller)?, token_id, ether(1)).await?;

        let flaky = FlakyReceipts::new(Arc::new(devnet.clone()), 3);
        let signer = AccountSigner::new(buyer, Arc::new(flaky));
        let handles = build_handles(&signer, &SessionGuard::default(), &fast_config())?;
        let submitter = TransactionSubmitter::new();
        let submission = submitter.begin();

        let call = TxCall::new(&handles.marketplace, "buyCard", vec![uint(token_id)]).with_value(ether(1));
        let receipt = submitter.submit_tracked(call, &submission).await?;

        assert!(receipt.success);
        assert!(matches!(submission.status(), TxStatus::Confirmed { .. }));
        assert_eq!(devnet.card_owner(token_id).await, Some(buyer));
        Ok(())
    }

    #[tokio::test]
    async fn pending_state_is_visible_until_mined() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let handles = devnet_handles(&devnet, devnet.accounts()[1])?;
        let submitter = Arc::new(TransactionSubmitter::new());
        let submission = submitter.begin();
        let mut updates = submission.subscribe();
        devnet.set_automine(false).await;

        let task = tokio::spawn({
            let submitter = Arc::clone(&submitter);
            let (call, submission) = (approval(&handles, &devnet), submission.clone());
            async move { submitter.submit_tracked(call, &submission).await }
        });

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            updates.wait_for(|status| matches!(status, TxStatus::Pending { .. })),
        )
        .await??;
        assert!(!submission.status().is_terminal());

        assert_eq!(devnet.mine().await, 1);
        let receipt = task.await??;
        assert!(receipt.success);
        assert!(submission.status().is_terminal());
        Ok(())
    }
}
