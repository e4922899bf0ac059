use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, Bytes, U256};
use anyhow::{Context, bail};
use async_trait::async_trait;
use cm_chain_client::{
    ChainError, ChainTransport, LogFilter, RawLog, TransactionRequest, TxHash, TxReceipt, WalletProvider,
};
use cm_devnet::Devnet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::{MarketConfig, PollIntervals};
use crate::handles::{ContractHandle, MarketHandles, SessionGuard, build_handles, uint};
use crate::session::SessionState;
use crate::submit::RefreshHook;

pub(crate) fn fast_config() -> MarketConfig {
    MarketConfig::default().with_polling(PollIntervals {
        events: Duration::from_millis(20),
        confirmations: Duration::from_millis(5),
    })
}

pub(crate) fn devnet_handles(devnet: &Devnet, account: Address) -> anyhow::Result<MarketHandles> {
    let signer = devnet.signer(account)?;
    Ok(build_handles(&signer, &SessionGuard::default(), &fast_config())?)
}

pub(crate) async fn confirm(
    handle: &ContractHandle,
    method: &str,
    args: &[DynSolValue],
    value: U256,
) -> anyhow::Result<TxReceipt> {
    let tx_hash = handle.send(method, args, value).await?;
    let receipt = handle.wait_for_receipt(tx_hash).await;
    if !receipt.success {
        bail!("{method} reverted");
    }
    Ok(receipt)
}

/// Mints through the deployer and returns the new token id.
pub(crate) async fn mint_card(
    devnet: &Devnet,
    recipient: Address,
    card_type: &str,
    rarity: &str,
) -> anyhow::Result<U256> {
    let deployer = devnet_handles(devnet, devnet.deployer())?;
    confirm(
        &deployer.registry,
        "mintCard",
        &[
            DynSolValue::Address(recipient),
            DynSolValue::String(format!("https://example.com/{card_type}.json")),
            DynSolValue::String(card_type.to_owned()),
            DynSolValue::String(rarity.to_owned()),
        ],
        U256::ZERO,
    )
    .await?;

    let transfers = deployer.registry.query_events("Transfer").await?;
    let minted = transfers.last().context("mint emitted no Transfer")?;
    minted
        .values
        .get(2)
        .and_then(DynSolValue::as_uint)
        .map(|(token_id, _)| token_id)
        .context("Transfer without token id")
}

async fn approve(handles: &MarketHandles) -> anyhow::Result<()> {
    confirm(
        &handles.registry,
        "setApprovalForAll",
        &[DynSolValue::Address(handles.marketplace.address()), DynSolValue::Bool(true)],
        U256::ZERO,
    )
    .await?;
    Ok(())
}

pub(crate) async fn list_for_sale(handles: &MarketHandles, token_id: U256, price: U256) -> anyhow::Result<()> {
    approve(handles).await?;
    confirm(
        &handles.marketplace,
        "listCard",
        &[uint(token_id), uint(price), DynSolValue::Bool(false), uint(U256::ZERO)],
        U256::ZERO,
    )
    .await?;
    Ok(())
}

pub(crate) async fn list_for_auction(
    handles: &MarketHandles,
    token_id: U256,
    start_price: U256,
    duration: u64,
) -> anyhow::Result<()> {
    approve(handles).await?;
    confirm(
        &handles.marketplace,
        "listCard",
        &[uint(token_id), uint(start_price), DynSolValue::Bool(true), uint(U256::from(duration))],
        U256::ZERO,
    )
    .await?;
    Ok(())
}

pub(crate) async fn wait_for_state(
    updates: &mut watch::Receiver<SessionState>,
    predicate: impl FnMut(&SessionState) -> bool,
) -> anyhow::Result<SessionState> {
    let state = tokio::time::timeout(Duration::from_secs(5), updates.wait_for(predicate)).await??;
    Ok((*state).clone())
}

/// Refresh hook that counts how often it ran.
#[derive(Default)]
pub(crate) struct CountingHook(AtomicUsize);

impl CountingHook {
    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefreshHook for CountingHook {
    async fn refresh(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport whose first `failures` receipt polls error out, like a node
/// timing out after accepting a transaction.
pub(crate) struct FlakyReceipts {
    inner: Arc<dyn ChainTransport>,
    failures: AtomicUsize,
}

impl FlakyReceipts {
    pub(crate) fn new(inner: Arc<dyn ChainTransport>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl ChainTransport for FlakyReceipts {
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        self.inner.call(to, data).await
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ChainError> {
        self.inner.send_transaction(tx).await
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if remaining.is_ok() {
            return Err(ChainError::Transport("timeout".to_owned()));
        }
        self.inner.transaction_receipt(tx_hash).await
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.inner.block_number().await
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        self.inner.logs(filter).await
    }
}
