use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

pub type TxHash = B256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("no wallet provider detected")]
    NoProvider,
    #[error("request rejected by user")]
    UserRejected,
    #[error("insufficient funds for value and fees")]
    InsufficientFunds,
    #[error("execution reverted: {0}")]
    Reverted(String),
    #[error("provider disconnected")]
    Disconnected,
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topic0: Option<B256>,
    pub from_block: u64,
    pub to_block: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: TxHash,
}

/// Byte-level access to an EVM-style chain.
#[async_trait]
pub trait ChainTransport: Send + Sync {
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError>;
    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ChainError>;
    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError>;
    async fn block_number(&self) -> Result<u64, ChainError>;
    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError>;
}

/// Signing capability for one account, as handed out by a wallet provider.
#[derive(Clone)]
pub struct AccountSigner {
    account: Address,
    transport: Arc<dyn ChainTransport>,
}

impl AccountSigner {
    pub fn new(account: Address, transport: Arc<dyn ChainTransport>) -> Self {
        Self { account, transport }
    }

    pub fn account(&self) -> Address {
        self.account
    }

    pub fn transport(&self) -> &Arc<dyn ChainTransport> {
        &self.transport
    }
}

impl fmt::Debug for AccountSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountSigner")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderEventKind {
    AccountsChanged,
    ChainChanged,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
    Disconnected { reason: String },
}

impl ProviderEvent {
    pub fn kind(&self) -> ProviderEventKind {
        match self {
            ProviderEvent::AccountsChanged(_) => ProviderEventKind::AccountsChanged,
            ProviderEvent::ChainChanged(_) => ProviderEventKind::ChainChanged,
            ProviderEvent::Disconnected { .. } => ProviderEventKind::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

pub type ProviderListener = Arc<dyn Fn(&ProviderEvent) + Send + Sync>;

/// An injected wallet: account access, signing and change notifications.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn request_accounts(&self) -> Result<Vec<Address>, ChainError>;
    async fn chain_id(&self) -> Result<u64, ChainError>;
    fn signer(&self, account: Address) -> Result<AccountSigner, ChainError>;
    fn on(&self, kind: ProviderEventKind, listener: ProviderListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Listener bookkeeping shared by provider implementations.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<ListenerId, (ProviderEventKind, ProviderListener)>>,
}

impl ListenerRegistry {
    pub fn register(&self, kind: ProviderEventKind, listener: ProviderListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (kind, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, kind: ProviderEventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(registered, _)| *registered == kind)
            .count()
    }

    /// Invokes every listener registered for the event's kind. Listeners run
    /// outside the registry lock so they may register or remove listeners.
    pub fn emit(&self, event: &ProviderEvent) {
        let kind = event.kind();
        let targets: Vec<ProviderListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(registered, _)| *registered == kind)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        debug!(?kind, listeners = targets.len(), "emitting provider event");
        for listener in targets {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_listener(counter: &Arc<AtomicUsize>) -> ProviderListener {
        let counter = Arc::clone(counter);
        Arc::new(move |_event: &ProviderEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn emit_reaches_only_matching_kind() {
        let registry = ListenerRegistry::default();
        let accounts = Arc::new(AtomicUsize::new(0));
        let chains = Arc::new(AtomicUsize::new(0));

        registry.register(ProviderEventKind::AccountsChanged, counting_listener(&accounts));
        registry.register(ProviderEventKind::ChainChanged, counting_listener(&chains));

        registry.emit(&ProviderEvent::AccountsChanged(vec![Address::ZERO]));
        registry.emit(&ProviderEvent::AccountsChanged(Vec::new()));

        assert_eq!(accounts.load(Ordering::SeqCst), 2);
        assert_eq!(chains.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let registry = ListenerRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let id = registry.register(ProviderEventKind::Disconnected, counting_listener(&hits));
        assert_eq!(registry.count(ProviderEventKind::Disconnected), 1);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());

        registry.emit(&ProviderEvent::Disconnected {
            reason: "closed".to_owned(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
