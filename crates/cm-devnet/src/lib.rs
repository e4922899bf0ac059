//! In-process chain that runs the card registry and marketplace contracts.
//!
//! `Devnet` is both the wallet provider and the chain transport, the way a
//! browser wallet fronts a local Hardhat node. Accounts are unlocked, every
//! transaction is mined immediately unless automine is switched off, and the
//! knobs below let tests simulate wallet prompts, network switches and
//! partially capable registries.

mod abi;
mod world;

pub use world::MetadataFault;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, B256, Bytes, U256, address};
use anyhow::Result;
use async_trait::async_trait;
use cm_api_types::interfaces::{CARD_REGISTRY_INTERFACE, MARKETPLACE_INTERFACE};
use cm_chain_client::{
    AccountSigner, ChainError, ChainTransport, ListenerId, ListenerRegistry, LogFilter,
    ProviderEvent, ProviderEventKind, ProviderListener, RawLog, TransactionRequest, TxHash,
    TxReceipt, WalletProvider,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::abi::{ContractAbi, Revert, require};
use crate::world::{Frame, World};

pub const DEVNET_CHAIN_ID: u64 = 31_337;
pub const REGISTRY_ADDRESS: Address = address!("e7f1725E7734CE288F8367e1Bb143E90bb3F0512");
pub const MARKETPLACE_ADDRESS: Address = address!("9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0");

const ACCOUNT_COUNT: u8 = 5;
const INITIAL_BALANCE_ETHER: u64 = 10_000;
const WEI_PER_ETHER: u64 = 1_000_000_000_000_000_000;
const GAS_PER_TX: u64 = 21_000;
const GAS_PRICE_WEI: u64 = 1_000_000_000;

/// Flat fee charged for every mined transaction, reverted or not.
pub fn transaction_fee() -> U256 {
    U256::from(GAS_PER_TX) * U256::from(GAS_PRICE_WEI)
}

pub fn ether(amount: u64) -> U256 {
    U256::from(amount) * U256::from(WEI_PER_ETHER)
}

struct WalletState {
    connected: bool,
    reject_access: bool,
    reject_signatures: bool,
    active: Option<Address>,
}

struct ChainState {
    chain_id: u64,
    time_offset: u64,
    block_number: u64,
    nonce: u64,
    automine: bool,
    fail_log_queries: bool,
    world: World,
    wallet: WalletState,
    mempool: Vec<(TxHash, TransactionRequest)>,
    receipts: HashMap<TxHash, TxReceipt>,
    logs: Vec<RawLog>,
}

struct Inner {
    accounts: Vec<Address>,
    installed: AtomicBool,
    registry_abi: ContractAbi,
    marketplace_abi: ContractAbi,
    listeners: ListenerRegistry,
    state: Mutex<ChainState>,
}

#[derive(Clone)]
pub struct Devnet {
    inner: Arc<Inner>,
}

impl Devnet {
    pub fn new() -> Result<Self> {
        let accounts: Vec<Address> = (1..=ACCOUNT_COUNT).map(Address::with_last_byte).collect();
        let deployer = accounts[0];
        let world = World::new(
            REGISTRY_ADDRESS,
            MARKETPLACE_ADDRESS,
            deployer,
            &accounts,
            ether(INITIAL_BALANCE_ETHER),
        );

        info!(
            registry = %REGISTRY_ADDRESS,
            marketplace = %MARKETPLACE_ADDRESS,
            accounts = accounts.len(),
            "devnet started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                registry_abi: ContractAbi::parse(CARD_REGISTRY_INTERFACE)?,
                marketplace_abi: ContractAbi::parse(MARKETPLACE_INTERFACE)?,
                installed: AtomicBool::new(true),
                listeners: ListenerRegistry::default(),
                state: Mutex::new(ChainState {
                    chain_id: DEVNET_CHAIN_ID,
                    time_offset: 0,
                    block_number: 0,
                    nonce: 0,
                    automine: true,
                    fail_log_queries: false,
                    world,
                    wallet: WalletState {
                        connected: true,
                        reject_access: false,
                        reject_signatures: false,
                        active: Some(deployer),
                    },
                    mempool: Vec::new(),
                    receipts: HashMap::new(),
                    logs: Vec::new(),
                }),
                accounts,
            }),
        })
    }

    pub fn accounts(&self) -> &[Address] {
        &self.inner.accounts
    }

    /// Account that deployed both contracts and owns them.
    pub fn deployer(&self) -> Address {
        self.inner.accounts[0]
    }

    pub fn registry_address(&self) -> Address {
        REGISTRY_ADDRESS
    }

    pub fn marketplace_address(&self) -> Address {
        MARKETPLACE_ADDRESS
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn listener_count_for(&self, kind: ProviderEventKind) -> usize {
        self.inner.listeners.count(kind)
    }

    pub fn set_installed(&self, installed: bool) {
        self.inner.installed.store(installed, Ordering::SeqCst);
    }

    pub async fn set_reject_access(&self, reject: bool) {
        self.inner.state.lock().await.wallet.reject_access = reject;
    }

    pub async fn set_reject_signatures(&self, reject: bool) {
        self.inner.state.lock().await.wallet.reject_signatures = reject;
    }

    pub async fn active_account(&self) -> Option<Address> {
        self.inner.state.lock().await.wallet.active
    }

    /// Selects another account in the wallet and notifies listeners.
    pub async fn switch_account(&self, account: Address) {
        self.inner.state.lock().await.wallet.active = Some(account);
        self.inner
            .listeners
            .emit(&ProviderEvent::AccountsChanged(vec![account]));
    }

    /// Locks the wallet: no account is exposed any more.
    pub async fn lock_wallet(&self) {
        self.inner.state.lock().await.wallet.active = None;
        self.inner
            .listeners
            .emit(&ProviderEvent::AccountsChanged(Vec::new()));
    }

    pub async fn switch_chain(&self, chain_id: u64) {
        self.inner.state.lock().await.chain_id = chain_id;
        self.inner.listeners.emit(&ProviderEvent::ChainChanged(chain_id));
    }

    pub async fn disconnect(&self, reason: &str) {
        self.inner.state.lock().await.wallet.connected = false;
        self.inner.listeners.emit(&ProviderEvent::Disconnected {
            reason: reason.to_owned(),
        });
    }

    pub async fn reconnect(&self) {
        self.inner.state.lock().await.wallet.connected = true;
    }

    pub async fn set_automine(&self, automine: bool) {
        self.inner.state.lock().await.automine = automine;
    }

    /// Mines every queued transaction, in submission order.
    pub async fn mine(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let queued = std::mem::take(&mut state.mempool);
        let count = queued.len();
        for (tx_hash, tx) in queued {
            self.inner.mine_transaction(&mut state, tx_hash, tx);
        }
        count
    }

    /// Moves the chain clock forward; it otherwise follows the wall clock.
    pub async fn advance_time(&self, seconds: u64) {
        self.inner.state.lock().await.time_offset += seconds;
    }

    pub async fn timestamp(&self) -> u64 {
        self.inner.state.lock().await.timestamp()
    }

    pub async fn balance(&self, account: Address) -> U256 {
        self.inner.state.lock().await.world.balance(account)
    }

    pub async fn card_owner(&self, token_id: U256) -> Option<Address> {
        self.inner
            .state
            .lock()
            .await
            .world
            .registry
            .owners
            .get(&token_id)
            .copied()
    }

    /// Turns the registry's enumerable extension on or off.
    pub async fn set_enumerable(&self, enumerable: bool) {
        self.inner.state.lock().await.world.registry.enumerable = enumerable;
    }

    pub async fn set_metadata_fault(&self, token_id: U256, fault: MetadataFault) {
        self.inner
            .state
            .lock()
            .await
            .world
            .registry
            .metadata_faults
            .insert(token_id, fault);
    }

    pub async fn fail_log_queries(&self, fail: bool) {
        self.inner.state.lock().await.fail_log_queries = fail;
    }

    /// Appends an arbitrary log at the current block, e.g. one that does not
    /// decode against the marketplace interface.
    pub async fn inject_log(&self, mut log: RawLog) {
        let mut state = self.inner.state.lock().await;
        log.block_number = state.block_number;
        state.logs.push(log);
    }
}

impl Inner {
    fn dispatch(&self, world: &mut World, frame: &mut Frame, to: Address, data: &[u8]) -> Result<Bytes, Revert> {
        let abi = if to == world.registry_address {
            &self.registry_abi
        } else if to == world.marketplace_address {
            &self.marketplace_abi
        } else {
            world.move_funds(frame.sender, to, frame.value)?;
            return Ok(Bytes::new());
        };

        let (function, args) = abi.decode_call(data)?;
        require(
            frame.value.is_zero() || ContractAbi::is_payable(function),
            "function is not payable",
        )?;
        world.move_funds(frame.sender, to, frame.value)?;

        let outputs: Vec<DynSolValue> = if to == world.registry_address {
            world.invoke_registry(frame, &function.name, &args)?
        } else {
            world.invoke_marketplace(frame, &function.name, &args)?
        };
        ContractAbi::encode_output(function, &outputs)
    }

    fn mine_transaction(&self, state: &mut ChainState, tx_hash: TxHash, tx: TransactionRequest) {
        state.block_number += 1;
        let block_number = state.block_number;

        let fee = transaction_fee();
        let payer = state.world.balance(tx.from);
        state.world.balances.insert(tx.from, payer.saturating_sub(fee));

        let mut next = state.world.clone();
        let mut frame = Frame {
            sender: tx.from,
            value: tx.value,
            timestamp: state.timestamp(),
            emitted: Vec::new(),
        };

        let success = match self.dispatch(&mut next, &mut frame, tx.to, &tx.data) {
            Ok(_) => {
                state.world = next;
                for emitted in frame.emitted {
                    let abi = if emitted.contract == REGISTRY_ADDRESS {
                        &self.registry_abi
                    } else {
                        &self.marketplace_abi
                    };
                    match abi.encode_log(emitted.contract, emitted.event, emitted.values, block_number, tx_hash) {
                        Ok(log) => state.logs.push(log),
                        Err(err) => warn!("dropping undeclared event {}: {err:#}", emitted.event),
                    }
                }
                true
            }
            Err(Revert(reason)) => {
                debug!(%tx_hash, %reason, "transaction reverted");
                false
            }
        };

        state.receipts.insert(
            tx_hash,
            TxReceipt {
                tx_hash,
                block_number,
                success,
            },
        );
    }
}

impl ChainState {
    fn timestamp(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        wall + self.time_offset
    }
}

fn transaction_hash(nonce: u64, tx: &TransactionRequest) -> TxHash {
    let payload = format!("{nonce}:{}:{}:{}:{}", tx.from, tx.to, tx.value, tx.data);
    B256::from_slice(&Sha256::digest(payload.as_bytes()))
}

#[async_trait]
impl ChainTransport for Devnet {
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        let state = self.inner.state.lock().await;
        if !state.wallet.connected {
            return Err(ChainError::Disconnected);
        }

        let mut scratch = state.world.clone();
        let mut frame = Frame {
            sender: Address::ZERO,
            value: U256::ZERO,
            timestamp: state.timestamp(),
            emitted: Vec::new(),
        };
        self.inner
            .dispatch(&mut scratch, &mut frame, to, &data)
            .map_err(|Revert(reason)| ChainError::Reverted(reason))
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ChainError> {
        if !self.inner.installed.load(Ordering::SeqCst) {
            return Err(ChainError::NoProvider);
        }

        let mut state = self.inner.state.lock().await;
        if !state.wallet.connected {
            return Err(ChainError::Disconnected);
        }
        if state.wallet.reject_signatures {
            return Err(ChainError::UserRejected);
        }
        if !self.inner.accounts.contains(&tx.from) {
            return Err(ChainError::Rpc(format!("unknown account {}", tx.from)));
        }
        if state.world.balance(tx.from) < tx.value + transaction_fee() {
            return Err(ChainError::InsufficientFunds);
        }

        state.nonce += 1;
        let tx_hash = transaction_hash(state.nonce, &tx);
        if state.automine {
            self.inner.mine_transaction(&mut state, tx_hash, tx);
        } else {
            state.mempool.push((tx_hash, tx));
        }
        Ok(tx_hash)
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        Ok(self.inner.state.lock().await.receipts.get(&tx_hash).cloned())
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let state = self.inner.state.lock().await;
        if !state.wallet.connected {
            return Err(ChainError::Disconnected);
        }
        Ok(state.block_number)
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        let state = self.inner.state.lock().await;
        if !state.wallet.connected {
            return Err(ChainError::Disconnected);
        }
        if state.fail_log_queries {
            return Err(ChainError::Rpc("log query failed".to_owned()));
        }

        Ok(state
            .logs
            .iter()
            .filter(|log| log.address == filter.address)
            .filter(|log| filter.topic0.is_none_or(|topic| log.topics.first() == Some(&topic)))
            .filter(|log| log.block_number >= filter.from_block)
            .filter(|log| filter.to_block.is_none_or(|to| log.block_number <= to))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WalletProvider for Devnet {
    async fn request_accounts(&self) -> Result<Vec<Address>, ChainError> {
        if !self.inner.installed.load(Ordering::SeqCst) {
            return Err(ChainError::NoProvider);
        }

        let mut state = self.inner.state.lock().await;
        if !state.wallet.connected {
            return Err(ChainError::Disconnected);
        }
        if state.wallet.reject_access {
            return Err(ChainError::UserRejected);
        }
        let active = *state.wallet.active.get_or_insert(self.inner.accounts[0]);
        Ok(vec![active])
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        if !self.inner.installed.load(Ordering::SeqCst) {
            return Err(ChainError::NoProvider);
        }
        Ok(self.inner.state.lock().await.chain_id)
    }

    fn signer(&self, account: Address) -> Result<AccountSigner, ChainError> {
        if !self.inner.installed.load(Ordering::SeqCst) {
            return Err(ChainError::NoProvider);
        }
        Ok(AccountSigner::new(account, Arc::new(self.clone())))
    }

    fn on(&self, kind: ProviderEventKind, listener: ProviderListener) -> ListenerId {
        self.inner.listeners.register(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }
}
