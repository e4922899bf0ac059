//! Contract handles: an address plus a parsed interface, bound to the signer
//! of one wallet session.

use alloy_dyn_abi::{DynSolValue, EventExt, FunctionExt, JsonAbiExt};
use alloy_json_abi::{Event, Function, JsonAbi, StateMutability};
use alloy_primitives::{Address, Bytes, U256};
use cm_api_types::{CardMetadata, ListingRecord};
use cm_chain_client::{AccountSigner, LogFilter, RawLog, TransactionRequest, TxHash, TxReceipt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ContractConfig, MarketConfig, PollIntervals};
use crate::error::{MarketError, Result};

/// Revocation flag shared by every handle of one wallet session.
#[derive(Debug, Clone, Default)]
pub struct SessionGuard(Arc<AtomicBool>);

impl SessionGuard {
    pub fn revoke(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A decoded contract event, values in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLog {
    pub name: String,
    pub values: Vec<DynSolValue>,
    pub block_number: u64,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone)]
pub struct ContractHandle {
    label: &'static str,
    address: Address,
    abi: Arc<JsonAbi>,
    signer: AccountSigner,
    guard: SessionGuard,
    polling: PollIntervals,
}

impl ContractHandle {
    pub fn new(
        label: &'static str,
        address: Address,
        abi: JsonAbi,
        signer: AccountSigner,
        guard: SessionGuard,
        polling: PollIntervals,
    ) -> Self {
        Self {
            label,
            address,
            abi: Arc::new(abi),
            signer,
            guard,
            polling,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn account(&self) -> Address {
        self.signer.account()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.abi.function(name).is_some_and(|overloads| !overloads.is_empty())
    }

    pub fn is_revoked(&self) -> bool {
        self.guard.is_revoked()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.guard.is_revoked() {
            return Err(MarketError::SessionExpired);
        }
        Ok(())
    }

    fn function(&self, method: &str, arity: usize) -> Result<&Function> {
        self.abi
            .function(method)
            .and_then(|overloads| overloads.iter().find(|function| function.inputs.len() == arity))
            .ok_or_else(|| MarketError::UnknownMethod(method.to_owned()))
    }

    fn event(&self, name: &str) -> Result<&Event> {
        self.abi
            .event(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| MarketError::UnknownMethod(name.to_owned()))
    }

    /// Read-only call against the latest state.
    pub async fn call(&self, method: &str, args: &[DynSolValue]) -> Result<Vec<DynSolValue>> {
        self.ensure_active()?;
        let function = self.function(method, args.len())?;
        let data = encode_call(function, args)?;

        let output = self.signer.transport().call(self.address, data).await?;
        function
            .abi_decode_output(&output)
            .map_err(|err| MarketError::Decode(format!("{}.{method}: {err}", self.label)))
    }

    /// Asks the wallet to sign and broadcast a transaction. Returns once the
    /// transaction is accepted, not mined.
    pub async fn send(&self, method: &str, args: &[DynSolValue], value: U256) -> Result<TxHash> {
        self.ensure_active()?;
        let function = self.function(method, args.len())?;
        if !value.is_zero() && function.state_mutability != StateMutability::Payable {
            return Err(MarketError::InvalidInput(format!("{method} does not accept a payment")));
        }
        let data = encode_call(function, args)?;

        debug!(contract = self.label, method, %value, from = %self.account(), "sending transaction");
        let tx_hash = self
            .signer
            .transport()
            .send_transaction(TransactionRequest {
                from: self.signer.account(),
                to: self.address,
                data,
                value,
            })
            .await?;
        Ok(tx_hash)
    }

    /// Polls until the transaction is mined. There is no client-side timeout;
    /// a broadcast transaction stays pending through failed polls.
    pub async fn wait_for_receipt(&self, tx_hash: TxHash) -> TxReceipt {
        loop {
            match self.signer.transport().transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return receipt,
                Ok(None) => {}
                Err(err) => warn!(contract = self.label, %tx_hash, "receipt poll failed, retrying: {err}"),
            }
            tokio::time::sleep(self.polling.confirmations).await;
        }
    }

    /// Every occurrence of `name` since genesis. Logs that do not decode
    /// against the interface are skipped.
    pub async fn query_events(&self, name: &str) -> Result<Vec<EventLog>> {
        self.ensure_active()?;
        let event = self.event(name)?;
        self.fetch_events(event, 0, None).await
    }

    async fn fetch_events(&self, event: &Event, from_block: u64, to_block: Option<u64>) -> Result<Vec<EventLog>> {
        let filter = LogFilter {
            address: self.address,
            topic0: Some(event.selector()),
            from_block,
            to_block,
        };
        let logs = self
            .signer
            .transport()
            .logs(&filter)
            .await
            .map_err(|err| MarketError::NetworkQueryFailed(err.to_string()))?;

        Ok(logs
            .iter()
            .filter_map(|log| match decode_event(event, log) {
                Ok(decoded) => Some(decoded),
                Err(err) => {
                    warn!(contract = self.label, event = %event.name, block = log.block_number, "skipping log: {err}");
                    None
                }
            })
            .collect())
    }

    /// Polls for new occurrences of the named events. The watch stops when
    /// dropped or when the session is revoked.
    pub async fn watch(&self, names: &[&str]) -> Result<EventWatch> {
        self.ensure_active()?;
        let events = names
            .iter()
            .map(|name| self.event(name).cloned())
            .collect::<Result<Vec<Event>>>()?;
        let mut last_block = self.signer.transport().block_number().await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(handle.polling.events).await;
                if handle.is_revoked() || sender.is_closed() {
                    return;
                }

                let head = match handle.signer.transport().block_number().await {
                    Ok(head) => head,
                    Err(err) => {
                        warn!(contract = handle.label, "event poll failed: {err}");
                        continue;
                    }
                };
                if head <= last_block {
                    continue;
                }

                let mut batch = Vec::new();
                let mut complete = true;
                for event in &events {
                    match handle.fetch_events(event, last_block + 1, Some(head)).await {
                        Ok(logs) => batch.extend(logs),
                        Err(err) => {
                            warn!(contract = handle.label, event = %event.name, "event poll failed: {err}");
                            complete = false;
                        }
                    }
                }
                // Retry the whole range on the next tick rather than lose events.
                if !complete {
                    continue;
                }

                batch.sort_by_key(|log| log.block_number);
                last_block = head;
                for log in batch {
                    if sender.send(log).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(EventWatch { receiver, task })
    }
}

fn encode_call(function: &Function, args: &[DynSolValue]) -> Result<Bytes> {
    function
        .abi_encode_input(args)
        .map(Bytes::from)
        .map_err(|err| MarketError::InvalidInput(format!("{}: {err}", function.name)))
}

fn decode_event(event: &Event, log: &RawLog) -> Result<EventLog> {
    let decoded = event
        .decode_log_parts(log.topics.iter().copied(), &log.data)
        .map_err(|err| MarketError::Decode(err.to_string()))?;

    let mut indexed = decoded.indexed.into_iter();
    let mut body = decoded.body.into_iter();
    let values = event
        .inputs
        .iter()
        .map(|param| if param.indexed { indexed.next() } else { body.next() })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| MarketError::Decode(format!("{} log is missing fields", event.name)))?;

    Ok(EventLog {
        name: event.name.clone(),
        values,
        block_number: log.block_number,
        tx_hash: log.tx_hash,
    })
}

/// Live event subscription. Dropping it stops the poller.
#[derive(Debug)]
pub struct EventWatch {
    receiver: mpsc::UnboundedReceiver<EventLog>,
    task: JoinHandle<()>,
}

impl EventWatch {
    pub async fn next(&mut self) -> Option<EventLog> {
        self.receiver.recv().await
    }
}

impl Drop for EventWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The registry and marketplace handles of one session.
#[derive(Debug, Clone)]
pub struct MarketHandles {
    pub registry: ContractHandle,
    pub marketplace: ContractHandle,
}

/// Parses both interfaces and binds them to the signer. No network traffic.
pub fn build_handles(signer: &AccountSigner, guard: &SessionGuard, config: &MarketConfig) -> Result<MarketHandles> {
    let bind = |label: &'static str, contract: &ContractConfig| -> Result<ContractHandle> {
        let abi = contract.interface.parse()?;
        Ok(ContractHandle::new(
            label,
            contract.address,
            abi,
            signer.clone(),
            guard.clone(),
            config.polling,
        ))
    };

    Ok(MarketHandles {
        registry: bind("registry", &config.registry)?,
        marketplace: bind("marketplace", &config.marketplace)?,
    })
}

pub fn uint(value: U256) -> DynSolValue {
    DynSolValue::Uint(value, 256)
}

fn uint_at(values: &[DynSolValue], index: usize, what: &str) -> Result<U256> {
    values
        .get(index)
        .and_then(DynSolValue::as_uint)
        .map(|(value, _)| value)
        .ok_or_else(|| MarketError::Decode(format!("{what}: expected uint at {index}")))
}

fn address_at(values: &[DynSolValue], index: usize, what: &str) -> Result<Address> {
    values
        .get(index)
        .and_then(DynSolValue::as_address)
        .ok_or_else(|| MarketError::Decode(format!("{what}: expected address at {index}")))
}

fn bool_at(values: &[DynSolValue], index: usize, what: &str) -> Result<bool> {
    values
        .get(index)
        .and_then(DynSolValue::as_bool)
        .ok_or_else(|| MarketError::Decode(format!("{what}: expected bool at {index}")))
}

fn string_at(values: &[DynSolValue], index: usize, what: &str) -> Result<String> {
    values
        .get(index)
        .and_then(DynSolValue::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| MarketError::Decode(format!("{what}: expected string at {index}")))
}

impl MarketHandles {
    pub fn account(&self) -> Address {
        self.registry.account()
    }

    pub async fn owner_of(&self, token_id: U256) -> Result<Address> {
        let values = self.registry.call("ownerOf", &[uint(token_id)]).await?;
        address_at(&values, 0, "ownerOf")
    }

    pub async fn card_info(&self, token_id: U256) -> Result<CardMetadata> {
        let values = self.registry.call("getCardInfo", &[uint(token_id)]).await?;
        Ok(CardMetadata {
            uri: string_at(&values, 0, "getCardInfo")?,
            card_type: string_at(&values, 1, "getCardInfo")?,
            rarity: string_at(&values, 2, "getCardInfo")?,
        })
    }

    pub async fn token_uri(&self, token_id: U256) -> Result<String> {
        let values = self.registry.call("tokenURI", &[uint(token_id)]).await?;
        string_at(&values, 0, "tokenURI")
    }

    pub async fn balance_of(&self, owner: Address) -> Result<U256> {
        let values = self.registry.call("balanceOf", &[DynSolValue::Address(owner)]).await?;
        uint_at(&values, 0, "balanceOf")
    }

    pub async fn token_of_owner_by_index(&self, owner: Address, index: U256) -> Result<U256> {
        let values = self
            .registry
            .call("tokenOfOwnerByIndex", &[DynSolValue::Address(owner), uint(index)])
            .await?;
        uint_at(&values, 0, "tokenOfOwnerByIndex")
    }

    pub async fn is_approved_for_all(&self, owner: Address, operator: Address) -> Result<bool> {
        let values = self
            .registry
            .call("isApprovedForAll", &[DynSolValue::Address(owner), DynSolValue::Address(operator)])
            .await?;
        bool_at(&values, 0, "isApprovedForAll")
    }

    pub async fn listing(&self, token_id: U256) -> Result<ListingRecord> {
        let values = self.marketplace.call("listings", &[uint(token_id)]).await?;
        Ok(ListingRecord {
            seller: address_at(&values, 0, "listings")?,
            price: uint_at(&values, 1, "listings")?,
            is_auction: bool_at(&values, 2, "listings")?,
            highest_bid: uint_at(&values, 3, "listings")?,
            highest_bidder: address_at(&values, 4, "listings")?,
            end_time: uint_at(&values, 5, "listings")?.saturating_to(),
        })
    }

    pub async fn pending_withdrawal(&self, account: Address) -> Result<U256> {
        let values = self
            .marketplace
            .call("pendingWithdrawals", &[DynSolValue::Address(account)])
            .await?;
        uint_at(&values, 0, "pendingWithdrawals")
    }
}

/// Fields of a decoded `Listed` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEvent {
    pub token_id: U256,
    pub seller: Address,
    pub price: U256,
    pub is_auction: bool,
}

impl TryFrom<&EventLog> for ListedEvent {
    type Error = MarketError;

    fn try_from(log: &EventLog) -> Result<Self> {
        Ok(Self {
            token_id: uint_at(&log.values, 0, "Listed")?,
            seller: address_at(&log.values, 1, "Listed")?,
            price: uint_at(&log.values, 2, "Listed")?,
            is_auction: bool_at(&log.values, 3, "Listed")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{devnet_handles, list_for_sale, mint_card};
    use alloy_primitives::B256;
    use cm_devnet::{Devnet, ether};
    use std::time::Duration;

    #[tokio::test]
    async fn reads_decode_typed_values() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let holder = devnet.accounts()[1];
        let handles = devnet_handles(&devnet, holder)?;
        let token_id = mint_card(&devnet, holder, "Water", "Rare").await?;

        assert_eq!(handles.owner_of(token_id).await?, holder);
        assert_eq!(handles.balance_of(holder).await?, U256::from(1));
        assert_eq!(handles.card_info(token_id).await?.card_type, "Water");
        assert_eq!(handles.listing(token_id).await?, ListingRecord::default());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_methods_and_unpayable_value_are_rejected_locally() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let handles = devnet_handles(&devnet, devnet.accounts()[1])?;

        let missing = handles.registry.call("burn", &[uint(U256::from(1))]).await;
        assert_eq!(missing, Err(MarketError::UnknownMethod("burn".to_owned())));

        let unpayable = handles.marketplace.send("withdraw", &[], ether(1)).await;
        assert!(matches!(unpayable, Err(MarketError::InvalidInput(_))));
        Ok(())
    }

    #[tokio::test]
    async fn revoked_handles_refuse_every_operation() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let guard = SessionGuard::default();
        let signer = cm_chain_client::WalletProvider::signer(&devnet, devnet.accounts()[1])?;
        let handles = build_handles(&signer, &guard, &crate::testing::fast_config())?;

        guard.revoke();
        assert_eq!(handles.marketplace.send("withdraw", &[], U256::ZERO).await, Err(MarketError::SessionExpired));
        assert_eq!(handles.owner_of(U256::from(1)).await, Err(MarketError::SessionExpired));
        assert!(matches!(handles.marketplace.query_events("Listed").await, Err(MarketError::SessionExpired)));
        Ok(())
    }

    #[tokio::test]
    async fn event_history_skips_undecodable_logs() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let seller = devnet.accounts()[1];
        let handles = devnet_handles(&devnet, seller)?;
        let token_id = mint_card(&devnet, seller, "Fire", "Legendary").await?;
        list_for_sale(&handles, token_id, ether(1)).await?;

        let listed_topic = Event::parse("event Listed(uint256 indexed tokenId, address indexed seller, uint256 price, bool isAuction)")?.selector();
        devnet
            .inject_log(RawLog {
                address: devnet.marketplace_address(),
                topics: vec![listed_topic],
                data: Bytes::from_static(&[0xde, 0xad]),
                block_number: 0,
                tx_hash: B256::ZERO,
            })
            .await;

        let logs = handles.marketplace.query_events("Listed").await?;
        assert_eq!(logs.len(), 1);
        let listed = ListedEvent::try_from(&logs[0])?;
        assert_eq!(listed.token_id, token_id);
        assert_eq!(listed.seller, seller);
        assert_eq!(listed.price, ether(1));
        assert!(!listed.is_auction);
        Ok(())
    }

    #[tokio::test]
    async fn watch_delivers_new_events_only() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let seller = devnet.accounts()[1];
        let handles = devnet_handles(&devnet, seller)?;
        let first = mint_card(&devnet, seller, "Fire", "Legendary").await?;
        list_for_sale(&handles, first, ether(1)).await?;

        let mut watch = handles.marketplace.watch(&["Listed", "Purchased"]).await?;
        let second = mint_card(&devnet, seller, "Water", "Rare").await?;
        list_for_sale(&handles, second, ether(2)).await?;

        let log = tokio::time::timeout(Duration::from_secs(5), watch.next())
            .await?
            .expect("watch is open");
        assert_eq!(log.name, "Listed");
        assert_eq!(ListedEvent::try_from(&log)?.token_id, second);
        Ok(())
    }
}
