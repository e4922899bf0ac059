use alloy_primitives::{Address, B256, Bytes, U64};
use async_trait::async_trait;
use cm_chain_client::{
    AccountSigner, ChainError, ChainTransport, ListenerId, ListenerRegistry, LogFilter, ProviderEvent,
    ProviderEventKind, ProviderListener, RawLog, TransactionRequest, TxHash, TxReceipt, WalletProvider,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const USER_REJECTED_CODE: i64 = 4001;
const METHOD_NOT_FOUND_CODE: i64 = -32601;
const EXECUTION_REVERTED_CODE: i64 = 3;

/// JSON-RPC 2.0 client for an Ethereum node.
///
/// Reads `MARKET_RPC_URL` from environment at construction time
/// (default: `http://localhost:8545`).
pub struct RpcClient {
    endpoint: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RpcFailure {
    Remote { code: i64, message: String },
    Transport(String),
}

impl From<RpcFailure> for ChainError {
    fn from(failure: RpcFailure) -> Self {
        match failure {
            RpcFailure::Remote { code, message } => map_remote_error(code, &message),
            RpcFailure::Transport(message) => ChainError::Transport(message),
        }
    }
}

fn map_remote_error(code: i64, message: &str) -> ChainError {
    let lowered = message.to_ascii_lowercase();
    if code == USER_REJECTED_CODE || lowered.contains("user denied") || lowered.contains("user rejected") {
        ChainError::UserRejected
    } else if lowered.contains("insufficient funds") {
        ChainError::InsufficientFunds
    } else if code == EXECUTION_REVERTED_CODE || lowered.contains("revert") {
        ChainError::Reverted(message.to_owned())
    } else {
        ChainError::Rpc(format!("{code}: {message}"))
    }
}

// ── JSON-RPC wire types ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<Address>,
    to: Address,
    data: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<alloy_primitives::U256>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    block_number: Option<U64>,
    status: Option<U64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: Option<U64>,
    transaction_hash: Option<B256>,
}

impl RpcClient {
    pub fn new(endpoint: Option<String>) -> Self {
        let endpoint = endpoint
            .or_else(|| std::env::var("MARKET_RPC_URL").ok())
            .unwrap_or_else(|| "http://localhost:8545".to_string());
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcFailure> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| RpcFailure::Transport(format!("{method}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RpcFailure::Transport(format!("{method} HTTP {status}: {text}")));
        }

        let envelope: RpcResponse = response
            .json()
            .await
            .map_err(|err| RpcFailure::Transport(format!("{method} parse: {err}")))?;
        decode_envelope(method, envelope)
    }
}

fn decode_envelope<T: DeserializeOwned>(method: &str, envelope: RpcResponse) -> Result<T, RpcFailure> {
    if let Some(error) = envelope.error {
        return Err(RpcFailure::Remote {
            code: error.code,
            message: error.message,
        });
    }
    serde_json::from_value(envelope.result).map_err(|err| RpcFailure::Transport(format!("{method} result: {err}")))
}

fn block_tag(block: u64) -> String {
    format!("{block:#x}")
}

/// Chain access through a node whose accounts are unlocked, so
/// `eth_sendTransaction` signs on the node side.
#[derive(Clone)]
pub struct RpcTransport {
    client: Arc<RpcClient>,
}

impl RpcTransport {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChainTransport for RpcTransport {
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        let request = CallRequest {
            from: None,
            to,
            data,
            value: None,
        };
        Ok(self.client.request("eth_call", json!([request, "latest"])).await?)
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ChainError> {
        let request = CallRequest {
            from: Some(tx.from),
            to: tx.to,
            data: tx.data,
            value: Some(tx.value),
        };
        let tx_hash: B256 = self.client.request("eth_sendTransaction", json!([request])).await?;
        debug!(%tx_hash, "transaction broadcast");
        Ok(tx_hash)
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        let receipt: Option<RpcReceipt> = self
            .client
            .request("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;

        // Receipts without a block number are still pending.
        Ok(receipt.and_then(|receipt| {
            let block_number = receipt.block_number?.to::<u64>();
            Some(TxReceipt {
                tx_hash: receipt.transaction_hash,
                block_number,
                success: receipt.status.is_none_or(|status| status == U64::from(1)),
            })
        }))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let block: U64 = self.client.request("eth_blockNumber", json!([])).await?;
        Ok(block.to::<u64>())
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        let topics: Vec<Option<B256>> = filter.topic0.into_iter().map(Some).collect();
        let params = json!([{
            "address": filter.address,
            "topics": topics,
            "fromBlock": block_tag(filter.from_block),
            "toBlock": filter.to_block.map_or_else(|| "latest".to_owned(), block_tag),
        }]);

        let logs: Vec<RpcLog> = self.client.request("eth_getLogs", params).await?;
        Ok(logs
            .into_iter()
            .map(|log| RawLog {
                address: log.address,
                topics: log.topics,
                data: log.data,
                block_number: log.block_number.map_or(0, |block| block.to::<u64>()),
                tx_hash: log.transaction_hash.unwrap_or_default(),
            })
            .collect())
    }
}

/// Wallet provider backed by a node's unlocked accounts.
///
/// Account and network changes are detected by polling `eth_accounts` and
/// `eth_chainId` while at least one listener is registered.
pub struct RpcWalletProvider {
    client: Arc<RpcClient>,
    listeners: Arc<ListenerRegistry>,
    poll_interval: Duration,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl RpcWalletProvider {
    pub fn new(client: Arc<RpcClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            listeners: Arc::new(ListenerRegistry::default()),
            poll_interval,
            watcher: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> RpcTransport {
        RpcTransport::new(Arc::clone(&self.client))
    }

    fn ensure_watcher(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime; wallet change detection disabled");
            return;
        };

        let client = Arc::clone(&self.client);
        let listeners = Arc::clone(&self.listeners);
        let interval = self.poll_interval;
        *watcher = Some(runtime.spawn(watch_wallet(client, listeners, interval)));
    }
}

impl Drop for RpcWalletProvider {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take() {
            watcher.abort();
        }
    }
}

async fn watch_wallet(client: Arc<RpcClient>, listeners: Arc<ListenerRegistry>, interval: Duration) {
    let mut last_accounts: Option<Vec<Address>> = None;
    let mut last_chain: Option<U64> = None;
    let mut reachable = true;

    loop {
        let snapshot = async {
            let accounts: Vec<Address> = client.request("eth_accounts", json!([])).await?;
            let chain: U64 = client.request("eth_chainId", json!([])).await?;
            Ok::<_, RpcFailure>((accounts, chain))
        }
        .await;

        match snapshot {
            Ok((accounts, chain)) => {
                reachable = true;
                if last_chain.is_some_and(|previous| previous != chain) {
                    listeners.emit(&ProviderEvent::ChainChanged(chain.to::<u64>()));
                }
                if last_accounts.as_ref().is_some_and(|previous| previous != &accounts) {
                    listeners.emit(&ProviderEvent::AccountsChanged(accounts.clone()));
                }
                last_chain = Some(chain);
                last_accounts = Some(accounts);
            }
            Err(failure) => {
                if reachable {
                    let reason = ChainError::from(failure).to_string();
                    warn!(%reason, "rpc node unreachable");
                    listeners.emit(&ProviderEvent::Disconnected { reason });
                }
                reachable = false;
            }
        }

        tokio::time::sleep(interval).await;
    }
}

#[async_trait]
impl WalletProvider for RpcWalletProvider {
    async fn request_accounts(&self) -> Result<Vec<Address>, ChainError> {
        let accounts: Result<Vec<Address>, RpcFailure> = match self.client.request("eth_requestAccounts", json!([])).await {
            Err(RpcFailure::Remote { code, .. }) if code == METHOD_NOT_FOUND_CODE => {
                self.client.request("eth_accounts", json!([])).await
            }
            other => other,
        };

        match accounts {
            Ok(accounts) => Ok(accounts),
            // Nothing answering at the endpoint is the RPC equivalent of no wallet.
            Err(RpcFailure::Transport(message)) => {
                info!(endpoint = %self.client.endpoint(), %message, "no wallet provider reachable");
                Err(ChainError::NoProvider)
            }
            Err(failure) => Err(failure.into()),
        }
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        let chain: U64 = self.client.request("eth_chainId", json!([])).await?;
        Ok(chain.to::<u64>())
    }

    fn signer(&self, account: Address) -> Result<AccountSigner, ChainError> {
        Ok(AccountSigner::new(account, Arc::new(self.transport())))
    }

    fn on(&self, kind: ProviderEventKind, listener: ProviderListener) -> ListenerId {
        let id = self.listeners.register(kind, listener);
        self.ensure_watcher();
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = self.listeners.remove(id);
        if self.listeners.is_empty() {
            if let Some(watcher) = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take() {
                watcher.abort();
                debug!("wallet watcher stopped");
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    #[test]
    fn remote_errors_map_to_chain_errors() {
        assert_eq!(map_remote_error(4001, "User denied transaction signature."), ChainError::UserRejected);
        assert_eq!(
            map_remote_error(-32000, "insufficient funds for gas * price + value"),
            ChainError::InsufficientFunds
        );
        assert_eq!(
            map_remote_error(3, "execution reverted: Marketplace: card is not listed"),
            ChainError::Reverted("execution reverted: Marketplace: card is not listed".to_owned())
        );
        assert_eq!(
            map_remote_error(-32603, "Error: VM Exception while processing transaction: reverted with reason string 'x'"),
            ChainError::Reverted("Error: VM Exception while processing transaction: reverted with reason string 'x'".to_owned())
        );
        assert!(matches!(map_remote_error(-32601, "method not found"), ChainError::Rpc(_)));
    }

    #[test]
    fn envelope_errors_take_precedence_over_results() {
        let envelope: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"error":{"code":4001,"message":"rejected"}}"#).unwrap();
        let result: Result<B256, RpcFailure> = decode_envelope("eth_sendTransaction", envelope);
        assert_eq!(
            result,
            Err(RpcFailure::Remote {
                code: 4001,
                message: "rejected".to_owned()
            })
        );
    }

    #[test]
    fn null_receipt_decodes_as_pending() {
        let envelope: RpcResponse = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        let receipt: Option<RpcReceipt> = decode_envelope("eth_getTransactionReceipt", envelope).unwrap();
        assert!(receipt.is_none());
    }

    #[test]
    fn receipts_and_logs_decode_from_hex_fields() {
        let receipt: RpcReceipt = serde_json::from_value(json!({
            "transactionHash": format!("{:#x}", B256::repeat_byte(0xab)),
            "blockNumber": "0x1b",
            "status": "0x0",
        }))
        .unwrap();
        assert_eq!(receipt.block_number, Some(U64::from(27)));
        assert_eq!(receipt.status, Some(U64::ZERO));

        let log: RpcLog = serde_json::from_value(json!({
            "address": "0x9fe46736679d2d9a65f0992f2272de9f3c7fa6e0",
            "topics": [format!("{:#x}", B256::repeat_byte(1))],
            "data": "0x0102",
            "blockNumber": "0x2",
            "transactionHash": format!("{:#x}", B256::repeat_byte(2)),
        }))
        .unwrap();
        assert_eq!(log.data, Bytes::from_static(&[1, 2]));
        assert_eq!(log.block_number, Some(U64::from(2)));
    }

    #[test]
    fn transaction_requests_serialize_as_hex_quantities() {
        let request = CallRequest {
            from: Some(Address::with_last_byte(1)),
            to: Address::with_last_byte(2),
            data: Bytes::from_static(&[0xde, 0xad]),
            value: Some(U256::from(255)),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["value"], "0xff");
        assert_eq!(value["data"], "0xdead");

        let read = CallRequest {
            from: None,
            to: Address::with_last_byte(2),
            data: Bytes::new(),
            value: None,
        };
        let value = serde_json::to_value(&read).unwrap();
        assert!(value.get("from").is_none());
        assert!(value.get("value").is_none());
        assert_eq!(block_tag(0), "0x0");
        assert_eq!(block_tag(255), "0xff");
    }
}
