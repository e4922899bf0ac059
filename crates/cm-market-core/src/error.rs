use alloy_primitives::U256;
use cm_chain_client::ChainError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketError {
    #[error("no wallet detected; install a browser wallet to continue")]
    NoWalletDetected,
    #[error("request rejected in the wallet")]
    UserRejected,
    #[error("insufficient funds to cover the value and fees")]
    InsufficientFunds,
    #[error("invalid contract interface: {0}")]
    InvalidInterface(String),
    #[error("method `{0}` is not part of the contract interface")]
    UnknownMethod(String),
    #[error("card registry does not support token enumeration")]
    EnumerationUnsupported,
    #[error("metadata unavailable for card {0}")]
    MetadataUnavailable(U256),
    #[error("listing for card {0} is stale")]
    StaleListing(U256),
    #[error("network query failed: {0}")]
    NetworkQueryFailed(String),
    #[error("transaction reverted: {0}")]
    TransactionReverted(String),
    #[error("wallet session expired; reconnect to continue")]
    SessionExpired,
    #[error("wallet is not connected")]
    NotConnected,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to decode contract data: {0}")]
    Decode(String),
}

pub type Result<T, E = MarketError> = std::result::Result<T, E>;

impl From<ChainError> for MarketError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::NoProvider => MarketError::NoWalletDetected,
            ChainError::UserRejected => MarketError::UserRejected,
            ChainError::InsufficientFunds => MarketError::InsufficientFunds,
            ChainError::Reverted(reason) => MarketError::TransactionReverted(reason),
            ChainError::Disconnected => MarketError::NetworkQueryFailed("provider disconnected".to_owned()),
            ChainError::Rpc(message) | ChainError::Transport(message) => MarketError::NetworkQueryFailed(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_errors_map_onto_the_market_taxonomy() {
        assert_eq!(MarketError::from(ChainError::NoProvider), MarketError::NoWalletDetected);
        assert_eq!(MarketError::from(ChainError::UserRejected), MarketError::UserRejected);
        assert_eq!(
            MarketError::from(ChainError::Reverted("Marketplace: auction has ended".to_owned())),
            MarketError::TransactionReverted("Marketplace: auction has ended".to_owned())
        );
        assert!(matches!(
            MarketError::from(ChainError::Transport("connection refused".to_owned())),
            MarketError::NetworkQueryFailed(_)
        ));
    }
}
