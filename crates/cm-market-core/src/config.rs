use alloy_primitives::{Address, address};
use cm_api_types::interfaces::{CARD_REGISTRY_INTERFACE, MARKETPLACE_INTERFACE};
use std::time::Duration;

use crate::error::{MarketError, Result};
use crate::interface::InterfaceSource;

pub const DEFAULT_REGISTRY_ADDRESS: Address = address!("e7f1725E7734CE288F8367e1Bb143E90bb3F0512");
pub const DEFAULT_MARKETPLACE_ADDRESS: Address = address!("9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0");
pub const DEFAULT_RPC_URL: &str = "http://localhost:8545";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

const DEFAULT_EVENT_POLL_MS: u64 = 4_000;
const DEFAULT_CONFIRMATION_POLL_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractConfig {
    pub address: Address,
    pub interface: InterfaceSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// JSON-RPC node with unlocked accounts.
    Rpc,
    /// In-process chain.
    Devnet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub events: Duration,
    pub confirmations: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            events: Duration::from_millis(DEFAULT_EVENT_POLL_MS),
            confirmations: Duration::from_millis(DEFAULT_CONFIRMATION_POLL_MS),
        }
    }
}

/// Deployment and runtime settings.
///
/// Read from environment variables at construction time, falling back to the
/// local Hardhat deployment addresses and the built-in contract interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketConfig {
    pub registry: ContractConfig,
    pub marketplace: ContractConfig,
    pub rpc_url: String,
    pub polling: PollIntervals,
    pub backend: Backend,
    pub listen_addr: String,
    pub mint_sample_cards: bool,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            registry: ContractConfig {
                address: DEFAULT_REGISTRY_ADDRESS,
                interface: InterfaceSource::human_readable(CARD_REGISTRY_INTERFACE),
            },
            marketplace: ContractConfig {
                address: DEFAULT_MARKETPLACE_ADDRESS,
                interface: InterfaceSource::human_readable(MARKETPLACE_INTERFACE),
            },
            rpc_url: DEFAULT_RPC_URL.to_owned(),
            polling: PollIntervals::default(),
            backend: Backend::Rpc,
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
            mint_sample_cards: false,
        }
    }
}

impl MarketConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let registry = ContractConfig {
            address: address_var(&lookup, "CARD_REGISTRY_ADDRESS", DEFAULT_REGISTRY_ADDRESS)?,
            interface: interface_var(&lookup, "CARD_REGISTRY_ABI_PATH", CARD_REGISTRY_INTERFACE)?,
        };
        let marketplace = ContractConfig {
            address: address_var(&lookup, "CARD_MARKETPLACE_ADDRESS", DEFAULT_MARKETPLACE_ADDRESS)?,
            interface: interface_var(&lookup, "CARD_MARKETPLACE_ABI_PATH", MARKETPLACE_INTERFACE)?,
        };

        let backend = match lookup("MARKET_BACKEND").as_deref().map(str::trim) {
            None | Some("") | Some("rpc") => Backend::Rpc,
            Some("devnet") => Backend::Devnet,
            Some(other) => {
                return Err(MarketError::InvalidInput(format!(
                    "MARKET_BACKEND must be `rpc` or `devnet`, got `{other}`"
                )));
            }
        };

        Ok(Self {
            registry,
            marketplace,
            rpc_url: lookup("MARKET_RPC_URL")
                .unwrap_or_else(|| DEFAULT_RPC_URL.to_owned())
                .trim_end_matches('/')
                .to_owned(),
            polling: PollIntervals {
                events: millis_var(&lookup, "MARKET_EVENT_POLL_MS", DEFAULT_EVENT_POLL_MS)?,
                confirmations: millis_var(&lookup, "MARKET_CONFIRMATION_POLL_MS", DEFAULT_CONFIRMATION_POLL_MS)?,
            },
            backend,
            listen_addr: lookup("MARKET_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_owned()),
            mint_sample_cards: lookup("MINT_SAMPLE_CARDS").is_some_and(|value| is_truthy(&value)),
        })
    }

    pub fn with_polling(mut self, polling: PollIntervals) -> Self {
        self.polling = polling;
        self
    }
}

fn address_var(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Address) -> Result<Address> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    raw.trim()
        .parse()
        .map_err(|err| MarketError::InvalidInput(format!("{key} is not an address: {err}")))
}

fn interface_var(lookup: &impl Fn(&str) -> Option<String>, key: &str, builtin: &[&str]) -> Result<InterfaceSource> {
    let Some(path) = lookup(key) else {
        return Ok(InterfaceSource::human_readable(builtin));
    };
    let text = std::fs::read_to_string(&path)
        .map_err(|err| MarketError::InvalidInterface(format!("{key}={path}: {err}")))?;
    Ok(InterfaceSource::Json(text))
}

fn millis_var(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let millis = match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| MarketError::InvalidInput(format!("{key} is not a number: {err}")))?,
        None => default,
    };
    Ok(Duration::from_millis(millis))
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
