//! Client core of the card marketplace: wallet sessions, contract handles,
//! listing reconstruction, owned-card views and transaction submission.

pub mod actions;
pub mod cards;
pub mod config;
pub mod error;
pub mod handles;
pub mod interface;
pub mod listings;
pub mod session;
pub mod submit;

#[cfg(test)]
pub(crate) mod testing;

pub use actions::{ListingTerms, MarketAction, MarketActions, RefreshSets, parse_amount, pending_withdrawal, status_message};
pub use cards::{list_collection, list_owned_cards, resolve_metadata};
pub use config::{Backend, ContractConfig, MarketConfig, PollIntervals};
pub use error::{MarketError, Result};
pub use handles::{ContractHandle, EventLog, EventWatch, MarketHandles, SessionGuard, build_handles};
pub use interface::InterfaceSource;
pub use listings::{ListingFeed, ListingSnapshot, ListingSubscription, refresh_listings};
pub use session::{Session, SessionManager, SessionState};
pub use submit::{RefreshHook, Submission, SubmissionId, TransactionSubmitter, TxCall};
