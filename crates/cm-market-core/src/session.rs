//! Wallet session lifecycle.
//!
//! A `Session` is an immutable value: account, chain, signer and the two
//! contract handles built for them. Account or network changes replace it
//! wholesale and revoke the previous one, so handles captured earlier can
//! never sign for the wrong account.

use alloy_primitives::Address;
use cm_chain_client::{AccountSigner, ListenerId, ProviderEvent, ProviderEventKind, WalletProvider};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MarketConfig;
use crate::error::{MarketError, Result};
use crate::handles::{MarketHandles, SessionGuard, build_handles};

#[derive(Debug)]
pub struct Session {
    pub account: Address,
    pub chain_id: u64,
    pub signer: AccountSigner,
    pub handles: MarketHandles,
    guard: SessionGuard,
}

impl Session {
    pub fn is_revoked(&self) -> bool {
        self.guard.is_revoked()
    }

    fn revoke(&self) {
        self.guard.revoke();
    }
}

#[derive(Debug, Clone, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected(Arc<Session>),
}

impl SessionState {
    pub fn session(&self) -> Option<&Arc<Session>> {
        match self {
            SessionState::Connected(session) => Some(session),
            SessionState::Disconnected => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(_))
    }
}

const WATCHED_EVENTS: [ProviderEventKind; 3] = [
    ProviderEventKind::AccountsChanged,
    ProviderEventKind::ChainChanged,
    ProviderEventKind::Disconnected,
];

struct Wiring {
    listeners: Vec<ListenerId>,
    task: JoinHandle<()>,
}

struct Shared {
    provider: Arc<dyn WalletProvider>,
    config: MarketConfig,
    state: watch::Sender<SessionState>,
    wiring: Mutex<Option<Wiring>>,
    /// Set when the provider dropped the connection. Account and network
    /// events are ignored until the user connects again.
    provider_disconnected: AtomicBool,
}

pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn WalletProvider>, config: MarketConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                provider,
                config,
                state,
                wiring: Mutex::new(None),
                provider_disconnected: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.shared.state.borrow().session().cloned()
    }

    pub fn require_session(&self) -> Result<Arc<Session>> {
        self.current().ok_or(MarketError::NotConnected)
    }

    pub fn config(&self) -> &MarketConfig {
        &self.shared.config
    }

    /// Requests account access and builds a session for the first account.
    pub async fn connect(&self) -> Result<Arc<Session>> {
        let accounts = self.shared.provider.request_accounts().await?;
        let Some(account) = accounts.first().copied() else {
            return Err(MarketError::UserRejected);
        };

        self.ensure_listeners();
        self.shared.provider_disconnected.store(false, Ordering::SeqCst);
        self.shared.establish(account).await
    }

    /// Removes every provider listener, stops the event task and clears the
    /// session.
    pub fn teardown(&self) {
        let wiring = self
            .shared
            .wiring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(wiring) = wiring {
            for id in wiring.listeners {
                self.shared.provider.remove_listener(id);
            }
            wiring.task.abort();
            debug!("wallet listeners removed");
        }
        self.shared.replace(SessionState::Disconnected);
    }

    fn ensure_listeners(&self) {
        let mut wiring = self.shared.wiring.lock().unwrap_or_else(PoisonError::into_inner);
        if wiring.is_some() {
            return;
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<ProviderEvent>();
        let listeners = WATCHED_EVENTS
            .into_iter()
            .map(|kind| {
                let sender = sender.clone();
                let shared = Arc::downgrade(&self.shared);
                self.shared.provider.on(
                    kind,
                    Arc::new(move |event: &ProviderEvent| {
                        // Revoke synchronously; the rebuild happens on the event task.
                        if let Some(shared) = shared.upgrade() {
                            shared.revoke_current();
                        }
                        let _ = sender.send(event.clone());
                    }),
                )
            })
            .collect();

        let shared = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.handle_event(event).await;
            }
        });

        *wiring = Some(Wiring { listeners, task });
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Shared {
    async fn establish(&self, account: Address) -> Result<Arc<Session>> {
        let chain_id = self.provider.chain_id().await?;
        let signer = self.provider.signer(account)?;
        let guard = SessionGuard::default();
        let handles = build_handles(&signer, &guard, &self.config)?;

        let session = Arc::new(Session {
            account,
            chain_id,
            signer,
            handles,
            guard,
        });
        self.replace(SessionState::Connected(Arc::clone(&session)));
        info!(%account, chain_id, "wallet session established");
        Ok(session)
    }

    fn replace(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if let Some(session) = previous.session() {
            session.revoke();
        }
    }

    fn revoke_current(&self) {
        if let Some(session) = self.state.borrow().session() {
            session.revoke();
        }
    }

    async fn handle_event(&self, event: ProviderEvent) {
        if self.provider_disconnected.load(Ordering::SeqCst)
            && !matches!(event, ProviderEvent::Disconnected { .. })
        {
            debug!(?event, "provider disconnected; waiting for an explicit connect");
            return;
        }
        match event {
            ProviderEvent::AccountsChanged(accounts) => match accounts.first().copied() {
                Some(account) => self.rebuild(account).await,
                None => {
                    info!("wallet locked; reconnect to continue");
                    self.replace(SessionState::Disconnected);
                }
            },
            ProviderEvent::ChainChanged(chain_id) => {
                let current = self.state.borrow().session().map(|session| session.account);
                match current {
                    Some(account) => {
                        info!(chain_id, "network changed; rebuilding session");
                        self.rebuild(account).await;
                    }
                    None => debug!(chain_id, "network changed while disconnected"),
                }
            }
            ProviderEvent::Disconnected { reason } => {
                warn!(%reason, "wallet provider disconnected");
                self.provider_disconnected.store(true, Ordering::SeqCst);
                self.replace(SessionState::Disconnected);
            }
        }
    }

    async fn rebuild(&self, account: Address) {
        if let Err(err) = self.establish(account).await {
            warn!(%account, "failed to rebuild wallet session: {err}");
            self.replace(SessionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, wait_for_state};
    use alloy_primitives::U256;
    use cm_devnet::{DEVNET_CHAIN_ID, Devnet};

    fn manager(devnet: &Devnet) -> SessionManager {
        SessionManager::new(Arc::new(devnet.clone()), fast_config())
    }

    #[tokio::test]
    async fn connect_builds_a_session_for_the_first_account() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let sessions = manager(&devnet);

        let session = sessions.connect().await?;
        assert_eq!(session.account, devnet.deployer());
        assert_eq!(session.chain_id, DEVNET_CHAIN_ID);
        assert_eq!(session.handles.account(), devnet.deployer());
        assert_eq!(session.handles.marketplace.address(), devnet.marketplace_address());
        assert!(sessions.subscribe().borrow().is_connected());
        Ok(())
    }

    #[tokio::test]
    async fn missing_wallet_and_declined_access_are_reported() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let sessions = manager(&devnet);

        devnet.set_installed(false);
        assert_eq!(sessions.connect().await.unwrap_err(), MarketError::NoWalletDetected);

        devnet.set_installed(true);
        devnet.set_reject_access(true).await;
        assert_eq!(sessions.connect().await.unwrap_err(), MarketError::UserRejected);
        assert_eq!(devnet.listener_count(), 0);
        assert!(sessions.current().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn repeated_connects_keep_one_listener_per_event() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let sessions = manager(&devnet);

        for _ in 0..3 {
            sessions.connect().await?;
        }
        assert_eq!(devnet.listener_count(), 3);
        for kind in WATCHED_EVENTS {
            assert_eq!(devnet.listener_count_for(kind), 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn account_change_revokes_old_handles() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let sessions = manager(&devnet);
        let mut updates = sessions.subscribe();
        let old = sessions.connect().await?;
        let next_account = devnet.accounts()[2];

        devnet.switch_account(next_account).await;
        assert!(old.is_revoked());
        assert_eq!(
            old.handles.marketplace.send("withdraw", &[], U256::ZERO).await,
            Err(MarketError::SessionExpired)
        );

        let state = wait_for_state(&mut updates, |state| {
            state.session().is_some_and(|session| session.account == next_account)
        })
        .await?;
        let fresh = state.session().expect("connected");
        assert!(!fresh.is_revoked());
        assert_eq!(fresh.handles.balance_of(next_account).await?, U256::ZERO);
        Ok(())
    }

    #[tokio::test]
    async fn locked_wallet_and_disconnect_clear_the_session() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let sessions = manager(&devnet);
        let mut updates = sessions.subscribe();

        let first = sessions.connect().await?;
        devnet.lock_wallet().await;
        wait_for_state(&mut updates, |state| !state.is_connected()).await?;
        assert!(first.is_revoked());

        let second = sessions.connect().await?;
        devnet.disconnect("network unreachable").await;
        wait_for_state(&mut updates, |state| !state.is_connected()).await?;
        assert!(second.is_revoked());
        assert_eq!(sessions.require_session().unwrap_err(), MarketError::NotConnected);
        Ok(())
    }

    #[tokio::test]
    async fn provider_disconnect_waits_for_an_explicit_connect() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let sessions = manager(&devnet);
        let mut updates = sessions.subscribe();

        sessions.connect().await?;
        devnet.disconnect("provider restarted").await;
        wait_for_state(&mut updates, |state| !state.is_connected()).await?;

        devnet.reconnect().await;
        let next_account = devnet.accounts()[2];
        devnet.switch_account(next_account).await;
        devnet.switch_chain(11_155_111).await;
        let rebuilt = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            updates.wait_for(SessionState::is_connected),
        )
        .await;
        assert!(rebuilt.is_err(), "session came back without a connect");
        drop(rebuilt);
        assert!(sessions.current().is_none());

        let session = sessions.connect().await?;
        assert_eq!(session.account, next_account);
        assert_eq!(session.chain_id, 11_155_111);

        devnet.switch_account(devnet.accounts()[1]).await;
        wait_for_state(&mut updates, |state| {
            state.session().is_some_and(|session| session.account == devnet.accounts()[1])
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn chain_change_rebuilds_the_session() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let sessions = manager(&devnet);
        let mut updates = sessions.subscribe();
        let old = sessions.connect().await?;

        devnet.switch_chain(11_155_111).await;
        let state = wait_for_state(&mut updates, |state| {
            state.session().is_some_and(|session| session.chain_id == 11_155_111)
        })
        .await?;
        assert!(old.is_revoked());
        assert_eq!(state.session().map(|session| session.account), Some(old.account));
        Ok(())
    }

    #[tokio::test]
    async fn teardown_and_drop_remove_listeners() -> anyhow::Result<()> {
        let devnet = Devnet::new()?;
        let sessions = manager(&devnet);
        let session = sessions.connect().await?;

        sessions.teardown();
        assert_eq!(devnet.listener_count(), 0);
        assert!(session.is_revoked());

        sessions.connect().await?;
        assert_eq!(devnet.listener_count(), 3);
        drop(sessions);
        assert_eq!(devnet.listener_count(), 0);
        Ok(())
    }
}
