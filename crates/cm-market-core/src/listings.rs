//! Active listing reconstruction.
//!
//! The marketplace keeps no index of open listings, so the set is rebuilt
//! from the full `Listed` history and cross-checked against live state:
//! the listing record must still name a seller and that seller must still
//! own the card. Nothing is cached between passes.

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use cm_api_types::{AuctionView, CardMetadata, ListingRecord, ListingView, MarketEventKind, display_ether};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MarketError, Result};
use crate::handles::{ListedEvent, MarketHandles};
use crate::session::SessionState;
use crate::submit::RefreshHook;

/// Rebuilds the active listing set. Each token appears at most once.
pub async fn refresh_listings(handles: &MarketHandles, now: DateTime<Utc>) -> Result<Vec<ListingView>> {
    let logs = handles.marketplace.query_events("Listed").await?;

    let mut seen = HashSet::new();
    let mut listings = Vec::new();
    for log in &logs {
        let listed = match ListedEvent::try_from(log) {
            Ok(listed) => listed,
            Err(err) => {
                warn!(block = log.block_number, "skipping Listed event: {err}");
                continue;
            }
        };
        if !seen.insert(listed.token_id) {
            continue;
        }

        match listing_row(handles, listed.token_id, now).await {
            Ok(Some(view)) => listings.push(view),
            Ok(None) => {}
            Err(err) => warn!(token_id = %listed.token_id, "dropping listing row: {err}"),
        }
    }

    debug!(events = logs.len(), active = listings.len(), "listings refreshed");
    Ok(listings)
}

async fn listing_row(handles: &MarketHandles, token_id: U256, now: DateTime<Utc>) -> Result<Option<ListingView>> {
    let record = handles.listing(token_id).await?;
    if !record.is_open() {
        return Ok(None);
    }

    let owner = handles.owner_of(token_id).await?;
    if owner != record.seller {
        debug!(%owner, seller = %record.seller, "{}", MarketError::StaleListing(token_id));
        return Ok(None);
    }

    let metadata = match handles.card_info(token_id).await {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!("{}: {err}", MarketError::MetadataUnavailable(token_id));
            CardMetadata::placeholder()
        }
    };

    Ok(Some(listing_view(token_id, &record, metadata, now)))
}

pub fn listing_view(token_id: U256, record: &ListingRecord, metadata: CardMetadata, now: DateTime<Utc>) -> ListingView {
    let auction = record.is_auction.then(|| {
        let end_time = chain_time(record.end_time);
        AuctionView {
            highest_bid: record.highest_bid,
            highest_bid_eth: display_ether(record.highest_bid),
            highest_bidder: (record.highest_bidder != Address::ZERO).then_some(record.highest_bidder),
            end_time,
            has_ended: now > end_time,
        }
    });

    ListingView {
        token_id,
        seller: record.seller,
        price: record.price,
        price_eth: display_ether(record.price),
        is_auction: record.is_auction,
        metadata,
        auction,
    }
}

fn chain_time(seconds: u64) -> DateTime<Utc> {
    i64::try_from(seconds)
        .ok()
        .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result of one refresh pass as published to subscribers.
#[derive(Debug, Clone, Default)]
pub struct ListingSnapshot {
    pub listings: Vec<ListingView>,
    pub error: Option<String>,
    /// Event that caused this pass; `None` for the initial load.
    pub trigger: Option<MarketEventKind>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl ListingSnapshot {
    /// Owned-card views are stale too after a purchase or a settled auction.
    pub fn ownership_changed(&self) -> bool {
        self.trigger.is_some_and(MarketEventKind::affects_ownership)
    }

    fn failed(err: &MarketError) -> Self {
        Self {
            error: Some(err.to_string()),
            refreshed_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

async fn take_snapshot(handles: &MarketHandles, trigger: Option<MarketEventKind>, previous: &[ListingView]) -> ListingSnapshot {
    let now = Utc::now();
    match refresh_listings(handles, now).await {
        Ok(listings) => ListingSnapshot {
            listings,
            error: None,
            trigger,
            refreshed_at: Some(now),
        },
        Err(err) => {
            warn!("listing refresh failed: {err}");
            ListingSnapshot {
                listings: previous.to_vec(),
                error: Some(err.to_string()),
                trigger,
                refreshed_at: Some(now),
            }
        }
    }
}

/// Keeps a listing snapshot current by re-running the refresh on every
/// marketplace event. Dropping the subscription stops the watch.
#[derive(Debug)]
pub struct ListingSubscription {
    snapshots: watch::Receiver<ListingSnapshot>,
    refresh: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ListingSubscription {
    pub async fn start(handles: MarketHandles) -> Result<Self> {
        Self::start_with(handles, Arc::new(Notify::new())).await
    }

    async fn start_with(handles: MarketHandles, refresh: Arc<Notify>) -> Result<Self> {
        let names = MarketEventKind::ALL.map(MarketEventKind::event_name);
        let mut events = handles.marketplace.watch(&names).await?;
        let initial = take_snapshot(&handles, None, &[]).await;
        let (sender, snapshots) = watch::channel(initial);

        let requests = Arc::clone(&refresh);
        let task = tokio::spawn(async move {
            loop {
                let trigger = tokio::select! {
                    event = events.next() => match event {
                        Some(event) => {
                            debug!(event = %event.name, block = event.block_number, "marketplace event");
                            MarketEventKind::from_event_name(&event.name)
                        }
                        None => break,
                    },
                    () = requests.notified() => None,
                };
                let previous = sender.borrow().listings.clone();
                sender.send_replace(take_snapshot(&handles, trigger, &previous).await);
            }
        });

        Ok(Self {
            snapshots,
            refresh,
            task,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ListingSnapshot> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> ListingSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Runs another pass without waiting for a marketplace event.
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn unsubscribe(self) {}
}

impl Drop for ListingSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Listing snapshots that follow the wallet session: each new session gets
/// its own subscription and the previous one is torn down.
#[derive(Debug)]
pub struct ListingFeed {
    snapshots: watch::Receiver<ListingSnapshot>,
    refresh: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ListingFeed {
    pub fn follow(mut sessions: watch::Receiver<SessionState>) -> Self {
        let (sender, snapshots) = watch::channel(ListingSnapshot::default());
        let refresh = Arc::new(Notify::new());

        let requests = Arc::clone(&refresh);
        let task = tokio::spawn(async move {
            loop {
                let state = sessions.borrow_and_update().clone();
                let subscription = match state.session() {
                    Some(session) => match ListingSubscription::start_with(session.handles.clone(), Arc::clone(&requests)).await {
                        Ok(subscription) => Some(subscription),
                        Err(err) => {
                            warn!(account = %session.account, "listing subscription failed: {err}");
                            sender.send_replace(ListingSnapshot::failed(&err));
                            None
                        }
                    },
                    None => {
                        sender.send_replace(ListingSnapshot::default());
                        None
                    }
                };

                let Some(subscription) = subscription else {
                    if sessions.changed().await.is_err() {
                        return;
                    }
                    continue;
                };

                info!("listing subscription started");
                let mut updates = subscription.subscribe();
                sender.send_replace(updates.borrow_and_update().clone());
                loop {
                    tokio::select! {
                        changed = sessions.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            break;
                        }
                        changed = updates.changed() => {
                            if changed.is_err() {
                                if sessions.changed().await.is_err() {
                                    return;
                                }
                                break;
                            }
                            sender.send_replace(updates.borrow_and_update().clone());
                        }
                    }
                }
                subscription.unsubscribe();
            }
        });

        Self {
            snapshots,
            refresh,
            task,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ListingSnapshot> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> ListingSnapshot {
        self.snapshots.borrow().clone()
    }
}

#[async_trait]
impl RefreshHook for ListingFeed {
    async fn refresh(&self) {
        self.refresh.notify_one();
    }
}

impl Drop for ListingFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}
