//! Change feed listeners.
//!
//! One task per watched collection reads notices from its feed subscription,
//! completes partial payloads, runs the collection's differ and hands the
//! resulting events to an [`EventSink`]. Notices for a collection are
//! processed strictly in delivery order.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::differ::{ClientDiffer, ProposalDiffer};
use crate::error::{EngineError, Result};
use crate::records::{parse_record, ClientRecord, ProposalRecord, RecordSource};
use crate::types::{ChangeType, Collection, Event, SessionUser};

const DEFAULT_FEED_CAPACITY: usize = 256;

/// Record body carried by a notice.
#[derive(Debug, Clone)]
pub enum FeedPayload {
    Full(Value),
    /// The feed only signalled the change; the record must be fetched.
    Partial,
}

#[derive(Debug, Clone)]
pub struct ChangeNotice {
    pub id: String,
    pub change: ChangeType,
    pub payload: FeedPayload,
}

type FeedItem = Result<ChangeNotice>;

/// Live subscription to one collection's feed.
///
/// The upstream subscription is released when this value is dropped, which
/// covers normal shutdown, early returns and panics in the consuming task.
pub struct FeedSubscription {
    receiver: mpsc::Receiver<FeedItem>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl FeedSubscription {
    pub fn new(receiver: mpsc::Receiver<FeedItem>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            receiver,
            release: Some(Box::new(release)),
        }
    }

    /// `None` once the feed has closed for good.
    pub async fn next(&mut self) -> Option<FeedItem> {
        self.receiver.recv().await
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Push source of change notices.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, collection: Collection) -> Result<FeedSubscription>;
}

type Senders = Arc<Mutex<HashMap<Collection, (u64, mpsc::Sender<FeedItem>)>>>;

/// Channel-backed feed that the host process pushes notices into.
pub struct ChannelFeed {
    senders: Senders,
    next_id: AtomicU64,
    capacity: usize,
}

impl ChannelFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, collection: Collection) -> Option<mpsc::Sender<FeedItem>> {
        let senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders.get(&collection).map(|(_, tx)| tx.clone())
    }

    /// Returns false when no listener is subscribed to `collection`.
    pub async fn publish(&self, collection: Collection, notice: ChangeNotice) -> bool {
        match self.sender(collection) {
            Some(tx) => tx.send(Ok(notice)).await.is_ok(),
            None => false,
        }
    }

    /// Surface a feed-level error (lost connection and the like) to the listener.
    pub async fn publish_error(&self, collection: Collection, error: EngineError) -> bool {
        match self.sender(collection) {
            Some(tx) => tx.send(Err(error)).await.is_ok(),
            None => false,
        }
    }

    pub fn is_subscribed(&self, collection: Collection) -> bool {
        let senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders.contains_key(&collection)
    }
}

impl Default for ChannelFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

#[async_trait]
impl ChangeFeed for ChannelFeed {
    async fn subscribe(&self, collection: Collection) -> Result<FeedSubscription> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
            senders.insert(collection, (id, tx));
        }

        let senders = self.senders.clone();
        Ok(FeedSubscription::new(rx, move || {
            let mut senders = senders.lock().unwrap_or_else(|e| e.into_inner());
            // A newer subscription for the same collection stays in place.
            if senders.get(&collection).map(|(current, _)| *current) == Some(id) {
                senders.remove(&collection);
            }
        }))
    }
}

/// Receives classified events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Clone)]
pub enum CollectionDiffer {
    Clients(Arc<ClientDiffer>),
    Proposals(Arc<ProposalDiffer>),
}

impl CollectionDiffer {
    pub fn collection(&self) -> Collection {
        match self {
            CollectionDiffer::Clients(_) => Collection::Clients,
            CollectionDiffer::Proposals(_) => Collection::Proposals,
        }
    }
}

/// Everything one listener task needs to process a notice.
pub struct ListenerContext {
    pub differ: CollectionDiffer,
    pub records: Arc<dyn RecordSource>,
    pub sink: Arc<dyn EventSink>,
    pub actor: SessionUser,
}

impl ListenerContext {
    pub async fn handle(&self, notice: ChangeNotice) -> Result<usize> {
        let ChangeNotice {
            id,
            change,
            payload,
        } = notice;

        let events = match &self.differ {
            CollectionDiffer::Clients(differ) => {
                if change == ChangeType::Removed {
                    differ.forget(&id);
                    return Ok(0);
                }
                let record: ClientRecord = match payload {
                    FeedPayload::Full(raw) => parse_record(&id, raw)?,
                    FeedPayload::Partial => self
                        .records
                        .fetch_client(&id)
                        .await?
                        .ok_or_else(|| EngineError::record(format!("client {id} not found")))?,
                };
                differ.observe(change, record)
            }
            CollectionDiffer::Proposals(differ) => {
                if change == ChangeType::Removed {
                    differ.forget(&id);
                    return Ok(0);
                }
                let record: ProposalRecord = match payload {
                    FeedPayload::Full(raw) => parse_record(&id, raw)?,
                    FeedPayload::Partial => self
                        .records
                        .fetch_proposal(&id)
                        .await?
                        .ok_or_else(|| EngineError::record(format!("proposal {id} not found")))?,
                };
                differ.observe(change, record, Some(&self.actor))
            }
        };

        let count = events.len();
        for event in events {
            debug!(event = %event.kind, entity_id = %event.entity_id, "classified change");
            self.sink.emit(event);
        }
        Ok(count)
    }
}

/// Running listener for one collection.
pub struct ListenerHandle {
    collection: Collection,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Unsubscribe and wait for the task to exit. In-flight dispatches are
    /// not cancelled.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(collection = %self.collection, "listener task panicked");
            }
        }
    }
}

pub fn spawn_listener(feed: Arc<dyn ChangeFeed>, ctx: ListenerContext) -> ListenerHandle {
    let collection = ctx.differ.collection();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(feed, ctx, stop_rx));
    ListenerHandle {
        collection,
        stop: stop_tx,
        task,
    }
}

async fn run(feed: Arc<dyn ChangeFeed>, ctx: ListenerContext, mut stop: watch::Receiver<bool>) {
    let collection = ctx.differ.collection();
    let mut subscription = match feed.subscribe(collection).await {
        Ok(s) => s,
        Err(e) => {
            error!(%collection, error = %e, "failed to subscribe to change feed");
            return;
        }
    };
    info!(%collection, "listening for changes");

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            next = subscription.next() => match next {
                None => {
                    info!(%collection, "change feed closed");
                    break;
                }
                // The feed reconnects on its own; stay subscribed.
                Some(Err(e)) => warn!(%collection, error = %e, "change feed error"),
                Some(Ok(notice)) => {
                    let entity_id = notice.id.clone();
                    if let Err(e) = ctx.handle(notice).await {
                        warn!(%collection, %entity_id, error = %e, "failed to process change");
                    }
                }
            }
        }
    }

    drop(subscription);
    info!(%collection, "listener stopped");
}
