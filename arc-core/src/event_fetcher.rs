//! # Event Fetcher
//!
//! Turns an [`EventSource`] into per-query fetchers with a uniform delivery contract.
//!
//! Every batch, whether from a one-shot [`EventFetcher::get`] or from a
//! [`EventFetcher::watch`] session, passes through the same stages in this order:
//!
//! 1. raw delivery from the source,
//! 2. normalization into a list,
//! 3. argument filtering,
//! 4. duplicate suppression,
//! 5. the optional pre-process hook,
//! 6. delivery to the caller.
//!
//! Duplicate suppression remembers keys per fetcher instance. A `get` followed by a `watch` on
//! the same fetcher therefore never reports the same transaction twice. Keys are remembered
//! only once their batch is delivered without error, so a batch rejected further down (by an
//! entity transform, say) is reported again by the next `get` or live delivery.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, B256};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::debug;

use crate::error::{Error, Result};
use crate::filter::{ArgFilter, FetchOptions};
use crate::ledger::{EventSource, LedgerError, LogDelivery, LogQuery, RawEvent};
use crate::watch::{spawn_watch, WatchSlot};

/// Hook that may rewrite each processed batch (or its error) before delivery.
pub type PreprocessHook = Arc<dyn Fn(Result<Vec<RawEvent>>) -> Result<Vec<RawEvent>> + Send + Sync>;

/// What identifies a duplicate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Deliver everything the source reports.
    Off,
    /// At most one event per transaction hash.
    #[default]
    ByTransaction,
    /// At most one event per (transaction hash, event name, log index).
    ByLogPosition,
}

/// Construction-time options of an [`EventFetcherFactory`].
///
/// | Field            | Default         | Effect                                        |
/// |------------------|-----------------|-----------------------------------------------|
/// | `dedup`          | `ByTransaction` | key used to suppress re-delivery              |
/// | `dedup_capacity` | `None`          | keys remembered before the oldest is evicted |
/// | `preprocess`     | `None`          | rewrites each batch before delivery           |
#[derive(Clone, Default)]
pub struct EventFetcherOptions {
    /// Duplicate suppression policy.
    pub dedup: DedupPolicy,
    /// Upper bound on remembered keys. Unbounded when `None`.
    pub dedup_capacity: Option<usize>,
    /// Batch rewrite hook.
    pub preprocess: Option<PreprocessHook>,
}

impl fmt::Debug for EventFetcherOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFetcherOptions")
            .field("dedup", &self.dedup)
            .field("dedup_capacity", &self.dedup_capacity)
            .field("preprocess", &self.preprocess.is_some())
            .finish()
    }
}

/// Builds fetchers for one event of one contract.
#[derive(Clone)]
pub struct EventFetcherFactory {
    source: Arc<dyn EventSource>,
    address: Address,
    event: String,
    base_filter: ArgFilter,
    options: EventFetcherOptions,
}

impl fmt::Debug for EventFetcherFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFetcherFactory")
            .field("address", &self.address)
            .field("event", &self.event)
            .field("base_filter", &self.base_filter)
            .field("options", &self.options)
            .finish()
    }
}

impl EventFetcherFactory {
    /// Creates a factory for `event` emitted by the contract at `address`.
    pub fn new(source: Arc<dyn EventSource>, address: Address, event: impl Into<String>) -> Self {
        Self {
            source,
            address,
            event: event.into(),
            base_filter: ArgFilter::default(),
            options: EventFetcherOptions::default(),
        }
    }

    /// Replaces the construction-time options.
    pub fn with_options(mut self, options: EventFetcherOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets a filter merged into every fetcher's filter. Its keys take precedence.
    pub fn with_base_filter(mut self, base_filter: ArgFilter) -> Self {
        self.base_filter = base_filter;
        self
    }

    /// Name of the fetched event.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Address of the emitting contract.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Creates a fetcher for logs matching `filter` (merged with the base filter) in `range`.
    pub fn fetcher(&self, filter: ArgFilter, range: FetchOptions) -> EventFetcher {
        let query = LogQuery {
            event: self.event.clone(),
            address: self.address,
            filter: filter.merged_with_base(&self.base_filter),
            range,
        };
        let seen = SeenKeys::new(self.options.dedup_capacity);

        EventFetcher {
            inner: Arc::new(FetcherInner {
                source: Arc::clone(&self.source),
                query,
                options: self.options.clone(),
                seen: Mutex::new(seen),
                watch: WatchSlot::default(),
            }),
        }
    }

    /// Creates a fetcher and immediately starts watching it with `callback`.
    pub fn watching<C>(&self, filter: ArgFilter, callback: C) -> Result<EventFetcher>
    where
        C: FnMut(Result<Vec<RawEvent>>) + Send + 'static,
    {
        let fetcher = self.fetcher(filter, FetchOptions::default());
        fetcher.watch(callback)?;
        Ok(fetcher)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum SeenKey {
    Transaction(B256),
    LogPosition(B256, String, Option<u64>),
}

/// Remembered duplicate keys, oldest first.
#[derive(Debug)]
struct SeenKeys {
    keys: HashSet<SeenKey>,
    order: VecDeque<SeenKey>,
    capacity: Option<usize>,
}

impl SeenKeys {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, key: &SeenKey) -> bool {
        self.keys.contains(key)
    }

    /// Records `key`, returning false when it was already known.
    fn insert(&mut self, key: SeenKey) -> bool {
        if !self.keys.insert(key.clone()) {
            return false;
        }
        if let Some(capacity) = self.capacity {
            self.order.push_back(key);
            while self.order.len() > capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.keys.remove(&oldest);
                }
            }
        }
        true
    }
}

struct FetcherInner {
    source: Arc<dyn EventSource>,
    query: LogQuery,
    options: EventFetcherOptions,
    seen: Mutex<SeenKeys>,
    watch: WatchSlot,
}

impl FetcherInner {
    /// Locks the remembered keys.
    fn seen(&self) -> std::sync::MutexGuard<'_, SeenKeys> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Key of `event` under the configured policy, `None` when dedup is off.
    fn key_of(&self, event: &RawEvent) -> Option<SeenKey> {
        match self.options.dedup {
            DedupPolicy::Off => None,
            DedupPolicy::ByTransaction => Some(SeenKey::Transaction(event.transaction_hash)),
            DedupPolicy::ByLogPosition => Some(SeenKey::LogPosition(
                event.transaction_hash,
                event.event.clone(),
                event.log_index,
            )),
        }
    }

    /// Drops events already delivered or repeated within the batch, collecting the keys of
    /// the survivors into `keys`.
    fn dedup(
        &self,
        events: impl Iterator<Item = RawEvent>,
        keys: &mut Vec<SeenKey>,
    ) -> Vec<RawEvent> {
        let seen = self.seen();
        let mut in_batch = HashSet::new();
        events
            .filter(|event| {
                let Some(key) = self.key_of(event) else {
                    return true;
                };
                if !seen.contains(&key) && in_batch.insert(key.clone()) {
                    keys.push(key);
                    return true;
                }
                debug!(
                    "Dropping duplicate {} from tx {}",
                    event.event, event.transaction_hash
                );
                false
            })
            .collect()
    }
}

/// Duplicate keys of a processed batch, not yet remembered by their fetcher.
pub(crate) struct PendingKeys {
    inner: Arc<FetcherInner>,
    keys: Vec<SeenKey>,
}

impl PendingKeys {
    /// Remembers the keys, suppressing their events from now on.
    pub(crate) fn commit(self) {
        let mut seen = self.inner.seen();
        for key in self.keys {
            seen.insert(key);
        }
    }
}

/// A processed batch and the keys to remember once it is delivered.
pub(crate) type Pending<T> = (Result<Vec<T>>, PendingKeys);

/// Live stream of pending event batches.
pub(crate) type PendingStream = BoxStream<'static, Pending<RawEvent>>;

/// Commits the keys of a successful batch and returns its outcome.
pub(crate) fn settle<T>((result, keys): Pending<T>) -> Result<Vec<T>> {
    if result.is_ok() {
        keys.commit();
    }
    result
}

/// A fetcher bound to one query.
///
/// Clones share the query, the duplicate keys and the watch session.
#[derive(Clone)]
pub struct EventFetcher {
    inner: Arc<FetcherInner>,
}

impl fmt::Debug for EventFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFetcher")
            .field("query", &self.inner.query)
            .field("watching", &self.inner.watch.is_watching())
            .finish()
    }
}

impl EventFetcher {
    /// The resolved query.
    pub fn query(&self) -> &LogQuery {
        &self.inner.query
    }

    /// Normalizes, filters and deduplicates one delivery, then runs the pre-process hook.
    fn process(&self, delivery: Result<LogDelivery, LedgerError>) -> Pending<RawEvent> {
        let mut keys = Vec::new();
        let batch = delivery.map_err(Error::from).map(|delivery| {
            let events = delivery
                .into_vec()
                .into_iter()
                .filter(|event| self.inner.query.filter.matches(&event.args));
            self.inner.dedup(events, &mut keys)
        });

        let batch = match &self.inner.options.preprocess {
            Some(hook) => hook(batch),
            None => batch,
        };
        let keys = PendingKeys {
            inner: Arc::clone(&self.inner),
            keys,
        };
        (batch, keys)
    }

    /// Fetches the configured range without remembering what it returned.
    pub(crate) async fn fetch_pending(&self) -> Pending<RawEvent> {
        let delivery = self.inner.source.get_logs(&self.inner.query).await;
        self.process(delivery)
    }

    /// Fetches all matching logs in the configured range.
    ///
    /// A source error fails the whole call; nothing partial is returned.
    pub async fn get(&self) -> Result<Vec<RawEvent>> {
        settle(self.fetch_pending().await)
    }

    /// Like [`EventFetcher::get`], also handing the outcome to `callback`.
    pub async fn get_with<C>(&self, callback: C) -> Result<Vec<RawEvent>>
    where
        C: FnOnce(&Result<Vec<RawEvent>>),
    {
        let result = self.get().await;
        callback(&result);
        result
    }

    /// Opens the live stream of processed batches.
    pub(crate) async fn open_pending(&self) -> Result<PendingStream> {
        let stream = self.inner.source.watch_logs(&self.inner.query).await?;
        let fetcher = self.clone();
        Ok(stream.map(move |delivery| fetcher.process(delivery)).boxed())
    }

    /// Label used in log lines.
    pub(crate) fn label(&self) -> String {
        format!("{}@{}", self.inner.query.event, self.inner.query.address)
    }

    /// Starts delivering live batches to `callback` until [`EventFetcher::stop_watching`].
    ///
    /// Source errors are handed to the callback and the session continues.
    pub fn watch<C>(&self, callback: C) -> Result<()>
    where
        C: FnMut(Result<Vec<RawEvent>>) + Send + 'static,
    {
        let session = self.inner.watch.start()?;
        let fetcher = self.clone();
        spawn_watch(
            self.label(),
            session,
            async move { fetcher.open_pending().await },
            std::future::ready,
            callback,
        );
        Ok(())
    }

    /// Stops the watch session. Safe to call repeatedly or when not watching.
    pub fn stop_watching(&self) {
        self.inner.watch.stop();
    }

    /// Whether a watch session is running.
    pub fn is_watching(&self) -> bool {
        self.inner.watch.is_watching()
    }
}
