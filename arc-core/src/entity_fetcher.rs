//! # Entity Fetcher
//!
//! Layers an asynchronous transform over an [`EventFetcher`]. Each processed event batch is
//! transformed concurrently; the batch resolves in input order once every transform has
//! finished, with excluded events (transform returned `None`) dropped.
//!
//! A single failing transform fails its whole batch. Its events are not marked as seen, so the
//! next `get` or live delivery of them is transformed again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use log::debug;

use crate::error::Result;
use crate::event_fetcher::{settle, EventFetcher, EventFetcherFactory, Pending};
use crate::filter::{ArgFilter, FetchOptions};
use crate::ledger::RawEvent;
use crate::watch::{spawn_watch, WatchSlot};

/// Asynchronous mapping from `I` to an optional `O`. `None` excludes the input.
pub type Transform<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<Option<O>>> + Send + Sync>;

/// Wraps an async closure into a [`Transform`].
pub fn transform<I, O, F, Fut>(f: F) -> Transform<I, O>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<O>>> + Send + 'static,
{
    Arc::new(move |input| f(input).boxed())
}

/// Applies `transform` to every item concurrently, preserving order and dropping exclusions.
async fn apply<I, O>(transform: &Transform<I, O>, items: Vec<I>) -> Result<Vec<O>> {
    let total = items.len();
    let results = try_join_all(items.into_iter().map(|item| transform(item))).await?;
    let entities: Vec<O> = results.into_iter().flatten().collect();
    if entities.len() < total {
        debug!("Transform excluded {} of {total} items", total - entities.len());
    }
    Ok(entities)
}

/// Transforms a pending event batch, keeping its duplicate keys for the caller to settle.
async fn apply_pending<O>(
    transform: &Transform<RawEvent, O>,
    pending: Pending<RawEvent>,
) -> Pending<O> {
    let (events, keys) = pending;
    let entities = match events {
        Ok(events) => apply(transform, events).await,
        Err(e) => Err(e),
    };
    (entities, keys)
}

/// Builds [`EntityFetcher`]s from an event factory and a transform.
pub struct EntityFetcherFactory<T> {
    events: EventFetcherFactory,
    transform: Transform<RawEvent, T>,
    base_filter: ArgFilter,
}

impl<T> Clone for EntityFetcherFactory<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            transform: Arc::clone(&self.transform),
            base_filter: self.base_filter.clone(),
        }
    }
}

impl<T> fmt::Debug for EntityFetcherFactory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityFetcherFactory")
            .field("events", &self.events)
            .field("base_filter", &self.base_filter)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> EntityFetcherFactory<T> {
    /// Creates a factory that maps every event from `events` through `transform`.
    pub fn new(events: EventFetcherFactory, transform: Transform<RawEvent, T>) -> Self {
        Self {
            events,
            transform,
            base_filter: ArgFilter::default(),
        }
    }

    /// Sets a filter merged into every fetcher's filter, on top of the event factory's own
    /// base filter. Its keys take precedence over the caller's.
    pub fn with_base_filter(mut self, base_filter: ArgFilter) -> Self {
        self.base_filter = base_filter;
        self
    }

    /// The underlying event factory.
    pub fn events(&self) -> &EventFetcherFactory {
        &self.events
    }

    /// Creates a fetcher for entities whose events match `filter` in `range`.
    pub fn fetcher(&self, filter: ArgFilter, range: FetchOptions) -> EntityFetcher<T> {
        let filter = filter.merged_with_base(&self.base_filter);
        EntityFetcher {
            events: self.events.fetcher(filter, range),
            transform: Arc::clone(&self.transform),
            watch: Arc::new(WatchSlot::default()),
        }
    }

    /// Creates a fetcher and immediately starts watching it with `callback`.
    pub fn watching<C>(&self, filter: ArgFilter, callback: C) -> Result<EntityFetcher<T>>
    where
        C: FnMut(Result<Vec<T>>) + Send + 'static,
    {
        let fetcher = self.fetcher(filter, FetchOptions::default());
        fetcher.watch(callback)?;
        Ok(fetcher)
    }

    /// Chains a further transform. An event excluded at either stage is excluded overall.
    pub fn pipe<U: Send + 'static>(&self, next: Transform<T, U>) -> EntityFetcherFactory<U> {
        let first = Arc::clone(&self.transform);
        let composed: Transform<RawEvent, U> = Arc::new(move |event| {
            let first = Arc::clone(&first);
            let next = Arc::clone(&next);
            async move {
                match first(event).await? {
                    Some(entity) => next(entity).await,
                    None => Ok(None),
                }
            }
            .boxed()
        });

        EntityFetcherFactory {
            events: self.events.clone(),
            transform: composed,
            base_filter: self.base_filter.clone(),
        }
    }
}

/// A fetcher of transformed entities bound to one query.
///
/// Clones share the underlying event fetcher and the watch session.
pub struct EntityFetcher<T> {
    events: EventFetcher,
    transform: Transform<RawEvent, T>,
    watch: Arc<WatchSlot>,
}

impl<T> Clone for EntityFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            transform: Arc::clone(&self.transform),
            watch: Arc::clone(&self.watch),
        }
    }
}

impl<T> fmt::Debug for EntityFetcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityFetcher")
            .field("events", &self.events)
            .field("watching", &self.watch.is_watching())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> EntityFetcher<T> {
    /// The underlying event fetcher.
    pub fn events(&self) -> &EventFetcher {
        &self.events
    }

    /// Fetches and transforms all matching events in the configured range.
    pub async fn get(&self) -> Result<Vec<T>> {
        let pending = self.events.fetch_pending().await;
        settle(apply_pending(&self.transform, pending).await)
    }

    /// Like [`EntityFetcher::get`], also handing the outcome to `callback`.
    pub async fn get_with<C>(&self, callback: C) -> Result<Vec<T>>
    where
        C: FnOnce(&Result<Vec<T>>),
    {
        let result = self.get().await;
        callback(&result);
        result
    }

    /// Starts delivering transformed live batches to `callback` until
    /// [`EntityFetcher::stop_watching`].
    ///
    /// A batch is delivered only after all of its transforms have finished. Source and
    /// transform errors are handed to the callback and the session continues.
    pub fn watch<C>(&self, callback: C) -> Result<()>
    where
        C: FnMut(Result<Vec<T>>) + Send + 'static,
    {
        let session = self.watch.start()?;
        let events = self.events.clone();
        let transform = Arc::clone(&self.transform);
        spawn_watch(
            events.label(),
            session,
            async move { events.open_pending().await },
            move |pending| {
                let transform = Arc::clone(&transform);
                async move { apply_pending(&transform, pending).await }
            },
            callback,
        );
        Ok(())
    }

    /// Stops the watch session. Safe to call repeatedly or when not watching.
    pub fn stop_watching(&self) {
        self.watch.stop();
    }

    /// Whether a watch session is running.
    pub fn is_watching(&self) -> bool {
        self.watch.is_watching()
    }
}
