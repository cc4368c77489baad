//! Watch sessions shared by event and entity fetchers.
//!
//! A session is a spawned task that pulls batches from a live log stream, post-processes
//! them and hands the result to a callback. [`WatchSlot`] owns the stop signal of the one
//! session a fetcher may run at a time.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::event_fetcher::{Pending, PendingStream};
use crate::ledger::RawEvent;

/// Stop signal of one session. `true` once the session is stopped or has ended.
pub(crate) type Session = Arc<watch::Sender<bool>>;

/// Holds the stop signal of a fetcher's current watch session.
///
/// A session runs until [`WatchSlot::stop`] or until its task ends on its own, after which the
/// slot is free again. Dropping the caller's fetcher handles does not end it.
#[derive(Debug, Default)]
pub(crate) struct WatchSlot {
    active: Mutex<Option<Session>>,
}

impl WatchSlot {
    /// Starts a new session, failing if one is running.
    pub(crate) fn start(&self) -> Result<Session> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().is_some_and(|tx| !*tx.borrow()) {
            return Err(Error::AlreadyWatching);
        }
        let session = Arc::new(watch::channel(false).0);
        *active = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Signals the running session to stop. Safe to call any number of times.
    pub(crate) fn stop(&self) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = active.as_ref() {
            tx.send_replace(true);
        }
    }

    /// Whether a session is currently running.
    pub(crate) fn is_watching(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.as_ref().is_some_and(|tx| !*tx.borrow())
    }
}

/// Marks its session ended when the session task returns or unwinds.
struct SessionEnd(Session);

impl Drop for SessionEnd {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// Resolves once the session is told to stop.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Spawns a watch session.
///
/// `open` produces the stream of pending batches; `process` finishes each one into the values
/// handed to `callback`. Errors from either are delivered to the callback and the session keeps
/// running. A batch's duplicate keys are committed only when it is delivered without error.
/// The stop flag is checked after processing, so a batch whose processing was already under
/// way when the session stopped is dropped.
pub(crate) fn spawn_watch<T, O, P, PF, C>(
    label: String,
    session: Session,
    open: O,
    process: P,
    mut callback: C,
) where
    T: Send + 'static,
    O: Future<Output = Result<PendingStream>> + Send + 'static,
    P: Fn(Pending<RawEvent>) -> PF + Send + 'static,
    PF: Future<Output = Pending<T>> + Send + 'static,
    C: FnMut(Result<Vec<T>>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut stop = session.subscribe();
        let _end = SessionEnd(session);
        info!("Starting watch on {label}");

        let opened = tokio::select! {
            _ = stopped(&mut stop) => None,
            opened = open => Some(opened),
        };
        let mut batches = match opened {
            Some(Ok(batches)) => batches,
            Some(Err(e)) => {
                warn!("Failed to open watch on {label}: {e}");
                if !*stop.borrow() {
                    callback(Err(e));
                }
                return;
            }
            None => {
                info!("Watch on {label} stopped before it opened");
                return;
            }
        };

        loop {
            let next = tokio::select! {
                _ = stopped(&mut stop) => break,
                next = batches.next() => next,
            };
            let Some(pending) = next else {
                debug!("Log stream for {label} ended");
                break;
            };

            let (result, keys) = process(pending).await;
            if let Err(e) = &result {
                warn!("Watch on {label} delivered an error: {e}");
            }

            if *stop.borrow() {
                break;
            }
            if result.is_ok() {
                keys.commit();
            }
            callback(result);
        }

        info!("Watch on {label} ended");
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;

    #[test]
    fn slot_allows_one_session_at_a_time() {
        let slot = WatchSlot::default();
        let session = slot.start().unwrap();
        assert!(slot.is_watching());
        assert!(matches!(slot.start(), Err(Error::AlreadyWatching)));

        slot.stop();
        slot.stop();
        assert!(*session.borrow());
        assert!(!slot.is_watching());

        let session = slot.start().unwrap();
        assert!(!*session.borrow());
    }

    #[tokio::test]
    async fn session_whose_stream_ends_frees_the_slot() {
        let slot = WatchSlot::default();
        let session = slot.start().unwrap();
        let batches: PendingStream = futures::stream::empty().boxed();
        spawn_watch(
            "ended".to_string(),
            session,
            async move { Ok::<_, Error>(batches) },
            std::future::ready,
            |_: Result<Vec<RawEvent>>| {},
        );

        timeout(Duration::from_secs(1), async {
            while slot.is_watching() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(slot.start().is_ok());
    }

    #[test]
    fn stop_without_session_is_a_no_op() {
        let slot = WatchSlot::default();
        slot.stop();
        assert!(!slot.is_watching());
    }
}
