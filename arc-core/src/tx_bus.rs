//! # Transaction Correlation Bus
//!
//! A logical operation such as "create a proposal" may need several transactions. The bus
//! lets the code issuing them announce up front how many will follow (the kick-off), then
//! announce each one as it is mined, all under one [`InvocationKey`].
//!
//! ## Topics
//! Topics are dot-separated. A subscription to `txReceipts.Scheme` receives publications to
//! `txReceipts.Scheme` and `txReceipts.Scheme.method`, but not to `txReceipts.SchemeOther`.
//!
//! ## Re-publishing
//! A composite operation can surface the transactions of the helpers it calls under its own
//! topic and invocation key with [`TxBus::re_publish`], without the helpers knowing about it.
//! Envelopes already carrying the composite's invocation key are not forwarded again, so the
//! source topics may include the composite's own topic or one of its ancestors.
//!
//! ## Delivery
//! Publishing is synchronous: every subscriber registered when `publish_*` is called runs
//! before it returns. Nothing is buffered for later subscribers. Callbacks may subscribe and
//! unsubscribe from within a delivery; the registry lock is never held while a callback runs.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::debug;
use serde::Serialize;

use crate::ledger::TxReceipt;

/// Root of the topics used by this crate's own transaction publishers.
pub const TX_TOPIC_ROOT: &str = "txReceipts";

/// Opaque token correlating every envelope of one logical operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct InvocationKey(u128);

impl InvocationKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// One notification on the bus.
///
/// An invocation publishes its kick-off first, then one envelope per mined transaction. When
/// a transaction fails to submit, the invocation stops there and fewer than `tx_count`
/// transaction envelopes follow the kick-off.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TxEventEnvelope {
    /// Key shared by all envelopes of the invocation.
    pub invocation_key: InvocationKey,
    /// The caller's parameters after defaults were applied.
    pub options: serde_json::Value,
    /// The mined transaction, or `None` for the kick-off.
    pub tx: Option<TxReceipt>,
    /// Number of transactions the invocation will publish. Fixed at kick-off.
    pub tx_count: usize,
}

impl TxEventEnvelope {
    /// Whether this is the kick-off announcement.
    pub fn is_kickoff(&self) -> bool {
        self.tx.is_none()
    }
}

/// Callback invoked with the published topic and the envelope.
pub type TxCallback = Arc<dyn Fn(&str, &TxEventEnvelope) + Send + Sync>;

struct Registration {
    id: u64,
    topics: Vec<String>,
    callback: TxCallback,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    registrations: Vec<Registration>,
}

/// A snapshot of one registration taken at publish time.
type Target = (TxCallback, Arc<AtomicBool>);

/// Runs the still-active callbacks of `targets`, returning whether any ran.
fn deliver(targets: Vec<Target>, topic: &str, envelope: &TxEventEnvelope) -> bool {
    let mut delivered = false;
    for (callback, active) in targets {
        // A callback earlier in this delivery may have removed a later one.
        if active.load(Ordering::Acquire) {
            callback(topic, envelope);
            delivered = true;
        }
    }
    delivered
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Returns true when a subscription to `subscribed` receives publications to `published`.
pub fn topic_matches(subscribed: &str, published: &str) -> bool {
    match published.strip_prefix(subscribed) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

/// Publish/subscribe registry for transaction progress.
///
/// Cloning yields another handle to the same registry. Independent buses are independent
/// registries, so tests and embedders can construct as many as they need.
#[derive(Clone, Default)]
pub struct TxBus {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for TxBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.registry);
        f.debug_struct("TxBus")
            .field("registrations", &registry.registrations.len())
            .finish()
    }
}

impl TxBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every topic in `topics`.
    ///
    /// The registration lives until [`TxSubscription::unsubscribe`], [`TxBus::unsubscribe_topic`]
    /// or [`TxBus::clear`]; dropping the returned handle does not remove it.
    pub fn subscribe<I, S, F>(&self, topics: I, callback: F) -> TxSubscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&str, &TxEventEnvelope) + Send + Sync + 'static,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let active = Arc::new(AtomicBool::new(true));

        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        debug!("Subscribing #{id} to {topics:?}");
        registry.registrations.push(Registration {
            id,
            topics,
            callback: Arc::new(callback),
            active: Arc::clone(&active),
        });

        TxSubscription {
            id,
            registry: Arc::downgrade(&self.registry),
            active,
        }
    }

    /// Delivers `envelope` to every subscriber of `topic` or one of its ancestors.
    ///
    /// Returns whether any subscriber existed.
    pub fn publish(&self, topic: &str, envelope: &TxEventEnvelope) -> bool {
        let targets: Vec<Target> = lock(&self.registry)
            .registrations
            .iter()
            .filter(|r| r.topics.iter().any(|t| topic_matches(t, topic)))
            .map(|r| (Arc::clone(&r.callback), Arc::clone(&r.active)))
            .collect();

        let delivered = deliver(targets, topic, envelope);
        if !delivered {
            debug!("No subscribers for {topic}");
        }
        delivered
    }

    /// Announces an invocation that will publish `tx_count` transactions.
    ///
    /// Always returns the kick-off envelope so its key and options can be reused for the
    /// per-transaction publications, even when `suppress_kickoff` kept it off the bus.
    pub fn publish_kickoff(
        &self,
        topic: &str,
        options: serde_json::Value,
        tx_count: usize,
        suppress_kickoff: bool,
    ) -> TxEventEnvelope {
        let envelope = TxEventEnvelope {
            invocation_key: InvocationKey::generate(),
            options,
            tx: None,
            tx_count,
        };
        if !suppress_kickoff {
            self.publish(topic, &envelope);
        }
        envelope
    }

    /// Publishes a copy of `envelope` carrying `receipt`.
    ///
    /// Returns whether any subscriber existed.
    pub fn publish_transaction(
        &self,
        topic: &str,
        envelope: &TxEventEnvelope,
        receipt: TxReceipt,
    ) -> bool {
        let envelope = TxEventEnvelope {
            tx: Some(receipt),
            ..envelope.clone()
        };
        self.publish(topic, &envelope)
    }

    /// Kicks off an invocation and returns a context for its transaction publications.
    pub fn begin(
        &self,
        topic: impl Into<String>,
        options: serde_json::Value,
        tx_count: usize,
        suppress_kickoff: bool,
    ) -> TxEventContext {
        let topic = topic.into();
        let envelope = self.publish_kickoff(&topic, options, tx_count, suppress_kickoff);
        TxEventContext {
            bus: self.clone(),
            topic,
            envelope,
        }
    }

    /// Forwards every transaction published under `source_topics` to `super_topic`, carrying
    /// `super_envelope`'s key, options and count instead of the source's.
    ///
    /// Kick-offs on the source topics are not forwarded, nor are envelopes that already carry
    /// `super_envelope`'s invocation key. Unsubscribing the returned handle ends the forwarding.
    pub fn re_publish<I, S>(
        &self,
        source_topics: I,
        super_topic: impl Into<String>,
        super_envelope: TxEventEnvelope,
    ) -> TxSubscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let super_topic = super_topic.into();
        let registry = Arc::downgrade(&self.registry);

        self.subscribe(source_topics, move |source_topic, envelope| {
            if envelope.invocation_key == super_envelope.invocation_key {
                return;
            }
            let (Some(tx), Some(registry)) = (&envelope.tx, registry.upgrade()) else {
                return;
            };
            debug!(
                "Re-publishing {} from {source_topic} to {super_topic}",
                tx.transaction_hash
            );
            TxBus { registry }.publish_transaction(&super_topic, &super_envelope, tx.clone());
        })
    }

    /// Removes `topic` and its descendants from every registration.
    ///
    /// Registrations left without topics are removed. Returns whether anything was removed.
    pub fn unsubscribe_topic(&self, topic: &str) -> bool {
        let mut registry = lock(&self.registry);
        let mut removed = false;

        for registration in registry.registrations.iter_mut() {
            let before = registration.topics.len();
            registration.topics.retain(|t| !topic_matches(topic, t));
            removed |= registration.topics.len() != before;
            if registration.topics.is_empty() {
                registration.active.store(false, Ordering::Release);
            }
        }
        registry.registrations.retain(|r| !r.topics.is_empty());
        removed
    }

    /// Removes every registration.
    pub fn clear(&self) {
        let mut registry = lock(&self.registry);
        for registration in registry.registrations.drain(..) {
            registration.active.store(false, Ordering::Release);
        }
    }

    /// Number of registrations a publication to `topic` would reach.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.registry)
            .registrations
            .iter()
            .filter(|r| r.topics.iter().any(|t| topic_matches(t, topic)))
            .count()
    }
}

/// Handle to one registration on a [`TxBus`].
#[derive(Debug)]
pub struct TxSubscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
    active: Arc<AtomicBool>,
}

impl TxSubscription {
    /// Removes the registration. Safe to call more than once.
    ///
    /// No delivery starts after this returns, including the remainder of a publication
    /// currently in progress.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).registrations.retain(|r| r.id != self.id);
        }
    }

    /// Whether the registration is still live.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// A kicked-off invocation: the topic and envelope its transactions are published with.
#[derive(Clone, Debug)]
pub struct TxEventContext {
    bus: TxBus,
    topic: String,
    envelope: TxEventEnvelope,
}

impl TxEventContext {
    /// The invocation's topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The kick-off envelope.
    pub fn envelope(&self) -> &TxEventEnvelope {
        &self.envelope
    }

    /// Publishes one mined transaction of the invocation.
    pub fn publish_tx(&self, receipt: TxReceipt) -> bool {
        self.bus
            .publish_transaction(&self.topic, &self.envelope, receipt)
    }

    /// Surfaces transactions published by helpers under `source_topics` as this invocation's.
    pub fn re_publish_from<I, S>(&self, source_topics: I) -> TxSubscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bus
            .re_publish(source_topics, self.topic.clone(), self.envelope.clone())
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::B256;
    use serde_json::json;

    use super::*;

    fn receipt(n: u8) -> TxReceipt {
        TxReceipt {
            transaction_hash: B256::repeat_byte(n),
            block_number: Some(n as u64),
            success: true,
        }
    }

    fn collector(bus: &TxBus, topic: &str) -> (TxSubscription, Arc<Mutex<Vec<TxEventEnvelope>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = bus.subscribe([topic], move |_, envelope| {
            sink.lock().unwrap().push(envelope.clone());
        });
        (subscription, seen)
    }

    #[test]
    fn kickoff_then_each_transaction() {
        let bus = TxBus::new();
        let (_sub, seen) = collector(&bus, "txReceipts.Scheme");

        let envelope = bus.publish_kickoff("txReceipts.Scheme.propose", json!({"a": 1}), 3, false);
        for n in 1..=3 {
            assert!(bus.publish_transaction("txReceipts.Scheme.propose", &envelope, receipt(n)));
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen[0].is_kickoff());
        assert!(seen[1..].iter().all(|e| e.tx.is_some()));
        assert!(seen
            .iter()
            .all(|e| e.invocation_key == envelope.invocation_key && e.tx_count == 3));
        assert_eq!(seen[3].tx, Some(receipt(3)));
    }

    #[test]
    fn suppressed_kickoff_still_returns_envelope() {
        let bus = TxBus::new();
        let (_sub, seen) = collector(&bus, "txReceipts");

        let envelope = bus.publish_kickoff("txReceipts.x", json!({}), 1, true);
        assert!(seen.lock().unwrap().is_empty());

        bus.publish_transaction("txReceipts.x", &envelope, receipt(1));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn hierarchical_topic_matching() {
        assert!(topic_matches("txReceipts.Scheme", "txReceipts.Scheme"));
        assert!(topic_matches("txReceipts.Scheme", "txReceipts.Scheme.method"));
        assert!(!topic_matches("txReceipts.Scheme", "txReceipts.SchemeOther"));
        assert!(!topic_matches("txReceipts.Scheme", "txReceiptsScheme"));
        assert!(!topic_matches("txReceipts.Scheme", "txReceipts"));

        let bus = TxBus::new();
        let (_sub, seen) = collector(&bus, "txReceipts.Scheme");
        let envelope = bus.publish_kickoff("unrelated", json!(null), 1, true);
        for topic in [
            "txReceipts.Scheme.method",
            "txReceipts.Scheme",
            "txReceipts.SchemeOther",
            "txReceiptsScheme",
        ] {
            bus.publish_transaction(topic, &envelope, receipt(1));
        }
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = TxBus::new();
        let envelope = bus.publish_kickoff("nobody", json!(null), 1, false);
        assert!(!bus.publish_transaction("nobody", &envelope, receipt(1)));
    }

    #[test]
    fn re_publish_uses_outer_envelope() {
        let bus = TxBus::new();
        let (_sub, outer_seen) = collector(&bus, "outer");

        let outer = bus.begin("outer", json!({"op": "createDao"}), 2, true);
        let _bridge = outer.re_publish_from(["inner.a"]);

        let inner = bus.publish_kickoff("inner.a", json!({"op": "forge"}), 2, false);
        bus.publish_transaction("inner.a", &inner, receipt(1));
        bus.publish_transaction("inner.a", &inner, receipt(2));

        let seen = outer_seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        for envelope in seen.iter() {
            assert_eq!(envelope.invocation_key, outer.envelope().invocation_key);
            assert_eq!(envelope.options, json!({"op": "createDao"}));
            assert_eq!(envelope.tx_count, 2);
        }
        assert_eq!(seen[0].tx, Some(receipt(1)));
        assert_eq!(seen[1].tx, Some(receipt(2)));
    }

    #[test]
    fn re_publish_into_a_source_descendant_forwards_once() {
        let bus = TxBus::new();
        let (_sub, outer_seen) = collector(&bus, "txReceipts.DAO.new");

        let outer = bus.begin("txReceipts.DAO.new", json!({"op": "createDao"}), 1, true);
        let _bridge = outer.re_publish_from(["txReceipts"]);

        let inner = bus.publish_kickoff("txReceipts.Forge", json!({}), 1, true);
        assert!(bus.publish_transaction("txReceipts.Forge", &inner, receipt(1)));

        let seen = outer_seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].invocation_key, outer.envelope().invocation_key);
        assert_eq!(seen[0].tx, Some(receipt(1)));
    }

    #[test]
    fn only_callbacks_that_ran_count_as_delivered() {
        let bus = TxBus::new();
        let envelope = bus.publish_kickoff("t", json!(null), 1, true);
        let runs = Arc::new(Mutex::new(0usize));
        let target = |active: bool| -> Target {
            let runs = Arc::clone(&runs);
            let callback: TxCallback =
                Arc::new(move |_: &str, _: &TxEventEnvelope| *runs.lock().unwrap() += 1);
            (callback, Arc::new(AtomicBool::new(active)))
        };

        assert!(!deliver(vec![target(false), target(false)], "t", &envelope));
        assert_eq!(*runs.lock().unwrap(), 0);
        assert!(deliver(vec![target(false), target(true)], "t", &envelope));
        assert_eq!(*runs.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = TxBus::new();
        let (sub, seen) = collector(&bus, "t");
        let envelope = bus.publish_kickoff("t", json!(null), 1, false);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert!(!bus.publish_transaction("t", &envelope, receipt(1)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn callbacks_may_mutate_the_registry() {
        let bus = TxBus::new();
        let later = Arc::new(Mutex::new(None::<TxSubscription>));
        let count = Arc::new(Mutex::new(0usize));

        let first = {
            let inner_bus = bus.clone();
            let later = Arc::clone(&later);
            bus.subscribe(["t"], move |_, _| {
                if let Some(sub) = later.lock().unwrap().take() {
                    sub.unsubscribe();
                }
                inner_bus.subscribe(["t.nested"], |_, _| {});
            })
        };
        let second = {
            let count = Arc::clone(&count);
            bus.subscribe(["t"], move |_, _| *count.lock().unwrap() += 1)
        };
        *later.lock().unwrap() = Some(second);

        let envelope = bus.publish_kickoff("t", json!(null), 1, false);
        assert_eq!(*count.lock().unwrap(), 0);
        assert_eq!(bus.subscriber_count("t.nested"), 2);

        first.unsubscribe();
        bus.publish_transaction("t", &envelope, receipt(1));
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn topic_removal_drops_descendants() {
        let bus = TxBus::new();
        let multi = bus.subscribe(["a.b", "c"], |_, _| {});
        let (only_ab, _) = collector(&bus, "a.b.c");

        assert!(bus.unsubscribe_topic("a.b"));
        assert!(!only_ab.is_active());
        assert!(multi.is_active());
        assert_eq!(bus.subscriber_count("a.b"), 0);
        assert_eq!(bus.subscriber_count("c"), 1);

        bus.clear();
        assert!(!multi.is_active());
        assert_eq!(bus.subscriber_count("c"), 0);
    }
}
