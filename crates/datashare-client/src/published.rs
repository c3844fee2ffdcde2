//! Published data subscriptions.
//!
//! Keys are `(data uri, subscriber id)`. Unlike rdb changes, one published
//! event carries items for many keys, so delivery is grouped per observer:
//! each observer gets a single node holding every item it subscribed to.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use datashare_proto::{OperationResult, PublishedDataChangeNode, PublishedDataItem};

use crate::bridge::{call_grouped, log_failures, PublishedDataSubscriptionService};
use crate::cache::ChangeCache;
use crate::key::{keys_for, SubscriptionKey};
use crate::observer::{ObserverId, PublishedDataObserver};
use crate::registry::{KeyState, SubscriptionRegistry};
use crate::stub::PublishedDataObserverStub;

type PublishedKey = SubscriptionKey<i64>;

/// Per-observer accumulator for one delivery.
type Deliveries = BTreeMap<ObserverId, (Arc<PublishedDataObserver>, Vec<PublishedDataItem>)>;

struct Inner {
    registry: SubscriptionRegistry<i64, PublishedDataChangeNode>,
    // Each entry holds the owner and the single latest item for its key
    cache: ChangeCache<PublishedKey, PublishedDataChangeNode>,
    stub: Mutex<Option<Arc<PublishedDataObserverStub>>>,
}

impl Inner {
    fn stub(self: &Arc<Self>) -> Arc<PublishedDataObserverStub> {
        let mut stub = self.stub.lock();
        if let Some(stub) = stub.as_ref() {
            return stub.clone();
        }

        tracing::info!("creating published data observer stub");
        let weak: Weak<Inner> = Arc::downgrade(self);
        let created = PublishedDataObserverStub::new(move |node: &PublishedDataChangeNode| {
            if let Some(inner) = weak.upgrade() {
                inner.emit(node);
            }
        });
        *stub = Some(created.clone());
        created
    }

    fn release(&self, keys: &[PublishedKey]) {
        for key in keys {
            self.cache.erase(key);
        }
        if !self.registry.is_empty() {
            return;
        }
        if let Some(stub) = self.stub.lock().take() {
            tracing::info!("no published data observers left, releasing stub");
            stub.clear_callback();
        }
    }

    /// Aggregate the cached items of `keys` into one node.
    fn cached_node<'a>(&self, keys: impl IntoIterator<Item = &'a PublishedKey>) -> Option<PublishedDataChangeNode> {
        let mut owner = None;
        let mut datas = Vec::new();
        for key in keys {
            if let Some(cached) = self.cache.get(key) {
                datas.extend(cached.datas);
                owner = Some(cached.owner_bundle_name);
            }
        }
        owner.map(|owner| PublishedDataChangeNode::new(owner, datas))
    }

    fn replay(&self, keys: &[PublishedKey], observer: &Arc<PublishedDataObserver>) {
        if let Some(node) = self.cached_node(keys) {
            tracing::debug!(observer = %observer.id(), items = node.datas.len(), "replaying cached items");
            observer.on_change(&node);
        }
    }

    fn emit(&self, node: &PublishedDataChangeNode) {
        let mut deliveries = Deliveries::new();
        for item in &node.datas {
            let key = SubscriptionKey::new(item.key.clone(), item.subscriber_id);
            let latest = PublishedDataChangeNode::new(node.owner_bundle_name.clone(), vec![item.clone()]);
            if self
                .registry
                .if_registered(&key, || self.cache.put(key.clone(), latest))
                .is_none()
            {
                tracing::debug!(key = %key, "published item for unregistered key dropped");
                continue;
            }

            let observers = self.registry.enabled_observers(&key);
            if observers.is_empty() {
                tracing::warn!(key = %key, "nobody subscribed to published item, not notified");
            }
            for observer in observers {
                deliveries
                    .entry(observer.id())
                    .or_insert_with(|| (observer.clone(), Vec::new()))
                    .1
                    .push(item.clone());
            }
            self.registry.mark_notify_on_enabled(&key);
        }

        for (observer, datas) in deliveries.into_values() {
            observer.on_change(&PublishedDataChangeNode::new(
                node.owner_bundle_name.clone(),
                datas,
            ));
        }
    }
}

/// Observers of published data, multiplexed over one remote subscription
/// per `(uri, subscriber id)` key.
pub struct PublishedDataSubscriptions {
    inner: Arc<Inner>,
}

impl PublishedDataSubscriptions {
    /// Create an empty subscription set.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: SubscriptionRegistry::new(),
                cache: ChangeCache::new(),
                stub: Mutex::new(None),
            }),
        }
    }

    /// Register `observer` for `uris` under `subscriber_id`.
    ///
    /// Cached items of every key joined locally are handed to the observer
    /// as one node.
    pub fn add_observers<S>(
        &self,
        service: &S,
        uris: &[String],
        subscriber_id: i64,
        observer: &Arc<PublishedDataObserver>,
    ) -> Vec<OperationResult>
    where
        S: PublishedDataSubscriptionService + ?Sized,
    {
        let keys = keys_for(uris, &subscriber_id);
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let outcome = inner.registry.add_observers(
                &keys,
                observer,
                |joined, observer| inner.replay(joined, observer),
                |first| {
                    let stub = inner.stub();
                    call_grouped(first, |subscriber_id, uris| {
                        service.subscribe_published_data(uris, *subscriber_id, stub.clone())
                    })
                },
            );
            inner.release(&outcome.released);
            outcome.results
        })
    }

    /// Remove `observer` (or every observer) from `uris`.
    ///
    /// With no uris, `observer` is removed from every key it is registered on.
    pub fn del_observers<S>(
        &self,
        service: &S,
        uris: &[String],
        subscriber_id: i64,
        observer: Option<ObserverId>,
    ) -> Vec<OperationResult>
    where
        S: PublishedDataSubscriptionService + ?Sized,
    {
        if uris.is_empty() {
            return match observer {
                Some(id) => self.del_all_observers(service, Some(id)),
                None => Vec::new(),
            };
        }

        let keys = keys_for(uris, &subscriber_id);
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let outcome = inner.registry.del_observers(&keys, observer, |last| {
                call_grouped(last, |subscriber_id, uris| {
                    service.unsubscribe_published_data(uris, *subscriber_id)
                })
            });
            inner.release(&outcome.released);
            outcome.results
        })
    }

    /// Remove `observer` (or every observer) from every key.
    pub fn del_all_observers<S>(&self, service: &S, observer: Option<ObserverId>) -> Vec<OperationResult>
    where
        S: PublishedDataSubscriptionService + ?Sized,
    {
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let outcome = inner.registry.del_all(observer, |last| {
                call_grouped(last, |subscriber_id, uris| {
                    service.unsubscribe_published_data(uris, *subscriber_id)
                })
            });
            inner.release(&outcome.released);
            outcome.results
        })
    }

    /// Resume delivery to `observer` on `uris`, handing it the items it
    /// missed while disabled.
    pub fn enable_observers<S>(
        &self,
        service: &S,
        uris: &[String],
        subscriber_id: i64,
        observer: ObserverId,
    ) -> Vec<OperationResult>
    where
        S: PublishedDataSubscriptionService + ?Sized,
    {
        let keys = keys_for(uris, &subscriber_id);
        let inner = &self.inner;
        let outcome = inner.registry.enable_observers(
            &keys,
            observer,
            |enabled| {
                let mut refresh: BTreeMap<ObserverId, (Arc<PublishedDataObserver>, Vec<PublishedKey>)> =
                    BTreeMap::new();
                for entry in enabled.into_iter().filter(|entry| entry.refresh) {
                    refresh
                        .entry(entry.observer.id())
                        .or_insert_with(|| (entry.observer.clone(), Vec::new()))
                        .1
                        .push(entry.key);
                }
                for (observer, keys) in refresh.into_values() {
                    if let Some(node) = inner.cached_node(&keys) {
                        observer.on_change(&node);
                    }
                }
            },
            |first| {
                call_grouped(first, |subscriber_id, uris| {
                    service.enable_subscribe_published_data(uris, *subscriber_id)
                })
            },
        );
        outcome.results
    }

    /// Pause delivery to `observer` on `uris`.
    pub fn disable_observers<S>(
        &self,
        service: &S,
        uris: &[String],
        subscriber_id: i64,
        observer: ObserverId,
    ) -> Vec<OperationResult>
    where
        S: PublishedDataSubscriptionService + ?Sized,
    {
        let keys = keys_for(uris, &subscriber_id);
        let outcome = self.inner.registry.disable_observers(&keys, observer, |last| {
            call_grouped(last, |subscriber_id, uris| {
                service.disable_subscribe_published_data(uris, *subscriber_id)
            })
        });
        outcome.results
    }

    /// Re-establish every registered subscription after the provider
    /// restarted. Keys whose observers are all disabled are disabled again.
    pub fn recover_observers<S>(&self, service: &S)
    where
        S: PublishedDataSubscriptionService + ?Sized,
    {
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let (enabled, disabled) = inner.registry.keys_by_enabled();
            if enabled.is_empty() && disabled.is_empty() {
                return;
            }

            let all: Vec<_> = enabled.iter().chain(disabled.iter()).cloned().collect();
            let stub = inner.stub();
            let codes = call_grouped(&all, |subscriber_id, uris| {
                service.subscribe_published_data(uris, *subscriber_id, stub.clone())
            });
            log_failures(&all, &codes, "recover published data subscription failed");

            if !disabled.is_empty() {
                let codes = call_grouped(&disabled, |subscriber_id, uris| {
                    service.disable_subscribe_published_data(uris, *subscriber_id)
                });
                log_failures(&disabled, &codes, "recover published data disable failed");
            }
            tracing::info!(count = all.len(), "recovered published data subscriptions");
        })
    }

    /// Deliver a change from the provider.
    pub fn emit(&self, node: &PublishedDataChangeNode) {
        self.inner.emit(node);
    }

    /// Latest cached item for a key.
    pub fn cached_item(&self, uri: &str, subscriber_id: i64) -> Option<PublishedDataItem> {
        self.inner
            .cache
            .get(&SubscriptionKey::new(uri, subscriber_id))
            .and_then(|node| node.datas.into_iter().next())
    }

    /// Remote subscription state of a key.
    pub fn state(&self, uri: &str, subscriber_id: i64) -> KeyState {
        self.inner.registry.state(&SubscriptionKey::new(uri, subscriber_id))
    }

    /// Number of observers registered on a key.
    pub fn observer_count(&self, uri: &str, subscriber_id: i64) -> usize {
        self.inner
            .registry
            .observer_count(&SubscriptionKey::new(uri, subscriber_id))
    }

    /// Check whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Number of cached items.
    pub fn cached_count(&self) -> usize {
        self.inner.cache.len()
    }
}

impl Default for PublishedDataSubscriptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use datashare_proto::{PublishedValue, ResultCode};

    #[derive(Default)]
    struct MockService {
        subscribed: Mutex<Vec<(String, i64)>>,
        unsubscribed: Mutex<Vec<(String, i64)>>,
    }

    fn ok_all(uris: &[String]) -> Result<Vec<OperationResult>, Error> {
        Ok(uris.iter().map(|uri| OperationResult::ok(uri.clone())).collect())
    }

    impl PublishedDataSubscriptionService for MockService {
        fn subscribe_published_data(
            &self,
            uris: &[String],
            subscriber_id: i64,
            _stub: Arc<PublishedDataObserverStub>,
        ) -> Result<Vec<OperationResult>, Error> {
            self.subscribed
                .lock()
                .extend(uris.iter().map(|uri| (uri.clone(), subscriber_id)));
            ok_all(uris)
        }

        fn unsubscribe_published_data(
            &self,
            uris: &[String],
            subscriber_id: i64,
        ) -> Result<Vec<OperationResult>, Error> {
            self.unsubscribed
                .lock()
                .extend(uris.iter().map(|uri| (uri.clone(), subscriber_id)));
            ok_all(uris)
        }

        fn enable_subscribe_published_data(
            &self,
            uris: &[String],
            _subscriber_id: i64,
        ) -> Result<Vec<OperationResult>, Error> {
            ok_all(uris)
        }

        fn disable_subscribe_published_data(
            &self,
            uris: &[String],
            _subscriber_id: i64,
        ) -> Result<Vec<OperationResult>, Error> {
            ok_all(uris)
        }
    }

    fn uris(list: &[&str]) -> Vec<String> {
        list.iter().map(|uri| uri.to_string()).collect()
    }

    fn recording_observer() -> (Arc<PublishedDataObserver>, Arc<Mutex<Vec<PublishedDataChangeNode>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = PublishedDataObserver::new(move |node: &PublishedDataChangeNode| {
            sink.lock().push(node.clone())
        });
        (observer, seen)
    }

    fn item_keys(node: &PublishedDataChangeNode) -> Vec<String> {
        node.datas.iter().map(|item| item.key.clone()).collect()
    }

    #[test]
    fn test_fan_out_groups_per_observer() {
        let service = MockService::default();
        let subscriptions = PublishedDataSubscriptions::new();
        let (a, seen_a) = recording_observer();
        let (b, seen_b) = recording_observer();

        subscriptions.add_observers(&service, &uris(&["k1", "k2"]), 7, &a);
        subscriptions.add_observers(&service, &uris(&["k2", "k3"]), 7, &b);

        subscriptions.emit(&PublishedDataChangeNode::new(
            "com.example.owner",
            vec![
                PublishedDataItem::new("k1", 7, "v1"),
                PublishedDataItem::new("k2", 7, "v2"),
                PublishedDataItem::new("k3", 7, "v3"),
                PublishedDataItem::new("k4", 7, "v4"),
            ],
        ));

        let seen_a = seen_a.lock();
        assert_eq!(seen_a.len(), 1);
        assert_eq!(item_keys(&seen_a[0]), vec!["k1", "k2"]);
        assert_eq!(seen_a[0].owner_bundle_name, "com.example.owner");

        // b joined k2 locally, but nothing was cached yet
        let seen_b = seen_b.lock();
        assert_eq!(seen_b.len(), 1);
        assert_eq!(item_keys(&seen_b[0]), vec!["k2", "k3"]);
    }

    #[test]
    fn test_join_replays_aggregated_items() {
        let service = MockService::default();
        let subscriptions = PublishedDataSubscriptions::new();
        let (a, _) = recording_observer();
        let (b, seen_b) = recording_observer();

        subscriptions.add_observers(&service, &uris(&["k1", "k2"]), 7, &a);
        subscriptions.emit(&PublishedDataChangeNode::new(
            "owner",
            vec![
                PublishedDataItem::new("k1", 7, "v1"),
                PublishedDataItem::new("k2", 7, vec![1u8, 2, 3]),
            ],
        ));

        subscriptions.add_observers(&service, &uris(&["k1", "k2"]), 7, &b);

        let seen_b = seen_b.lock();
        assert_eq!(seen_b.len(), 1);
        assert_eq!(item_keys(&seen_b[0]), vec!["k1", "k2"]);
        assert_eq!(seen_b[0].datas[1].value, PublishedValue::Bytes(vec![1, 2, 3]));
        assert_eq!(service.subscribed.lock().len(), 2);
    }

    #[test]
    fn test_join_without_cache_delivers_nothing() {
        let service = MockService::default();
        let subscriptions = PublishedDataSubscriptions::new();
        let (a, _) = recording_observer();
        let (b, seen_b) = recording_observer();

        subscriptions.add_observers(&service, &uris(&["k1"]), 7, &a);
        subscriptions.add_observers(&service, &uris(&["k1"]), 7, &b);

        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn test_item_without_enabled_observer_cached_not_delivered() {
        let service = MockService::default();
        let subscriptions = PublishedDataSubscriptions::new();
        let (a, seen) = recording_observer();
        subscriptions.add_observers(&service, &uris(&["k1"]), 7, &a);
        subscriptions.disable_observers(&service, &uris(&["k1"]), 7, a.id());

        subscriptions.emit(&PublishedDataChangeNode::new(
            "owner",
            vec![PublishedDataItem::new("k1", 7, "v1")],
        ));
        assert!(seen.lock().is_empty());
        assert!(subscriptions.cached_item("k1", 7).is_some());

        let results = subscriptions.enable_observers(&service, &uris(&["k1"]), 7, a.id());
        assert_eq!(results[0].code, ResultCode::Ok);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_last_unsubscribe_erases_cache() {
        let service = MockService::default();
        let subscriptions = PublishedDataSubscriptions::new();
        let (a, _) = recording_observer();
        subscriptions.add_observers(&service, &uris(&["k1"]), 7, &a);
        subscriptions.emit(&PublishedDataChangeNode::new(
            "owner",
            vec![PublishedDataItem::new("k1", 7, "v1")],
        ));

        subscriptions.del_observers(&service, &[], 7, Some(a.id()));

        assert_eq!(*service.unsubscribed.lock(), vec![("k1".to_string(), 7)]);
        assert_eq!(subscriptions.cached_count(), 0);
        assert!(subscriptions.is_empty());
    }
}
