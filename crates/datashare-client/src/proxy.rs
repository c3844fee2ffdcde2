//! Shared-config subscriptions.
//!
//! Keys are bare URIs. Shared-config changes are point notifications with no
//! "latest row" to hand back, so nothing is cached or replayed: observers only
//! see changes delivered after they subscribed.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use datashare_proto::{OperationResult, ProxyDataChangeInfo};

use crate::bridge::{call_grouped, log_failures, ProxyDataSubscriptionService};
use crate::key::{keys_for, SubscriptionKey};
use crate::observer::{ObserverId, ProxyDataObserver};
use crate::registry::{KeyState, SubscriptionRegistry};
use crate::stub::ProxyDataObserverStub;

struct Inner {
    registry: SubscriptionRegistry<(), Vec<ProxyDataChangeInfo>>,
    stub: Mutex<Option<Arc<ProxyDataObserverStub>>>,
}

impl Inner {
    fn stub(self: &Arc<Self>) -> Arc<ProxyDataObserverStub> {
        let mut stub = self.stub.lock();
        if let Some(stub) = stub.as_ref() {
            return stub.clone();
        }

        tracing::info!("creating proxy data observer stub");
        let weak: Weak<Inner> = Arc::downgrade(self);
        let created = ProxyDataObserverStub::new(move |changes: &Vec<ProxyDataChangeInfo>| {
            if let Some(inner) = weak.upgrade() {
                inner.emit(changes);
            }
        });
        *stub = Some(created.clone());
        created
    }

    fn release_stub_if_idle(&self) {
        if !self.registry.is_empty() {
            return;
        }
        if let Some(stub) = self.stub.lock().take() {
            tracing::info!("no proxy data observers left, releasing stub");
            stub.clear_callback();
        }
    }

    fn emit(&self, changes: &[ProxyDataChangeInfo]) {
        let mut deliveries: BTreeMap<ObserverId, (Arc<ProxyDataObserver>, Vec<ProxyDataChangeInfo>)> =
            BTreeMap::new();
        for change in changes {
            let key = SubscriptionKey::from_uri(change.uri.clone());
            for observer in self.registry.enabled_observers(&key) {
                deliveries
                    .entry(observer.id())
                    .or_insert_with(|| (observer.clone(), Vec::new()))
                    .1
                    .push(change.clone());
            }
        }

        for (observer, batch) in deliveries.into_values() {
            observer.on_change(&batch);
        }
    }
}

/// Observers of shared-config changes, multiplexed over one remote
/// subscription per URI.
pub struct ProxyDataSubscriptions {
    inner: Arc<Inner>,
}

impl ProxyDataSubscriptions {
    /// Create an empty subscription set.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: SubscriptionRegistry::new(),
                stub: Mutex::new(None),
            }),
        }
    }

    /// Register `observer` for `uris`.
    pub fn add_observers<S>(
        &self,
        service: &S,
        uris: &[String],
        observer: &Arc<ProxyDataObserver>,
    ) -> Vec<OperationResult>
    where
        S: ProxyDataSubscriptionService + ?Sized,
    {
        let keys = keys_for(uris, &());
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let outcome = inner.registry.add_observers(
                &keys,
                observer,
                |_, _| {},
                |first| {
                    let stub = inner.stub();
                    call_grouped(first, |_, uris| service.subscribe_proxy_data(uris, stub.clone()))
                },
            );
            inner.release_stub_if_idle();
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
        observer: Option<ObserverId>,
    ) -> Vec<OperationResult>
    where
        S: ProxyDataSubscriptionService + ?Sized,
    {
        if uris.is_empty() {
            return match observer {
                Some(id) => self.del_all_observers(service, Some(id)),
                None => Vec::new(),
            };
        }

        let keys = keys_for(uris, &());
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let outcome = inner.registry.del_observers(&keys, observer, |last| {
                call_grouped(last, |_, uris| service.unsubscribe_proxy_data(uris))
            });
            inner.release_stub_if_idle();
            outcome.results
        })
    }

    /// Remove `observer` (or every observer) from every key.
    pub fn del_all_observers<S>(&self, service: &S, observer: Option<ObserverId>) -> Vec<OperationResult>
    where
        S: ProxyDataSubscriptionService + ?Sized,
    {
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let outcome = inner.registry.del_all(observer, |last| {
                call_grouped(last, |_, uris| service.unsubscribe_proxy_data(uris))
            });
            inner.release_stub_if_idle();
            outcome.results
        })
    }

    /// Re-establish every registered subscription after the provider
    /// restarted.
    pub fn recover_observers<S>(&self, service: &S)
    where
        S: ProxyDataSubscriptionService + ?Sized,
    {
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let keys = inner.registry.keys();
            if keys.is_empty() {
                return;
            }
            let stub = inner.stub();
            let codes = call_grouped(&keys, |_, uris| service.subscribe_proxy_data(uris, stub.clone()));
            log_failures(&keys, &codes, "recover proxy data subscription failed");
            tracing::info!(count = keys.len(), "recovered proxy data subscriptions");
        })
    }

    /// Deliver a batch of changes from the provider. Each observer receives
    /// one batch holding the changes to the uris it subscribed to.
    pub fn emit(&self, changes: &[ProxyDataChangeInfo]) {
        self.inner.emit(changes);
    }

    /// Remote subscription state of a uri.
    pub fn state(&self, uri: &str) -> KeyState {
        self.inner.registry.state(&SubscriptionKey::from_uri(uri))
    }

    /// Number of observers registered on a uri.
    pub fn observer_count(&self, uri: &str) -> usize {
        self.inner.registry.observer_count(&SubscriptionKey::from_uri(uri))
    }

    /// Check whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }
}

impl Default for ProxyDataSubscriptions {
    fn default() -> Self {
        Self::new()
    }
}
