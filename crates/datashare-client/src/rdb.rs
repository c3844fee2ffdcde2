//! Rdb template subscriptions.
//!
//! Keys are `(table uri, template id)`. Every change event concerns exactly
//! one key and is delivered as-is to each enabled observer of that key. The
//! latest change per key is cached and replayed to observers that join an
//! active key or come back from being disabled.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use datashare_proto::{OperationResult, RdbChangeNode, TemplateId};

use crate::bridge::{call_grouped, log_failures, RdbSubscriptionService};
use crate::cache::ChangeCache;
use crate::key::{keys_for, SubscriptionKey};
use crate::observer::{ObserverId, RdbObserver};
use crate::registry::{KeyState, SubscriptionRegistry};
use crate::stub::RdbObserverStub;

type RdbKey = SubscriptionKey<TemplateId>;

struct Inner {
    registry: SubscriptionRegistry<TemplateId, RdbChangeNode>,
    cache: ChangeCache<RdbKey, RdbChangeNode>,
    stub: Mutex<Option<Arc<RdbObserverStub>>>,
}

impl Inner {
    fn stub(self: &Arc<Self>) -> Arc<RdbObserverStub> {
        let mut stub = self.stub.lock();
        if let Some(stub) = stub.as_ref() {
            return stub.clone();
        }

        tracing::info!("creating rdb observer stub");
        let weak: Weak<Inner> = Arc::downgrade(self);
        let created = RdbObserverStub::new(move |node: &RdbChangeNode| {
            if let Some(inner) = weak.upgrade() {
                inner.emit(node);
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
            tracing::info!("no rdb observers left, releasing stub");
            stub.clear_callback();
        }
    }

    fn release(&self, keys: &[RdbKey]) {
        for key in keys {
            self.cache.erase(key);
        }
        self.release_stub_if_idle();
    }

    fn replay(&self, keys: &[RdbKey], observer: &Arc<RdbObserver>) {
        for key in keys {
            if let Some(node) = self.cache.get(key) {
                tracing::debug!(key = %key, observer = %observer.id(), "replaying cached change");
                observer.on_change(&node);
            }
        }
    }

    fn emit(&self, node: &RdbChangeNode) {
        let key = SubscriptionKey::new(node.uri.clone(), node.template_id.clone());
        if self
            .registry
            .if_registered(&key, || self.cache.put(key.clone(), node.clone()))
            .is_none()
        {
            tracing::debug!(key = %key, "change for unregistered key dropped");
            return;
        }

        for observer in self.registry.enabled_observers(&key) {
            observer.on_change(node);
        }
        self.registry.mark_notify_on_enabled(&key);
    }
}

/// Observers of rdb template changes, multiplexed over one remote
/// subscription per `(uri, template)` key.
pub struct RdbSubscriptions {
    inner: Arc<Inner>,
}

impl RdbSubscriptions {
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

    /// Register `observer` for `uris` under `template_id`.
    ///
    /// Returns one result per distinct uri. Keys already active replay their
    /// cached change to the observer before this returns.
    pub fn add_observers<S>(
        &self,
        service: &S,
        uris: &[String],
        template_id: &TemplateId,
        observer: &Arc<RdbObserver>,
    ) -> Vec<OperationResult>
    where
        S: RdbSubscriptionService + ?Sized,
    {
        let keys = keys_for(uris, template_id);
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let outcome = inner.registry.add_observers(
                &keys,
                observer,
                |joined, observer| inner.replay(joined, observer),
                |first| {
                    let stub = inner.stub();
                    call_grouped(first, |template, uris| {
                        service.subscribe_rdb_data(uris, template, stub.clone())
                    })
                },
            );
            inner.release(&outcome.released);
            outcome.results
        })
    }

    /// Remove `observer` (or every observer) from `uris` under `template_id`.
    ///
    /// With no uris, `observer` is removed from every key it is registered on.
    pub fn del_observers<S>(
        &self,
        service: &S,
        uris: &[String],
        template_id: &TemplateId,
        observer: Option<ObserverId>,
    ) -> Vec<OperationResult>
    where
        S: RdbSubscriptionService + ?Sized,
    {
        if uris.is_empty() {
            return match observer {
                Some(id) => self.del_all_observers(service, Some(id)),
                None => Vec::new(),
            };
        }

        let keys = keys_for(uris, template_id);
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let outcome = inner.registry.del_observers(&keys, observer, |last| {
                call_grouped(last, |template, uris| service.unsubscribe_rdb_data(uris, template))
            });
            inner.release(&outcome.released);
            outcome.results
        })
    }

    /// Remove `observer` (or every observer) from every key.
    pub fn del_all_observers<S>(&self, service: &S, observer: Option<ObserverId>) -> Vec<OperationResult>
    where
        S: RdbSubscriptionService + ?Sized,
    {
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let outcome = inner.registry.del_all(observer, |last| {
                call_grouped(last, |template, uris| service.unsubscribe_rdb_data(uris, template))
            });
            inner.release(&outcome.released);
            outcome.results
        })
    }

    /// Resume delivery to `observer` on `uris`.
    ///
    /// If the observer missed a change while disabled it is handed the
    /// latest one.
    pub fn enable_observers<S>(
        &self,
        service: &S,
        uris: &[String],
        template_id: &TemplateId,
        observer: ObserverId,
    ) -> Vec<OperationResult>
    where
        S: RdbSubscriptionService + ?Sized,
    {
        let keys = keys_for(uris, template_id);
        let inner = &self.inner;
        let outcome = inner.registry.enable_observers(
            &keys,
            observer,
            |enabled| {
                for entry in enabled.into_iter().filter(|entry| entry.refresh) {
                    if let Some(node) = inner.cache.get(&entry.key) {
                        entry.observer.on_change(&node);
                    }
                }
            },
            |first| {
                call_grouped(first, |template, uris| {
                    service.enable_subscribe_rdb_data(uris, template)
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
        template_id: &TemplateId,
        observer: ObserverId,
    ) -> Vec<OperationResult>
    where
        S: RdbSubscriptionService + ?Sized,
    {
        let keys = keys_for(uris, template_id);
        let outcome = self.inner.registry.disable_observers(&keys, observer, |last| {
            call_grouped(last, |template, uris| {
                service.disable_subscribe_rdb_data(uris, template)
            })
        });
        outcome.results
    }

    /// Re-establish every registered subscription after the provider
    /// restarted. Keys whose observers are all disabled are disabled again.
    pub fn recover_observers<S>(&self, service: &S)
    where
        S: RdbSubscriptionService + ?Sized,
    {
        let inner = &self.inner;
        inner.registry.with_transition(|| {
            let (enabled, disabled) = inner.registry.keys_by_enabled();
            if enabled.is_empty() && disabled.is_empty() {
                return;
            }

            let all: Vec<_> = enabled.iter().chain(disabled.iter()).cloned().collect();
            let stub = inner.stub();
            let codes = call_grouped(&all, |template, uris| {
                service.subscribe_rdb_data(uris, template, stub.clone())
            });
            log_failures(&all, &codes, "recover rdb subscription failed");

            if !disabled.is_empty() {
                let codes = call_grouped(&disabled, |template, uris| {
                    service.disable_subscribe_rdb_data(uris, template)
                });
                log_failures(&disabled, &codes, "recover rdb disable failed");
            }
            tracing::info!(count = all.len(), "recovered rdb subscriptions");
        })
    }

    /// Deliver a change from the provider.
    pub fn emit(&self, node: &RdbChangeNode) {
        self.inner.emit(node);
    }

    /// Latest cached change for a key.
    pub fn cached_change(&self, uri: &str, template_id: &TemplateId) -> Option<RdbChangeNode> {
        self.inner
            .cache
            .get(&SubscriptionKey::new(uri, template_id.clone()))
    }

    /// Remote subscription state of a key.
    pub fn state(&self, uri: &str, template_id: &TemplateId) -> KeyState {
        self.inner
            .registry
            .state(&SubscriptionKey::new(uri, template_id.clone()))
    }

    /// Number of observers registered on a key.
    pub fn observer_count(&self, uri: &str, template_id: &TemplateId) -> usize {
        self.inner
            .registry
            .observer_count(&SubscriptionKey::new(uri, template_id.clone()))
    }

    /// Check whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Number of cached changes.
    pub fn cached_count(&self) -> usize {
        self.inner.cache.len()
    }

    /// Check whether a stub is currently live.
    pub fn has_stub(&self) -> bool {
        self.inner.stub.lock().is_some()
    }
}

impl Default for RdbSubscriptions {
    fn default() -> Self {
        Self::new()
    }
}
