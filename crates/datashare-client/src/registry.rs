//! Keyed subscription registry.
//!
//! The registry tracks which observers are registered against which
//! [`SubscriptionKey`]s and decides when a remote call is needed: only the
//! first observer of a key subscribes remotely and only the last one to leave
//! unsubscribes. Everything else is local bookkeeping.
//!
//! ## Locking
//!
//! ```text
//! transition (reentrant) : add / del / enable / disable, held across the remote call
//! entries (short-held)   : the key -> observer map, also taken by emit snapshots
//! ```
//!
//! Remote calls and join callbacks never run while the map lock is held, so a
//! provider may deliver change events from inside a subscribe call without
//! deadlocking.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use datashare_proto::{OperationResult, ResultCode};

use crate::key::SubscriptionKey;
use crate::observer::{Observer, ObserverId};

/// Remote subscription state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// No observers and no remote subscription.
    Unsubscribed,
    /// First observer added; remote subscribe in flight.
    Subscribing,
    /// Remote subscription established.
    Active,
    /// Last observer removed; remote unsubscribe in flight.
    Unsubscribing,
}

impl KeyState {
    /// Check whether a remote transition for the key is still pending.
    pub fn is_in_flight(self) -> bool {
        matches!(self, KeyState::Subscribing | KeyState::Unsubscribing)
    }
}

/// Result of a registry operation.
#[derive(Debug)]
pub struct Outcome<D> {
    /// One result per distinct requested key, in request order.
    pub results: Vec<OperationResult>,
    /// Keys that returned to [`KeyState::Unsubscribed`] during the call.
    pub released: Vec<SubscriptionKey<D>>,
}

impl<D> Default for Outcome<D> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            released: Vec::new(),
        }
    }
}

/// An observer that was just re-enabled on a key.
pub struct EnabledObserver<D, E> {
    /// The key the observer was enabled on.
    pub key: SubscriptionKey<D>,
    /// The observer.
    pub observer: Arc<Observer<E>>,
    /// Set when the observer missed a change while disabled.
    pub refresh: bool,
}

struct ObserverNode<E> {
    observer: Arc<Observer<E>>,
    enabled: bool,
    notify_on_enabled: bool,
}

impl<E> ObserverNode<E> {
    fn new(observer: Arc<Observer<E>>) -> Self {
        Self {
            observer,
            enabled: true,
            notify_on_enabled: false,
        }
    }

    fn id(&self) -> ObserverId {
        self.observer.id()
    }
}

struct KeyEntry<E> {
    state: KeyState,
    nodes: Vec<ObserverNode<E>>,
    // A change arrived while the remote unsubscribe was in flight
    missed: bool,
}

impl<E> KeyEntry<E> {
    fn new() -> Self {
        Self {
            state: KeyState::Unsubscribed,
            nodes: Vec::new(),
            missed: false,
        }
    }

    fn is_releasing(&self) -> bool {
        self.state == KeyState::Unsubscribing
    }

    fn enabled_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.enabled).count()
    }

    fn node_mut(&mut self, id: ObserverId) -> Option<&mut ObserverNode<E>> {
        self.nodes.iter_mut().find(|node| node.id() == id)
    }

    fn contains(&self, id: ObserverId) -> bool {
        self.nodes.iter().any(|node| node.id() == id)
    }
}

/// Thread-safe bookkeeping of observers per subscription key.
///
/// `D` is the key discriminator and `E` the change payload delivered to
/// observers. Remote calls are supplied by the caller as closures returning
/// one [`ResultCode`] per key passed in, in the same order; a missing code
/// counts as [`ResultCode::InnerError`].
pub struct SubscriptionRegistry<D, E> {
    transition: ReentrantMutex<()>,
    entries: Mutex<BTreeMap<SubscriptionKey<D>, KeyEntry<E>>>,
}

impl<D, E> SubscriptionRegistry<D, E>
where
    D: Ord + Clone + Debug,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            transition: ReentrantMutex::new(()),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register `observer` against `keys`.
    ///
    /// Active keys that already have enabled observers are joined locally and
    /// passed to `on_local_join` in one call so the observer can be handed
    /// cached state. The remaining keys are added speculatively and passed to
    /// `on_first_subscribe`; keys it rejects are rolled back.
    ///
    /// A key whose remote subscribe or unsubscribe is still in flight (reached
    /// by re-entering from inside a remote call) is refused with
    /// [`ResultCode::InnerError`] and nothing is registered for it.
    pub fn add_observers<J, S>(
        &self,
        keys: &[SubscriptionKey<D>],
        observer: &Arc<Observer<E>>,
        on_local_join: J,
        on_first_subscribe: S,
    ) -> Outcome<D>
    where
        J: FnOnce(&[SubscriptionKey<D>], &Arc<Observer<E>>),
        S: FnOnce(&[SubscriptionKey<D>]) -> Vec<ResultCode>,
    {
        let keys = distinct(keys);
        if keys.is_empty() {
            return Outcome::default();
        }
        let _transition = self.transition.lock();

        let mut slots: Vec<Option<OperationResult>> = vec![None; keys.len()];
        let mut joined = Vec::new();
        let mut first: Vec<(usize, KeyState)> = Vec::new();
        {
            let mut entries = self.entries.lock();
            for (slot, key) in keys.iter().enumerate() {
                let entry = entries.entry(key.clone()).or_insert_with(KeyEntry::new);
                if entry.state.is_in_flight() {
                    tracing::warn!(uri = %key.uri(), state = ?entry.state, "key busy, refusing observer");
                    slots[slot] = Some(OperationResult::new(key.uri(), ResultCode::InnerError));
                    continue;
                }
                if entry.contains(observer.id()) {
                    slots[slot] = Some(OperationResult::ok(key.uri()));
                    continue;
                }
                if entry.enabled_count() == 0 {
                    first.push((slot, entry.state));
                    entry.state = KeyState::Subscribing;
                } else {
                    joined.push(key.clone());
                    slots[slot] = Some(OperationResult::ok(key.uri()));
                }
                entry.nodes.push(ObserverNode::new(observer.clone()));
            }
        }

        tracing::debug!(
            observer = %observer.id(),
            joined = joined.len(),
            first = first.len(),
            "adding observers"
        );

        if !joined.is_empty() {
            on_local_join(&joined, observer);
        }

        let mut released = Vec::new();
        if !first.is_empty() {
            let first_keys: Vec<_> = first.iter().map(|(slot, _)| keys[*slot].clone()).collect();
            let codes = on_first_subscribe(&first_keys);

            let mut entries = self.entries.lock();
            for (i, (slot, prior)) in first.into_iter().enumerate() {
                let key = &keys[slot];
                let code = code_at(&codes, i);
                if code.is_ok() {
                    if let Some(entry) = entries.get_mut(key) {
                        entry.state = KeyState::Active;
                    }
                } else {
                    tracing::warn!(uri = %key.uri(), code = ?code, "remote subscribe failed");
                    if remove_node(&mut entries, key, observer.id(), prior) {
                        released.push(key.clone());
                    }
                }
                slots[slot] = Some(OperationResult::new(key.uri(), code));
            }
        }

        Outcome {
            results: slots.into_iter().flatten().collect(),
            released,
        }
    }

    /// Remove an observer (or every observer when `observer` is `None`) from
    /// `keys`.
    ///
    /// Keys left without observers are passed to `on_last_unsubscribe` in one
    /// batch. They stay registered as [`KeyState::Unsubscribing`] until the
    /// remote result is known, so changes arriving meanwhile are still cached.
    /// If the remote side fails to unsubscribe a key, its observers are
    /// restored because the remote subscription is still in place; a change
    /// that arrived during the call is not delivered to them, but disabled
    /// ones are flagged for refresh.
    pub fn del_observers<U>(
        &self,
        keys: &[SubscriptionKey<D>],
        observer: Option<ObserverId>,
        on_last_unsubscribe: U,
    ) -> Outcome<D>
    where
        U: FnOnce(&[SubscriptionKey<D>]) -> Vec<ResultCode>,
    {
        let keys = distinct(keys);
        if keys.is_empty() {
            return Outcome::default();
        }
        let _transition = self.transition.lock();

        let mut slots: Vec<Option<OperationResult>> = vec![None; keys.len()];
        let mut last: Vec<(usize, KeyState, Vec<ObserverNode<E>>)> = Vec::new();
        {
            let mut entries = self.entries.lock();
            for (slot, key) in keys.iter().enumerate() {
                let entry = match entries.get_mut(key) {
                    Some(entry) if !entry.is_releasing() => entry,
                    _ => {
                        slots[slot] =
                            Some(OperationResult::new(key.uri(), ResultCode::UnregisteredEmpty));
                        continue;
                    }
                };
                let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.nodes)
                    .into_iter()
                    .partition(|node| observer.map_or(true, |id| node.id() == id));
                entry.nodes = kept;
                if !entry.nodes.is_empty() {
                    slots[slot] = Some(OperationResult::ok(key.uri()));
                    continue;
                }
                let state = entry.state;
                entry.state = KeyState::Unsubscribing;
                entry.missed = false;
                last.push((slot, state, removed));
            }
        }

        let mut released = Vec::new();
        if !last.is_empty() {
            let last_keys: Vec<_> = last.iter().map(|(slot, _, _)| keys[*slot].clone()).collect();
            let codes = on_last_unsubscribe(&last_keys);

            let mut entries = self.entries.lock();
            for (i, (slot, state, mut nodes)) in last.into_iter().enumerate() {
                let key = &keys[slot];
                let code = code_at(&codes, i);
                if code.is_ok() {
                    entries.remove(key);
                    released.push(key.clone());
                } else {
                    tracing::warn!(uri = %key.uri(), code = ?code, "remote unsubscribe failed, restoring observers");
                    let entry = entries.entry(key.clone()).or_insert_with(KeyEntry::new);
                    if std::mem::take(&mut entry.missed) {
                        for node in nodes.iter_mut().filter(|node| !node.enabled) {
                            node.notify_on_enabled = true;
                        }
                    }
                    entry.state = state;
                    entry.nodes.splice(0..0, nodes);
                }
                slots[slot] = Some(OperationResult::new(key.uri(), code));
            }
        }

        tracing::debug!(
            observer = ?observer,
            released = released.len(),
            "removed observers"
        );

        Outcome {
            results: slots.into_iter().flatten().collect(),
            released,
        }
    }

    /// Remove an observer (or every observer) from every key it is registered on.
    pub fn del_all<U>(&self, observer: Option<ObserverId>, on_last_unsubscribe: U) -> Outcome<D>
    where
        U: FnOnce(&[SubscriptionKey<D>]) -> Vec<ResultCode>,
    {
        let _transition = self.transition.lock();
        let keys: Vec<_> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, entry)| !entry.is_releasing())
                .filter(|(_, entry)| observer.map_or(true, |id| entry.contains(id)))
                .map(|(key, _)| key.clone())
                .collect()
        };
        self.del_observers(&keys, observer, on_last_unsubscribe)
    }

    /// Re-enable a disabled observer on `keys`.
    ///
    /// Keys with no other enabled observer are passed to `on_first_enable`;
    /// keys it rejects stay disabled. Every observer that ends up enabled is
    /// handed to `on_local_enabled`, flagged when it missed a change.
    pub fn enable_observers<L, S>(
        &self,
        keys: &[SubscriptionKey<D>],
        observer: ObserverId,
        on_local_enabled: L,
        on_first_enable: S,
    ) -> Outcome<D>
    where
        L: FnOnce(Vec<EnabledObserver<D, E>>),
        S: FnOnce(&[SubscriptionKey<D>]) -> Vec<ResultCode>,
    {
        let keys = distinct(keys);
        if keys.is_empty() {
            return Outcome::default();
        }
        let _transition = self.transition.lock();

        let mut slots: Vec<Option<OperationResult>> = vec![None; keys.len()];
        let mut enabled: Vec<(usize, EnabledObserver<D, E>)> = Vec::new();
        let mut first: Vec<usize> = Vec::new();
        {
            let mut entries = self.entries.lock();
            for (slot, key) in keys.iter().enumerate() {
                let Some(entry) = entries.get_mut(key) else {
                    slots[slot] = Some(OperationResult::new(key.uri(), ResultCode::SubscriberNotExist));
                    continue;
                };
                let was_silent = entry.enabled_count() == 0;
                let Some(node) = entry.node_mut(observer) else {
                    slots[slot] = Some(OperationResult::new(key.uri(), ResultCode::SubscriberNotExist));
                    continue;
                };
                if node.enabled {
                    slots[slot] = Some(OperationResult::ok(key.uri()));
                    continue;
                }
                node.enabled = true;
                enabled.push((
                    slot,
                    EnabledObserver {
                        key: key.clone(),
                        observer: node.observer.clone(),
                        refresh: std::mem::take(&mut node.notify_on_enabled),
                    },
                ));
                if was_silent {
                    first.push(slot);
                } else {
                    slots[slot] = Some(OperationResult::ok(key.uri()));
                }
            }
        }

        if !first.is_empty() {
            let first_keys: Vec<_> = first.iter().map(|slot| keys[*slot].clone()).collect();
            let codes = on_first_enable(&first_keys);

            let mut entries = self.entries.lock();
            for (i, slot) in first.into_iter().enumerate() {
                let key = &keys[slot];
                let code = code_at(&codes, i);
                if !code.is_ok() {
                    tracing::warn!(uri = %key.uri(), code = ?code, "remote enable failed");
                    if let Some(node) = entries.get_mut(key).and_then(|e| e.node_mut(observer)) {
                        node.enabled = false;
                    }
                    enabled.retain(|(s, _)| *s != slot);
                }
                slots[slot] = Some(OperationResult::new(key.uri(), code));
            }
        }

        if !enabled.is_empty() {
            on_local_enabled(enabled.into_iter().map(|(_, e)| e).collect());
        }

        Outcome {
            results: slots.into_iter().flatten().collect(),
            released: Vec::new(),
        }
    }

    /// Disable an observer on `keys` without dropping its registration.
    ///
    /// Keys left without enabled observers are passed to `on_last_disable`.
    pub fn disable_observers<S>(
        &self,
        keys: &[SubscriptionKey<D>],
        observer: ObserverId,
        on_last_disable: S,
    ) -> Outcome<D>
    where
        S: FnOnce(&[SubscriptionKey<D>]) -> Vec<ResultCode>,
    {
        let keys = distinct(keys);
        if keys.is_empty() {
            return Outcome::default();
        }
        let _transition = self.transition.lock();

        let mut slots: Vec<Option<OperationResult>> = vec![None; keys.len()];
        let mut last: Vec<usize> = Vec::new();
        {
            let mut entries = self.entries.lock();
            for (slot, key) in keys.iter().enumerate() {
                let entry = match entries.get_mut(key) {
                    Some(entry) if entry.enabled_count() > 0 => entry,
                    _ => {
                        slots[slot] =
                            Some(OperationResult::new(key.uri(), ResultCode::SubscriberNotExist));
                        continue;
                    }
                };
                let Some(node) = entry.node_mut(observer) else {
                    slots[slot] = Some(OperationResult::new(key.uri(), ResultCode::SubscriberNotExist));
                    continue;
                };
                node.enabled = false;
                node.notify_on_enabled = false;
                if entry.enabled_count() > 0 {
                    slots[slot] = Some(OperationResult::ok(key.uri()));
                } else {
                    last.push(slot);
                }
            }
        }

        if !last.is_empty() {
            let last_keys: Vec<_> = last.iter().map(|slot| keys[*slot].clone()).collect();
            let codes = on_last_disable(&last_keys);
            for (i, slot) in last.into_iter().enumerate() {
                let key = &keys[slot];
                let code = code_at(&codes, i);
                if !code.is_ok() {
                    tracing::warn!(uri = %key.uri(), code = ?code, "remote disable failed");
                }
                slots[slot] = Some(OperationResult::new(key.uri(), code));
            }
        }

        Outcome {
            results: slots.into_iter().flatten().collect(),
            released: Vec::new(),
        }
    }

    /// Flag the disabled observers of `key` so that re-enabling them replays
    /// the latest change. Returns how many observers were flagged.
    pub fn mark_notify_on_enabled(&self, key: &SubscriptionKey<D>) -> usize {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return 0;
        };
        if entry.is_releasing() {
            entry.missed = true;
            return 0;
        }
        let mut flagged = 0;
        for node in entry.nodes.iter_mut().filter(|node| !node.enabled) {
            node.notify_on_enabled = true;
            flagged += 1;
        }
        if flagged > 0 {
            tracing::debug!(key = %key, total = entry.nodes.len(), flagged, "observers pending refresh");
        }
        flagged
    }

    /// Run `f` only if `key` is registered (or its release is still pending),
    /// while the registration cannot be released underneath it.
    pub fn if_registered<R>(&self, key: &SubscriptionKey<D>, f: impl FnOnce() -> R) -> Option<R> {
        let entries = self.entries.lock();
        if entries.contains_key(key) {
            Some(f())
        } else {
            None
        }
    }

    /// Snapshot of the enabled observers of `key`.
    pub fn enabled_observers(&self, key: &SubscriptionKey<D>) -> Vec<Arc<Observer<E>>> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .map(|entry| {
                entry
                    .nodes
                    .iter()
                    .filter(|node| node.enabled)
                    .map(|node| node.observer.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remote subscription state of `key`.
    pub fn state(&self, key: &SubscriptionKey<D>) -> KeyState {
        self.entries
            .lock()
            .get(key)
            .map_or(KeyState::Unsubscribed, |entry| entry.state)
    }

    /// Every registered key, in key order.
    pub fn keys(&self) -> Vec<SubscriptionKey<D>> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.is_releasing())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Registered keys split into those with and without enabled observers.
    pub fn keys_by_enabled(&self) -> (Vec<SubscriptionKey<D>>, Vec<SubscriptionKey<D>>) {
        let entries = self.entries.lock();
        let (enabled, disabled): (Vec<_>, Vec<_>) = entries
            .iter()
            .filter(|(_, entry)| !entry.is_releasing())
            .partition(|(_, entry)| entry.enabled_count() > 0);
        (
            enabled.into_iter().map(|(key, _)| key.clone()).collect(),
            disabled.into_iter().map(|(key, _)| key.clone()).collect(),
        )
    }

    /// Number of observers (enabled or not) registered on `key`.
    pub fn observer_count(&self, key: &SubscriptionKey<D>) -> usize {
        self.entries.lock().get(key).map_or(0, |entry| entry.nodes.len())
    }

    /// Total number of enabled registrations across all keys.
    pub fn enabled_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.enabled_count())
            .sum()
    }

    /// Check whether no key is registered or pending release.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run `f` while holding the transition lock, so no add/del/enable/disable
    /// interleaves with it.
    pub fn with_transition<R>(&self, f: impl FnOnce() -> R) -> R {
        let _transition = self.transition.lock();
        f()
    }
}

impl<D, E> Default for SubscriptionRegistry<D, E>
where
    D: Ord + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

fn distinct<D: Ord + Clone>(keys: &[SubscriptionKey<D>]) -> Vec<SubscriptionKey<D>> {
    let mut seen = BTreeSet::new();
    keys.iter()
        .filter(|key| seen.insert(*key))
        .cloned()
        .collect()
}

fn code_at(codes: &[ResultCode], index: usize) -> ResultCode {
    codes.get(index).copied().unwrap_or(ResultCode::InnerError)
}

/// Roll back a speculative add. Returns true if the key was released.
fn remove_node<D: Ord, E>(
    entries: &mut BTreeMap<SubscriptionKey<D>, KeyEntry<E>>,
    key: &SubscriptionKey<D>,
    id: ObserverId,
    prior: KeyState,
) -> bool {
    let Some(entry) = entries.get_mut(key) else {
        return false;
    };
    entry.nodes.retain(|node| node.id() != id);
    if entry.nodes.is_empty() {
        entries.remove(key);
        true
    } else {
        entry.state = prior;
        false
    }
}
