//! Observer handles.
//!
//! An observer wraps the application callback for one registration. Each
//! observer is minted a process-unique [`ObserverId`] when it is created; the
//! registries deduplicate by that id, never by callback identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use datashare_proto::{ProxyDataChangeInfo, PublishedDataChangeNode, RdbChangeNode};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

type Callback<E> = Box<dyn Fn(&E) + Send + Sync>;

/// A registered recipient of change events of type `E`.
pub struct Observer<E> {
    id: ObserverId,
    callback: Callback<E>,
}

impl<E> Observer<E> {
    /// Create an observer running `callback` on every change.
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: ObserverId::next(),
            callback: Box::new(callback),
        })
    }

    /// The observer's identity.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Deliver a change.
    pub fn on_change(&self, change: &E) {
        (self.callback)(change);
    }
}

impl<E> Observer<E>
where
    E: Clone + Send + 'static,
{
    /// Create an observer that forwards every change into a channel.
    ///
    /// Changes are delivered on whatever thread emits them; the receiver lets
    /// async code consume them on its own runtime. Changes are dropped once the
    /// receiver is gone.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Self::new(move |change: &E| {
            if tx.send(change.clone()).is_err() {
                tracing::trace!("observer receiver dropped, discarding change");
            }
        });
        (observer, rx)
    }
}

impl<E> PartialEq for Observer<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<E> Eq for Observer<E> {}

impl<E> fmt::Debug for Observer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer").field("id", &self.id).finish()
    }
}

/// Observer of rdb template changes.
pub type RdbObserver = Observer<RdbChangeNode>;

/// Observer of published data changes.
pub type PublishedDataObserver = Observer<PublishedDataChangeNode>;

/// Observer of shared-config changes.
pub type ProxyDataObserver = Observer<Vec<ProxyDataChangeInfo>>;
