//! Observer stubs.
//!
//! A stub is the local endpoint handed to the provider on subscribe. The
//! provider sends framed [`CallbackMessage`]s to it from its own delivery
//! thread; the stub decodes them and forwards the change to the owning
//! subscriptions. Once the owner has no observers left it clears the stub,
//! after which deliveries are dropped.

use std::sync::Arc;

use parking_lot::Mutex;

use datashare_proto::{
    callback, CallbackInterface, CallbackMessage, ProxyDataChangeInfo, PublishedDataChangeNode,
    RdbChangeNode,
};

use crate::error::Error;

/// A change payload that arrives through a stub.
pub trait StubPayload: Sized + Send + Sync + 'static {
    /// Interface frames for this payload are addressed to.
    const INTERFACE: CallbackInterface;

    /// Extract the payload from a decoded message.
    fn from_message(message: CallbackMessage) -> Option<Self>;
}

impl StubPayload for RdbChangeNode {
    const INTERFACE: CallbackInterface = CallbackInterface::Rdb;

    fn from_message(message: CallbackMessage) -> Option<Self> {
        match message {
            CallbackMessage::Rdb(node) => Some(node),
            _ => None,
        }
    }
}

impl StubPayload for PublishedDataChangeNode {
    const INTERFACE: CallbackInterface = CallbackInterface::PublishedData;

    fn from_message(message: CallbackMessage) -> Option<Self> {
        match message {
            CallbackMessage::PublishedData(node) => Some(node),
            _ => None,
        }
    }
}

impl StubPayload for Vec<ProxyDataChangeInfo> {
    const INTERFACE: CallbackInterface = CallbackInterface::ProxyData;

    fn from_message(message: CallbackMessage) -> Option<Self> {
        match message {
            CallbackMessage::ProxyData(changes) => Some(changes),
            _ => None,
        }
    }
}

type StubCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Local endpoint receiving change events of type `E` from the provider.
pub struct ObserverStub<E> {
    callback: Mutex<Option<StubCallback<E>>>,
}

impl<E: StubPayload> ObserverStub<E> {
    /// Create a stub forwarding every change to `callback`.
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        Arc::new(Self {
            callback: Mutex::new(Some(Arc::new(callback))),
        })
    }

    /// Forward a decoded change.
    pub fn on_change(&self, change: &E) {
        // Don't hold the lock while the change fans out
        let callback = self.callback.lock().clone();
        match callback {
            Some(callback) => callback(change),
            None => tracing::debug!(interface = ?E::INTERFACE, "stub cleared, dropping change"),
        }
    }

    /// Detach the stub from its owner.
    pub fn clear_callback(&self) {
        self.callback.lock().take();
    }

    /// Check whether the stub was cleared.
    pub fn is_cleared(&self) -> bool {
        self.callback.lock().is_none()
    }

    /// Handle a framed callback message from the provider.
    pub fn on_remote_request(&self, frame: &[u8]) -> Result<(), Error> {
        let interface = callback::peek_interface(frame)?;
        if interface != E::INTERFACE {
            return Err(Error::Protocol(datashare_proto::Error::InvalidMessage(format!(
                "stub for {:?} received a {:?} frame",
                E::INTERFACE,
                interface
            ))));
        }

        let message = callback::decode(frame)?;
        let change = E::from_message(message).ok_or_else(|| {
            Error::Protocol(datashare_proto::Error::InvalidMessage(
                "callback payload does not match its interface".to_string(),
            ))
        })?;
        self.on_change(&change);
        Ok(())
    }
}

impl<E> std::fmt::Debug for ObserverStub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverStub")
            .field("cleared", &self.callback.lock().is_none())
            .finish()
    }
}

/// Stub for rdb template changes.
pub type RdbObserverStub = ObserverStub<RdbChangeNode>;

/// Stub for published data changes.
pub type PublishedDataObserverStub = ObserverStub<PublishedDataChangeNode>;

/// Stub for shared-config changes.
pub type ProxyDataObserverStub = ObserverStub<Vec<ProxyDataChangeInfo>>;
