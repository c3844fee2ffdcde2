//! DataShare Client - change subscriptions against data-sharing providers.
//!
//! Many observers may subscribe to the same data key; the client keeps a
//! single remote subscription per distinct key, caches the latest change so
//! late joiners see current state, and fans provider events out to exactly the
//! observers registered for the changed keys.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use datashare_client::{ClientConfig, DataShareClient, PublishedDataObserver};
//!
//! let client = DataShareClient::new(ClientConfig::new("com.example.app"), Arc::new(service));
//!
//! // Changes can also be consumed from async code through a channel
//! let (observer, mut changes) = PublishedDataObserver::channel();
//! let uris = vec!["datashareproxy://com.example.provider/weather".to_string()];
//! for result in client.subscribe_published_data(&uris, 1, &observer)? {
//!     if !result.is_ok() {
//!         eprintln!("{} rejected: {:?}", result.key, result.code);
//!     }
//! }
//!
//! while let Some(node) = changes.recv().await {
//!     println!("{} items from {}", node.datas.len(), node.owner_bundle_name);
//! }
//! ```
//!
//! # Modules
//!
//! - [`registry`] - Keyed observer bookkeeping and remote transition triggers
//! - [`rdb`], [`published`], [`proxy`] - The three subscription classes
//! - [`bridge`] - Remote calls the client makes into the provider
//! - [`stub`] - Endpoints the provider delivers change events to

mod cache;

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod observer;
pub mod proxy;
pub mod published;
pub mod rdb;
pub mod registry;
pub mod stub;

pub use bridge::{
    DataShareService, ProxyDataSubscriptionService, PublishedDataSubscriptionService,
    RdbSubscriptionService,
};
pub use client::DataShareClient;
pub use config::ClientConfig;
pub use error::Error;
pub use key::SubscriptionKey;
pub use observer::{Observer, ObserverId, ProxyDataObserver, PublishedDataObserver, RdbObserver};
pub use proxy::ProxyDataSubscriptions;
pub use published::PublishedDataSubscriptions;
pub use rdb::RdbSubscriptions;
pub use registry::{KeyState, Outcome, SubscriptionRegistry};
pub use stub::{ObserverStub, ProxyDataObserverStub, PublishedDataObserverStub, RdbObserverStub};

/// Re-export protocol types.
pub use datashare_proto as proto;
