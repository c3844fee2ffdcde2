//! DataShare client API.
//!
//! This module provides [`DataShareClient`], the handle applications use to
//! subscribe to provider changes. All subscription state lives in the client
//! and is torn down when it is closed or dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use datashare_proto::{OperationResult, TemplateId};

use crate::bridge::DataShareService;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::observer::{ObserverId, ProxyDataObserver, PublishedDataObserver, RdbObserver};
use crate::proxy::ProxyDataSubscriptions;
use crate::published::PublishedDataSubscriptions;
use crate::rdb::RdbSubscriptions;

/// A client subscribing to changes of one data-sharing provider.
///
/// Every subscribe/unsubscribe call returns one [`OperationResult`] per
/// distinct uri. The results are independent: some uris may succeed while
/// others are rejected, and the caller is expected to inspect each entry.
///
/// # Example
///
/// ```ignore
/// use datashare_client::{ClientConfig, DataShareClient, RdbObserver};
/// use datashare_proto::TemplateId;
///
/// let client = DataShareClient::new(ClientConfig::new("com.example.app"), service);
///
/// let observer = RdbObserver::new(|change| println!("{} changed", change.uri));
/// let template = TemplateId::new(1, "com.example.app");
/// let results = client.subscribe_rdb_data(
///     &["datashareproxy://com.example.provider/table".to_string()],
///     &template,
///     &observer,
/// )?;
///
/// client.close();
/// ```
pub struct DataShareClient {
    config: ClientConfig,
    service: Arc<dyn DataShareService>,
    rdb: RdbSubscriptions,
    published: PublishedDataSubscriptions,
    proxy: ProxyDataSubscriptions,
    closed: AtomicBool,
}

impl DataShareClient {
    /// Create a client talking to `service`.
    pub fn new(config: ClientConfig, service: Arc<dyn DataShareService>) -> Self {
        tracing::debug!(
            bundle = %config.bundle_name,
            client_id = %config.client_id,
            "creating datashare client"
        );
        Self {
            config,
            service,
            rdb: RdbSubscriptions::new(),
            published: PublishedDataSubscriptions::new(),
            proxy: ProxyDataSubscriptions::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribe `observer` to rdb changes of `uris` under `template_id`.
    pub fn subscribe_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
        observer: &Arc<RdbObserver>,
    ) -> Result<Vec<OperationResult>, Error> {
        self.check_call(uris)?;
        Ok(self
            .rdb
            .add_observers(&*self.service, uris, template_id, observer))
    }

    /// Unsubscribe `observer` (or every observer when `None`) from `uris`.
    ///
    /// With no uris, `observer` is unsubscribed from everything it observes.
    pub fn unsubscribe_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
        observer: Option<ObserverId>,
    ) -> Result<Vec<OperationResult>, Error> {
        self.check_call(uris)?;
        Ok(self
            .rdb
            .del_observers(&*self.service, uris, template_id, observer))
    }

    /// Resume rdb delivery to `observer`.
    pub fn enable_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
        observer: ObserverId,
    ) -> Result<Vec<OperationResult>, Error> {
        self.check_call(uris)?;
        Ok(self
            .rdb
            .enable_observers(&*self.service, uris, template_id, observer))
    }

    /// Pause rdb delivery to `observer`.
    pub fn disable_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
        observer: ObserverId,
    ) -> Result<Vec<OperationResult>, Error> {
        self.check_call(uris)?;
        Ok(self
            .rdb
            .disable_observers(&*self.service, uris, template_id, observer))
    }

    /// Subscribe `observer` to published data `uris` for `subscriber_id`.
    pub fn subscribe_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
        observer: &Arc<PublishedDataObserver>,
    ) -> Result<Vec<OperationResult>, Error> {
        self.check_call(uris)?;
        Ok(self
            .published
            .add_observers(&*self.service, uris, subscriber_id, observer))
    }

    /// Unsubscribe `observer` (or every observer when `None`) from published
    /// data `uris`.
    pub fn unsubscribe_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
        observer: Option<ObserverId>,
    ) -> Result<Vec<OperationResult>, Error> {
        self.check_call(uris)?;
        Ok(self
            .published
            .del_observers(&*self.service, uris, subscriber_id, observer))
    }

    /// Resume published data delivery to `observer`.
    pub fn enable_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
        observer: ObserverId,
    ) -> Result<Vec<OperationResult>, Error> {
        self.check_call(uris)?;
        Ok(self
            .published
            .enable_observers(&*self.service, uris, subscriber_id, observer))
    }

    /// Pause published data delivery to `observer`.
    pub fn disable_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
        observer: ObserverId,
    ) -> Result<Vec<OperationResult>, Error> {
        self.check_call(uris)?;
        Ok(self
            .published
            .disable_observers(&*self.service, uris, subscriber_id, observer))
    }

    /// Subscribe `observer` to shared-config `uris`.
    pub fn subscribe_proxy_data(
        &self,
        uris: &[String],
        observer: &Arc<ProxyDataObserver>,
    ) -> Result<Vec<OperationResult>, Error> {
        self.check_call(uris)?;
        Ok(self.proxy.add_observers(&*self.service, uris, observer))
    }

    /// Unsubscribe `observer` (or every observer when `None`) from
    /// shared-config `uris`.
    pub fn unsubscribe_proxy_data(
        &self,
        uris: &[String],
        observer: Option<ObserverId>,
    ) -> Result<Vec<OperationResult>, Error> {
        self.check_call(uris)?;
        Ok(self.proxy.del_observers(&*self.service, uris, observer))
    }

    /// Re-establish every subscription after the provider restarted.
    pub fn on_service_restarted(&self) -> Result<(), Error> {
        self.check_open()?;
        tracing::info!(client_id = %self.config.client_id, "provider restarted, recovering subscriptions");
        self.rdb.recover_observers(&*self.service);
        self.published.recover_observers(&*self.service);
        self.proxy.recover_observers(&*self.service);
        Ok(())
    }

    /// Unsubscribe everything and close the client.
    ///
    /// Closing twice is a no-op; later calls return [`Error::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let rdb = self.rdb.del_all_observers(&*self.service, None);
        let published = self.published.del_all_observers(&*self.service, None);
        let proxy = self.proxy.del_all_observers(&*self.service, None);

        let failed = rdb
            .iter()
            .chain(published.iter())
            .chain(proxy.iter())
            .filter(|result| !result.is_ok())
            .count();
        tracing::debug!(
            client_id = %self.config.client_id,
            released = rdb.len() + published.len() + proxy.len(),
            failed,
            "datashare client closed"
        );
    }

    /// Check if the client is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Rdb subscriptions owned by this client.
    pub fn rdb(&self) -> &RdbSubscriptions {
        &self.rdb
    }

    /// Published data subscriptions owned by this client.
    pub fn published(&self) -> &PublishedDataSubscriptions {
        &self.published
    }

    /// Shared-config subscriptions owned by this client.
    pub fn proxy(&self) -> &ProxyDataSubscriptions {
        &self.proxy
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn check_call(&self, uris: &[String]) -> Result<(), Error> {
        self.check_open()?;
        self.config.validate_uris(uris)
    }
}

impl Drop for DataShareClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DataShareClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataShareClient")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}
