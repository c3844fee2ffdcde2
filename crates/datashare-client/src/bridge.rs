//! Remote subscription services.
//!
//! These traits are the calls the subscriptions make into the data-sharing
//! provider. Every call returns one [`OperationResult`] per URI; an `Err`
//! means the whole batch failed in transport and is treated as
//! [`ResultCode::InnerError`] for every URI in it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use datashare_proto::{OperationResult, ResultCode, TemplateId};

use crate::error::Error;
use crate::key::SubscriptionKey;
use crate::stub::{ProxyDataObserverStub, PublishedDataObserverStub, RdbObserverStub};

/// Rdb template subscriptions.
pub trait RdbSubscriptionService: Send + Sync {
    /// Subscribe `uris` under `template_id`, delivering changes to `stub`.
    fn subscribe_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
        stub: Arc<RdbObserverStub>,
    ) -> Result<Vec<OperationResult>, Error>;

    /// Drop the subscription for `uris` under `template_id`.
    fn unsubscribe_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
    ) -> Result<Vec<OperationResult>, Error>;

    /// Resume delivery for `uris`.
    fn enable_subscribe_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
    ) -> Result<Vec<OperationResult>, Error>;

    /// Pause delivery for `uris` without dropping the subscription.
    fn disable_subscribe_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
    ) -> Result<Vec<OperationResult>, Error>;
}

/// Published data subscriptions.
pub trait PublishedDataSubscriptionService: Send + Sync {
    /// Subscribe `uris` for `subscriber_id`, delivering changes to `stub`.
    fn subscribe_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
        stub: Arc<PublishedDataObserverStub>,
    ) -> Result<Vec<OperationResult>, Error>;

    /// Drop the subscription for `uris`.
    fn unsubscribe_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
    ) -> Result<Vec<OperationResult>, Error>;

    /// Resume delivery for `uris`.
    fn enable_subscribe_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
    ) -> Result<Vec<OperationResult>, Error>;

    /// Pause delivery for `uris` without dropping the subscription.
    fn disable_subscribe_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
    ) -> Result<Vec<OperationResult>, Error>;
}

/// Shared-config subscriptions.
pub trait ProxyDataSubscriptionService: Send + Sync {
    /// Subscribe `uris`, delivering changes to `stub`.
    fn subscribe_proxy_data(
        &self,
        uris: &[String],
        stub: Arc<ProxyDataObserverStub>,
    ) -> Result<Vec<OperationResult>, Error>;

    /// Drop the subscription for `uris`.
    fn unsubscribe_proxy_data(&self, uris: &[String]) -> Result<Vec<OperationResult>, Error>;
}

/// A provider connection offering every subscription class.
pub trait DataShareService:
    RdbSubscriptionService + PublishedDataSubscriptionService + ProxyDataSubscriptionService
{
}

impl<T> DataShareService for T where
    T: RdbSubscriptionService + PublishedDataSubscriptionService + ProxyDataSubscriptionService
{
}

/// Flatten a remote call into per-URI results.
///
/// A transport failure becomes an [`ResultCode::InnerError`] entry for every
/// URI of the batch.
pub(crate) fn results_or_failure(
    uris: &[String],
    result: Result<Vec<OperationResult>, Error>,
) -> Vec<OperationResult> {
    match result {
        Ok(results) => results,
        Err(e) => {
            tracing::warn!(error = %e, count = uris.len(), "remote call failed");
            uris.iter()
                .map(|uri| OperationResult::new(uri.clone(), ResultCode::InnerError))
                .collect()
        }
    }
}

/// Issue one remote call per discriminator and map the results back onto
/// `keys`, in order. Keys the provider did not answer for count as failed.
pub(crate) fn call_grouped<D, F>(keys: &[SubscriptionKey<D>], mut call: F) -> Vec<ResultCode>
where
    D: Ord + Clone,
    F: FnMut(&D, &[String]) -> Result<Vec<OperationResult>, Error>,
{
    let mut groups: BTreeMap<D, Vec<usize>> = BTreeMap::new();
    for (i, key) in keys.iter().enumerate() {
        groups.entry(key.discriminator().clone()).or_default().push(i);
    }

    let mut codes = vec![ResultCode::InnerError; keys.len()];
    for (discriminator, indexes) in groups {
        let uris: Vec<String> = indexes.iter().map(|i| keys[*i].uri().to_string()).collect();
        let results = results_or_failure(&uris, call(&discriminator, &uris));
        for i in indexes {
            if let Some(result) = results.iter().find(|r| r.key == keys[i].uri()) {
                codes[i] = result.code;
            }
        }
    }
    codes
}

/// Log every key whose remote call failed.
pub(crate) fn log_failures<D: Debug>(keys: &[SubscriptionKey<D>], codes: &[ResultCode], message: &str) {
    for (key, code) in keys.iter().zip(codes) {
        if !code.is_ok() {
            tracing::warn!(key = %key, code = ?code, "{}", message);
        }
    }
}
