//! In-process provider used by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use datashare_client::proto::{
    callback, CallbackMessage, OperationResult, ProxyDataChangeInfo, PublishedDataChangeNode,
    RdbChangeNode, ResultCode, TemplateId,
};
use datashare_client::{
    ClientConfig, DataShareClient, Error, ProxyDataObserverStub, ProxyDataSubscriptionService,
    PublishedDataObserverStub, PublishedDataSubscriptionService, RdbObserverStub,
    RdbSubscriptionService,
};

/// Remote call recorded by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Subscribe(String),
    Unsubscribe(String),
    Enable(String),
    Disable(String),
}

#[derive(Default)]
struct State {
    rdb: BTreeMap<(String, TemplateId), Arc<RdbObserverStub>>,
    published: BTreeMap<(String, i64), Arc<PublishedDataObserverStub>>,
    proxy: BTreeMap<String, Arc<ProxyDataObserverStub>>,
    calls: Vec<Call>,
    rejected: HashMap<String, ResultCode>,
    failing_unsubscribe: BTreeSet<String>,
    transport_down: bool,
    current_rdb: BTreeMap<String, RdbChangeNode>,
}

/// A provider that keeps subscriptions in memory and delivers changes
/// through the stubs it was handed.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<State>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject subscriptions to `uri` with `code`.
    pub fn reject(&self, uri: &str, code: ResultCode) {
        self.state.lock().rejected.insert(uri.to_string(), code);
    }

    /// Fail unsubscribing from `uri`.
    pub fn fail_unsubscribe(&self, uri: &str, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_unsubscribe.insert(uri.to_string());
        } else {
            state.failing_unsubscribe.remove(uri);
        }
    }

    /// Push `node` to the subscriber from inside every later subscribe or
    /// unsubscribe call touching its uri, before the call returns.
    pub fn push_on_call(&self, node: RdbChangeNode) {
        self.state.lock().current_rdb.insert(node.uri.clone(), node);
    }

    /// Fail every call as a whole.
    pub fn set_transport_down(&self, down: bool) {
        self.state.lock().transport_down = down;
    }

    /// Forget every subscription, as after a provider restart.
    pub fn restart(&self) {
        let mut state = self.state.lock();
        state.rdb.clear();
        state.published.clear();
        state.proxy.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count(&self, call: &Call) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn rdb_subscribed(&self) -> Vec<String> {
        self.state.lock().rdb.keys().map(|(uri, _)| uri.clone()).collect()
    }

    pub fn published_subscribed(&self) -> Vec<String> {
        self.state.lock().published.keys().map(|(uri, _)| uri.clone()).collect()
    }

    pub fn proxy_subscribed(&self) -> Vec<String> {
        self.state.lock().proxy.keys().cloned().collect()
    }

    /// Deliver an rdb change as a callback frame.
    pub fn publish_rdb(&self, node: RdbChangeNode) {
        let stub = self
            .state
            .lock()
            .rdb
            .get(&(node.uri.clone(), node.template_id.clone()))
            .cloned();
        if let Some(stub) = stub {
            let frame = callback::encode(&CallbackMessage::Rdb(node)).unwrap();
            stub.on_remote_request(&frame).unwrap();
        }
    }

    /// Deliver a published data batch to every stub subscribed to one of
    /// its items.
    pub fn publish_published(&self, node: PublishedDataChangeNode) {
        let stubs: Vec<_> = {
            let state = self.state.lock();
            let mut stubs: Vec<Arc<PublishedDataObserverStub>> = Vec::new();
            for item in &node.datas {
                if let Some(stub) = state.published.get(&(item.key.clone(), item.subscriber_id)) {
                    if !stubs.iter().any(|s| Arc::ptr_eq(s, stub)) {
                        stubs.push(stub.clone());
                    }
                }
            }
            stubs
        };
        let frame = callback::encode(&CallbackMessage::PublishedData(node)).unwrap();
        for stub in stubs {
            stub.on_remote_request(&frame).unwrap();
        }
    }

    /// Deliver shared-config changes to every stub subscribed to one of
    /// their uris.
    pub fn publish_proxy(&self, changes: Vec<ProxyDataChangeInfo>) {
        let stubs: Vec<_> = {
            let state = self.state.lock();
            let mut stubs: Vec<Arc<ProxyDataObserverStub>> = Vec::new();
            for change in &changes {
                if let Some(stub) = state.proxy.get(&change.uri) {
                    if !stubs.iter().any(|s| Arc::ptr_eq(s, stub)) {
                        stubs.push(stub.clone());
                    }
                }
            }
            stubs
        };
        let frame = callback::encode(&CallbackMessage::ProxyData(changes)).unwrap();
        for stub in stubs {
            stub.on_remote_request(&frame).unwrap();
        }
    }

    fn record(&self, uris: &[String], call: fn(String) -> Call) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.calls.extend(uris.iter().cloned().map(call));
        if state.transport_down {
            return Err(Error::Transport("provider unreachable".to_string()));
        }
        Ok(())
    }

    fn subscribe_code(&self, uri: &str) -> ResultCode {
        self.state
            .lock()
            .rejected
            .get(uri)
            .copied()
            .unwrap_or(ResultCode::Ok)
    }

    fn unsubscribe_code(&self, uri: &str) -> ResultCode {
        if self.state.lock().failing_unsubscribe.contains(uri) {
            ResultCode::InnerError
        } else {
            ResultCode::Ok
        }
    }

    fn push_current(&self, uri: &str, stub: &RdbObserverStub) -> Result<(), Error> {
        let node = self.state.lock().current_rdb.get(uri).cloned();
        if let Some(node) = node {
            let frame = callback::encode(&CallbackMessage::Rdb(node))?;
            stub.on_remote_request(&frame)?;
        }
        Ok(())
    }

    fn ok_all(uris: &[String]) -> Vec<OperationResult> {
        uris.iter().map(|uri| OperationResult::ok(uri.clone())).collect()
    }
}

impl RdbSubscriptionService for MockProvider {
    fn subscribe_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
        stub: Arc<RdbObserverStub>,
    ) -> Result<Vec<OperationResult>, Error> {
        self.record(uris, Call::Subscribe)?;
        let mut results = Vec::new();
        for uri in uris {
            let code = self.subscribe_code(uri);
            if code.is_ok() {
                self.state
                    .lock()
                    .rdb
                    .insert((uri.clone(), template_id.clone()), stub.clone());
            }
            results.push(OperationResult::new(uri.clone(), code));
        }
        for result in results.iter().filter(|result| result.is_ok()) {
            self.push_current(&result.key, &stub)?;
        }
        Ok(results)
    }

    fn unsubscribe_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
    ) -> Result<Vec<OperationResult>, Error> {
        self.record(uris, Call::Unsubscribe)?;
        let mut results = Vec::new();
        for uri in uris {
            let stub = self
                .state
                .lock()
                .rdb
                .get(&(uri.clone(), template_id.clone()))
                .cloned();
            if let Some(stub) = stub {
                self.push_current(uri, &stub)?;
            }
            let code = self.unsubscribe_code(uri);
            if code.is_ok() {
                self.state.lock().rdb.remove(&(uri.clone(), template_id.clone()));
            }
            results.push(OperationResult::new(uri.clone(), code));
        }
        Ok(results)
    }

    fn enable_subscribe_rdb_data(
        &self,
        uris: &[String],
        _template_id: &TemplateId,
    ) -> Result<Vec<OperationResult>, Error> {
        self.record(uris, Call::Enable)?;
        Ok(Self::ok_all(uris))
    }

    fn disable_subscribe_rdb_data(
        &self,
        uris: &[String],
        _template_id: &TemplateId,
    ) -> Result<Vec<OperationResult>, Error> {
        self.record(uris, Call::Disable)?;
        Ok(Self::ok_all(uris))
    }
}

impl PublishedDataSubscriptionService for MockProvider {
    fn subscribe_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
        stub: Arc<PublishedDataObserverStub>,
    ) -> Result<Vec<OperationResult>, Error> {
        self.record(uris, Call::Subscribe)?;
        let mut results = Vec::new();
        for uri in uris {
            let code = self.subscribe_code(uri);
            if code.is_ok() {
                self.state
                    .lock()
                    .published
                    .insert((uri.clone(), subscriber_id), stub.clone());
            }
            results.push(OperationResult::new(uri.clone(), code));
        }
        Ok(results)
    }

    fn unsubscribe_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
    ) -> Result<Vec<OperationResult>, Error> {
        self.record(uris, Call::Unsubscribe)?;
        let mut results = Vec::new();
        for uri in uris {
            let code = self.unsubscribe_code(uri);
            if code.is_ok() {
                self.state.lock().published.remove(&(uri.clone(), subscriber_id));
            }
            results.push(OperationResult::new(uri.clone(), code));
        }
        Ok(results)
    }

    fn enable_subscribe_published_data(
        &self,
        uris: &[String],
        _subscriber_id: i64,
    ) -> Result<Vec<OperationResult>, Error> {
        self.record(uris, Call::Enable)?;
        Ok(Self::ok_all(uris))
    }

    fn disable_subscribe_published_data(
        &self,
        uris: &[String],
        _subscriber_id: i64,
    ) -> Result<Vec<OperationResult>, Error> {
        self.record(uris, Call::Disable)?;
        Ok(Self::ok_all(uris))
    }
}

impl ProxyDataSubscriptionService for MockProvider {
    fn subscribe_proxy_data(
        &self,
        uris: &[String],
        stub: Arc<ProxyDataObserverStub>,
    ) -> Result<Vec<OperationResult>, Error> {
        self.record(uris, Call::Subscribe)?;
        let mut results = Vec::new();
        for uri in uris {
            let code = self.subscribe_code(uri);
            if code.is_ok() {
                self.state.lock().proxy.insert(uri.clone(), stub.clone());
            }
            results.push(OperationResult::new(uri.clone(), code));
        }
        Ok(results)
    }

    fn unsubscribe_proxy_data(&self, uris: &[String]) -> Result<Vec<OperationResult>, Error> {
        self.record(uris, Call::Unsubscribe)?;
        let mut results = Vec::new();
        for uri in uris {
            let code = self.unsubscribe_code(uri);
            if code.is_ok() {
                self.state.lock().proxy.remove(uri);
            }
            results.push(OperationResult::new(uri.clone(), code));
        }
        Ok(results)
    }
}

/// Route library logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datashare_client=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A client bound to a fresh provider.
pub fn client() -> (DataShareClient, Arc<MockProvider>) {
    init_tracing();
    let provider = MockProvider::new();
    let client = DataShareClient::new(ClientConfig::new("com.example.app"), provider.clone());
    (client, provider)
}

pub fn uris(list: &[&str]) -> Vec<String> {
    list.iter().map(|uri| uri.to_string()).collect()
}

/// Collects every change an observer receives.
pub fn recorder<E: Clone + Send + 'static>() -> (Arc<datashare_client::Observer<E>>, Arc<Mutex<Vec<E>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer = datashare_client::Observer::new(move |change: &E| sink.lock().push(change.clone()));
    (observer, seen)
}
