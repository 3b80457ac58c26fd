use crate::application::registry::ScriptCallbacks;
use crate::domain::classifier::FailureCause;
use crate::domain::payment::{BackendFunction, ScriptCall};
use crate::domain::ports::{PurchaseParams, ScriptSurface, StoreClient, StoreFeature, StoreListener};
use crate::domain::purchase::{Product, PurchaseRecord, PurchaseStatus};
use crate::error::{StoreFailure, StoreResponseCode, SurfaceError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct StoreState {
    products: Vec<Product>,
    purchases: Vec<PurchaseRecord>,
    connect_results: VecDeque<Result<(), StoreFailure>>,
    product_query_failure: Option<StoreFailure>,
    purchase_query_failure: Option<StoreFailure>,
    launch_failure: Option<StoreFailure>,
    ack_failure: Option<StoreFailure>,
    subscriptions_supported: bool,
    auto_complete: bool,
    hold_next_query: bool,
    listener: Option<StoreListener>,
    blocked_urls: HashSet<String>,
    opened_urls: Vec<String>,
    launches: Vec<PurchaseParams>,
    acks: HashMap<String, usize>,
    next_order: usize,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            products: Vec::new(),
            purchases: Vec::new(),
            connect_results: VecDeque::new(),
            product_query_failure: None,
            purchase_query_failure: None,
            launch_failure: None,
            ack_failure: None,
            subscriptions_supported: true,
            auto_complete: false,
            hold_next_query: false,
            listener: None,
            blocked_urls: HashSet::new(),
            opened_urls: Vec::new(),
            launches: Vec::new(),
            acks: HashMap::new(),
            next_order: 1,
        }
    }
}

/// A scriptable in-process store.
///
/// Every outcome the manager reacts to can be staged up front: connect results,
/// query failures, acknowledgement failures and out-of-band purchase updates.
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    query_count: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            query_count: AtomicUsize::new(0),
            gate: watch::Sender::new(false),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(self, products: Vec<Product>) -> Self {
        lock(&self.state).products = products;
        self
    }

    pub fn set_products(&self, products: Vec<Product>) {
        lock(&self.state).products = products;
    }

    pub fn set_purchases(&self, purchases: Vec<PurchaseRecord>) {
        lock(&self.state).purchases = purchases;
    }

    /// Results returned by successive `connect` calls; `Ok` once exhausted.
    pub fn push_connect_result(&self, result: Result<(), StoreFailure>) {
        lock(&self.state).connect_results.push_back(result);
    }

    pub fn fail_product_query(&self, failure: Option<StoreFailure>) {
        lock(&self.state).product_query_failure = failure;
    }

    pub fn fail_purchase_query(&self, failure: Option<StoreFailure>) {
        lock(&self.state).purchase_query_failure = failure;
    }

    pub fn fail_launch(&self, failure: Option<StoreFailure>) {
        lock(&self.state).launch_failure = failure;
    }

    pub fn fail_acknowledge(&self, failure: Option<StoreFailure>) {
        lock(&self.state).ack_failure = failure;
    }

    pub fn set_subscriptions_supported(&self, supported: bool) {
        lock(&self.state).subscriptions_supported = supported;
    }

    /// Launching a purchase immediately delivers it as purchased.
    pub fn set_auto_complete(&self, auto_complete: bool) {
        lock(&self.state).auto_complete = auto_complete;
    }

    pub fn block_url(&self, url: &str) {
        lock(&self.state).blocked_urls.insert(url.to_string());
    }

    /// The next purchase query snapshots its answer and then waits for
    /// [`release_queries`](Self::release_queries).
    pub fn hold_next_query(&self) {
        lock(&self.state).hold_next_query = true;
        self.gate.send_replace(true);
    }

    pub fn release_queries(&self) {
        self.gate.send_replace(false);
    }

    /// Records a purchase and reports it through the listener.
    pub fn deliver_purchase(&self, record: PurchaseRecord) -> bool {
        let listener = {
            let mut state = lock(&self.state);
            state.purchases.retain(|p| p.purchase_token != record.purchase_token);
            state.purchases.push(record.clone());
            state.listener.clone()
        };
        listener.is_some_and(|l| l.purchases_updated(Ok(vec![record])))
    }

    pub fn deliver_failure(&self, failure: StoreFailure) -> bool {
        let listener = lock(&self.state).listener.clone();
        listener.is_some_and(|l| l.purchases_updated(Err(failure)))
    }

    /// Simulates the store dropping the connection.
    pub fn disconnect(&self) -> bool {
        let listener = lock(&self.state).listener.clone();
        listener.is_some_and(|l| l.disconnected())
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    pub fn ack_count(&self, purchase_token: &str) -> usize {
        lock(&self.state).acks.get(purchase_token).copied().unwrap_or(0)
    }

    pub fn launches(&self) -> Vec<PurchaseParams> {
        lock(&self.state).launches.clone()
    }

    pub fn opened_urls(&self) -> Vec<String> {
        lock(&self.state).opened_urls.clone()
    }

    pub fn purchases(&self) -> Vec<PurchaseRecord> {
        lock(&self.state).purchases.clone()
    }

    fn purchase_for(state: &mut StoreState, params: &PurchaseParams) -> PurchaseRecord {
        let order = state.next_order;
        state.next_order += 1;
        PurchaseRecord {
            purchase_token: format!("purchase-token-{order}"),
            product_id: params.product_id.clone(),
            order_id: Some(format!("GPA.{order:04}")),
            package_name: "billing.core".to_string(),
            status: PurchaseStatus::Purchased,
            acknowledged: false,
            auto_renewing: true,
            expiry_time_millis: None,
            obfuscated_account_id: params.account_id.clone(),
        }
    }
}

#[async_trait]
impl StoreClient for InMemoryStore {
    async fn connect(&self, listener: StoreListener) -> Result<(), StoreFailure> {
        let mut state = lock(&self.state);
        let result = state.connect_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            state.listener = Some(listener);
        }
        result
    }

    fn is_feature_supported(&self, feature: StoreFeature) -> bool {
        match feature {
            StoreFeature::Subscriptions => lock(&self.state).subscriptions_supported,
            StoreFeature::ProductDetails => true,
        }
    }

    async fn query_products(&self, product_ids: &[String]) -> Result<Vec<Product>, StoreFailure> {
        let state = lock(&self.state);
        if let Some(failure) = state.product_query_failure.clone() {
            return Err(failure);
        }
        Ok(state
            .products
            .iter()
            .filter(|p| product_ids.contains(&p.product_id))
            .cloned()
            .collect())
    }

    async fn query_purchases(&self) -> Result<Vec<PurchaseRecord>, StoreFailure> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        let (snapshot, hold) = {
            let mut state = lock(&self.state);
            let snapshot = match state.purchase_query_failure.clone() {
                Some(failure) => Err(failure),
                None => Ok(state.purchases.clone()),
            };
            (snapshot, std::mem::take(&mut state.hold_next_query))
        };
        if hold {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|held| !*held).await;
        }
        snapshot
    }

    async fn launch_purchase(&self, params: &PurchaseParams) -> Result<(), StoreFailure> {
        let (record, listener) = {
            let mut state = lock(&self.state);
            state.launches.push(params.clone());
            if let Some(failure) = state.launch_failure.clone() {
                return Err(failure);
            }
            if !state.products.iter().any(|p| p.product_id == params.product_id) {
                return Err(StoreFailure::new(
                    StoreResponseCode::ItemUnavailable,
                    format!("unknown product {}", params.product_id),
                ));
            }
            if !state.auto_complete {
                return Ok(());
            }
            let record = Self::purchase_for(&mut state, params);
            state.purchases.push(record.clone());
            (record, state.listener.clone())
        };
        if let Some(listener) = listener {
            listener.purchases_updated(Ok(vec![record]));
        }
        Ok(())
    }

    async fn acknowledge(&self, purchase_token: &str) -> Result<(), StoreFailure> {
        let mut state = lock(&self.state);
        *state.acks.entry(purchase_token.to_string()).or_default() += 1;
        if let Some(failure) = state.ack_failure.clone() {
            return Err(failure);
        }
        for purchase in state
            .purchases
            .iter_mut()
            .filter(|p| p.purchase_token == purchase_token)
        {
            purchase.acknowledged = true;
        }
        Ok(())
    }

    fn open_url(&self, url: &str) -> bool {
        let mut state = lock(&self.state);
        if state.blocked_urls.contains(url) {
            return false;
        }
        state.opened_urls.push(url.to_string());
        true
    }
}

/// How the in-memory surface answers one script call.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceReply {
    Success(Value),
    Reject(String),
    /// Never posts a result.
    Silent,
    /// The script cannot be executed at all.
    Fail(FailureCause),
    /// Posts the given text verbatim.
    Raw(String),
    /// Posts the default success twice.
    Duplicate,
}

#[derive(Debug, Default)]
struct SurfaceState {
    callbacks: Option<ScriptCallbacks>,
    replies: HashMap<BackendFunction, VecDeque<SurfaceReply>>,
    calls: Vec<ScriptCall>,
    subscriptions: Vec<Value>,
    tokens_issued: usize,
}

/// Script surface that answers through the registered callbacks on a
/// background task, the way a real web context would.
#[derive(Debug, Default)]
pub struct InMemoryScriptSurface {
    state: Mutex<SurfaceState>,
    dropped_callbacks: Arc<AtomicUsize>,
}

impl InMemoryScriptSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, callbacks: ScriptCallbacks) {
        lock(&self.state).callbacks = Some(callbacks);
    }

    pub fn push_reply(&self, function: BackendFunction, reply: SurfaceReply) {
        lock(&self.state)
            .replies
            .entry(function)
            .or_default()
            .push_back(reply);
    }

    /// Backend subscriptions reported by `getSubscriptions`, by name.
    pub fn set_subscriptions(&self, names: &[&str]) {
        lock(&self.state).subscriptions = names
            .iter()
            .enumerate()
            .map(|(i, name)| json!({"ID": format!("sub-{i}"), "Name": name, "Renew": 1}))
            .collect();
    }

    pub fn calls(&self) -> Vec<BackendFunction> {
        lock(&self.state).calls.iter().map(|c| c.function).collect()
    }

    pub fn payloads(&self, function: BackendFunction) -> Vec<Value> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.function == function)
            .filter_map(|c| c.payload.clone())
            .collect()
    }

    /// Callbacks the registry refused (unknown or already completed ids).
    pub fn dropped_callbacks(&self) -> usize {
        self.dropped_callbacks.load(Ordering::SeqCst)
    }

    fn default_data(state: &mut SurfaceState, function: BackendFunction) -> Value {
        match function {
            BackendFunction::PaymentToken => {
                state.tokens_issued += 1;
                json!({"Token": format!("payment-token-{}", state.tokens_issued)})
            }
            BackendFunction::Subscription => json!({"Code": 1000}),
            BackendFunction::GetSubscriptions => json!({"Subscriptions": state.subscriptions}),
        }
    }
}

fn success(data: &Value) -> String {
    json!({"status": "success", "data": data}).to_string()
}

#[async_trait]
impl ScriptSurface for InMemoryScriptSurface {
    async fn execute(&self, call: &ScriptCall) -> Result<(), SurfaceError> {
        let (callbacks, posts) = {
            let mut state = lock(&self.state);
            let Some(callbacks) = state.callbacks.clone() else {
                return Err(SurfaceError::Unavailable);
            };
            state.calls.push(call.clone());
            let reply = state
                .replies
                .get_mut(&call.function)
                .and_then(VecDeque::pop_front);
            let posts = match reply {
                Some(SurfaceReply::Fail(cause)) => return Err(SurfaceError::Failed(cause)),
                Some(SurfaceReply::Silent) => Vec::new(),
                Some(SurfaceReply::Success(data)) => vec![success(&data)],
                Some(SurfaceReply::Reject(message)) => {
                    vec![json!({"status": "error", "message": message}).to_string()]
                }
                Some(SurfaceReply::Raw(raw)) => vec![raw],
                Some(SurfaceReply::Duplicate) => {
                    let raw = success(&Self::default_data(&mut state, call.function));
                    vec![raw.clone(), raw]
                }
                None => vec![success(&Self::default_data(&mut state, call.function))],
            };
            (callbacks, posts)
        };

        let transaction_id = call.transaction_id.to_string();
        let dropped = self.dropped_callbacks.clone();
        debug!(%transaction_id, function = %call.function, posts = posts.len(), "executing script");
        tokio::spawn(async move {
            for raw in posts {
                if !callbacks.post_result(&transaction_id, &raw).await {
                    dropped.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::TransactionId;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_connect_results_are_consumed_in_order() {
        let store = InMemoryStore::new();
        store.push_connect_result(Err(StoreFailure::new(
            StoreResponseCode::ServiceUnavailable,
            "down",
        )));
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(store.connect(StoreListener::new(tx.clone())).await.is_err());
        assert!(store.connect(StoreListener::new(tx)).await.is_ok());
    }

    #[tokio::test]
    async fn test_acknowledge_marks_purchase() {
        let store = InMemoryStore::new();
        let params = PurchaseParams {
            product_id: "p".to_string(),
            offer_token: None,
            account_id: None,
        };
        let record = {
            let mut state = lock(&store.state);
            InMemoryStore::purchase_for(&mut state, &params)
        };
        store.set_purchases(vec![record.clone()]);

        store.acknowledge(&record.purchase_token).await.unwrap();
        assert_eq!(store.ack_count(&record.purchase_token), 1);
        assert!(store.purchases()[0].acknowledged);
    }

    #[tokio::test]
    async fn test_blocked_url_is_not_opened() {
        let store = InMemoryStore::new();
        store.block_url("https://a");
        assert!(!store.open_url("https://a"));
        assert!(store.open_url("https://b"));
        assert_eq!(store.opened_urls(), vec!["https://b"]);
    }

    #[tokio::test]
    async fn test_unattached_surface_is_unavailable() {
        let surface = InMemoryScriptSurface::new();
        let call = ScriptCall {
            transaction_id: TransactionId::new(),
            function: BackendFunction::PaymentToken,
            payload: None,
        };
        assert_eq!(surface.execute(&call).await, Err(SurfaceError::Unavailable));
    }
}
