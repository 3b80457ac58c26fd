use super::backend::BackendClient;
use super::manager::{BillingManager, Command, ConnectionState, Published};
use crate::config::BillingConfig;
use crate::domain::plan::EnrichedPlan;
use crate::domain::ports::{BillingGateway, GatewayRef, PurchaseParams, StoreClientRef};
use crate::domain::processing::PaymentProcessingState;
use crate::domain::purchase::{Product, PurchaseRecord, PurchaseState, SubscriptionStatus};
use crate::error::{BillingError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Handle to a running billing session.
#[derive(Clone)]
pub struct StoreBillingGateway {
    commands: mpsc::UnboundedSender<Command>,
    store: StoreClientRef,
    management_url: String,
    store_fallback_url: String,
    available: watch::Receiver<bool>,
    connection: watch::Receiver<ConnectionState>,
    catalog: watch::Receiver<Vec<Product>>,
    plans: watch::Receiver<Vec<EnrichedPlan>>,
    refreshing: watch::Receiver<bool>,
    processing: watch::Receiver<Option<PaymentProcessingState>>,
    purchase_state: watch::Receiver<PurchaseState>,
    status: watch::Receiver<SubscriptionStatus>,
}

impl StoreBillingGateway {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        store: StoreClientRef,
        config: &BillingConfig,
        published: &Published,
    ) -> Self {
        Self {
            commands,
            store,
            management_url: config.management_url.clone(),
            store_fallback_url: config.store_fallback_url.clone(),
            available: published.available.subscribe(),
            connection: published.connection.subscribe(),
            catalog: published.catalog.subscribe(),
            plans: published.plans.subscribe(),
            refreshing: published.refreshing.subscribe(),
            processing: published.processing.subscribe(),
            purchase_state: published.purchase_state.subscribe(),
            status: published.status.subscribe(),
        }
    }

    fn send(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            warn!("billing session is closed; command dropped");
            return false;
        }
        true
    }

    /// Connects to the store. A no-op while connecting or connected.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Purchases from the cache when fresh, otherwise from a live query.
    pub async fn query_purchases(&self, force: bool) -> Result<Vec<PurchaseRecord>> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::QueryPurchases { force, reply }) {
            return Err(BillingError::Shutdown);
        }
        rx.await.map_err(|_| BillingError::Shutdown)?
    }

    pub fn purchase_state(&self) -> PurchaseState {
        self.purchase_state.borrow().clone()
    }

    pub fn purchase_state_updates(&self) -> watch::Receiver<PurchaseState> {
        self.purchase_state.clone()
    }

    pub fn subscription_status_updates(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }

    pub fn plans(&self) -> watch::Receiver<Vec<EnrichedPlan>> {
        self.plans.clone()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Resolves once every command sent before it has been handled.
    pub async fn flush(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        if !self.send(Command::Flush(ack)) {
            return Err(BillingError::Shutdown);
        }
        rx.await.map_err(|_| BillingError::Shutdown)
    }

    /// Waits until processing is neither loading nor verifying.
    pub async fn wait_until_settled(&self) -> Option<PaymentProcessingState> {
        let mut processing = self.processing.clone();
        match processing
            .wait_for(|state| !state.as_ref().is_some_and(PaymentProcessingState::is_in_flight))
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => self.processing.borrow().clone(),
        }
    }

    /// Stops the session: the refresher is aborted and pending backend
    /// transactions are failed.
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.send(Command::Shutdown(ack)) {
            let _ = rx.await;
        }
    }
}

impl BillingGateway for StoreBillingGateway {
    fn available(&self) -> bool {
        *self.available.borrow()
    }

    fn product_catalog(&self) -> watch::Receiver<Vec<Product>> {
        self.catalog.clone()
    }

    fn is_refreshing(&self) -> watch::Receiver<bool> {
        self.refreshing.clone()
    }

    fn processing_state(&self) -> watch::Receiver<Option<PaymentProcessingState>> {
        self.processing.clone()
    }

    fn subscription_status(&self) -> SubscriptionStatus {
        *self.status.borrow()
    }

    fn refresh(&self, force: bool) {
        self.send(Command::Refresh { force });
    }

    fn invalidate_cache(&self) {
        self.send(Command::InvalidateCache);
    }

    fn open_store_management_screen(&self) -> bool {
        if self.store.open_url(&self.management_url) {
            return true;
        }
        debug!("management screen unavailable, trying store fallback");
        self.store.open_url(&self.store_fallback_url)
    }

    fn launch_purchase(&self, product_id: &str, offer_token: Option<&str>, account_id: Option<&str>) {
        self.send(Command::LaunchPurchase(PurchaseParams {
            product_id: product_id.to_string(),
            offer_token: offer_token.map(str::to_string),
            account_id: account_id.map(str::to_string),
        }));
    }

    fn retry_verification(&self) {
        self.send(Command::RetryVerification);
    }

    fn reset_processing_state(&self) -> bool {
        if self
            .processing
            .borrow()
            .as_ref()
            .is_some_and(PaymentProcessingState::is_in_flight)
        {
            debug!("processing in flight; reset refused");
            return false;
        }
        self.send(Command::ResetProcessingState)
    }

    fn trigger_recovery(&self) {
        self.send(Command::TriggerRecovery);
    }
}

/// Gateway used when the store cannot be reached at all.
pub struct NoopBillingGateway {
    catalog: watch::Sender<Vec<Product>>,
    refreshing: watch::Sender<bool>,
    processing: watch::Sender<Option<PaymentProcessingState>>,
}

impl NoopBillingGateway {
    pub fn new() -> Self {
        Self {
            catalog: watch::Sender::new(Vec::new()),
            refreshing: watch::Sender::new(false),
            processing: watch::Sender::new(None),
        }
    }
}

impl Default for NoopBillingGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl BillingGateway for NoopBillingGateway {
    fn available(&self) -> bool {
        false
    }

    fn product_catalog(&self) -> watch::Receiver<Vec<Product>> {
        self.catalog.subscribe()
    }

    fn is_refreshing(&self) -> watch::Receiver<bool> {
        self.refreshing.subscribe()
    }

    fn processing_state(&self) -> watch::Receiver<Option<PaymentProcessingState>> {
        self.processing.subscribe()
    }

    fn subscription_status(&self) -> SubscriptionStatus {
        SubscriptionStatus::default()
    }

    fn refresh(&self, _force: bool) {}

    fn invalidate_cache(&self) {}

    fn open_store_management_screen(&self) -> bool {
        false
    }

    fn launch_purchase(&self, product_id: &str, _offer_token: Option<&str>, _account_id: Option<&str>) {
        debug!(%product_id, "billing unavailable; purchase ignored");
    }

    fn retry_verification(&self) {}

    fn reset_processing_state(&self) -> bool {
        true
    }

    fn trigger_recovery(&self) {}
}

/// Picks the gateway for this host.
pub struct BillingProvider;

impl BillingProvider {
    /// Spawns a store-backed session and waits up to the connect timeout for
    /// it to become available. Without a store, or when the store never comes
    /// up, the no-op gateway is returned instead.
    pub async fn get(store: Option<StoreClientRef>, backend: BackendClient, config: BillingConfig) -> GatewayRef {
        let Some(store) = store else {
            info!("no store capability; billing disabled");
            return Arc::new(NoopBillingGateway::new());
        };
        match Self::connect(store, backend, config).await {
            Some(gateway) => Arc::new(gateway),
            None => Arc::new(NoopBillingGateway::new()),
        }
    }

    /// The store-backed gateway, if it connects within the timeout.
    pub async fn connect(
        store: StoreClientRef,
        backend: BackendClient,
        config: BillingConfig,
    ) -> Option<StoreBillingGateway> {
        let timeout = config.connect_timeout();
        let gateway = BillingManager::spawn(store, backend, config);
        let mut available = gateway.available.clone();
        let connected = matches!(
            tokio::time::timeout(timeout, available.wait_for(|up| *up)).await,
            Ok(Ok(_))
        );
        if connected {
            return Some(gateway);
        }
        warn!(timeout_ms = timeout.as_millis() as u64, "store not available; falling back to no-op billing");
        gateway.shutdown().await;
        None
    }
}
