#![allow(dead_code)]

use billing_core::application::backend::BackendClient;
use billing_core::application::gateway::StoreBillingGateway;
use billing_core::application::manager::{BillingManager, ConnectionState};
use billing_core::config::BillingConfig;
use billing_core::domain::ports::{BillingGateway, StoreClientRef};
use billing_core::domain::processing::PaymentProcessingState;
use billing_core::domain::purchase::{
    PricingPhase, Product, PurchaseRecord, PurchaseState, PurchaseStatus, SubscriptionOffer,
};
use billing_core::infrastructure::in_memory::{InMemoryScriptSurface, InMemoryStore};
use std::sync::Arc;
use std::time::Duration;

pub const MONTHLY: &str = "plus_1_renewing";
pub const ANNUAL: &str = "plus_12_renewing";
pub const ACCOUNT: &str = "acct-42";

/// Upper bound on any single wait. Tests run on a paused clock, so this only
/// matters when something is genuinely stuck.
pub const WAIT: Duration = Duration::from_secs(600);

pub fn product(id: &str, period: &str, micros: i64, formatted: &str) -> Product {
    Product {
        product_id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        one_time_price: None,
        offers: vec![SubscriptionOffer {
            base_plan_id: id.to_string(),
            offer_token: offer_token(id),
            pricing_phases: vec![PricingPhase {
                billing_period: period.to_string(),
                formatted_price: formatted.to_string(),
                price_amount_micros: micros,
                price_currency_code: "USD".to_string(),
            }],
        }],
    }
}

pub fn offer_token(product_id: &str) -> String {
    format!("{product_id}-offer")
}

pub fn catalog() -> Vec<Product> {
    vec![
        product(MONTHLY, "P1M", 9_990_000, "$9.99"),
        product(ANNUAL, "P1Y", 99_990_000, "$99.99"),
    ]
}

/// An acknowledged, renewing purchase already on the store account.
pub fn owned(product_id: &str, token: &str) -> PurchaseRecord {
    PurchaseRecord {
        purchase_token: token.to_string(),
        product_id: product_id.to_string(),
        order_id: Some("GPA.owned".to_string()),
        package_name: "billing.core".to_string(),
        status: PurchaseStatus::Purchased,
        acknowledged: true,
        auto_renewing: true,
        expiry_time_millis: None,
        obfuscated_account_id: Some(ACCOUNT.to_string()),
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub surface: Arc<InMemoryScriptSurface>,
    pub backend: BackendClient,
    pub config: BillingConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BillingConfig::default())
    }

    pub fn with_config(config: BillingConfig) -> Self {
        let store = Arc::new(InMemoryStore::new().with_products(catalog()));
        let surface = Arc::new(InMemoryScriptSurface::new());
        let backend = BackendClient::new(surface.clone(), config.transaction_timeout());
        surface.attach(backend.callbacks());
        Self {
            store,
            surface,
            backend,
            config,
        }
    }

    pub fn store_ref(&self) -> StoreClientRef {
        self.store.clone()
    }

    pub fn spawn(&self) -> StoreBillingGateway {
        BillingManager::spawn(self.store_ref(), self.backend.clone(), self.config.clone())
    }

    /// Spawns a session and waits until it is connected, the catalog is loaded
    /// and the initial purchase query has landed.
    pub async fn connected(&self) -> StoreBillingGateway {
        let gateway = self.spawn();
        wait_available(&gateway, true).await;
        let mut catalog = gateway.product_catalog();
        tokio::time::timeout(WAIT, catalog.wait_for(|products| !products.is_empty()))
            .await
            .expect("catalog load timed out")
            .expect("session closed");
        wait_refreshed(&gateway).await;
        gateway
    }

    /// Launches a purchase the store completes immediately.
    pub async fn buy(&self, gateway: &StoreBillingGateway, product_id: &str) {
        self.store.set_auto_complete(true);
        gateway.launch_purchase(product_id, Some(&offer_token(product_id)), Some(ACCOUNT));
        gateway.flush().await.expect("session closed");
    }
}

pub async fn wait_available(gateway: &StoreBillingGateway, up: bool) {
    let mut connection = gateway.connection_state();
    tokio::time::timeout(WAIT, connection.wait_for(|state| (*state == ConnectionState::Connected) == up))
        .await
        .expect("availability wait timed out")
        .expect("session closed");
}

pub async fn wait_refreshed(gateway: &StoreBillingGateway) {
    let mut refreshing = gateway.is_refreshing();
    tokio::time::timeout(WAIT, refreshing.wait_for(|busy| !*busy))
        .await
        .expect("refresh wait timed out")
        .expect("session closed");
}

/// Waits for processing to satisfy `done` and returns the state it settled on.
pub async fn wait_processing(
    gateway: &StoreBillingGateway,
    done: impl FnMut(&Option<PaymentProcessingState>) -> bool,
) -> Option<PaymentProcessingState> {
    let mut processing = gateway.processing_state();
    let state = tokio::time::timeout(WAIT, processing.wait_for(done))
        .await
        .expect("processing wait timed out")
        .expect("session closed")
        .clone();
    state
}

/// Waits until a purchase attempt reaches a terminal state.
pub async fn settled(gateway: &StoreBillingGateway) -> Option<PaymentProcessingState> {
    let state = wait_processing(gateway, |state| {
        state.as_ref().is_some_and(|s| {
            !s.is_in_flight() && !matches!(s, PaymentProcessingState::SubscriptionRecovery(_))
        })
    })
    .await;
    wait_refreshed(gateway).await;
    state
}

pub async fn wait_purchase_state(
    gateway: &StoreBillingGateway,
    done: impl FnMut(&PurchaseState) -> bool,
) -> PurchaseState {
    let mut updates = gateway.purchase_state_updates();
    let state = tokio::time::timeout(WAIT, updates.wait_for(done))
        .await
        .expect("purchase state wait timed out")
        .expect("session closed")
        .clone();
    state
}

/// Polls `check` on the virtual clock until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
