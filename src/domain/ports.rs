use super::payment::ScriptCall;
use super::processing::PaymentProcessingState;
use super::purchase::{Product, PurchaseRecord, SubscriptionStatus};
use crate::error::{StoreFailure, SurfaceError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFeature {
    Subscriptions,
    ProductDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseParams {
    pub product_id: String,
    pub offer_token: Option<String>,
    pub account_id: Option<String>,
}

/// Notifications the store delivers outside of any request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    PurchasesUpdated(Result<Vec<PurchaseRecord>, StoreFailure>),
    Disconnected,
}

/// Handle given to the store on connect. Events are delivered in send order.
#[derive(Debug, Clone)]
pub struct StoreListener {
    tx: mpsc::UnboundedSender<StoreEvent>,
}

impl StoreListener {
    pub fn new(tx: mpsc::UnboundedSender<StoreEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the session that owned the listener has gone away.
    pub fn purchases_updated(&self, result: Result<Vec<PurchaseRecord>, StoreFailure>) -> bool {
        self.tx.send(StoreEvent::PurchasesUpdated(result)).is_ok()
    }

    pub fn disconnected(&self) -> bool {
        self.tx.send(StoreEvent::Disconnected).is_ok()
    }
}

/// The platform store capability.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn connect(&self, listener: StoreListener) -> Result<(), StoreFailure>;
    fn is_feature_supported(&self, feature: StoreFeature) -> bool;
    async fn query_products(&self, product_ids: &[String]) -> Result<Vec<Product>, StoreFailure>;
    async fn query_purchases(&self) -> Result<Vec<PurchaseRecord>, StoreFailure>;
    /// Starts the purchase flow. The outcome arrives later through the listener.
    async fn launch_purchase(&self, params: &PurchaseParams) -> Result<(), StoreFailure>;
    async fn acknowledge(&self, purchase_token: &str) -> Result<(), StoreFailure>;
    fn open_url(&self, url: &str) -> bool;
}

/// Executes scripts in the embedded web context. Results come back through
/// `ScriptCallbacks::post_result`, never through this call.
#[async_trait]
pub trait ScriptSurface: Send + Sync {
    async fn execute(&self, call: &ScriptCall) -> Result<(), SurfaceError>;
}

/// Billing operations available to the rest of the application.
pub trait BillingGateway: Send + Sync {
    fn available(&self) -> bool;
    fn product_catalog(&self) -> watch::Receiver<Vec<Product>>;
    fn is_refreshing(&self) -> watch::Receiver<bool>;
    fn processing_state(&self) -> watch::Receiver<Option<PaymentProcessingState>>;
    fn subscription_status(&self) -> SubscriptionStatus;

    fn refresh(&self, force: bool);
    fn invalidate_cache(&self);
    fn open_store_management_screen(&self) -> bool;
    fn launch_purchase(&self, product_id: &str, offer_token: Option<&str>, account_id: Option<&str>);
    fn retry_verification(&self);
    /// Returns false while processing is in flight.
    fn reset_processing_state(&self) -> bool;
    fn trigger_recovery(&self);
}

pub type StoreClientRef = Arc<dyn StoreClient>;
pub type ScriptSurfaceRef = Arc<dyn ScriptSurface>;
pub type GatewayRef = Arc<dyn BillingGateway>;
