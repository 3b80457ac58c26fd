//! Replays scenario steps against in-memory collaborators.

use super::csv::scenario_reader::{ScenarioAction, ScenarioStep};
use super::csv::timeline_writer::TimelineRow;
use crate::application::backend::BackendClient;
use crate::application::gateway::StoreBillingGateway;
use crate::application::manager::{BillingManager, ConnectionState};
use crate::application::reconciler::Reconciler;
use crate::config::BillingConfig;
use crate::domain::classifier::FailureCause;
use crate::domain::payment::BackendFunction;
use crate::domain::plan::{format_price, micros_to_decimal};
use crate::domain::ports::{BillingGateway, GatewayRef, StoreClientRef};
use crate::domain::processing::{PaymentProcessingState, label};
use crate::domain::purchase::{
    PricingPhase, Product, PurchaseRecord, PurchaseState, PurchaseStatus, SubscriptionOffer,
};
use crate::error::{BillingError, Result, StoreFailure, StoreResponseCode};
use crate::infrastructure::in_memory::{InMemoryScriptSurface, InMemoryStore, SurfaceReply};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_MICROS: i64 = 9_990_000;
const ACCOUNT_ID: &str = "scenario-account";

/// Settled: nothing in flight and no recovery prompt waiting on the store.
fn is_settled(state: Option<&PaymentProcessingState>) -> bool {
    state.is_some_and(|s| !s.is_in_flight() && !matches!(s, PaymentProcessingState::SubscriptionRecovery(_)))
}

async fn wait_until<T>(rx: &mut watch::Receiver<T>, deadline: Instant, done: impl FnMut(&T) -> bool) -> bool {
    matches!(tokio::time::timeout_at(deadline, rx.wait_for(done)).await, Ok(Ok(_)))
}

pub struct ScenarioRunner {
    store: Arc<InMemoryStore>,
    surface: Arc<InMemoryScriptSurface>,
    backend: BackendClient,
    config: BillingConfig,
    products: Vec<Product>,
    gateway: Option<StoreBillingGateway>,
    settle_timeout: Duration,
    step: usize,
}

impl ScenarioRunner {
    pub fn new(config: BillingConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let surface = Arc::new(InMemoryScriptSurface::new());
        let backend = BackendClient::new(surface.clone(), config.transaction_timeout());
        surface.attach(backend.callbacks());
        let settle_timeout = config.transaction_timeout() * 2 + config.reconnect_delay() + config.connect_timeout();
        Self {
            store,
            surface,
            backend,
            config,
            products: Vec::new(),
            gateway: None,
            settle_timeout,
            step: 0,
        }
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    pub fn surface(&self) -> &Arc<InMemoryScriptSurface> {
        &self.surface
    }

    pub fn gateway(&self) -> Option<&StoreBillingGateway> {
        self.gateway.as_ref()
    }

    /// Applies one step and reports the state it left behind.
    pub async fn apply(&mut self, step: &ScenarioStep) -> Result<TimelineRow> {
        self.step += 1;
        debug!(step = self.step, action = %step.action, "applying scenario step");
        match step.action {
            ScenarioAction::Product => self.add_product(step)?,
            ScenarioAction::Owned => self.add_owned(step)?,
            ScenarioAction::Backend => self.stage_backend(step)?,
            ScenarioAction::Unavailable => {
                let message = step.value.as_deref().unwrap_or("billing unavailable");
                self.store
                    .push_connect_result(Err(StoreFailure::new(StoreResponseCode::BillingUnavailable, message)));
            }
            ScenarioAction::Connect => self.connect().await,
            ScenarioAction::Purchase => self.purchase(step).await?,
            ScenarioAction::Retry => {
                let gateway = self.session()?;
                gateway.retry_verification();
                gateway.flush().await?;
                if gateway.processing_state().borrow().is_some() {
                    self.settle_processing(&gateway).await;
                }
            }
            ScenarioAction::Recover => {
                let gateway = self.session()?;
                gateway.trigger_recovery();
                gateway.flush().await?;
                self.settle_processing(&gateway).await;
            }
            ScenarioAction::Dismiss => {
                let gateway = self.session()?;
                if !gateway.reset_processing_state() {
                    warn!("processing in flight; dismiss ignored");
                }
                gateway.flush().await?;
            }
            ScenarioAction::Refresh => {
                let records = self.session()?.query_purchases(true).await?;
                debug!(count = records.len(), "purchases refreshed");
            }
            ScenarioAction::Invalidate => {
                let gateway = self.session()?;
                gateway.invalidate_cache();
                gateway.flush().await?;
                self.settle_refresh(&gateway).await;
            }
            ScenarioAction::Disconnect => {
                let gateway = self.session()?;
                self.store.disconnect();
                gateway.flush().await?;
                self.settle_connection(&gateway).await;
            }
            ScenarioAction::Reconcile => self.reconcile().await?,
        }
        Ok(self.snapshot(step.action))
    }

    /// Shuts the session down, failing anything still pending.
    pub async fn finish(&mut self) {
        if let Some(gateway) = self.gateway.take() {
            gateway.shutdown().await;
        }
    }

    fn session(&self) -> Result<StoreBillingGateway> {
        self.gateway.clone().ok_or(BillingError::NotConnected)
    }

    fn snapshot(&self, action: ScenarioAction) -> TimelineRow {
        let (available, processing, status) = match &self.gateway {
            Some(gateway) => (
                gateway.available(),
                label(gateway.processing_state().borrow().as_ref()),
                gateway.subscription_status(),
            ),
            None => (false, label(None), Default::default()),
        };
        TimelineRow {
            step: self.step,
            action: action.to_string(),
            available,
            processing,
            active: status.is_active,
            auto_renewing: status.is_auto_renewing,
        }
    }

    fn add_product(&mut self, step: &ScenarioStep) -> Result<()> {
        let product_id = step.subject()?.to_string();
        let micros = match step.value.as_deref() {
            Some(raw) if !raw.is_empty() => raw
                .parse::<i64>()
                .map_err(|_| BillingError::InvalidStep(format!("price must be micros, got {raw}")))?,
            _ => DEFAULT_MICROS,
        };
        let plan = self.config.plans.iter().find(|p| p.product_id == product_id);
        let period = plan.and_then(|p| p.expected_period()).unwrap_or("P1M");
        let name = plan.map_or_else(|| product_id.clone(), |p| p.plan_name.clone());

        let phase = PricingPhase {
            billing_period: period.to_string(),
            formatted_price: format_price(micros_to_decimal(micros), "USD"),
            price_amount_micros: micros,
            price_currency_code: "USD".to_string(),
        };
        let product = Product {
            product_id: product_id.clone(),
            name,
            description: String::new(),
            one_time_price: None,
            offers: vec![SubscriptionOffer {
                base_plan_id: product_id.clone(),
                offer_token: format!("{product_id}-offer"),
                pricing_phases: vec![phase],
            }],
        };
        self.products.retain(|p| p.product_id != product_id);
        self.products.push(product);
        self.store.set_products(self.products.clone());
        Ok(())
    }

    fn add_owned(&mut self, step: &ScenarioStep) -> Result<()> {
        let product_id = step.subject()?.to_string();
        let auto_renewing = !matches!(step.value.as_deref(), Some("cancelled"));
        let mut purchases = self.store.purchases();
        purchases.push(PurchaseRecord {
            purchase_token: format!("owned-{product_id}"),
            product_id,
            order_id: None,
            package_name: "billing.core".to_string(),
            status: PurchaseStatus::Purchased,
            acknowledged: true,
            auto_renewing,
            expiry_time_millis: None,
            obfuscated_account_id: Some(ACCOUNT_ID.to_string()),
        });
        self.store.set_purchases(purchases);
        Ok(())
    }

    fn stage_backend(&mut self, step: &ScenarioStep) -> Result<()> {
        let function = match step.subject()? {
            "payment_token" => BackendFunction::PaymentToken,
            "subscription" => BackendFunction::Subscription,
            "subscriptions" => {
                let names: Vec<&str> = step
                    .value
                    .as_deref()
                    .unwrap_or_default()
                    .split(';')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .collect();
                self.surface.set_subscriptions(&names);
                return Ok(());
            }
            other => return Err(BillingError::InvalidStep(format!("unknown backend call {other}"))),
        };
        let value = step.value.as_deref().unwrap_or("ok");
        let reply = match value {
            "ok" => SurfaceReply::Success(match function {
                BackendFunction::PaymentToken => json!({"Token": format!("payment-token-step-{}", self.step)}),
                _ => json!({"Code": 1000}),
            }),
            "timeout" => SurfaceReply::Silent,
            "duplicate" => SurfaceReply::Duplicate,
            "fail" => SurfaceReply::Fail(FailureCause::ConnectionRefused("connection refused".to_string())),
            other => match other.strip_prefix("reject:") {
                Some(message) => SurfaceReply::Reject(message.to_string()),
                None => return Err(BillingError::InvalidStep(format!("unknown backend reply {other}"))),
            },
        };
        self.surface.push_reply(function, reply);
        Ok(())
    }

    async fn connect(&mut self) {
        let gateway = match &self.gateway {
            Some(gateway) => {
                gateway.connect();
                gateway.clone()
            }
            None => {
                let store: StoreClientRef = self.store.clone();
                let gateway = BillingManager::spawn(store, self.backend.clone(), self.config.clone());
                self.gateway = Some(gateway.clone());
                gateway
            }
        };
        self.settle_connection(&gateway).await;
    }

    /// Waits for the session to connect or give up, then for the catalog and
    /// the initial purchase query.
    async fn settle_connection(&self, gateway: &StoreBillingGateway) {
        let deadline = Instant::now() + self.settle_timeout;
        let mut connection = gateway.connection_state();
        let reached = wait_until(&mut connection, deadline, |state| {
            matches!(state, ConnectionState::Connected | ConnectionState::Unavailable(_))
        })
        .await;
        let state = connection.borrow().clone();
        if !reached || state != ConnectionState::Connected {
            info!(connection = %state, "store not connected");
            return;
        }

        let mut catalog = gateway.product_catalog();
        let mut purchase_state = gateway.purchase_state_updates();
        loop {
            let loaded = !catalog.borrow_and_update().is_empty()
                || matches!(
                    *purchase_state.borrow_and_update(),
                    PurchaseState::NoProductsAvailable(_) | PurchaseState::Error(_)
                );
            if loaded {
                break;
            }
            tokio::select! {
                changed = catalog.changed() => if changed.is_err() { return },
                changed = purchase_state.changed() => if changed.is_err() { return },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("catalog did not load in time");
                    return;
                }
            }
        }
        self.settle_refresh(gateway).await;
    }

    async fn settle_refresh(&self, gateway: &StoreBillingGateway) {
        let deadline = Instant::now() + self.settle_timeout;
        let mut refreshing = gateway.is_refreshing();
        if !wait_until(&mut refreshing, deadline, |busy| !*busy).await {
            warn!("purchase refresh did not finish in time");
        }
    }

    async fn settle_processing(&self, gateway: &StoreBillingGateway) {
        let deadline = Instant::now() + self.settle_timeout;
        let mut processing = gateway.processing_state();
        if !wait_until(&mut processing, deadline, |state| is_settled(state.as_ref())).await {
            warn!(state = %label(processing.borrow().as_ref()), "processing did not settle in time");
        }
        self.settle_refresh(gateway).await;
    }

    async fn purchase(&mut self, step: &ScenarioStep) -> Result<()> {
        let product_id = step.subject()?.to_string();
        let gateway = self.session()?;
        let offer_token = step.value.clone().filter(|v| !v.is_empty());

        let current = gateway.processing_state().borrow().clone();
        if current.as_ref().is_some_and(PaymentProcessingState::is_dismissible) {
            gateway.reset_processing_state();
        }
        let before = gateway.purchase_state();
        self.store.set_auto_complete(true);
        gateway.launch_purchase(&product_id, offer_token.as_deref(), Some(ACCOUNT_ID));
        gateway.flush().await?;

        let deadline = Instant::now() + self.settle_timeout;
        let mut processing = gateway.processing_state();
        let mut purchase_state = gateway.purchase_state_updates();
        loop {
            let settled = is_settled(processing.borrow_and_update().as_ref());
            let failed = {
                let state = purchase_state.borrow_and_update();
                *state != before && matches!(*state, PurchaseState::Error(_) | PurchaseState::Cancelled)
            };
            if settled || failed {
                break;
            }
            tokio::select! {
                changed = processing.changed() => if changed.is_err() { break },
                changed = purchase_state.changed() => if changed.is_err() { break },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(%product_id, "purchase did not settle in time");
                    break;
                }
            }
        }
        self.settle_refresh(&gateway).await;
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<()> {
        let gateway = self.session()?;
        let handle: GatewayRef = Arc::new(gateway.clone());
        let reconciler = Reconciler::new(handle, self.backend.clone(), self.config.entitlement_markers.clone());
        if reconciler.reconcile().await? {
            gateway.flush().await?;
            self.settle_processing(&gateway).await;
        }
        Ok(())
    }
}
