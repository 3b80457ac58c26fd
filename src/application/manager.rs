//! The billing session actor.
//!
//! `BillingManager` is the only writer of purchase state, processing state, the
//! purchase cache, the product catalog and the connection state. Callers talk
//! to it through [`StoreBillingGateway`]; store and backend I/O runs on spawned
//! tasks whose results come back as commands, so every mutation happens on the
//! actor's task in arrival order.

use super::backend::BackendClient;
use super::cache::PurchaseCache;
use super::gateway::StoreBillingGateway;
use super::verification::{VerificationFailure, VerificationRequest, verify_purchase};
use crate::config::BillingConfig;
use crate::domain::plan::{EnrichedPlan, enrich};
use crate::domain::ports::{PurchaseParams, StoreClientRef, StoreEvent, StoreFeature, StoreListener};
use crate::domain::processing::{
    PaymentProcessingState, ProcessingEvent, RetryAction, label, retry_action, transition,
};
use crate::domain::purchase::{
    Product, PurchaseRecord, PurchaseState, PurchaseStatus, SubscriptionStatus, derive_status,
};
use crate::error::{BillingError, Result, StoreFailure, StoreResponseCode};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const NOT_CONNECTED: &str = "Billing service not connected. Please try again.";
pub const NO_PURCHASE_TO_RETRY: &str = "No active purchase found to retry. Please try purchasing again.";
pub const NOTHING_TO_RECOVER: &str = "No active store subscription found to recover";
pub const RECOVERY_MESSAGE: &str =
    "We found your subscription in the store but it's not synced with our servers. Let's fix that!";
pub const MISSING_PRODUCT: &str = "Application error: could not process payment";
pub const PLAN_NOT_FOUND: &str = "Selected plan details not found.";
pub const PLAN_CONFIGURATION: &str = "Plan configuration error.";
pub const OFFER_UNAVAILABLE: &str =
    "Selected plan offer is not available. Please try again or select a different plan.";
pub const NO_PRODUCTS: &str = "No subscription plans are available right now.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Billing cannot work on this host. Only an explicit `connect` leaves it.
    Unavailable(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Unavailable(reason) => write!(f, "unavailable: {reason}"),
        }
    }
}

/// Copy shown when the store can never be used on this host.
fn permanent_failure_message(failure: &StoreFailure) -> String {
    let debug = failure.debug_message.to_lowercase();
    if debug.contains("api version is less than 3") {
        "This device's billing version is too old. Please update the store app or use the web version."
            .to_string()
    } else if failure.code == StoreResponseCode::FeatureNotSupported || debug.contains("not supported") {
        "In-app purchases are not supported on this device. Please use the web version for subscriptions."
            .to_string()
    } else {
        "Billing unavailable: Please ensure the store app is installed, updated and you are logged in"
            .to_string()
    }
}

fn product_query_message(failure: &StoreFailure) -> String {
    match failure.code {
        StoreResponseCode::ServiceUnavailable
        | StoreResponseCode::NetworkError
        | StoreResponseCode::ServiceTimeout => {
            "Network error. Please check your connection and try again.".to_string()
        }
        StoreResponseCode::BillingUnavailable => permanent_failure_message(failure),
        StoreResponseCode::ItemUnavailable => "Subscription plans are currently unavailable.".to_string(),
        _ => format!("Failed to load subscription plans: {}", failure.debug_message),
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Continuation of a purchase fetch, run once its records are known.
#[derive(Debug)]
pub(crate) enum AfterFetch {
    Nothing,
    Reply(oneshot::Sender<Result<Vec<PurchaseRecord>>>),
    Retry,
    Recover,
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Refresh { force: bool },
    InvalidateCache,
    QueryPurchases {
        force: bool,
        reply: oneshot::Sender<Result<Vec<PurchaseRecord>>>,
    },
    LaunchPurchase(PurchaseParams),
    RetryVerification,
    ResetProcessingState,
    TriggerRecovery,
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
    ConnectFinished(std::result::Result<(), StoreFailure>),
    ProductsFetched(std::result::Result<Vec<Product>, StoreFailure>),
    PurchasesFetched {
        seq: u64,
        result: std::result::Result<Vec<PurchaseRecord>, StoreFailure>,
        then: AfterFetch,
    },
    LaunchFinished {
        product_id: String,
        result: std::result::Result<(), StoreFailure>,
    },
    Acknowledged {
        purchase_token: String,
        result: std::result::Result<(), StoreFailure>,
    },
    VerificationFinished {
        attempt: u64,
        outcome: std::result::Result<(), VerificationFailure>,
    },
    RefreshTick,
    ReconnectDue,
}

/// Everything the actor publishes. Gateways hold the receiving ends.
#[derive(Debug)]
pub(crate) struct Published {
    pub available: watch::Sender<bool>,
    pub connection: watch::Sender<ConnectionState>,
    pub catalog: watch::Sender<Vec<Product>>,
    pub plans: watch::Sender<Vec<EnrichedPlan>>,
    pub refreshing: watch::Sender<bool>,
    pub processing: watch::Sender<Option<PaymentProcessingState>>,
    pub purchase_state: watch::Sender<PurchaseState>,
    pub status: watch::Sender<SubscriptionStatus>,
}

impl Published {
    fn new() -> Self {
        Self {
            available: watch::Sender::new(false),
            connection: watch::Sender::new(ConnectionState::Disconnected),
            catalog: watch::Sender::new(Vec::new()),
            plans: watch::Sender::new(Vec::new()),
            refreshing: watch::Sender::new(false),
            processing: watch::Sender::new(None),
            purchase_state: watch::Sender::new(PurchaseState::NotPurchased),
            status: watch::Sender::new(SubscriptionStatus::default()),
        }
    }
}

pub struct BillingManager {
    store: StoreClientRef,
    backend: BackendClient,
    config: BillingConfig,
    inbox: mpsc::UnboundedReceiver<Command>,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<StoreEvent>,
    event_tx: mpsc::UnboundedSender<StoreEvent>,
    published: Published,

    connection: ConnectionState,
    purchase_state: PurchaseState,
    processing: Option<PaymentProcessingState>,
    status: SubscriptionStatus,
    cache: PurchaseCache,
    products: Vec<Product>,
    purchases: Vec<PurchaseRecord>,
    account_id: Option<String>,

    fetch_seq: u64,
    applied_seq: u64,
    fetches_in_flight: usize,
    reconnect_scheduled: bool,
    refresher: Option<JoinHandle<()>>,
    acknowledging: HashSet<String>,
    acknowledged: HashSet<String>,
    verification_attempt: u64,
}

impl BillingManager {
    /// Starts a session actor and asks it to connect.
    pub fn spawn(store: StoreClientRef, backend: BackendClient, config: BillingConfig) -> StoreBillingGateway {
        let (command_tx, inbox) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let published = Published::new();
        let gateway = StoreBillingGateway::new(command_tx.clone(), store.clone(), &config, &published);

        let manager = Self {
            cache: PurchaseCache::new(config.cache_ttl()),
            store,
            backend,
            config,
            inbox,
            commands: command_tx.downgrade(),
            events,
            event_tx,
            published,
            connection: ConnectionState::Disconnected,
            purchase_state: PurchaseState::NotPurchased,
            processing: None,
            status: SubscriptionStatus::default(),
            products: Vec::new(),
            purchases: Vec::new(),
            account_id: None,
            fetch_seq: 0,
            applied_seq: 0,
            fetches_in_flight: 0,
            reconnect_scheduled: false,
            refresher: None,
            acknowledging: HashSet::new(),
            acknowledged: HashSet::new(),
            verification_attempt: 0,
        };
        tokio::spawn(manager.run());
        gateway.connect();
        gateway
    }

    async fn run(mut self) {
        debug!("billing session started");
        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.handle_store_event(event),
                command = self.inbox.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
            }
        }
        debug!("billing session stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Refresh { force } => {
                if self.connection == ConnectionState::Disconnected {
                    info!("refresh requested while disconnected, reconnecting");
                    self.connect();
                } else {
                    self.fetch_purchases(force, AfterFetch::Nothing);
                }
            }
            Command::InvalidateCache => {
                debug!("purchase cache invalidated");
                self.cache.invalidate();
                self.fetch_purchases(true, AfterFetch::Nothing);
            }
            Command::QueryPurchases { force, reply } => {
                self.fetch_purchases(force, AfterFetch::Reply(reply))
            }
            Command::LaunchPurchase(params) => self.launch_purchase(params),
            Command::RetryVerification => self.retry_verification(),
            Command::ResetProcessingState => {
                self.apply(ProcessingEvent::Dismiss);
            }
            Command::TriggerRecovery => self.recover(),
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            // Handled by the run loop.
            Command::Shutdown(ack) => {
                let _ = ack.send(());
            }
            Command::ConnectFinished(result) => self.on_connect_finished(result),
            Command::ProductsFetched(result) => self.on_products_fetched(result),
            Command::PurchasesFetched { seq, result, then } => self.on_purchases_fetched(seq, result, then),
            Command::LaunchFinished { product_id, result } => match result {
                Ok(()) => debug!(%product_id, "purchase flow launched"),
                Err(failure) if failure.code == StoreResponseCode::UserCanceled => {
                    self.set_purchase_state(PurchaseState::Cancelled)
                }
                Err(failure) => {
                    warn!(%product_id, error = %failure, "failed to launch purchase flow");
                    self.set_purchase_state(PurchaseState::Error(format!(
                        "Failed to initiate purchase: {}",
                        failure.debug_message
                    )));
                }
            },
            Command::Acknowledged { purchase_token, result } => {
                self.acknowledging.remove(&purchase_token);
                match result {
                    Ok(()) => {
                        info!(%purchase_token, "purchase acknowledged");
                        self.acknowledged.insert(purchase_token);
                    }
                    Err(failure) => warn!(%purchase_token, error = %failure, "failed to acknowledge purchase"),
                }
            }
            Command::VerificationFinished { attempt, outcome } => self.on_verification_finished(attempt, outcome),
            Command::RefreshTick => {
                if self.connection == ConnectionState::Connected && self.status.is_active {
                    debug!("periodic purchase refresh");
                    self.fetch_purchases(true, AfterFetch::Nothing);
                }
            }
            Command::ReconnectDue => {
                self.reconnect_scheduled = false;
                if self.connection == ConnectionState::Disconnected {
                    info!("reconnecting to store");
                    self.connect();
                }
            }
        }
    }

    /// Runs `task` off the actor and feeds its result back as a command.
    fn run_task<F>(&self, task: F)
    where
        F: Future<Output = Command> + Send + 'static,
    {
        let Some(tx) = self.commands.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let command = task.await;
            let _ = tx.send(command);
        });
    }

    fn set_connection(&mut self, connection: ConnectionState) {
        if self.connection != connection {
            info!(from = %self.connection, to = %connection, "store connection changed");
        }
        self.published
            .available
            .send_replace(connection == ConnectionState::Connected);
        self.published.connection.send_replace(connection.clone());
        self.connection = connection;
    }

    fn set_purchase_state(&mut self, state: PurchaseState) {
        if self.purchase_state != state {
            info!(from = %self.purchase_state, to = %state, "purchase state changed");
        }
        self.published.purchase_state.send_replace(state.clone());
        self.purchase_state = state;
    }

    /// Applies a processing event through the transition table.
    fn apply(&mut self, event: ProcessingEvent) -> bool {
        match transition(self.processing.as_ref(), event.clone()) {
            Ok(next) => {
                if next != self.processing {
                    info!(
                        from = %label(self.processing.as_ref()),
                        to = %label(next.as_ref()),
                        %event,
                        "processing state changed"
                    );
                }
                self.published.processing.send_replace(next.clone());
                self.processing = next;
                true
            }
            Err(err) => {
                warn!(error = %err, "processing transition refused");
                false
            }
        }
    }

    /// Fails the current processing attempt if one is waiting on the store.
    fn fail_waiting(&mut self, message: String) {
        if matches!(
            self.processing,
            Some(PaymentProcessingState::Loading | PaymentProcessingState::SubscriptionRecovery(_))
        ) {
            self.apply(ProcessingEvent::Rejected(message));
        }
    }

    fn connect(&mut self) {
        match self.connection {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!(state = %self.connection, "connect ignored");
                return;
            }
            ConnectionState::Unavailable(_) => info!("retrying connection after permanent failure"),
            ConnectionState::Disconnected => {}
        }
        self.set_connection(ConnectionState::Connecting);
        let store = self.store.clone();
        let listener = StoreListener::new(self.event_tx.clone());
        self.run_task(async move { Command::ConnectFinished(store.connect(listener).await) });
    }

    fn on_connect_finished(&mut self, result: std::result::Result<(), StoreFailure>) {
        if self.connection != ConnectionState::Connecting {
            debug!(state = %self.connection, "stale connect result ignored");
            return;
        }
        match result {
            Ok(()) if !self.store.is_feature_supported(StoreFeature::Subscriptions) => {
                let failure = StoreFailure::new(
                    StoreResponseCode::FeatureNotSupported,
                    "subscriptions not supported",
                );
                error!(error = %failure, "store cannot sell subscriptions");
                self.enter_unavailable(&failure);
            }
            Ok(()) => {
                self.set_connection(ConnectionState::Connected);
                if matches!(self.purchase_state, PurchaseState::Error(_)) {
                    self.set_purchase_state(PurchaseState::NotPurchased);
                }
                self.query_products();
                self.fetch_purchases(true, AfterFetch::Nothing);
                self.restart_refresher();
            }
            Err(failure) if failure.code.is_permanent() => {
                error!(error = %failure, "billing unavailable");
                self.enter_unavailable(&failure);
            }
            Err(failure) => {
                warn!(error = %failure, "store connection failed");
                self.set_purchase_state(PurchaseState::Error(format!(
                    "Failed to connect to billing service: {}",
                    failure.debug_message
                )));
                self.set_connection(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    fn enter_unavailable(&mut self, failure: &StoreFailure) {
        let message = permanent_failure_message(failure);
        self.stop_refresher();
        self.set_connection(ConnectionState::Unavailable(failure.to_string()));
        self.set_purchase_state(PurchaseState::Error(message));
    }

    fn on_disconnected(&mut self) {
        if matches!(self.connection, ConnectionState::Unavailable(_)) {
            return;
        }
        warn!("store disconnected");
        self.stop_refresher();
        self.set_connection(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_scheduled {
            debug!("reconnect already scheduled");
            return;
        }
        self.reconnect_scheduled = true;
        let delay = self.config.reconnect_delay();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::ReconnectDue);
            }
        });
    }

    fn restart_refresher(&mut self) {
        self.stop_refresher();
        let period = self.config.refresh_interval();
        let commands = self.commands.clone();
        self.refresher = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(tx) = commands.upgrade() else {
                    break;
                };
                if tx.send(Command::RefreshTick).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_refresher(&mut self) {
        if let Some(handle) = self.refresher.take() {
            handle.abort();
        }
    }

    fn query_products(&mut self) {
        let store = self.store.clone();
        let ids = self.config.product_ids();
        self.run_task(async move { Command::ProductsFetched(store.query_products(&ids).await) });
    }

    fn on_products_fetched(&mut self, result: std::result::Result<Vec<Product>, StoreFailure>) {
        match result {
            Ok(products) if products.is_empty() => {
                warn!("store returned no products");
                self.products.clear();
                self.published.catalog.send_replace(Vec::new());
                self.published.plans.send_replace(Vec::new());
                self.set_purchase_state(PurchaseState::NoProductsAvailable(NO_PRODUCTS.to_string()));
            }
            Ok(products) => {
                info!(count = products.len(), "product catalog loaded");
                let plans = enrich(&self.config.plans, &products);
                self.published.plans.send_replace(plans);
                self.published.catalog.send_replace(products.clone());
                self.products = products;
                if matches!(self.purchase_state, PurchaseState::NoProductsAvailable(_)) {
                    self.set_purchase_state(if self.status.is_active {
                        PurchaseState::Purchased
                    } else {
                        PurchaseState::NotPurchased
                    });
                }
            }
            Err(failure) if failure.code == StoreResponseCode::ServiceDisconnected => self.on_disconnected(),
            Err(failure) => {
                warn!(error = %failure, "product query failed");
                self.set_purchase_state(PurchaseState::Error(product_query_message(&failure)));
            }
        }
    }

    fn fetch_purchases(&mut self, force: bool, then: AfterFetch) {
        if self.connection != ConnectionState::Connected {
            warn!(state = %self.connection, "cannot query purchases while not connected");
            self.fail_waiting(NOT_CONNECTED.to_string());
            if let AfterFetch::Reply(reply) = then {
                let _ = reply.send(Err(BillingError::NotConnected));
            }
            return;
        }

        if let Some(records) = self.cache.lookup(Instant::now(), force) {
            debug!(count = records.len(), "serving purchases from cache");
            let records = records.to_vec();
            self.continue_after_fetch(then, records);
            return;
        }

        self.fetch_seq += 1;
        let seq = self.fetch_seq;
        self.fetches_in_flight += 1;
        self.published.refreshing.send_replace(true);
        debug!(seq, force, "querying purchases");
        let store = self.store.clone();
        self.run_task(async move {
            Command::PurchasesFetched {
                seq,
                result: store.query_purchases().await,
                then,
            }
        });
    }

    fn on_purchases_fetched(
        &mut self,
        seq: u64,
        result: std::result::Result<Vec<PurchaseRecord>, StoreFailure>,
        then: AfterFetch,
    ) {
        self.fetches_in_flight = self.fetches_in_flight.saturating_sub(1);
        self.published.refreshing.send_replace(self.fetches_in_flight > 0);

        match result {
            Ok(_) if seq <= self.applied_seq => {
                debug!(seq, applied = self.applied_seq, "stale purchase query discarded");
                let latest = self.purchases.clone();
                self.continue_after_fetch(then, latest);
            }
            Ok(records) => {
                self.applied_seq = seq;
                self.cache.store(records.clone(), Instant::now());
                self.apply_purchases(records.clone());
                self.continue_after_fetch(then, records);
            }
            Err(failure) => {
                warn!(seq, error = %failure, "purchase query failed");
                if failure.code == StoreResponseCode::ServiceDisconnected {
                    self.on_disconnected();
                }
                self.fail_waiting(format!("Failed to query purchases: {}", failure.debug_message));
                if let AfterFetch::Reply(reply) = then {
                    let _ = reply.send(Err(failure.into()));
                }
            }
        }
    }

    /// Replaces the store truth with a full query result.
    fn apply_purchases(&mut self, records: Vec<PurchaseRecord>) {
        let (state, status) = derive_status(&records, now_millis());
        self.status = status;
        self.published.status.send_replace(status);
        let keep_catalog_state = matches!(
            self.purchase_state,
            PurchaseState::NoProductsAvailable(_) | PurchaseState::Error(_)
        ) && state != PurchaseState::Purchased;
        if !keep_catalog_state {
            self.set_purchase_state(state);
        }
        self.acknowledge_pending(&records);
        self.purchases = records;
    }

    fn continue_after_fetch(&mut self, then: AfterFetch, records: Vec<PurchaseRecord>) {
        let now = now_millis();
        match then {
            AfterFetch::Nothing => {}
            AfterFetch::Reply(reply) => {
                let _ = reply.send(Ok(records));
            }
            AfterFetch::Retry => {
                if self.processing != Some(PaymentProcessingState::Loading) {
                    debug!("retry superseded");
                    return;
                }
                match records.into_iter().find(|r| r.is_active_at(now)) {
                    Some(purchase) => self.start_verification(&purchase),
                    None => {
                        self.apply(ProcessingEvent::Rejected(NO_PURCHASE_TO_RETRY.to_string()));
                    }
                }
            }
            AfterFetch::Recover => {
                if !matches!(self.processing, Some(PaymentProcessingState::SubscriptionRecovery(_))) {
                    debug!("recovery superseded");
                    return;
                }
                match records.into_iter().find(|r| r.is_active_at(now)) {
                    Some(purchase) => {
                        match &purchase.obfuscated_account_id {
                            Some(account_id) => {
                                debug!(%account_id, "adopting account id from store purchase");
                                self.account_id = Some(account_id.clone());
                            }
                            None => warn!("recovered purchase carries no account id"),
                        }
                        if self.apply(ProcessingEvent::RecoveryAccepted) {
                            self.start_verification(&purchase);
                        }
                    }
                    None => {
                        self.apply(ProcessingEvent::Rejected(NOTHING_TO_RECOVER.to_string()));
                    }
                }
            }
        }
    }

    fn acknowledge_pending(&mut self, records: &[PurchaseRecord]) {
        for record in records {
            let token = &record.purchase_token;
            if record.status != PurchaseStatus::Purchased
                || record.acknowledged
                || self.acknowledged.contains(token)
                || !self.acknowledging.insert(token.clone())
            {
                continue;
            }
            debug!(purchase_token = %token, "acknowledging purchase");
            let store = self.store.clone();
            let purchase_token = token.clone();
            self.run_task(async move {
                let result = store.acknowledge(&purchase_token).await;
                Command::Acknowledged { purchase_token, result }
            });
        }
    }

    fn handle_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Disconnected => self.on_disconnected(),
            StoreEvent::PurchasesUpdated(Ok(records)) => self.on_purchases_updated(records),
            StoreEvent::PurchasesUpdated(Err(failure)) => match failure.code {
                StoreResponseCode::UserCanceled => {
                    info!("purchase cancelled by user");
                    self.set_purchase_state(PurchaseState::Cancelled);
                }
                StoreResponseCode::ItemAlreadyOwned => {
                    info!("item already owned");
                    self.set_purchase_state(PurchaseState::Purchased);
                    self.fetch_purchases(true, AfterFetch::Nothing);
                }
                _ => {
                    warn!(error = %failure, "purchase update failed");
                    self.set_purchase_state(PurchaseState::Error(format!(
                        "Purchase failed: {}",
                        failure.debug_message
                    )));
                }
            },
        }
    }

    fn on_purchases_updated(&mut self, records: Vec<PurchaseRecord>) {
        debug!(count = records.len(), "purchases updated by store");
        self.cache.invalidate();
        // Queries already in flight were answered before this update.
        self.applied_seq = self.fetch_seq;
        for record in &records {
            self.purchases.retain(|p| p.purchase_token != record.purchase_token);
            self.purchases.push(record.clone());
        }
        let (_, status) = derive_status(&self.purchases, now_millis());
        self.status = status;
        self.published.status.send_replace(status);

        for record in &records {
            match record.status {
                PurchaseStatus::Purchased => {
                    self.set_purchase_state(PurchaseState::Purchased);
                    if self.processing == Some(PaymentProcessingState::Verifying) {
                        debug!(product_id = %record.product_id, "verification already running");
                        continue;
                    }
                    if self.apply(ProcessingEvent::PurchaseConfirmed) {
                        self.start_verification(record);
                    }
                }
                PurchaseStatus::Pending => info!(product_id = %record.product_id, "purchase pending"),
                PurchaseStatus::Unspecified => debug!(product_id = %record.product_id, "purchase in unspecified state"),
            }
        }
        self.acknowledge_pending(&records);
    }

    /// Verifies `purchase` with the backend. Processing must be `Loading`.
    fn start_verification(&mut self, purchase: &PurchaseRecord) {
        let Some(product) = self.products.iter().find(|p| p.product_id == purchase.product_id) else {
            error!(product_id = %purchase.product_id, "no product details for purchase");
            self.apply(ProcessingEvent::Rejected(MISSING_PRODUCT.to_string()));
            return;
        };
        let request = VerificationRequest::new(
            purchase,
            product,
            self.account_id.as_deref(),
            &self.config.payment_type,
            &self.config.backend_plan_id,
        );
        if !self.apply(ProcessingEvent::TokenDispatched) {
            return;
        }

        self.verification_attempt += 1;
        let attempt = self.verification_attempt;
        info!(attempt, product_id = %purchase.product_id, "verifying purchase with backend");
        let backend = self.backend.clone();
        self.run_task(async move {
            let outcome = verify_purchase(&backend, &request).await;
            Command::VerificationFinished { attempt, outcome }
        });
    }

    fn on_verification_finished(
        &mut self,
        attempt: u64,
        outcome: std::result::Result<(), VerificationFailure>,
    ) {
        if attempt != self.verification_attempt {
            debug!(attempt, current = self.verification_attempt, "superseded verification result ignored");
            return;
        }
        match outcome {
            Ok(()) => {
                if self.apply(ProcessingEvent::Activated) {
                    self.fetch_purchases(true, AfterFetch::Nothing);
                }
            }
            Err(failure) => {
                warn!(attempt, error = %failure, "verification failed");
                self.apply(failure.into_event());
            }
        }
    }

    fn launch_purchase(&mut self, params: PurchaseParams) {
        if self.connection != ConnectionState::Connected {
            warn!(product_id = %params.product_id, "cannot launch purchase while not connected");
            self.set_purchase_state(PurchaseState::Error(NOT_CONNECTED.to_string()));
            return;
        }
        let Some(product) = self.products.iter().find(|p| p.product_id == params.product_id) else {
            warn!(product_id = %params.product_id, "unknown product");
            self.set_purchase_state(PurchaseState::Error(PLAN_NOT_FOUND.to_string()));
            return;
        };
        let offer_problem = match params.offer_token.as_deref() {
            Some(_) if product.offers.is_empty() => Some(PLAN_CONFIGURATION),
            Some(token) if product.offer(token).is_none() => Some(OFFER_UNAVAILABLE),
            _ => None,
        };
        if let Some(message) = offer_problem {
            warn!(product_id = %params.product_id, offer_token = ?params.offer_token, "offer not available");
            self.set_purchase_state(PurchaseState::Error(message.to_string()));
            return;
        }

        if params.account_id.is_some() {
            self.account_id = params.account_id.clone();
        }
        info!(product_id = %params.product_id, "launching purchase flow");
        let store = self.store.clone();
        self.run_task(async move {
            let result = store.launch_purchase(&params).await;
            Command::LaunchFinished {
                product_id: params.product_id,
                result,
            }
        });
    }

    fn retry_verification(&mut self) {
        match retry_action(self.processing.as_ref()) {
            Some(RetryAction::Recover) => self.recover(),
            Some(RetryAction::Reverify) => {
                if self.apply(ProcessingEvent::Retry) {
                    self.fetch_purchases(true, AfterFetch::Retry);
                }
            }
            None => {
                warn!(state = %label(self.processing.as_ref()), "nothing to retry");
            }
        }
    }

    fn recover(&mut self) {
        if self.apply(ProcessingEvent::RecoveryStarted(RECOVERY_MESSAGE.to_string())) {
            self.fetch_purchases(true, AfterFetch::Recover);
        }
    }

    async fn teardown(&mut self) {
        self.stop_refresher();
        let failed = self.backend.shutdown().await;
        self.set_connection(ConnectionState::Disconnected);
        info!(pending_transactions = failed, "billing session torn down");
    }
}
