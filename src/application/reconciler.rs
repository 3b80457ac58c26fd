//! Detects a subscription the store knows about but the backend does not.

use super::backend::BackendClient;
use crate::domain::payment::has_valid_subscription;
use crate::domain::ports::GatewayRef;
use crate::error::BackendError;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Store says active, backend says not entitled.
pub fn check_mismatch(backend_has_valid: bool, store_active: bool) -> bool {
    !backend_has_valid && store_active
}

#[derive(Clone)]
pub struct Reconciler {
    gateway: GatewayRef,
    backend: BackendClient,
    entitlement_markers: Vec<String>,
}

impl Reconciler {
    pub fn new(gateway: GatewayRef, backend: BackendClient, entitlement_markers: Vec<String>) -> Self {
        Self {
            gateway,
            backend,
            entitlement_markers,
        }
    }

    pub fn check_mismatch(&self, backend_has_valid: bool) -> bool {
        check_mismatch(backend_has_valid, self.gateway.subscription_status().is_active)
    }

    pub async fn backend_has_valid_subscription(&self) -> Result<bool, BackendError> {
        let subscriptions = self.backend.fetch_subscriptions().await?;
        Ok(has_valid_subscription(&subscriptions, &self.entitlement_markers))
    }

    /// Starts recovery when `backend_has_valid` disagrees with the store.
    /// Returns whether recovery was triggered.
    pub fn reconcile_with(&self, backend_has_valid: bool) -> bool {
        if !self.check_mismatch(backend_has_valid) {
            return false;
        }
        info!("store subscription is not known to the backend; starting recovery");
        self.gateway.trigger_recovery();
        true
    }

    /// Fetches the backend view and reconciles against it.
    pub async fn reconcile(&self) -> Result<bool, BackendError> {
        let valid = self.backend_has_valid_subscription().await?;
        debug!(backend_has_valid = valid, "backend subscriptions fetched");
        Ok(self.reconcile_with(valid))
    }

    /// Re-checks for drift every `interval` until the handle is aborted.
    pub fn spawn_periodic(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if !self.gateway.available() {
                    continue;
                }
                if let Err(err) = self.reconcile().await {
                    warn!(error = %err, "reconciliation skipped");
                }
            }
        })
    }
}
