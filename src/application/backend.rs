use super::registry::{ScriptCallbacks, TransactionRegistry};
use crate::domain::payment::{
    BackendFunction, BackendResponse, BackendSubscription, PaymentTokenRequest, ScriptCall,
    SubscriptionRequest, parse_subscriptions,
};
use crate::domain::ports::ScriptSurfaceRef;
use crate::error::BackendError;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Typed backend calls carried over the script surface.
#[derive(Clone)]
pub struct BackendClient {
    surface: ScriptSurfaceRef,
    registry: TransactionRegistry,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(surface: ScriptSurfaceRef, timeout: Duration) -> Self {
        Self {
            surface,
            registry: TransactionRegistry::new(),
            timeout,
        }
    }

    pub fn callbacks(&self) -> ScriptCallbacks {
        self.registry.callbacks()
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        function: BackendFunction,
        payload: Option<Value>,
    ) -> Result<BackendResponse, BackendError> {
        let (transaction_id, rx) = self.registry.register(function).await;
        let call = ScriptCall {
            transaction_id,
            function,
            payload,
        };

        if let Err(err) = self.surface.execute(&call).await {
            self.registry.remove(transaction_id).await;
            warn!(%transaction_id, %function, error = %err, "script dispatch failed");
            return Err(err.into());
        }
        debug!(%transaction_id, %function, "script dispatched");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Err(BackendError::Closed("callback dropped".to_string())),
            Err(_) => {
                self.registry.remove(transaction_id).await;
                warn!(%transaction_id, %function, timeout_ms = self.timeout.as_millis() as u64, "transaction timed out");
                Err(BackendError::Timeout(self.timeout))
            }
        }
    }

    pub async fn create_payment_token(
        &self,
        request: &PaymentTokenRequest,
    ) -> Result<BackendResponse, BackendError> {
        self.dispatch(BackendFunction::PaymentToken, Some(to_payload(request)?))
            .await
    }

    pub async fn activate_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<BackendResponse, BackendError> {
        self.dispatch(BackendFunction::Subscription, Some(to_payload(request)?))
            .await
    }

    pub async fn fetch_subscriptions(&self) -> Result<Vec<BackendSubscription>, BackendError> {
        let response = self.dispatch(BackendFunction::GetSubscriptions, None).await?;
        Ok(parse_subscriptions(&response))
    }

    /// Fails every outstanding transaction.
    pub async fn shutdown(&self) -> usize {
        self.registry.fail_all("billing session closed").await
    }
}

fn to_payload<T: Serialize>(request: &T) -> Result<Value, BackendError> {
    serde_json::to_value(request).map_err(|e| BackendError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classifier::FailureCause;
    use crate::infrastructure::in_memory::{InMemoryScriptSurface, SurfaceReply};
    use std::sync::Arc;

    fn client(surface: &Arc<InMemoryScriptSurface>, timeout: Duration) -> BackendClient {
        let client = BackendClient::new(surface.clone(), timeout);
        surface.attach(client.callbacks());
        client
    }

    #[tokio::test]
    async fn test_round_trip_through_surface() {
        let surface = Arc::new(InMemoryScriptSurface::new());
        let client = client(&surface, Duration::from_secs(5));

        let subs = client.fetch_subscriptions().await.unwrap();
        assert!(subs.is_empty());
        assert_eq!(surface.calls(), vec![BackendFunction::GetSubscriptions]);
        assert_eq!(client.registry().pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_surface_times_out_and_cleans_up() {
        let surface = Arc::new(InMemoryScriptSurface::new());
        surface.push_reply(BackendFunction::PaymentToken, SurfaceReply::Silent);
        let client = client(&surface, Duration::from_secs(30));

        let result = client.dispatch(BackendFunction::PaymentToken, None).await;
        assert_eq!(result, Err(BackendError::Timeout(Duration::from_secs(30))));
        assert_eq!(client.registry().pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_failure_removes_entry() {
        let surface = Arc::new(InMemoryScriptSurface::new());
        surface.push_reply(
            BackendFunction::Subscription,
            SurfaceReply::Fail(FailureCause::ConnectionRefused("refused".into())),
        );
        let client = client(&surface, Duration::from_secs(5));

        let result = client.dispatch(BackendFunction::Subscription, None).await;
        assert!(matches!(result, Err(BackendError::Dispatch(_))));
        assert_eq!(client.registry().pending_count().await, 0);
    }
}
