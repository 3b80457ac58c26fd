use crate::domain::plan::{SubscriptionPlan, default_catalog};
use crate::error::{BillingError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Runtime settings for a billing session. Timeouts are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub cache_ttl_ms: u64,
    pub refresh_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub transaction_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconcile_interval_ms: u64,
    pub plans: Vec<SubscriptionPlan>,
    /// Plan key sent with subscription activation.
    pub backend_plan_id: String,
    pub payment_type: String,
    /// Backend subscription names that grant access.
    pub entitlement_markers: Vec<String>,
    pub management_url: String,
    pub store_fallback_url: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 60_000,
            refresh_interval_ms: 30_000,
            reconnect_delay_ms: 1_000,
            transaction_timeout_ms: 30_000,
            connect_timeout_ms: 2_000,
            reconcile_interval_ms: 60_000,
            plans: default_catalog(),
            backend_plan_id: "plus2024".to_string(),
            payment_type: "google".to_string(),
            entitlement_markers: vec!["plus".to_string(), "visionary".to_string()],
            management_url: "https://play.google.com/store/account/subscriptions".to_string(),
            store_fallback_url: "https://play.google.com/store/apps/details?id=com.android.vending"
                .to_string(),
        }
    }
}

impl BillingConfig {
    /// Reads a JSON config file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                serde_json::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("cache_ttl_ms", self.cache_ttl_ms),
            ("refresh_interval_ms", self.refresh_interval_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("transaction_timeout_ms", self.transaction_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("reconcile_interval_ms", self.reconcile_interval_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(BillingError::ConfigError(format!("{name} must be greater than zero")));
        }
        if self.plans.is_empty() {
            return Err(BillingError::ConfigError("plan catalog is empty".to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(plan) = self.plans.iter().find(|p| !seen.insert(p.product_id.as_str())) {
            return Err(BillingError::ConfigError(format!(
                "duplicate product id {}",
                plan.product_id
            )));
        }
        if self.backend_plan_id.is_empty() {
            return Err(BillingError::ConfigError("backend_plan_id is empty".to_string()));
        }
        Ok(())
    }

    pub fn product_ids(&self) -> Vec<String> {
        self.plans.iter().map(|p| p.product_id.clone()).collect()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = BillingConfig::load(None).unwrap();
        assert_eq!(config.transaction_timeout(), Duration::from_secs(30));
        assert_eq!(config.product_ids(), vec!["plus_1_renewing", "plus_12_renewing"]);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"cache_ttl_ms": 500, "backend_plan_id": "lumo2024"}}"#).unwrap();

        let config = BillingConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.cache_ttl(), Duration::from_millis(500));
        assert_eq!(config.backend_plan_id, "lumo2024");
        assert_eq!(config.refresh_interval_ms, 30_000);
    }

    #[test]
    fn test_zero_duration_is_rejected() {
        let config = BillingConfig {
            transaction_timeout_ms: 0,
            ..BillingConfig::default()
        };
        assert!(matches!(config.validate(), Err(BillingError::ConfigError(_))));
    }

    #[test]
    fn test_duplicate_products_are_rejected() {
        let mut config = BillingConfig::default();
        config.plans.push(config.plans[0].clone());
        assert!(matches!(config.validate(), Err(BillingError::ConfigError(_))));
    }
}
