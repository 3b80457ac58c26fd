use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    #[default]
    Purchased,
    Pending,
    Unspecified,
}

/// A purchase as reported by the store. Immutable once received; later queries
/// supersede it rather than mutate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub purchase_token: String,
    pub product_id: String,
    pub order_id: Option<String>,
    pub package_name: String,
    pub status: PurchaseStatus,
    pub acknowledged: bool,
    pub auto_renewing: bool,
    /// Raw expiry in milliseconds since the Unix epoch, when the store reports one.
    pub expiry_time_millis: Option<i64>,
    /// Account-linking identifier attached when the purchase flow was launched.
    pub obfuscated_account_id: Option<String>,
}

impl PurchaseRecord {
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        self.expiry_time_millis
            .is_some_and(|expiry| expiry > 0 && expiry <= now_millis)
    }

    pub fn is_active_at(&self, now_millis: i64) -> bool {
        self.status == PurchaseStatus::Purchased && !self.is_expired_at(now_millis)
    }
}

/// Store-truth purchase status as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PurchaseState {
    #[default]
    NotPurchased,
    Purchased,
    Cancelled,
    Error(String),
    NoProductsAvailable(String),
}

impl fmt::Display for PurchaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPurchased => f.write_str("not_purchased"),
            Self::Purchased => f.write_str("purchased"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Error(message) => write!(f, "error: {message}"),
            Self::NoProductsAvailable(message) => write!(f, "no_products: {message}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionStatus {
    pub is_active: bool,
    pub is_auto_renewing: bool,
    /// Zero when unknown.
    pub expiry_time_millis: i64,
}

/// Derives the store-truth state from a fresh purchase query.
///
/// Purchases whose expiry has passed do not count as active, even if the store
/// still lists them.
pub fn derive_status(records: &[PurchaseRecord], now_millis: i64) -> (PurchaseState, SubscriptionStatus) {
    let active: Vec<&PurchaseRecord> = records.iter().filter(|r| r.is_active_at(now_millis)).collect();

    if active.is_empty() {
        let expiry = records
            .iter()
            .filter_map(|r| r.expiry_time_millis)
            .max()
            .unwrap_or(0);
        let status = SubscriptionStatus {
            is_active: false,
            is_auto_renewing: false,
            expiry_time_millis: expiry,
        };
        return (PurchaseState::NotPurchased, status);
    }

    let status = SubscriptionStatus {
        is_active: true,
        is_auto_renewing: active.iter().any(|r| r.auto_renewing),
        expiry_time_millis: active
            .iter()
            .filter_map(|r| r.expiry_time_millis)
            .max()
            .unwrap_or(0),
    };
    (PurchaseState::Purchased, status)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPhase {
    /// ISO-8601 period such as `P1M` or `P1Y`.
    pub billing_period: String,
    pub formatted_price: String,
    pub price_amount_micros: i64,
    pub price_currency_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOffer {
    pub base_plan_id: String,
    pub offer_token: String,
    pub pricing_phases: Vec<PricingPhase>,
}

/// Product metadata resolved from the store catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub name: String,
    pub description: String,
    pub one_time_price: Option<PricingPhase>,
    pub offers: Vec<SubscriptionOffer>,
}

impl Product {
    /// The phase a purchase of this product is billed at.
    pub fn billing_phase(&self) -> Option<&PricingPhase> {
        self.one_time_price.as_ref().or_else(|| {
            self.offers
                .first()
                .and_then(|offer| offer.pricing_phases.first())
        })
    }

    pub fn offer(&self, offer_token: &str) -> Option<&SubscriptionOffer> {
        self.offers.iter().find(|o| o.offer_token == offer_token)
    }
}
