//! Payloads exchanged with the web backend and the script that carries them.

use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Correlation key for one script round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InAppPayload {
    pub purchase_token: String,
    #[serde(rename = "customerID")]
    pub customer_id: String,
    pub package_name: String,
    #[serde(rename = "productID")]
    pub product_id: String,
    #[serde(rename = "orderID")]
    pub order_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Payment {
    #[serde(rename = "Type")]
    pub kind: String,
    pub details: Option<InAppPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PaymentTokenRequest {
    /// Integer cents.
    pub amount: i64,
    pub currency: String,
    #[serde(rename = "PaymentMethodID")]
    pub payment_method_id: Option<String>,
    pub payment: Option<Payment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionRequest {
    pub payment_token: Option<String>,
    pub cycle: u32,
    pub currency: String,
    pub plans: BTreeMap<String, u32>,
    pub coupon_code: Option<String>,
    pub billing_address: Option<String>,
}

impl SubscriptionRequest {
    pub fn new(payment_token: String, currency: &str, plan_id: &str) -> Self {
        Self {
            payment_token: Some(payment_token),
            cycle: 1,
            currency: currency.to_string(),
            plans: BTreeMap::from([(plan_id.to_string(), 1)]),
            coupon_code: None,
            billing_address: None,
        }
    }
}

/// The `{status, data, message}` envelope posted back by the script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ScriptEnvelope {
    status: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BackendResponse {
    pub data: Option<Value>,
}

impl BackendResponse {
    /// Payment token from `data.Token`, or `data` itself when it is a string.
    pub fn extract_token(&self) -> Option<String> {
        match self.data.as_ref()? {
            Value::String(token) if !token.is_empty() => Some(token.clone()),
            Value::Object(map) => map
                .get("Token")
                .and_then(Value::as_str)
                .filter(|token| !token.is_empty())
                .map(str::to_string),
            _ => None,
        }
    }
}

/// Subset of a backend subscription record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BackendSubscription {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub period_end: i64,
    pub renew: i64,
    #[serde(rename = "CustomerID")]
    pub customer_id: Option<String>,
}

/// Reads `Subscriptions` (array) or `Subscription` (single object) out of `data`.
pub fn parse_subscriptions(response: &BackendResponse) -> Vec<BackendSubscription> {
    let Some(Value::Object(map)) = response.data.as_ref() else {
        return Vec::new();
    };
    if let Some(list) = map.get("Subscriptions") {
        return serde_json::from_value(list.clone()).unwrap_or_default();
    }
    map.get("Subscription")
        .and_then(|single| serde_json::from_value(single.clone()).ok())
        .into_iter()
        .collect()
}

/// True when any subscription name contains one of the entitlement markers.
pub fn has_valid_subscription(subscriptions: &[BackendSubscription], markers: &[String]) -> bool {
    subscriptions.iter().any(|sub| {
        let name = sub.name.to_lowercase();
        markers
            .iter()
            .any(|marker| !marker.is_empty() && name.contains(&marker.to_lowercase()))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendFunction {
    PaymentToken,
    Subscription,
    GetSubscriptions,
}

impl BackendFunction {
    pub fn function_name(self) -> &'static str {
        match self {
            Self::PaymentToken => "postPaymentToken",
            Self::Subscription => "postSubscription",
            Self::GetSubscriptions => "getSubscriptions",
        }
    }
}

impl fmt::Display for BackendFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.function_name())
    }
}

/// A backend call ready to be injected into the script surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptCall {
    pub transaction_id: TransactionId,
    pub function: BackendFunction,
    pub payload: Option<Value>,
}

impl ScriptCall {
    /// The async script that invokes the backend function and reports the
    /// outcome through `Android.postResult(txId, json)`.
    pub fn script(&self) -> String {
        let name = self.function.function_name();
        let argument = match self.function {
            BackendFunction::GetSubscriptions => "'android'".to_string(),
            _ => self
                .payload
                .as_ref()
                .map_or_else(|| "null".to_string(), Value::to_string),
        };
        format!(
            r#"(async function() {{
    const txId = '{tx}';
    if (typeof Android === 'undefined' || typeof Android.postResult !== 'function') {{
        console.error('Android.postResult is not available');
        return;
    }}
    try {{
        if (window.paymentApiInstance && typeof window.paymentApiInstance.{name} === 'function') {{
            const result = await window.paymentApiInstance.{name}({argument});
            Android.postResult(txId, JSON.stringify({{ status: 'success', data: result }}));
        }} else {{
            Android.postResult(txId, JSON.stringify({{ status: 'error', message: 'paymentApiInstance or {name} not found' }}));
        }}
    }} catch (e) {{
        const message = e instanceof Error ? e.message : String(e);
        Android.postResult(txId, JSON.stringify({{ status: 'error', message: 'JS Error: ' + message }}));
    }}
}})();"#,
            tx = self.transaction_id,
        )
    }
}

const MAX_DECODE_DEPTH: usize = 4;

/// Normalizes a raw script result into a backend response.
///
/// Unresolved-promise and empty sentinels are rejected, surrounding quotes are
/// stripped and JSON that was encoded as a string is decoded before the
/// envelope is read.
pub fn parse_script_result(raw: &str) -> Result<BackendResponse, BackendError> {
    let trimmed = raw.trim();
    if trimmed.starts_with("[object Promise]") || trimmed == "undefined" || trimmed == "{}" {
        return Err(BackendError::Malformed(format!(
            "unexpected script result: {trimmed}"
        )));
    }

    let envelope = decode_envelope(trimmed, 0).ok_or_else(|| {
        BackendError::Malformed(format!("could not parse script result: {trimmed}"))
    })?;

    if envelope.status.as_deref() == Some("success") {
        Ok(BackendResponse {
            data: envelope.data.filter(|data| !data.is_null()),
        })
    } else {
        Err(BackendError::Rejected(
            envelope
                .message
                .unwrap_or_else(|| "Unknown error from JS".to_string()),
        ))
    }
}

fn decode_envelope(raw: &str, depth: usize) -> Option<ScriptEnvelope> {
    if depth > MAX_DECODE_DEPTH {
        return None;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => serde_json::from_value(Value::Object(map)).ok(),
        Ok(Value::String(inner)) => decode_envelope(&inner, depth + 1),
        Ok(_) => None,
        Err(_) => {
            let unquoted = raw.strip_prefix('"')?.strip_suffix('"')?;
            let unescaped = unquoted.replace("\\\"", "\"").replace("\\\\", "\\");
            decode_envelope(&unescaped, depth + 1)
        }
    }
}
