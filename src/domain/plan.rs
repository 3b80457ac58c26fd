use crate::domain::purchase::{PricingPhase, Product, SubscriptionOffer};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Micro-units per integer cent in store prices.
pub const MICROS_PER_CENT: i64 = 10_000;

/// Static catalog entry. Pricing is never written back into it; see [`enrich`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub product_id: String,
    pub plan_name: String,
    pub duration_months: u32,
    #[serde(default)]
    pub description: String,
}

impl SubscriptionPlan {
    pub fn new(product_id: &str, plan_name: &str, duration_months: u32, description: &str) -> Self {
        Self {
            product_id: product_id.to_string(),
            plan_name: plan_name.to_string(),
            duration_months,
            description: description.to_string(),
        }
    }

    /// ISO-8601 billing period matching this plan's duration, if it has a standard one.
    pub fn expected_period(&self) -> Option<&'static str> {
        match self.duration_months {
            1 => Some("P1M"),
            3 => Some("P3M"),
            6 => Some("P6M"),
            12 => Some("P1Y"),
            _ => None,
        }
    }
}

pub fn default_catalog() -> Vec<SubscriptionPlan> {
    vec![
        SubscriptionPlan::new("plus_1_renewing", "1 Month", 1, "Monthly subscription"),
        SubscriptionPlan::new(
            "plus_12_renewing",
            "12 Months",
            12,
            "Annual subscription (save 20%)",
        ),
    ]
}

/// A plan combined with the store's live pricing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichedPlan {
    pub plan: SubscriptionPlan,
    pub formatted_price: String,
    pub price_amount_micros: i64,
    pub currency_code: String,
    pub period_text: String,
    pub offer_token: Option<String>,
    pub price_per_month: Option<String>,
    pub savings_percent: Option<u32>,
}

/// Integer cents for a store price in micro-units. Truncates, never rounds.
pub fn micros_to_cents(micros: i64) -> i64 {
    micros / MICROS_PER_CENT
}

pub fn micros_to_decimal(micros: i64) -> Decimal {
    Decimal::new(micros, 6)
}

pub fn format_price(amount: Decimal, currency: &str) -> String {
    let amount = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let amount = format!("{amount:.2}");
    match currency {
        "USD" => format!("${amount}"),
        "EUR" => format!("€{amount}"),
        "GBP" => format!("£{amount}"),
        _ => format!("{amount} {currency}"),
    }
}

pub fn period_text(billing_period: &str) -> String {
    match billing_period {
        "P1D" => "day",
        "P1W" => "week",
        "P1M" => "month",
        "P3M" => "quarter",
        "P6M" => "6 months",
        "P1Y" => "year",
        other => other,
    }
    .to_string()
}

fn select_offer<'a>(plan: &SubscriptionPlan, product: &'a Product) -> Option<&'a SubscriptionOffer> {
    plan.expected_period()
        .and_then(|period| {
            product.offers.iter().find(|offer| {
                offer
                    .pricing_phases
                    .iter()
                    .any(|phase| phase.billing_period == period)
            })
        })
        .or_else(|| product.offers.first())
}

fn pricing_for<'a>(
    plan: &SubscriptionPlan,
    products: &'a [Product],
) -> Option<(&'a SubscriptionOffer, &'a PricingPhase)> {
    let product = products.iter().find(|p| p.product_id == plan.product_id)?;
    let offer = select_offer(plan, product)?;
    let phase = offer.pricing_phases.first()?;
    Some((offer, phase))
}

/// Builds priced plans from the static catalog and the store products.
///
/// Plans without a matching product (or without offers) are left out.
pub fn enrich(plans: &[SubscriptionPlan], products: &[Product]) -> Vec<EnrichedPlan> {
    let monthly_micros = plans
        .iter()
        .find(|p| p.duration_months == 1)
        .and_then(|p| pricing_for(p, products))
        .map(|(_, phase)| phase.price_amount_micros)
        .filter(|micros| *micros > 0);

    plans
        .iter()
        .filter_map(|plan| {
            let (offer, phase) = pricing_for(plan, products)?;
            let price_per_month = (plan.duration_months > 1 && phase.price_amount_micros > 0).then(|| {
                let monthly = micros_to_decimal(phase.price_amount_micros)
                    / Decimal::from(plan.duration_months);
                format_price(monthly, &phase.price_currency_code)
            });
            let savings_percent = monthly_micros
                .filter(|_| plan.duration_months > 1)
                .and_then(|monthly| savings(monthly, phase.price_amount_micros, plan.duration_months));

            Some(EnrichedPlan {
                plan: plan.clone(),
                formatted_price: phase.formatted_price.clone(),
                price_amount_micros: phase.price_amount_micros,
                currency_code: phase.price_currency_code.clone(),
                period_text: period_text(&phase.billing_period),
                offer_token: Some(offer.offer_token.clone()),
                price_per_month,
                savings_percent,
            })
        })
        .collect()
}

/// Whole-percent saving of a multi-month price against paying monthly.
fn savings(monthly_micros: i64, total_micros: i64, months: u32) -> Option<u32> {
    let paying_monthly = Decimal::from(monthly_micros) * Decimal::from(months);
    let total = Decimal::from(total_micros);
    if total >= paying_monthly {
        return None;
    }
    ((paying_monthly - total) / paying_monthly * Decimal::ONE_HUNDRED)
        .trunc()
        .to_u32()
        .filter(|p| *p > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn product(id: &str, period: &str, micros: i64, formatted: &str) -> Product {
        Product {
            product_id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            one_time_price: None,
            offers: vec![SubscriptionOffer {
                base_plan_id: format!("{id}-base"),
                offer_token: format!("{id}-offer"),
                pricing_phases: vec![PricingPhase {
                    billing_period: period.to_string(),
                    formatted_price: formatted.to_string(),
                    price_amount_micros: micros,
                    price_currency_code: "USD".to_string(),
                }],
            }],
        }
    }

    #[test]
    fn test_micros_to_cents() {
        assert_eq!(micros_to_cents(9_990_000), 999);
        assert_eq!(micros_to_cents(99_990_000), 9_999);
        assert_eq!(micros_to_cents(9_999), 0);
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(dec!(9.99), "USD"), "$9.99");
        assert_eq!(format_price(dec!(8.3325), "EUR"), "€8.33");
        assert_eq!(format_price(dec!(12), "CHF"), "12.00 CHF");
    }

    #[test]
    fn test_enrich_returns_new_values() {
        let plans = default_catalog();
        let products = vec![
            product("plus_1_renewing", "P1M", 9_990_000, "$9.99"),
            product("plus_12_renewing", "P1Y", 99_990_000, "$99.99"),
        ];

        let enriched = enrich(&plans, &products);

        assert_eq!(enriched.len(), 2);
        assert_eq!(plans, default_catalog());

        let monthly = &enriched[0];
        assert_eq!(monthly.formatted_price, "$9.99");
        assert_eq!(monthly.period_text, "month");
        assert_eq!(monthly.price_per_month, None);
        assert_eq!(monthly.offer_token.as_deref(), Some("plus_1_renewing-offer"));

        let annual = &enriched[1];
        assert_eq!(annual.period_text, "year");
        assert_eq!(annual.price_per_month.as_deref(), Some("$8.33"));
        assert_eq!(annual.savings_percent, Some(16));
    }

    #[test]
    fn test_enrich_skips_plans_without_products() {
        let plans = default_catalog();
        let products = vec![product("plus_1_renewing", "P1M", 9_990_000, "$9.99")];
        let enriched = enrich(&plans, &products);
        assert_eq!(enriched.len(), 1);
        assert_eq!(enriched[0].plan.product_id, "plus_1_renewing");
    }

    #[test]
    fn test_offer_matching_period_is_preferred() {
        let plan = SubscriptionPlan::new("p", "12 Months", 12, "");
        let mut prod = product("p", "P1M", 1_000_000, "$1.00");
        prod.offers.push(SubscriptionOffer {
            base_plan_id: "annual".to_string(),
            offer_token: "annual-offer".to_string(),
            pricing_phases: vec![PricingPhase {
                billing_period: "P1Y".to_string(),
                formatted_price: "$10.00".to_string(),
                price_amount_micros: 10_000_000,
                price_currency_code: "USD".to_string(),
            }],
        });

        let enriched = enrich(&[plan], &[prod]);
        assert_eq!(enriched[0].offer_token.as_deref(), Some("annual-offer"));
        assert_eq!(enriched[0].formatted_price, "$10.00");
    }
}
