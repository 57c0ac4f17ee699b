use std::str::FromStr;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Months, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, dsl::exists, select};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    checkout::hints::ItemHint,
    currency::{CurrencyConversion, USD, round_money},
    models::{
        CreateSubscriptionEntity, HostingPlanEntity, HostingPlanPriceEntity, OrderEntity, OrderItemEntity,
        SubscriptionEntity,
    },
    pricing::BillingCycle,
    provisioning::ProvisioningError,
    schema::{hosting_plan_prices, hosting_plans, subscriptions},
};

/// Allowed gap between the paid and expected renewal amount, in USD.
fn renewal_tolerance() -> Decimal {
    Decimal::new(50, 2)
}

pub fn product_snapshot(plan: &HostingPlanEntity, price: &HostingPlanPriceEntity, order_item_id: i32) -> Value {
    json!({
        "plan": {
            "id": plan.id,
            "name": plan.name,
            "slug": plan.slug,
        },
        "price": {
            "id": price.id,
            "regular_price": price.regular_price,
            "renewal_price": price.renewal_price,
            "billing_cycle": price.billing_cycle,
        },
        "order_item_id": order_item_id,
        "renewals": [],
    })
}

/// `from` moved forward by `months`, starting at now when `from` has passed.
pub fn extend_from(from: DateTime<Utc>, now: DateTime<Utc>, months: i32) -> Option<DateTime<Utc>> {
    let base = if from > now { from } else { now };
    base.checked_add_months(Months::new(months.max(1) as u32))
}

pub fn append_renewal(snapshot: &Value, months: i32, amount: Decimal, renewed_at: DateTime<Utc>) -> Value {
    let mut snapshot = match snapshot {
        Value::Object(_) => snapshot.clone(),
        _ => json!({}),
    };
    let entry = json!({ "months": months, "amount": amount, "renewed_at": renewed_at });
    match snapshot.get_mut("renewals").and_then(Value::as_array_mut) {
        Some(renewals) => renewals.push(entry),
        None => snapshot["renewals"] = json!([entry]),
    }
    snapshot
}

/// Monthly price a subscription renews at, in its own currency.
pub fn expected_monthly_price(
    custom_price: Option<Decimal>,
    subscription_cycle: Option<BillingCycle>,
    plan_renewal_price: Decimal,
    plan_cycle: Option<BillingCycle>,
) -> Decimal {
    match custom_price {
        Some(custom) if subscription_cycle == Some(BillingCycle::Annually) => custom / Decimal::from(12),
        Some(custom) => custom,
        None => {
            let months = plan_cycle.map(|c| c.months()).unwrap_or(1);
            plan_renewal_price / Decimal::from(months)
        }
    }
}

pub fn check_renewal_amount(paid: Decimal, expected: Decimal) -> Result<(), ProvisioningError> {
    if (paid - expected).abs() > renewal_tolerance() {
        return Err(ProvisioningError::AmountMismatch {
            expected: round_money(expected),
            paid: round_money(paid),
        });
    }
    Ok(())
}

/// Creates the hosting subscription bought by an order item.
pub async fn create_from_item(
    conn: &mut AsyncPgConnection,
    order: &OrderEntity,
    item: &OrderItemEntity,
    hint: &ItemHint,
) -> Result<(), ProvisioningError> {
    let ItemHint::Hosting {
        plan_id,
        pricing_id,
        billing_cycle,
        linked_domain,
        duration_months,
    } = hint
    else {
        return Err(anyhow!("Order item {} is not a hosting item", item.id).into());
    };

    let pricing: Option<(HostingPlanPriceEntity, HostingPlanEntity)> = hosting_plan_prices::table
        .inner_join(hosting_plans::table)
        .filter(hosting_plan_prices::id.eq(*pricing_id))
        .filter(hosting_plans::id.eq(*plan_id))
        .select((HostingPlanPriceEntity::as_select(), HostingPlanEntity::as_select()))
        .first(conn)
        .await
        .optional()?;
    let (price, plan) = pricing.ok_or(ProvisioningError::PricingNotFound(*pricing_id))?;

    let domain = linked_domain.clone().unwrap_or_else(|| item.domain_name.clone());

    let duplicate: bool = select(exists(
        subscriptions::table
            .filter(subscriptions::user_id.eq(order.user_id))
            .filter(subscriptions::domain.eq(&domain))
            .filter(subscriptions::hosting_plan_pricing_id.eq(*pricing_id))
            .filter(subscriptions::status.eq("active")),
    ))
    .get_result(conn)
    .await
    .context("Failed to check existing subscriptions")?;

    if duplicate {
        info!(order_id = order.id, domain, "Active subscription already exists, skipping");
        return Ok(());
    }

    let starts_at = Utc::now();
    let expires_at = extend_from(starts_at, starts_at, *duration_months)
        .ok_or_else(|| anyhow!("Subscription expiry is out of range"))?;

    let subscription = diesel::insert_into(subscriptions::table)
        .values(CreateSubscriptionEntity {
            user_id: order.user_id,
            hosting_plan_id: plan.id,
            hosting_plan_pricing_id: price.id,
            billing_cycle: billing_cycle.as_str().into(),
            domain: Some(domain),
            status: "active".into(),
            starts_at,
            expires_at,
            next_renewal_at: Some(expires_at),
            auto_renew: true,
            product_snapshot: product_snapshot(&plan, &price, item.id),
        })
        .returning(SubscriptionEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to create subscription")?;

    info!(order_id = order.id, subscription_id = subscription.id, plan = plan.slug, "Subscription created");
    Ok(())
}

/// Extends a subscription after checking the paid amount against its price.
pub async fn renew_from_item(
    conn: &mut AsyncPgConnection,
    converter: &dyn CurrencyConversion,
    order: &OrderEntity,
    item: &OrderItemEntity,
    hint: &ItemHint,
) -> Result<(), ProvisioningError> {
    let ItemHint::SubscriptionRenewal {
        subscription_id,
        billing_cycle,
        duration_months,
    } = hint
    else {
        return Err(anyhow!("Order item {} is not a subscription renewal", item.id).into());
    };

    let subscription: SubscriptionEntity = subscriptions::table
        .find(*subscription_id)
        .select(SubscriptionEntity::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or(ProvisioningError::SubscriptionNotFound(*subscription_id))?;

    if subscription.user_id != order.user_id {
        return Err(ProvisioningError::SubscriptionNotOwned(subscription.id));
    }

    let months = *duration_months;
    let paid = converter.convert(item.total_amount, &item.currency, USD).await?;

    let subscription_cycle = BillingCycle::from_str(&subscription.billing_cycle).ok();
    let expected_monthly = match subscription.custom_price {
        Some(custom) => {
            let monthly = expected_monthly_price(Some(custom), subscription_cycle, Decimal::ZERO, None);
            let currency = subscription.custom_price_currency.as_deref().unwrap_or(USD);
            converter.convert(monthly, currency, USD).await?
        }
        None => {
            let price: HostingPlanPriceEntity = hosting_plan_prices::table
                .find(subscription.hosting_plan_pricing_id)
                .select(HostingPlanPriceEntity::as_select())
                .first(conn)
                .await
                .optional()?
                .ok_or(ProvisioningError::PricingNotFound(subscription.hosting_plan_pricing_id))?;
            let plan_cycle = BillingCycle::from_str(&price.billing_cycle).ok();
            let monthly = expected_monthly_price(None, None, price.renewal_price, plan_cycle);
            converter.convert(monthly, &price.currency, USD).await?
        }
    };
    check_renewal_amount(paid, expected_monthly * Decimal::from(months))?;

    let now = Utc::now();
    let expires_at = extend_from(subscription.expires_at, now, months)
        .ok_or_else(|| anyhow!("Subscription expiry is out of range"))?;
    let cycle = billing_cycle
        .map(|c| c.as_str().to_string())
        .unwrap_or(subscription.billing_cycle.clone());

    diesel::update(subscriptions::table.find(subscription.id))
        .set((
            subscriptions::expires_at.eq(expires_at),
            subscriptions::next_renewal_at.eq(Some(expires_at)),
            subscriptions::status.eq("active"),
            subscriptions::billing_cycle.eq(cycle),
            subscriptions::product_snapshot.eq(append_renewal(
                &subscription.product_snapshot,
                months,
                item.total_amount,
                now,
            )),
        ))
        .execute(conn)
        .await
        .context("Failed to extend subscription")?;

    info!(order_id = order.id, subscription_id = subscription.id, months, expires_at = %expires_at, "Subscription renewed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn annual_custom_price_is_spread_over_twelve_months() {
        assert_eq!(
            expected_monthly_price(Some(dec!(120)), Some(BillingCycle::Annually), dec!(0), None),
            dec!(10)
        );
        assert_eq!(
            expected_monthly_price(Some(dec!(9)), Some(BillingCycle::Monthly), dec!(0), None),
            dec!(9)
        );
    }

    #[test]
    fn plan_price_is_normalized_by_its_cycle() {
        assert_eq!(
            expected_monthly_price(None, None, dec!(30), Some(BillingCycle::Quarterly)),
            dec!(10)
        );
    }

    #[test]
    fn renewal_amount_allows_fifty_cents() {
        assert!(check_renewal_amount(dec!(29.60), dec!(30)).is_ok());
        assert!(check_renewal_amount(dec!(30.50), dec!(30)).is_ok());
        assert!(matches!(
            check_renewal_amount(dec!(20), dec!(30)),
            Err(ProvisioningError::AmountMismatch { .. })
        ));
    }

    #[test]
    fn extension_starts_from_the_later_date() {
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        let future = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            extend_from(future, now, 3),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            extend_from(now - chrono::TimeDelta::days(10), now, 1),
            Some(Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn renewals_are_appended_to_the_snapshot() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let snapshot = append_renewal(&json!({"plan": {"id": 1}, "renewals": []}), 3, dec!(30), at);
        let snapshot = append_renewal(&snapshot, 1, dec!(10), at);
        assert_eq!(snapshot["renewals"].as_array().map(Vec::len), Some(2));
        assert_eq!(snapshot["plan"]["id"], json!(1));
        assert_eq!(append_renewal(&Value::Null, 1, dec!(1), at)["renewals"][0]["months"], json!(1));
    }
}
