use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::currency::{CurrencyConversion, CurrencyError, round_money};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Registration,
    Renewal,
    Transfer,
    Hosting,
    SubscriptionRenewal,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Registration => "registration",
            ItemType::Renewal => "renewal",
            ItemType::Transfer => "transfer",
            ItemType::Hosting => "hosting",
            ItemType::SubscriptionRenewal => "subscription_renewal",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration" => Ok(ItemType::Registration),
            "renewal" => Ok(ItemType::Renewal),
            "transfer" => Ok(ItemType::Transfer),
            "hosting" => Ok(ItemType::Hosting),
            "subscription_renewal" => Ok(ItemType::SubscriptionRenewal),
            other => Err(format!("Unknown item type: {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    #[serde(alias = "semi-annually")]
    SemiAnnually,
    Annually,
    Biennially,
    Triennially,
}

impl BillingCycle {
    pub fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Quarterly => 3,
            BillingCycle::SemiAnnually => 6,
            BillingCycle::Annually => 12,
            BillingCycle::Biennially => 24,
            BillingCycle::Triennially => 36,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Quarterly => "quarterly",
            BillingCycle::SemiAnnually => "semi_annually",
            BillingCycle::Annually => "annually",
            BillingCycle::Biennially => "biennially",
            BillingCycle::Triennially => "triennially",
        }
    }
}

impl FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "monthly" => Ok(BillingCycle::Monthly),
            "quarterly" => Ok(BillingCycle::Quarterly),
            "semi_annually" | "semi-annually" => Ok(BillingCycle::SemiAnnually),
            "annually" => Ok(BillingCycle::Annually),
            "biennially" => Ok(BillingCycle::Biennially),
            "triennially" => Ok(BillingCycle::Triennially),
            other => Err(format!("Unknown billing cycle: {other}")),
        }
    }
}

/// One cart entry as submitted at checkout. `attributes` carries the
/// provisioning hints validated later into an `ItemHint`.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
pub struct CartLine {
    pub id: String,
    pub name: String,
    pub item_type: ItemType,
    pub price: Decimal,
    pub currency: String,
    pub quantity: i32,
    #[serde(default)]
    pub billing_cycle: Option<BillingCycle>,
    #[serde(default)]
    pub monthly_unit_price: Option<Decimal>,
    #[serde(default)]
    pub unit_price: Option<Decimal>,
    #[serde(default)]
    pub display_unit_price: Option<Decimal>,
    #[serde(default)]
    pub attributes: Value,
}

/// A cart line priced in the target currency. `total == unit_price * quantity`.
#[derive(Serialize, Clone, Debug, PartialEq, ToSchema)]
pub struct PricedLine {
    pub line_id: String,
    pub item_type: ItemType,
    pub unit_price: Decimal,
    /// Presentation only. Never used in totals.
    pub display_unit_price: Decimal,
    pub quantity: i32,
    pub total: Decimal,
    pub currency: String,
}

#[derive(Serialize, Clone, Debug, PartialEq, ToSchema)]
pub struct PricedCart {
    pub currency: String,
    pub lines: Vec<PricedLine>,
    pub subtotal: Decimal,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
pub struct Totals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

/// Price per quantity unit in the line's own currency, before conversion.
pub fn base_unit_price(line: &CartLine) -> Decimal {
    match line.item_type {
        ItemType::Registration | ItemType::Renewal | ItemType::Transfer => line.price,
        ItemType::Hosting => line.monthly_unit_price.unwrap_or_else(|| {
            let months = line.billing_cycle.map(|c| c.months()).unwrap_or(1);
            line.price / Decimal::from(months)
        }),
        ItemType::SubscriptionRenewal => line.unit_price.unwrap_or(line.price),
    }
}

fn display_base_price(line: &CartLine) -> Decimal {
    match line.item_type {
        ItemType::SubscriptionRenewal => line
            .display_unit_price
            .or(line.unit_price)
            .unwrap_or(line.price),
        _ => base_unit_price(line),
    }
}

pub async fn price_line<C>(line: &CartLine, target: &str, converter: &C) -> Result<PricedLine, CurrencyError>
where
    C: CurrencyConversion + ?Sized,
{
    // Unit prices are stored at cent precision, so the line total is built
    // from the rounded value.
    let unit_price = round_money(
        converter
            .convert(base_unit_price(line), &line.currency, target)
            .await?,
    );
    let display_unit_price = match line.item_type {
        ItemType::SubscriptionRenewal => round_money(
            converter
                .convert(display_base_price(line), &line.currency, target)
                .await?,
        ),
        _ => unit_price,
    };
    let quantity = line.quantity.max(1);

    Ok(PricedLine {
        line_id: line.id.clone(),
        item_type: line.item_type,
        unit_price,
        display_unit_price,
        quantity,
        total: round_money(unit_price * Decimal::from(quantity)),
        currency: target.to_string(),
    })
}

/// Prices every line in `target`. A single failed conversion fails the whole cart.
pub async fn price_cart<C>(lines: &[CartLine], target: &str, converter: &C) -> Result<PricedCart, CurrencyError>
where
    C: CurrencyConversion + ?Sized,
{
    let mut priced = Vec::with_capacity(lines.len());
    for line in lines {
        priced.push(price_line(line, target, converter).await?);
    }
    let subtotal = priced.iter().map(|line| line.total).sum();

    Ok(PricedCart {
        currency: target.to_string(),
        lines: priced,
        subtotal,
    })
}

pub fn totals(subtotal: Decimal, discount: Decimal, tax: Decimal) -> Totals {
    let discount = discount.clamp(Decimal::ZERO, subtotal.max(Decimal::ZERO));
    let total = round_money(subtotal - discount + tax).max(Decimal::ZERO);
    Totals {
        subtotal,
        discount,
        tax,
        total,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;

    /// Converts with fixed per-currency rates relative to USD.
    pub struct FixedRates(pub HashMap<&'static str, Decimal>);

    impl FixedRates {
        pub fn usd_rwf() -> Self {
            Self(HashMap::from([("USD", dec!(1)), ("RWF", dec!(1000))]))
        }
    }

    #[async_trait]
    impl CurrencyConversion for FixedRates {
        async fn convert(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal, CurrencyError> {
            if from == to {
                return Ok(amount);
            }
            let from_rate = self.0.get(from).ok_or_else(|| CurrencyError::NotFound(from.into()))?;
            let to_rate = self.0.get(to).ok_or_else(|| CurrencyError::NotFound(to.into()))?;
            Ok(round_money(amount / from_rate * to_rate))
        }
    }

    pub fn line(item_type: ItemType, price: Decimal, quantity: i32) -> CartLine {
        CartLine {
            id: format!("{item_type}-{price}"),
            name: "example.com".into(),
            item_type,
            price,
            currency: "USD".into(),
            quantity,
            billing_cycle: None,
            monthly_unit_price: None,
            unit_price: None,
            display_unit_price: None,
            attributes: json!({}),
        }
    }

    #[tokio::test]
    async fn registration_and_monthly_hosting_add_up() {
        let mut hosting = line(ItemType::Hosting, dec!(10.00), 1);
        hosting.billing_cycle = Some(BillingCycle::Monthly);
        let cart = vec![line(ItemType::Registration, dec!(12.00), 2), hosting];

        let priced = price_cart(&cart, "USD", &FixedRates::usd_rwf()).await.unwrap();
        assert_eq!(priced.lines[0].total, dec!(24.00));
        assert_eq!(priced.lines[1].total, dec!(10.00));
        assert_eq!(priced.subtotal, dec!(34.00));
    }

    #[tokio::test]
    async fn hosting_period_price_is_normalized_to_monthly() {
        let mut hosting = line(ItemType::Hosting, dec!(120.00), 12);
        hosting.billing_cycle = Some(BillingCycle::Annually);

        let priced = price_line(&hosting, "USD", &FixedRates::usd_rwf()).await.unwrap();
        assert_eq!(priced.unit_price, dec!(10.00));
        assert_eq!(priced.total, dec!(120.00));
    }

    #[tokio::test]
    async fn uneven_monthly_prices_keep_the_line_consistent() {
        let mut hosting = line(ItemType::Hosting, dec!(100.00), 3);
        hosting.billing_cycle = Some(BillingCycle::Quarterly);

        let priced = price_line(&hosting, "USD", &FixedRates::usd_rwf()).await.unwrap();
        assert_eq!(priced.unit_price, dec!(33.33));
        assert_eq!(priced.total, dec!(99.99));
        assert_eq!(priced.unit_price * Decimal::from(priced.quantity), priced.total);
    }

    #[tokio::test]
    async fn explicit_monthly_price_wins() {
        let mut hosting = line(ItemType::Hosting, dec!(99.00), 3);
        hosting.billing_cycle = Some(BillingCycle::Quarterly);
        hosting.monthly_unit_price = Some(dec!(30.00));

        let priced = price_line(&hosting, "USD", &FixedRates::usd_rwf()).await.unwrap();
        assert_eq!(priced.total, dec!(90.00));
    }

    #[tokio::test]
    async fn subscription_renewal_display_price_never_feeds_totals() {
        let mut renewal = line(ItemType::SubscriptionRenewal, dec!(5.00), 12);
        renewal.unit_price = Some(dec!(5.00));
        renewal.display_unit_price = Some(dec!(60.00));

        let priced = price_line(&renewal, "RWF", &FixedRates::usd_rwf()).await.unwrap();
        assert_eq!(priced.unit_price, dec!(5000));
        assert_eq!(priced.display_unit_price, dec!(60000));
        assert_eq!(priced.total, dec!(60000));
    }

    #[tokio::test]
    async fn conversion_failures_propagate() {
        let mut bad = line(ItemType::Registration, dec!(10.00), 1);
        bad.currency = "EUR".into();
        let cart = vec![line(ItemType::Registration, dec!(10.00), 1), bad];

        let result = price_cart(&cart, "USD", &FixedRates::usd_rwf()).await;
        assert_eq!(result, Err(CurrencyError::NotFound("EUR".into())));
    }

    #[test]
    fn discount_is_clamped_to_subtotal() {
        let t = totals(dec!(20.00), dec!(25.00), Decimal::ZERO);
        assert_eq!(t.discount, dec!(20.00));
        assert_eq!(t.total, Decimal::ZERO);

        let t = totals(dec!(20.00), dec!(-5.00), Decimal::ZERO);
        assert_eq!(t.discount, Decimal::ZERO);
        assert_eq!(t.total, dec!(20.00));
    }

    proptest! {
        #[test]
        fn subtotal_equals_sum_of_line_totals(
            lines in prop::collection::vec((0i64..100_000, 1i32..37, 0usize..3), 1..8)
        ) {
            let cart: Vec<CartLine> = lines
                .into_iter()
                .map(|(cents, quantity, kind)| {
                    let item_type = [ItemType::Registration, ItemType::Hosting, ItemType::SubscriptionRenewal][kind];
                    let mut l = line(item_type, Decimal::new(cents, 2), quantity);
                    l.billing_cycle = Some(BillingCycle::Quarterly);
                    l
                })
                .collect();

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let priced = runtime.block_on(price_cart(&cart, "RWF", &FixedRates::usd_rwf())).unwrap();
            let sum: Decimal = priced.lines.iter().map(|l| l.total).sum();
            prop_assert_eq!(sum, priced.subtotal);
            for l in &priced.lines {
                prop_assert_eq!(l.unit_price, round_money(l.unit_price));
                prop_assert_eq!(l.total, l.unit_price * Decimal::from(l.quantity));
            }
        }

        #[test]
        fn total_is_never_negative(subtotal in 0i64..1_000_000, discount in -1_000_000i64..2_000_000) {
            let t = totals(Decimal::new(subtotal, 2), Decimal::new(discount, 2), Decimal::ZERO);
            prop_assert!(t.total >= Decimal::ZERO);
            prop_assert!(t.discount <= t.subtotal);
        }
    }
}
