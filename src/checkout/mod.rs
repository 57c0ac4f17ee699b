//! Turns a priced cart into a persisted order.

pub mod hints;

use std::collections::HashMap;

use anyhow::Context;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    app_error::AppError,
    currency::{CurrencyConversion, CurrencyError, normalize_code},
    models::{
        ContactEntity, CreateOrderEntity, CreateOrderItemEntity, CurrencyEntity, OrderEntity,
        OrderItemEntity,
    },
    pricing::{self, CartLine, ItemType, Totals},
    schema::{contacts, currencies, order_items, orders},
};

use hints::{ContactIds, HintError, ItemHint};

/// Allowed difference between the submitted and recomputed subtotal.
fn subtotal_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

#[derive(Debug, Error, PartialEq)]
pub enum CheckoutError {
    #[error("Your cart is empty")]
    EmptyCart,

    #[error("Cart totals are missing")]
    MissingTotals,

    #[error("Cart subtotal {submitted} no longer matches current prices ({expected})")]
    PriceMismatch { expected: Decimal, submitted: Decimal },

    #[error("Invalid cart item {name}: {source}")]
    InvalidItem { name: String, source: HintError },

    #[error("Billing details are required")]
    MissingBilling,

    #[error(transparent)]
    Currency(#[from] CurrencyError),
}

impl From<CheckoutError> for AppError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::Currency(CurrencyError::Transport(reason)) => {
                AppError::ServiceUnreachable(format!("Currency rates ({reason})"))
            }
            err => AppError::BadRequest(err.to_string()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, ToSchema)]
pub struct CouponInput {
    pub code: String,
    pub discount_type: Option<String>,
    pub discount_amount: Decimal,
}

#[derive(Deserialize, Serialize, Clone, Debug, ToSchema)]
pub struct BillingInput {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub address: Option<Value>,
}

/// Cart payload as prepared by the storefront.
#[derive(Deserialize, Clone, Debug, ToSchema)]
pub struct CheckoutRequest {
    pub items: Vec<CartLine>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub subtotal: Option<Decimal>,
    #[serde(default)]
    pub total: Option<Decimal>,
    #[serde(default)]
    pub tax: Option<Decimal>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub coupon: Option<CouponInput>,
    #[serde(default)]
    pub contact_ids: Option<ContactIds>,
    #[serde(default)]
    pub selected_contact_id: Option<i32>,
    #[serde(default)]
    pub billing: Option<BillingInput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedItem {
    pub domain_name: String,
    pub domain_type: ItemType,
    pub price: Decimal,
    pub currency: String,
    pub exchange_rate: Decimal,
    pub quantity: i32,
    pub years: i32,
    pub total_amount: Decimal,
    pub hint: ItemHint,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedOrder {
    pub order_type: ItemType,
    pub currency: String,
    pub totals: Totals,
    pub coupon: Option<CouponInput>,
    pub payment_method: Option<String>,
    pub contact_ids: ContactIds,
    pub selected_contact_id: Option<i32>,
    pub items: Vec<PreparedItem>,
    pub items_snapshot: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingSnapshot {
    pub name: String,
    pub email: String,
    pub address: Option<Value>,
}

/// Order type from the mix of item types. Homogeneous carts keep their
/// type; anything mixed is a registration order.
pub fn classify_order_type(types: &[ItemType]) -> ItemType {
    let all = |t: ItemType| !types.is_empty() && types.iter().all(|x| *x == t);
    if all(ItemType::SubscriptionRenewal) {
        ItemType::SubscriptionRenewal
    } else if all(ItemType::Renewal) {
        ItemType::Renewal
    } else if all(ItemType::Transfer) {
        ItemType::Transfer
    } else if all(ItemType::Hosting) {
        ItemType::Hosting
    } else {
        ItemType::Registration
    }
}

pub fn generate_order_number() -> String {
    let random = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("ORD-{}", &random[..10])
}

/// Rate captured on the item: order currency rate over item currency rate,
/// 1 when either side is unknown.
pub fn item_exchange_rate(rates: &HashMap<String, Decimal>, order_currency: &str, item_currency: &str) -> Decimal {
    match (rates.get(order_currency), rates.get(item_currency)) {
        (Some(order_rate), Some(item_rate)) if !item_rate.is_zero() => order_rate / item_rate,
        _ => Decimal::ONE,
    }
}

/// Validates and prices a cart payload. Nothing is persisted.
pub async fn prepare_order<C>(
    request: &CheckoutRequest,
    default_currency: &str,
    converter: &C,
    rates: &HashMap<String, Decimal>,
) -> Result<PreparedOrder, CheckoutError>
where
    C: CurrencyConversion + ?Sized,
{
    if request.items.is_empty() {
        return Err(CheckoutError::EmptyCart);
    }
    let submitted = match (request.subtotal, request.total) {
        (Some(subtotal), Some(_)) => subtotal,
        _ => return Err(CheckoutError::MissingTotals),
    };

    let currency = match request.currency.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => normalize_code(code),
        _ => {
            warn!(default_currency, "Checkout payload has no currency, using default");
            normalize_code(default_currency)
        }
    };

    let priced = pricing::price_cart(&request.items, &currency, converter).await?;
    if (priced.subtotal - submitted).abs() > subtotal_tolerance() {
        return Err(CheckoutError::PriceMismatch {
            expected: priced.subtotal,
            submitted,
        });
    }

    let discount = request
        .coupon
        .as_ref()
        .map(|c| c.discount_amount)
        .unwrap_or(Decimal::ZERO);
    let totals = pricing::totals(priced.subtotal, discount, request.tax.unwrap_or(Decimal::ZERO));

    let mut items = Vec::with_capacity(request.items.len());
    let mut snapshot = Vec::with_capacity(request.items.len());
    for (line, priced_line) in request.items.iter().zip(&priced.lines) {
        let hint = ItemHint::parse(line.item_type, &line.attributes, priced_line.quantity, line.billing_cycle)
            .map_err(|source| CheckoutError::InvalidItem {
                name: line.name.clone(),
                source,
            })?;

        let mut metadata = hint.to_metadata();
        metadata["original_currency"] = json!(normalize_code(&line.currency));
        metadata["original_price"] = json!(line.price);
        if priced_line.display_unit_price != priced_line.unit_price {
            metadata["display_unit_price"] = json!(priced_line.display_unit_price);
        }

        let years = match line.item_type {
            ItemType::Registration | ItemType::Renewal | ItemType::Transfer => priced_line.quantity,
            ItemType::Hosting | ItemType::SubscriptionRenewal => 1,
        };

        snapshot.push(json!({
            "id": line.id,
            "name": line.name,
            "price": priced_line.unit_price,
            "quantity": priced_line.quantity,
            "attributes": line.attributes,
        }));

        items.push(PreparedItem {
            domain_name: line.name.trim().to_lowercase(),
            domain_type: line.item_type,
            price: priced_line.unit_price,
            currency: currency.clone(),
            exchange_rate: item_exchange_rate(rates, &currency, &normalize_code(&line.currency)),
            quantity: priced_line.quantity,
            years,
            total_amount: priced_line.total,
            hint,
            metadata,
        });
    }

    let types: Vec<ItemType> = items.iter().map(|item| item.domain_type).collect();

    Ok(PreparedOrder {
        order_type: classify_order_type(&types),
        currency,
        totals,
        coupon: request.coupon.clone(),
        payment_method: request.payment_method.clone(),
        contact_ids: request.contact_ids.unwrap_or_default(),
        selected_contact_id: request.selected_contact_id,
        items,
        items_snapshot: Value::Array(snapshot),
    })
}

/// Active currency rates keyed by code.
pub async fn load_rates(conn: &mut AsyncPgConnection) -> anyhow::Result<HashMap<String, Decimal>> {
    let rows: Vec<CurrencyEntity> = currencies::table
        .filter(currencies::is_active.eq(true))
        .select(CurrencyEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get currencies")?;

    Ok(rows.into_iter().map(|c| (c.code, c.exchange_rate)).collect())
}

/// Billing contact when one is selected and owned by the user, otherwise the submitted details.
pub async fn resolve_billing(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    billing_contact_id: Option<i32>,
    submitted: Option<&BillingInput>,
) -> Result<BillingSnapshot, AppError> {
    if let Some(contact_id) = billing_contact_id {
        let contact: Option<ContactEntity> = contacts::table
            .find(contact_id)
            .filter(contacts::user_id.eq(user_id))
            .select(ContactEntity::as_select())
            .first(conn)
            .await
            .optional()
            .context("Failed to get billing contact")?;

        if let Some(contact) = contact {
            return Ok(BillingSnapshot {
                name: format!("{} {}", contact.first_name, contact.last_name),
                email: contact.email,
                address: Some(json!({
                    "address_one": contact.address_one,
                    "city": contact.city,
                    "state_province": contact.state_province,
                    "postal_code": contact.postal_code,
                    "country_code": contact.country_code,
                })),
            });
        }
        warn!(user_id, contact_id, "Billing contact not found for user, using submitted details");
    }

    submitted
        .map(|billing| BillingSnapshot {
            name: billing.name.clone(),
            email: billing.email.clone(),
            address: billing.address.clone(),
        })
        .ok_or_else(|| CheckoutError::MissingBilling.into())
}

/// Persists the order and its items in one transaction.
pub async fn create_order(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    prepared: PreparedOrder,
    billing: BillingSnapshot,
) -> Result<(OrderEntity, Vec<OrderItemEntity>), AppError> {
    conn.transaction(move |conn| {
        Box::pin(async move {
            let metadata = json!({
                "contact_ids": prepared.contact_ids,
                "selected_contact_id": prepared.selected_contact_id,
            });

            let order = diesel::insert_into(orders::table)
                .values(CreateOrderEntity {
                    user_id,
                    order_number: generate_order_number(),
                    order_type: prepared.order_type.to_string(),
                    status: "pending".into(),
                    payment_status: "pending".into(),
                    payment_method: prepared.payment_method.clone(),
                    currency: prepared.currency.clone(),
                    subtotal: prepared.totals.subtotal,
                    tax: prepared.totals.tax,
                    total_amount: prepared.totals.total,
                    coupon_code: prepared.coupon.as_ref().map(|c| c.code.clone()),
                    discount_type: prepared.coupon.as_ref().and_then(|c| c.discount_type.clone()),
                    discount_amount: prepared.totals.discount,
                    billing_name: billing.name,
                    billing_email: billing.email,
                    billing_address: billing.address,
                    items: prepared.items_snapshot,
                    metadata,
                })
                .returning(OrderEntity::as_returning())
                .get_result(conn)
                .await
                .context("Failed to create order")?;

            let rows: Vec<CreateOrderItemEntity> = prepared
                .items
                .into_iter()
                .map(|item| CreateOrderItemEntity {
                    order_id: order.id,
                    domain_name: item.domain_name,
                    domain_type: item.domain_type.to_string(),
                    price: item.price,
                    currency: item.currency,
                    exchange_rate: item.exchange_rate,
                    quantity: item.quantity,
                    years: item.years,
                    total_amount: item.total_amount,
                    metadata: item.metadata,
                })
                .collect();

            let items = diesel::insert_into(order_items::table)
                .values(&rows)
                .returning(OrderItemEntity::as_returning())
                .get_results(conn)
                .await
                .context("Failed to create order items")?;

            info!(order_id = order.id, order_number = %order.order_number, items = items.len(), "Order created");

            Ok::<(OrderEntity, Vec<OrderItemEntity>), AppError>((order, items))
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::pricing::{
        BillingCycle,
        tests::{FixedRates, line},
    };

    fn request(items: Vec<CartLine>, subtotal: Decimal) -> CheckoutRequest {
        CheckoutRequest {
            items,
            currency: Some("USD".into()),
            subtotal: Some(subtotal),
            total: Some(subtotal),
            tax: None,
            payment_method: Some("stripe".into()),
            coupon: None,
            contact_ids: None,
            selected_contact_id: None,
            billing: None,
        }
    }

    fn hosting_line(price: Decimal) -> CartLine {
        let mut hosting = line(ItemType::Hosting, price, 1);
        hosting.billing_cycle = Some(BillingCycle::Monthly);
        hosting.attributes = json!({"hosting_plan_id": 1, "hosting_plan_pricing_id": 2});
        hosting
    }

    #[test]
    fn classifies_homogeneous_and_mixed_carts() {
        use ItemType::*;
        assert_eq!(classify_order_type(&[Renewal, Renewal]), Renewal);
        assert_eq!(classify_order_type(&[Transfer]), Transfer);
        assert_eq!(classify_order_type(&[SubscriptionRenewal]), SubscriptionRenewal);
        assert_eq!(classify_order_type(&[Hosting]), Hosting);
        assert_eq!(classify_order_type(&[Renewal, Transfer]), Registration);
        assert_eq!(classify_order_type(&[Registration, Hosting]), Registration);
        assert_eq!(classify_order_type(&[]), Registration);
    }

    #[test]
    fn order_numbers_have_the_expected_shape() {
        let number = generate_order_number();
        assert!(number.starts_with("ORD-"));
        assert_eq!(number.len(), 14);
        assert!(number[4..].chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn item_exchange_rate_defaults_to_one() {
        let rates = HashMap::from([("USD".to_string(), dec!(1)), ("RWF".to_string(), dec!(1350))]);
        assert_eq!(item_exchange_rate(&rates, "RWF", "USD"), dec!(1350));
        assert_eq!(item_exchange_rate(&rates, "USD", "EUR"), Decimal::ONE);
    }

    #[tokio::test]
    async fn prepares_the_reference_cart() {
        let cart = vec![line(ItemType::Registration, dec!(12.00), 2), hosting_line(dec!(10.00))];
        let prepared = prepare_order(&request(cart, dec!(34.00)), "USD", &FixedRates::usd_rwf(), &HashMap::new())
            .await
            .unwrap();

        assert_eq!(prepared.order_type, ItemType::Registration);
        assert_eq!(prepared.totals.subtotal, dec!(34.00));
        assert_eq!(prepared.totals.total, dec!(34.00));
        assert_eq!(prepared.items[0].years, 2);
        assert_eq!(prepared.items[1].metadata["hosting_plan_pricing_id"], json!(2));
        assert_eq!(prepared.items[1].metadata["original_currency"], json!("USD"));

        let sum: Decimal = prepared.items.iter().map(|i| i.total_amount).sum();
        assert_eq!(sum, prepared.totals.subtotal);
        for item in &prepared.items {
            assert_eq!(item.total_amount, item.price * Decimal::from(item.quantity));
        }
    }

    #[tokio::test]
    async fn stored_hosting_prices_multiply_back_to_the_line_total() {
        let mut hosting = hosting_line(dec!(100.00));
        hosting.billing_cycle = Some(BillingCycle::Quarterly);
        hosting.quantity = 3;
        let prepared = prepare_order(&request(vec![hosting], dec!(99.99)), "USD", &FixedRates::usd_rwf(), &HashMap::new())
            .await
            .unwrap();

        let item = &prepared.items[0];
        assert_eq!(item.price, item.price.round_dp(2));
        assert_eq!(item.price * Decimal::from(item.quantity), item.total_amount);
        assert_eq!(item.total_amount, dec!(99.99));
    }

    #[tokio::test]
    async fn rejects_empty_carts_and_missing_totals() {
        let converter = FixedRates::usd_rwf();
        let empty = request(vec![], Decimal::ZERO);
        assert_eq!(
            prepare_order(&empty, "USD", &converter, &HashMap::new()).await,
            Err(CheckoutError::EmptyCart)
        );

        let mut no_totals = request(vec![line(ItemType::Registration, dec!(5), 1)], dec!(5));
        no_totals.total = None;
        assert_eq!(
            prepare_order(&no_totals, "USD", &converter, &HashMap::new()).await,
            Err(CheckoutError::MissingTotals)
        );
    }

    #[tokio::test]
    async fn missing_currency_uses_default() {
        let mut req = request(vec![line(ItemType::Registration, dec!(1.00), 1)], dec!(1000));
        req.currency = None;
        let prepared = prepare_order(&req, "RWF", &FixedRates::usd_rwf(), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(prepared.currency, "RWF");
        assert_eq!(prepared.totals.subtotal, dec!(1000));
    }

    #[tokio::test]
    async fn stale_client_subtotal_is_rejected() {
        let req = request(vec![line(ItemType::Registration, dec!(12.00), 1)], dec!(10.00));
        assert!(matches!(
            prepare_order(&req, "USD", &FixedRates::usd_rwf(), &HashMap::new()).await,
            Err(CheckoutError::PriceMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn hosting_without_plan_is_rejected_at_the_boundary() {
        let mut hosting = hosting_line(dec!(10.00));
        hosting.attributes = json!({});
        let req = request(vec![hosting], dec!(10.00));
        assert!(matches!(
            prepare_order(&req, "USD", &FixedRates::usd_rwf(), &HashMap::new()).await,
            Err(CheckoutError::InvalidItem { .. })
        ));
    }
}
