use chrono::{DateTime, Utc};
use diesel::{
    Selectable,
    prelude::{AsChangeset, Associations, Identifiable, Insertable, Queryable},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

// Currencies

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::currencies)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CurrencyEntity {
    pub id: i32,
    pub code: String,
    pub name: String,
    pub symbol: String,
    pub exchange_rate: Decimal,
    pub is_base: bool,
    pub is_active: bool,
    pub rate_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::exchange_rate_cache)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CachedRateEntity {
    pub cache_key: String,
    pub rate: Decimal,
    pub is_fallback: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = crate::schema::exchange_rate_cache)]
pub struct UpsertCachedRateEntity {
    pub cache_key: String,
    pub rate: Decimal,
    pub is_fallback: bool,
    pub expires_at: DateTime<Utc>,
}

// Contacts

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::contacts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ContactEntity {
    pub id: i32,
    pub user_id: i32,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub address_one: Option<String>,
    pub city: Option<String>,
    pub state_province: Option<String>,
    pub postal_code: Option<String>,
    pub country_code: Option<String>,
    pub is_primary: bool,
}

// Orders

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderEntity {
    pub id: i32,
    pub uuid: Uuid,
    pub user_id: i32,
    pub order_number: String,
    pub order_type: String,
    pub status: String,
    pub payment_status: String,
    pub payment_method: Option<String>,
    pub currency: String,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total_amount: Decimal,
    pub coupon_code: Option<String>,
    pub discount_type: Option<String>,
    pub discount_amount: Decimal,
    pub billing_name: String,
    pub billing_email: String,
    pub billing_address: Option<Value>,
    pub items: Value,
    pub metadata: Value,
    pub notes: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderEntity {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateOrderEntity {
    pub user_id: i32,
    pub order_number: String,
    pub order_type: String,
    pub status: String,
    pub payment_status: String,
    pub payment_method: Option<String>,
    pub currency: String,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total_amount: Decimal,
    pub coupon_code: Option<String>,
    pub discount_type: Option<String>,
    pub discount_amount: Decimal,
    pub billing_name: String,
    pub billing_email: String,
    pub billing_address: Option<Value>,
    pub items: Value,
    pub metadata: Value,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Serialize, Debug, Clone, ToSchema)]
#[diesel(belongs_to(OrderEntity, foreign_key = order_id))]
#[diesel(table_name = crate::schema::order_items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderItemEntity {
    pub id: i32,
    pub order_id: i32,
    pub domain_name: String,
    pub domain_type: String,
    pub domain_id: Option<i32>,
    pub price: Decimal,
    pub currency: String,
    pub exchange_rate: Decimal,
    pub quantity: i32,
    pub years: i32,
    pub total_amount: Decimal,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::order_items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateOrderItemEntity {
    pub order_id: i32,
    pub domain_name: String,
    pub domain_type: String,
    pub price: Decimal,
    pub currency: String,
    pub exchange_rate: Decimal,
    pub quantity: i32,
    pub years: i32,
    pub total_amount: Decimal,
    pub metadata: Value,
}

// Payments

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PaymentEntity {
    pub id: i32,
    pub user_id: i32,
    pub order_id: i32,
    pub payment_method: String,
    pub status: String,
    pub amount: Decimal,
    pub currency: String,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_session_id: Option<String>,
    pub kpay_transaction_id: Option<String>,
    pub kpay_ref_id: Option<String>,
    pub attempt_number: i32,
    pub metadata: Value,
    pub failure_details: Option<Value>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreatePaymentEntity {
    pub user_id: i32,
    pub order_id: i32,
    pub payment_method: String,
    pub status: String,
    pub amount: Decimal,
    pub currency: String,
    pub stripe_payment_intent_id: Option<String>,
    pub attempt_number: i32,
    pub metadata: Value,
    pub last_attempted_at: Option<DateTime<Utc>>,
}

// Failed domain registrations

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::failed_domain_registrations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FailedDomainRegistrationEntity {
    pub id: i32,
    pub order_id: i32,
    pub order_item_id: i32,
    pub domain_name: String,
    pub failure_reason: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub status: String,
    pub contact_ids: Value,
    pub attempts: Value,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FailedDomainRegistrationEntity {
    /// Still pending and below the retry ceiling.
    pub fn can_retry(&self) -> bool {
        self.status == "pending" && self.retry_count < self.max_retries
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::failed_domain_registrations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateFailedDomainRegistrationEntity {
    pub order_id: i32,
    pub order_item_id: i32,
    pub domain_name: String,
    pub failure_reason: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub status: String,
    pub contact_ids: Value,
    pub attempts: Value,
    pub next_retry_at: Option<DateTime<Utc>>,
}

// Domains

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::domains)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DomainEntity {
    pub id: i32,
    pub owner_id: i32,
    pub name: String,
    pub registrar: String,
    pub status: String,
    pub registered_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_renewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::domains)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateDomainEntity {
    pub owner_id: i32,
    pub name: String,
    pub registrar: String,
    pub status: String,
    pub registered_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::domain_renewals)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateDomainRenewalEntity {
    pub domain_id: i32,
    pub order_id: i32,
    pub years: i32,
    pub amount: Decimal,
    pub currency: String,
    pub old_expiry_date: Option<DateTime<Utc>>,
    pub new_expiry_date: Option<DateTime<Utc>>,
    pub status: String,
    pub failure_reason: Option<String>,
}

// Hosting

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::hosting_plans)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HostingPlanEntity {
    pub id: i32,
    pub name: String,
    pub slug: String,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::hosting_plan_prices)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HostingPlanPriceEntity {
    pub id: i32,
    pub hosting_plan_id: i32,
    pub billing_cycle: String,
    pub regular_price: Decimal,
    pub renewal_price: Decimal,
    pub currency: String,
    pub is_active: bool,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::subscriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SubscriptionEntity {
    pub id: i32,
    pub uuid: Uuid,
    pub user_id: i32,
    pub hosting_plan_id: i32,
    pub hosting_plan_pricing_id: i32,
    pub billing_cycle: String,
    pub domain: Option<String>,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub next_renewal_at: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub custom_price: Option<Decimal>,
    pub custom_price_currency: Option<String>,
    pub product_snapshot: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::subscriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateSubscriptionEntity {
    pub user_id: i32,
    pub hosting_plan_id: i32,
    pub hosting_plan_pricing_id: i32,
    pub billing_cycle: String,
    pub domain: Option<String>,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub next_renewal_at: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub product_snapshot: Value,
}

// Outbox

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = crate::schema::outbox)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OutboxEntity {
    pub id: i32,
    pub event_type: String,
    pub payload: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Serialize, Deserialize, Debug)]
#[diesel(table_name = crate::schema::outbox)]
pub struct CreateOutboxEntity {
    pub event_type: String,
    pub payload: String,
    pub status: String,
}
