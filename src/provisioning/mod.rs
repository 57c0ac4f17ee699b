//! Fulfils paid orders item by item.
//!
//! Each item is provisioned on its own: a failing item is recorded and the
//! loop moves on, so siblings in the same order are never blocked.

pub mod domains;
pub mod subscriptions;

use std::str::FromStr;

use anyhow::Context;
use chrono::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::{
    api::registrars::{RegistrarError, Registrars},
    app_error::AppError,
    checkout::hints::{ContactIds, HintError, ItemHint},
    config::RecoveryConfig,
    currency::{CurrencyConversion, CurrencyError},
    events::{self, AdminNotificationEvent, AdminNotificationKind},
    models::{OrderEntity, OrderItemEntity},
    outbox,
    pricing::ItemType,
    recovery,
    schema::{order_items, orders},
};

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Registrar(#[from] RegistrarError),

    #[error("No registrant contact is available for {0}")]
    MissingContacts(String),

    #[error("Domain {0} was not found")]
    DomainNotFound(String),

    #[error("Domain {0} does not belong to this customer")]
    DomainNotOwned(String),

    #[error("Subscription {0} was not found")]
    SubscriptionNotFound(i32),

    #[error("Subscription {0} does not belong to this customer")]
    SubscriptionNotOwned(i32),

    #[error("Hosting plan pricing {0} was not found")]
    PricingNotFound(i32),

    #[error("Paid amount {paid} USD does not match the expected {expected} USD")]
    AmountMismatch { expected: Decimal, paid: Decimal },

    #[error("Invalid provisioning details: {0}")]
    InvalidHint(#[from] HintError),

    #[error("Unknown item type: {0}")]
    UnknownItemType(String),

    #[error(transparent)]
    Currency(#[from] CurrencyError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<diesel::result::Error> for ProvisioningError {
    fn from(err: diesel::result::Error) -> Self {
        ProvisioningError::Other(err.into())
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct ItemResult {
    pub order_item_id: i32,
    pub name: String,
    pub error: Option<String>,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq, ToSchema)]
pub struct ProvisioningReport {
    pub successful: Vec<ItemResult>,
    pub failed: Vec<ItemResult>,
}

impl ProvisioningReport {
    pub fn order_status(&self) -> &'static str {
        aggregate_status(self.successful.len(), self.failed.len())
    }
}

/// Order status after provisioning `successful` and `failed` items.
pub fn aggregate_status(successful: usize, failed: usize) -> &'static str {
    match (successful, failed) {
        (_, 0) => "completed",
        (0, _) => "requires_attention",
        _ => "partially_completed",
    }
}

/// Collaborators needed to fulfil an order.
pub struct Provisioner<'a> {
    pub registrars: &'a Registrars,
    pub converter: &'a dyn CurrencyConversion,
    pub recovery: &'a RecoveryConfig,
}

impl Provisioner<'_> {
    /// Provisions a paid order. Returns `None` when the order is not paid or
    /// was already processed.
    pub async fn provision_order(
        &self,
        conn: &mut AsyncPgConnection,
        order_id: i32,
    ) -> Result<Option<ProvisioningReport>, AppError> {
        let Some(order) = claim_order(conn, order_id).await? else {
            return Ok(None);
        };

        let items: Vec<OrderItemEntity> = order_items::table
            .filter(order_items::order_id.eq(order.id))
            .order_by(order_items::id.asc())
            .select(OrderItemEntity::as_select())
            .get_results(conn)
            .await
            .context("Failed to get order items")?;

        let order_contacts = domains::order_contacts(&order.metadata);

        let mut report = ProvisioningReport::default();
        for item in &items {
            match self.provision_item(conn, &order, item, &order_contacts).await {
                Ok(()) => report.successful.push(ItemResult {
                    order_item_id: item.id,
                    name: item.domain_name.clone(),
                    error: None,
                }),
                Err(err) => {
                    warn!(order_id, order_item_id = item.id, item = item.domain_name, error = %err, "Item provisioning failed");
                    report.failed.push(ItemResult {
                        order_item_id: item.id,
                        name: item.domain_name.clone(),
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let status = report.order_status();
        let notes = (!report.failed.is_empty()).then(|| {
            report
                .failed
                .iter()
                .map(|f| format!("{}: {}", f.name, f.error.as_deref().unwrap_or("failed")))
                .collect::<Vec<_>>()
                .join("\n")
        });

        diesel::update(orders::table.find(order.id))
            .set((
                orders::status.eq(status),
                orders::processed_at.eq(Some(Utc::now())),
                orders::notes.eq(notes.or(order.notes.clone())),
            ))
            .execute(conn)
            .await
            .context("Failed to update order status")?;

        info!(
            order_id,
            status,
            successful = report.successful.len(),
            failed = report.failed.len(),
            "Order provisioned"
        );
        Ok(Some(report))
    }

    async fn provision_item(
        &self,
        conn: &mut AsyncPgConnection,
        order: &OrderEntity,
        item: &OrderItemEntity,
        order_contacts: &ContactIds,
    ) -> Result<(), ProvisioningError> {
        let item_type = ItemType::from_str(&item.domain_type).map_err(ProvisioningError::UnknownItemType)?;
        let hint = ItemHint::parse(item_type, &item.metadata, item.quantity, None);

        match item_type {
            ItemType::Registration | ItemType::Transfer => {
                let item_contacts = match &hint {
                    Ok(ItemHint::Domain { contact_ids }) => *contact_ids,
                    _ => ContactIds::default(),
                };
                let contacts = domains::choose_contacts(order_contacts, &item_contacts);

                match domains::register(conn, self.registrars, order, item, &contacts).await {
                    Ok(_) => Ok(()),
                    Err(err) => {
                        recovery::record_failure(conn, order, item, &err.to_string(), &contacts, self.recovery)
                            .await
                            .context("Failed to record registration failure")?;
                        Err(err)
                    }
                }
            }
            ItemType::Renewal => {
                let domain_id = match hint? {
                    ItemHint::Renewal { domain_id } => domain_id,
                    _ => None,
                };
                domains::renew(conn, self.registrars, order, item, domain_id).await
            }
            ItemType::Hosting => match hint {
                Ok(hint @ ItemHint::Hosting { .. }) => {
                    subscriptions::create_from_item(conn, order, item, &hint).await
                }
                Ok(_) => Err(ProvisioningError::InvalidHint(HintError::Invalid("attributes"))),
                Err(err) => {
                    warn!(order_id = order.id, order_item_id = item.id, error = %err, "Hosting item is missing plan details, skipping");
                    Err(err.into())
                }
            },
            ItemType::SubscriptionRenewal => match hint? {
                hint @ ItemHint::SubscriptionRenewal { .. } => {
                    subscriptions::renew_from_item(conn, self.converter, order, item, &hint).await
                }
                _ => Err(ProvisioningError::InvalidHint(HintError::Invalid("attributes"))),
            },
        }
    }
}

/// Marks a paid, unprocessed order as taken. Only one caller can win the
/// claim, so concurrent deliveries of the same event provision once.
pub async fn claim_order(conn: &mut AsyncPgConnection, order_id: i32) -> Result<Option<OrderEntity>, AppError> {
    let claimed: Option<OrderEntity> = diesel::update(
        orders::table
            .find(order_id)
            .filter(orders::payment_status.eq("paid"))
            .filter(orders::processed_at.is_null()),
    )
    .set(orders::processed_at.eq(Some(Utc::now())))
    .returning(OrderEntity::as_returning())
    .get_result(conn)
    .await
    .optional()
    .context("Failed to claim order for provisioning")?;

    if claimed.is_some() {
        return Ok(claimed);
    }

    let order: OrderEntity = orders::table
        .find(order_id)
        .select(OrderEntity::as_select())
        .first(conn)
        .await?;
    if order.is_paid() {
        info!(order_id, "Order already provisioned");
    } else {
        warn!(order_id, payment_status = order.payment_status, "Skipping provisioning for unpaid order");
    }
    Ok(None)
}

/// Flags an order whose payment succeeded but whose dispatch failed as a whole.
pub async fn escalate(conn: &mut AsyncPgConnection, order_id: i32, reason: &str) -> Result<(), AppError> {
    error!(order_id, reason, "Payment succeeded but processing failed");
    let notes = format!("Payment succeeded but processing failed: {reason}");

    conn.transaction(move |conn| {
        Box::pin(async move {
            let order: Option<OrderEntity> = diesel::update(orders::table.find(order_id))
                .set((orders::status.eq("requires_attention"), orders::notes.eq(Some(notes.clone()))))
                .returning(OrderEntity::as_returning())
                .get_result(conn)
                .await
                .optional()
                .context("Failed to flag order")?;

            let Some(order) = order else {
                return Err(AppError::NotFound);
            };

            outbox::publish(
                conn,
                events::ADMIN_NOTIFICATION.into(),
                AdminNotificationEvent {
                    kind: AdminNotificationKind::CriticalProvisioningFailure,
                    order_id,
                    subject: format!("Order {} needs attention", order.order_number),
                    message: notes,
                },
            )
            .await
            .context("Failed to send outbox")?;

            Ok::<(), AppError>(())
        })
    })
    .await
}
