//! Maps gateway-reported payment status onto payments and orders.
//!
//! Every mutation is a conditional update, so concurrent deliveries of the
//! same signal (webhook, postback, foreground polling) race safely: only the
//! caller whose update flips the order to paid stages the provisioning event.

use anyhow::Context;
use chrono::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rust_decimal::Decimal;
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    app_error::AppError,
    events::{self, OrderPaidEvent},
    models::{CreatePaymentEntity, OrderEntity, PaymentEntity},
    outbox,
    schema::{orders, payments},
};

#[derive(Debug, Clone, PartialEq)]
pub enum GatewaySignal {
    Succeeded { metadata: Value },
    Failed { reason: String, details: Value },
    Pending { metadata: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Payment succeeded and the order becomes paid. Provisioning follows.
    MarkPaid,
    /// Payment succeeded but the order was already paid by another attempt.
    RecordSuccess,
    MarkFailed,
    /// Only the payment attempt fails; the order keeps its paid state.
    FailAttemptOnly,
    NoOp,
}

/// Decides what a signal does to a payment and its order.
pub fn plan(payment_status: &str, order_payment_status: &str, signal: &GatewaySignal) -> Transition {
    let order_paid = order_payment_status == "paid";
    match signal {
        GatewaySignal::Pending { .. } => Transition::NoOp,
        GatewaySignal::Succeeded { .. } => match payment_status {
            "succeeded" => Transition::NoOp,
            _ if order_paid => Transition::RecordSuccess,
            _ => Transition::MarkPaid,
        },
        GatewaySignal::Failed { .. } => match payment_status {
            "succeeded" | "failed" | "cancelled" => Transition::NoOp,
            _ if order_paid => Transition::FailAttemptOnly,
            _ => Transition::MarkFailed,
        },
    }
}

/// Shallow merge of two JSON objects; keys in `patch` win.
pub fn merge_metadata(base: &Value, patch: &Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(patch) = patch {
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

pub fn pending_intent_id(order_id: i32, attempt_number: i32, attempt_identifier: &Uuid) -> String {
    format!("pending-{order_id}-{attempt_number}-{attempt_identifier}")
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub payment: PaymentEntity,
    pub order: OrderEntity,
    pub transition: Transition,
}

impl Reconciled {
    pub fn dispatched(&self) -> bool {
        self.transition == Transition::MarkPaid
    }
}

/// Applies a gateway signal to a payment, idempotently.
pub async fn reconcile(
    conn: &mut AsyncPgConnection,
    payment_id: i32,
    signal: GatewaySignal,
) -> Result<Reconciled, AppError> {
    conn.transaction(move |conn| {
        Box::pin(async move {
            let payment: PaymentEntity = payments::table
                .find(payment_id)
                .select(PaymentEntity::as_select())
                .first(conn)
                .await?;
            let order: OrderEntity = orders::table
                .find(payment.order_id)
                .select(OrderEntity::as_select())
                .first(conn)
                .await?;

            let mut transition = plan(&payment.status, &order.payment_status, &signal);
            let now = Utc::now();

            let (payment, order) = match (transition, &signal) {
                (Transition::MarkPaid | Transition::RecordSuccess, GatewaySignal::Succeeded { metadata }) => {
                    let updated: Option<PaymentEntity> = diesel::update(
                        payments::table
                            .find(payment.id)
                            .filter(payments::status.ne("succeeded")),
                    )
                    .set((
                        payments::status.eq("succeeded"),
                        payments::paid_at.eq(Some(now)),
                        payments::last_attempted_at.eq(Some(now)),
                        payments::metadata.eq(merge_metadata(&payment.metadata, metadata)),
                    ))
                    .returning(PaymentEntity::as_returning())
                    .get_result(conn)
                    .await
                    .optional()
                    .context("Failed to update payment status")?;

                    let Some(payment) = updated else {
                        transition = Transition::NoOp;
                        return Ok(Reconciled {
                            payment,
                            order,
                            transition,
                        });
                    };

                    let paid: Option<OrderEntity> = diesel::update(
                        orders::table
                            .find(order.id)
                            .filter(orders::payment_status.ne("paid")),
                    )
                    .set((
                        orders::payment_status.eq("paid"),
                        orders::status.eq("processing"),
                        orders::payment_method.eq(Some(payment.payment_method.clone())),
                    ))
                    .returning(OrderEntity::as_returning())
                    .get_result(conn)
                    .await
                    .optional()
                    .context("Failed to update order status")?;

                    match paid {
                        Some(order) => {
                            transition = Transition::MarkPaid;
                            outbox::publish(
                                conn,
                                events::ORDER_PAID.into(),
                                OrderPaidEvent {
                                    order_id: order.id,
                                    payment_id: payment.id,
                                },
                            )
                            .await
                            .context("Failed to send outbox")?;
                            info!(order_id = order.id, payment_id = payment.id, "Order paid");
                            (payment, order)
                        }
                        None => {
                            transition = Transition::RecordSuccess;
                            warn!(order_id = order.id, payment_id = payment.id, "Payment succeeded on an already paid order");
                            (payment, order)
                        }
                    }
                }
                (Transition::MarkFailed | Transition::FailAttemptOnly, GatewaySignal::Failed { reason, details }) => {
                    let failure = merge_metadata(
                        payment.failure_details.as_ref().unwrap_or(&Value::Null),
                        &merge_metadata(details, &json!({ "reason": reason, "failed_at": now })),
                    );
                    let metadata = merge_metadata(&payment.metadata, &json!({ "failure_details": failure }));

                    let updated: Option<PaymentEntity> = diesel::update(
                        payments::table
                            .find(payment.id)
                            .filter(payments::status.eq_any(["pending", "processing"])),
                    )
                    .set((
                        payments::status.eq("failed"),
                        payments::last_attempted_at.eq(Some(now)),
                        payments::failure_details.eq(Some(failure)),
                        payments::metadata.eq(metadata),
                    ))
                    .returning(PaymentEntity::as_returning())
                    .get_result(conn)
                    .await
                    .optional()
                    .context("Failed to update payment status")?;

                    let Some(payment) = updated else {
                        transition = Transition::NoOp;
                        return Ok(Reconciled {
                            payment,
                            order,
                            transition,
                        });
                    };
                    warn!(order_id = order.id, payment_id = payment.id, reason, "Payment failed");

                    if transition == Transition::FailAttemptOnly {
                        (payment, order)
                    } else {
                        let failed: Option<OrderEntity> = diesel::update(
                            orders::table
                                .find(order.id)
                                .filter(orders::payment_status.ne("paid"))
                                .filter(orders::status.ne("cancelled")),
                        )
                        .set((orders::payment_status.eq("failed"), orders::status.eq("failed")))
                        .returning(OrderEntity::as_returning())
                        .get_result(conn)
                        .await
                        .optional()
                        .context("Failed to update order status")?;

                        match failed {
                            Some(order) => (payment, order),
                            None => {
                                transition = Transition::FailAttemptOnly;
                                (payment, order)
                            }
                        }
                    }
                }
                (_, GatewaySignal::Pending { metadata }) if !metadata.is_null() => {
                    let payment = diesel::update(payments::table.find(payment.id))
                        .set((
                            payments::last_attempted_at.eq(Some(now)),
                            payments::metadata.eq(merge_metadata(&payment.metadata, metadata)),
                        ))
                        .returning(PaymentEntity::as_returning())
                        .get_result(conn)
                        .await
                        .context("Failed to update payment metadata")?;
                    (payment, order)
                }
                _ => (payment, order),
            };

            Ok::<Reconciled, AppError>(Reconciled {
                payment,
                order,
                transition,
            })
        })
    })
    .await
}

pub struct NewAttempt {
    pub user_id: i32,
    pub payment_method: String,
    pub amount: Decimal,
    pub currency: String,
    pub metadata: Value,
}

/// Opens the next payment attempt for an order.
pub async fn create_attempt(
    conn: &mut AsyncPgConnection,
    order: &OrderEntity,
    attempt: NewAttempt,
) -> Result<PaymentEntity, AppError> {
    let order_id = order.id;
    conn.transaction(move |conn| {
        Box::pin(async move {
            let last: Option<i32> = payments::table
                .filter(payments::order_id.eq(order_id))
                .select(diesel::dsl::max(payments::attempt_number))
                .first(conn)
                .await
                .context("Failed to get payment attempts")?;
            let attempt_number = last.unwrap_or(0) + 1;
            let identifier = Uuid::new_v4();

            let metadata = merge_metadata(
                &attempt.metadata,
                &json!({ "attempt_identifier": identifier.to_string() }),
            );
            let intent_id = (attempt.payment_method == "stripe")
                .then(|| pending_intent_id(order_id, attempt_number, &identifier));

            let payment = diesel::insert_into(payments::table)
                .values(CreatePaymentEntity {
                    user_id: attempt.user_id,
                    order_id,
                    payment_method: attempt.payment_method,
                    status: "pending".into(),
                    amount: attempt.amount,
                    currency: attempt.currency,
                    stripe_payment_intent_id: intent_id,
                    attempt_number,
                    metadata,
                    last_attempted_at: Some(Utc::now()),
                })
                .returning(PaymentEntity::as_returning())
                .get_result(conn)
                .await
                .context("Failed to create payment")?;

            Ok::<PaymentEntity, AppError>(payment)
        })
    })
    .await
}

pub fn attempt_identifier(payment: &PaymentEntity) -> String {
    payment.metadata["attempt_identifier"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| format!("payment-{}-{}", payment.id, payment.attempt_number))
}

#[derive(Debug, Default, Clone)]
pub struct GatewayRefs {
    pub stripe_session_id: Option<String>,
    pub stripe_payment_intent_id: Option<String>,
    pub kpay_transaction_id: Option<String>,
    pub kpay_ref_id: Option<String>,
}

/// Stores provider identifiers once the gateway assigns them.
pub async fn attach_gateway_refs(
    conn: &mut AsyncPgConnection,
    payment: &PaymentEntity,
    refs: GatewayRefs,
    metadata: &Value,
) -> Result<PaymentEntity, AppError> {
    let payment = diesel::update(payments::table.find(payment.id))
        .set((
            payments::stripe_session_id.eq(refs.stripe_session_id.or(payment.stripe_session_id.clone())),
            payments::stripe_payment_intent_id
                .eq(refs.stripe_payment_intent_id.or(payment.stripe_payment_intent_id.clone())),
            payments::kpay_transaction_id.eq(refs.kpay_transaction_id.or(payment.kpay_transaction_id.clone())),
            payments::kpay_ref_id.eq(refs.kpay_ref_id.or(payment.kpay_ref_id.clone())),
            payments::metadata.eq(merge_metadata(&payment.metadata, metadata)),
        ))
        .returning(PaymentEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to update payment references")?;

    Ok(payment)
}

/// Looks a Stripe payment up by intent id, then payment id metadata, then session id.
pub async fn find_stripe_payment(
    conn: &mut AsyncPgConnection,
    intent_id: Option<&str>,
    payment_id: Option<i32>,
    session_id: Option<&str>,
) -> Result<Option<PaymentEntity>, AppError> {
    if let Some(intent_id) = intent_id {
        let payment = payments::table
            .filter(payments::stripe_payment_intent_id.eq(intent_id))
            .select(PaymentEntity::as_select())
            .first(conn)
            .await
            .optional()
            .context("Failed to get payment")?;
        if payment.is_some() {
            return Ok(payment);
        }
    }

    if let Some(payment_id) = payment_id {
        let payment = payments::table
            .find(payment_id)
            .filter(payments::payment_method.eq("stripe"))
            .select(PaymentEntity::as_select())
            .first(conn)
            .await
            .optional()
            .context("Failed to get payment")?;
        if payment.is_some() {
            return Ok(payment);
        }
    }

    match session_id {
        Some(session_id) => Ok(payments::table
            .filter(payments::stripe_session_id.eq(session_id))
            .select(PaymentEntity::as_select())
            .first(conn)
            .await
            .optional()
            .context("Failed to get payment")?),
        None => Ok(None),
    }
}

/// Order number carried by a KPay refid (`{order_number}-{suffix}`).
pub fn order_number_from_refid(refid: &str) -> Option<&str> {
    refid.rsplit_once('-').map(|(prefix, _)| prefix).filter(|p| !p.is_empty())
}

/// Looks a KPay payment up by tid, then refid, then the latest KPay attempt
/// of the order named by the refid.
pub async fn find_kpay_payment(
    conn: &mut AsyncPgConnection,
    tid: Option<&str>,
    refid: Option<&str>,
) -> Result<Option<PaymentEntity>, AppError> {
    if let Some(tid) = tid {
        let payment = payments::table
            .filter(payments::kpay_transaction_id.eq(tid))
            .select(PaymentEntity::as_select())
            .first(conn)
            .await
            .optional()
            .context("Failed to get payment")?;
        if payment.is_some() {
            return Ok(payment);
        }
    }

    let Some(refid) = refid else {
        return Ok(None);
    };

    let payment = payments::table
        .filter(payments::kpay_ref_id.eq(refid))
        .select(PaymentEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get payment")?;
    if payment.is_some() {
        return Ok(payment);
    }

    let Some(order_number) = order_number_from_refid(refid) else {
        return Ok(None);
    };

    Ok(payments::table
        .inner_join(orders::table)
        .filter(orders::order_number.eq(order_number))
        .filter(payments::payment_method.eq("kpay"))
        .order_by(payments::attempt_number.desc())
        .select(PaymentEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get payment")?)
}

/// Cancels a pending, unpaid order and its pending payment attempts.
pub async fn cancel_order(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    order_id: i32,
) -> Result<OrderEntity, AppError> {
    conn.transaction(move |conn| {
        Box::pin(async move {
            let cancelled: Option<OrderEntity> = diesel::update(
                orders::table
                    .find(order_id)
                    .filter(orders::user_id.eq(user_id))
                    .filter(orders::status.eq("pending"))
                    .filter(orders::payment_status.ne("paid")),
            )
            .set((orders::status.eq("cancelled"), orders::payment_status.eq("cancelled")))
            .returning(OrderEntity::as_returning())
            .get_result(conn)
            .await
            .optional()
            .context("Failed to cancel order")?;

            let Some(order) = cancelled else {
                let exists: Option<i32> = orders::table
                    .find(order_id)
                    .filter(orders::user_id.eq(user_id))
                    .select(orders::id)
                    .first(conn)
                    .await
                    .optional()
                    .context("Failed to get order")?;
                return Err(match exists {
                    Some(_) => AppError::BadRequest("Only pending orders can be cancelled".into()),
                    None => AppError::NotFound,
                });
            };

            diesel::update(
                payments::table
                    .filter(payments::order_id.eq(order.id))
                    .filter(payments::status.eq("pending")),
            )
            .set(payments::status.eq("cancelled"))
            .execute(conn)
            .await
            .context("Failed to cancel payments")?;

            info!(order_id = order.id, "Order cancelled");
            Ok::<OrderEntity, AppError>(order)
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn success() -> GatewaySignal {
        GatewaySignal::Succeeded { metadata: json!({}) }
    }

    fn failure() -> GatewaySignal {
        GatewaySignal::Failed {
            reason: "card_declined".into(),
            details: json!({}),
        }
    }

    #[test]
    fn first_success_marks_the_order_paid() {
        assert_eq!(plan("pending", "pending", &success()), Transition::MarkPaid);
    }

    #[test]
    fn repeated_success_is_a_no_op() {
        assert_eq!(plan("succeeded", "paid", &success()), Transition::NoOp);
    }

    #[test]
    fn second_attempt_succeeding_does_not_dispatch_again() {
        assert_eq!(plan("pending", "paid", &success()), Transition::RecordSuccess);
    }

    #[test]
    fn failure_never_overrides_success() {
        assert_eq!(plan("succeeded", "paid", &failure()), Transition::NoOp);
        assert_eq!(plan("pending", "paid", &failure()), Transition::FailAttemptOnly);
        assert_eq!(plan("pending", "pending", &failure()), Transition::MarkFailed);
    }

    #[test]
    fn pending_signals_change_nothing() {
        let pending = GatewaySignal::Pending { metadata: json!({}) };
        assert_eq!(plan("pending", "pending", &pending), Transition::NoOp);
    }

    #[test]
    fn merge_keeps_existing_keys() {
        let merged = merge_metadata(
            &json!({"attempt_identifier": "a", "kpay_statusid": "03"}),
            &json!({"kpay_statusid": "01"}),
        );
        assert_eq!(merged, json!({"attempt_identifier": "a", "kpay_statusid": "01"}));
        assert_eq!(merge_metadata(&Value::Null, &json!({"x": 1})), json!({"x": 1}));
    }

    #[test]
    fn refid_carries_the_order_number() {
        assert_eq!(order_number_from_refid("ORD-ABC123-2"), Some("ORD-ABC123"));
        assert_eq!(order_number_from_refid("plain"), None);
    }

    #[test]
    fn pending_intent_ids_are_unique_per_attempt() {
        let id = Uuid::new_v4();
        assert_eq!(pending_intent_id(4, 2, &id), format!("pending-4-2-{id}"));
    }

    fn status() -> impl Strategy<Value = &'static str> {
        prop_oneof![Just("pending"), Just("succeeded"), Just("failed"), Just("cancelled")]
    }

    fn order_status() -> impl Strategy<Value = &'static str> {
        prop_oneof![Just("pending"), Just("paid"), Just("failed"), Just("cancelled")]
    }

    proptest! {
        // Applying the resulting state a second time is always a no-op.
        #[test]
        fn success_is_idempotent(payment in status(), order in order_status()) {
            let first = plan(payment, order, &success());
            let (payment, order) = match first {
                Transition::MarkPaid => ("succeeded", "paid"),
                Transition::RecordSuccess => ("succeeded", order),
                _ => (payment, order),
            };
            prop_assert_eq!(plan(payment, order, &success()), Transition::NoOp);
        }

        #[test]
        fn failure_never_touches_paid_orders(payment in status()) {
            prop_assert_ne!(plan(payment, "paid", &failure()), Transition::MarkFailed);
        }
    }
}
