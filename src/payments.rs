//! Payment flows on top of the gateway clients: starting checkouts, polling
//! and the provider callbacks. Gateway failures are turned into a
//! [`GatewayOutcome`] here and never reach the customer as raw errors.

use anyhow::Context;
use chrono::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::{
    api::{
        GatewayError, GatewayOutcome,
        kpay::{self, KPayInitiateRequest, KPayStatus},
        stripe::CheckoutSessionRequest,
    },
    app_error::AppError,
    app_state::AppState,
    config::KPayStatusCodes,
    currency::{CurrencyConversion, CurrencyError, RWF, USD, format::format_amount, normalize_code},
    models::{OrderEntity, PaymentEntity},
    reconciliation::{
        self, GatewayRefs, GatewaySignal, NewAttempt, Reconciled, attach_gateway_refs, attempt_identifier,
        create_attempt,
    },
    schema::{orders, payments},
};

#[derive(Deserialize, Debug, Clone, ToSchema)]
pub struct KPayPaymentReq {
    pub msisdn: String,
    /// `momo` or `cc`; defaults to `momo`.
    pub pmethod: Option<String>,
}

/// What a Stripe checkout actually charges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeCharge {
    pub currency: String,
    pub amount: Decimal,
    pub converted: bool,
}

/// Orders worth less than the Stripe minimum in USD are charged in USD
/// instead of their own currency.
pub async fn stripe_charge<C>(
    amount: Decimal,
    currency: &str,
    converter: &C,
    minimum_usd: Decimal,
) -> Result<StripeCharge, CurrencyError>
where
    C: CurrencyConversion + ?Sized,
{
    let currency = normalize_code(currency);
    let amount_usd = if currency == USD {
        amount
    } else {
        converter.convert(amount, &currency, USD).await?
    };

    if amount_usd >= minimum_usd {
        return Ok(StripeCharge {
            currency,
            amount,
            converted: false,
        });
    }
    Ok(StripeCharge {
        converted: currency != USD,
        currency: USD.into(),
        amount: amount_usd,
    })
}

/// Turns a classified KPay response into a reconciliation signal.
pub fn kpay_signal(status: KPayStatus, body: &Value) -> GatewaySignal {
    let metadata = kpay::callback_metadata(body);
    match status {
        KPayStatus::Success => GatewaySignal::Succeeded { metadata },
        KPayStatus::Pending => GatewaySignal::Pending { metadata },
        KPayStatus::Failure => GatewaySignal::Failed {
            reason: body["statusdesc"]
                .as_str()
                .filter(|desc| !desc.trim().is_empty())
                .unwrap_or("KPay reported the payment as failed")
                .to_string(),
            details: metadata,
        },
    }
}

/// A Stripe webhook event reduced to what reconciliation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct StripeEvent {
    pub intent_id: Option<String>,
    pub payment_id: Option<i32>,
    pub session_id: Option<String>,
    pub signal: GatewaySignal,
}

/// Parses the two handled event types. Anything else yields `None`.
pub fn parse_stripe_event(event: &Value) -> Option<StripeEvent> {
    let object = &event["data"]["object"];
    let intent_id = object["id"].as_str().map(String::from);
    let payment_id = match &object["metadata"]["payment_id"] {
        Value::String(id) => id.parse().ok(),
        Value::Number(id) => id.as_i64().and_then(|id| i32::try_from(id).ok()),
        _ => None,
    };
    let session_id = object["metadata"]["session_id"].as_str().map(String::from);

    let signal = match event["type"].as_str()? {
        "payment_intent.succeeded" => GatewaySignal::Succeeded {
            metadata: json!({
                "stripe_payment_intent_id": intent_id,
                "stripe_charge_id": object["latest_charge"],
                "stripe_event_id": event["id"],
            }),
        },
        "payment_intent.payment_failed" => {
            let last_error = &object["last_payment_error"];
            GatewaySignal::Failed {
                reason: last_error["message"].as_str().unwrap_or("Payment failed").to_string(),
                details: json!({
                    "code": last_error["code"],
                    "decline_code": last_error["decline_code"],
                    "stripe_event_id": event["id"],
                }),
            }
        }
        _ => return None,
    };

    Some(StripeEvent {
        intent_id,
        payment_id,
        session_id,
        signal,
    })
}

/// Customer-facing view of a payment's state.
pub fn outcome_for(payment: &PaymentEntity) -> GatewayOutcome {
    match payment.status.as_str() {
        "succeeded" => GatewayOutcome::ok(payment.id, "Payment completed successfully!").with_status("succeeded"),
        "failed" => GatewayOutcome::failed(Some(payment.id), "Payment failed. Please try again.").with_status("failed"),
        "cancelled" => GatewayOutcome::failed(Some(payment.id), "Payment was cancelled.").with_status("cancelled"),
        _ => GatewayOutcome::ok(payment.id, "Payment is still being processed. Please wait.").with_status("pending"),
    }
}

fn kpay_error_message(err: &GatewayError) -> String {
    match err {
        GatewayError::Rejected(message) | GatewayError::InvalidRequest(message) => message.clone(),
        _ => "Payment initiation failed. Please try again.".into(),
    }
}

async fn payable_order(conn: &mut AsyncPgConnection, user_id: i32, order_id: i32) -> Result<OrderEntity, AppError> {
    let order: OrderEntity = orders::table
        .find(order_id)
        .filter(orders::user_id.eq(user_id))
        .select(OrderEntity::as_select())
        .first(conn)
        .await?;

    if order.is_paid() {
        return Err(AppError::BadRequest("This order has already been paid".into()));
    }
    if !matches!(order.status.as_str(), "pending" | "failed") {
        return Err(AppError::BadRequest("This order can no longer be paid".into()));
    }
    Ok(order)
}

/// Fails an attempt that never reached the gateway. The order is untouched.
async fn fail_attempt(conn: &mut AsyncPgConnection, payment: &PaymentEntity, message: &str) -> Result<(), AppError> {
    let now = Utc::now();
    diesel::update(
        payments::table
            .find(payment.id)
            .filter(payments::status.eq("pending")),
    )
    .set((
        payments::status.eq("failed"),
        payments::last_attempted_at.eq(Some(now)),
        payments::failure_details.eq(Some(json!({ "message": message, "failed_at": now }))),
    ))
    .execute(conn)
    .await
    .context("Failed to mark payment as failed")?;
    Ok(())
}

pub async fn start_stripe_checkout(state: &AppState, user_id: i32, order_id: i32) -> Result<GatewayOutcome, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order = payable_order(conn, user_id, order_id).await?;
    let stripe = state.stripe();
    if stripe.config().secret_key.is_none() {
        warn!(order_id, "Stripe checkout requested but Stripe is not configured");
        return Ok(GatewayOutcome::failed(
            None,
            "Stripe payment is not configured. Please contact support.",
        ));
    }

    let converter = state.converter();
    let charge = match stripe_charge(
        order.total_amount,
        &order.currency,
        &converter,
        stripe.config().minimum_usd_amount,
    )
    .await
    {
        Ok(charge) => charge,
        Err(err) => {
            error!(order_id, currency = order.currency, amount = %order.total_amount, error = %err, "Currency conversion failed for Stripe validation");
            return Ok(GatewayOutcome::failed(
                None,
                format!(
                    "Unable to process payment in {}. Please try again or contact support.",
                    order.currency
                ),
            ));
        }
    };

    let payment = create_attempt(
        conn,
        &order,
        NewAttempt {
            user_id: order.user_id,
            payment_method: "stripe".into(),
            amount: charge.amount,
            currency: charge.currency.clone(),
            metadata: json!({
                "original_currency": order.currency,
                "original_amount": order.total_amount,
                "processing_currency": charge.currency,
                "processing_amount": charge.amount,
                "converted": charge.converted,
            }),
        },
    )
    .await?;

    let description = format!(
        "Order {} ({})",
        order.order_number,
        format_amount(charge.amount, &charge.currency)
    );
    let request = CheckoutSessionRequest {
        order_id: order.id,
        order_number: order.order_number.clone(),
        user_id: order.user_id,
        payment_id: payment.id,
        currency: charge.currency,
        amount: charge.amount,
        description,
        customer_email: order.billing_email.clone(),
        idempotency_key: attempt_identifier(&payment),
    };

    match stripe.create_checkout_session(&request).await {
        Ok(session) => {
            let payment = attach_gateway_refs(
                conn,
                &payment,
                GatewayRefs {
                    stripe_session_id: Some(session.id.clone()),
                    stripe_payment_intent_id: session.payment_intent.clone(),
                    ..Default::default()
                },
                &json!({ "checkout_url": session.url }),
            )
            .await?;

            info!(order_id, payment_id = payment.id, session_id = session.id, "Stripe checkout started");
            Ok(GatewayOutcome::ok(payment.id, "Redirecting to Stripe checkout")
                .with_redirect(session.url)
                .with_status("pending"))
        }
        Err(err) => {
            error!(order_id, payment_id = payment.id, error = %err, "Failed to create Stripe checkout session");
            fail_attempt(conn, &payment, &err.to_string()).await?;
            Ok(GatewayOutcome::failed(
                Some(payment.id),
                "Failed to initialize payment. Please try again or contact support.",
            ))
        }
    }
}

/// KPay charges in RWF, converting from the order's currency.
pub async fn start_kpay_payment(
    state: &AppState,
    user_id: i32,
    order_id: i32,
    req: &KPayPaymentReq,
) -> Result<GatewayOutcome, AppError> {
    let msisdn = req.msisdn.trim();
    if msisdn.is_empty() || msisdn == "0" {
        return Ok(GatewayOutcome::failed(None, "Phone number is required for KPay payment."));
    }
    let pmethod = req.pmethod.as_deref().map(str::trim).unwrap_or("momo");
    if !matches!(pmethod, "momo" | "cc") {
        return Ok(GatewayOutcome::failed(
            None,
            "The selected payment method is not supported. Please choose Mobile Money or Card Payment.",
        ));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order = payable_order(conn, user_id, order_id).await?;
    let converter = state.converter();
    let amount = match converter.convert(order.total_amount, &order.currency, RWF).await {
        Ok(amount) => amount,
        Err(err) => {
            error!(order_id, currency = order.currency, error = %err, "Currency conversion failed for KPay");
            return Ok(GatewayOutcome::failed(
                None,
                format!(
                    "Unable to process payment in {}. Please try again or contact support.",
                    order.currency
                ),
            ));
        }
    };

    let payment = create_attempt(
        conn,
        &order,
        NewAttempt {
            user_id: order.user_id,
            payment_method: "kpay".into(),
            amount,
            currency: RWF.into(),
            metadata: json!({
                "original_currency": order.currency,
                "original_amount": order.total_amount,
                "pmethod": pmethod,
            }),
        },
    )
    .await?;

    let kpay = state.kpay();
    let request = KPayInitiateRequest {
        order_id: order.id,
        order_number: order.order_number.clone(),
        attempt_suffix: payment.attempt_number.to_string(),
        msisdn: msisdn.to_string(),
        email: order.billing_email.clone(),
        details: format!("Order {} ({})", order.order_number, format_amount(amount, RWF)),
        amount,
        currency: RWF.into(),
        customer_name: order.billing_name.clone(),
        customer_number: kpay::normalize_msisdn(msisdn),
        payment_method: Some(pmethod.to_string()),
    };

    let initiation = match kpay.initiate(&request).await {
        Ok(initiation) => initiation,
        Err(err) => {
            fail_attempt(conn, &payment, &err.to_string()).await?;
            return Ok(GatewayOutcome::failed(Some(payment.id), kpay_error_message(&err)));
        }
    };

    let payment = attach_gateway_refs(
        conn,
        &payment,
        GatewayRefs {
            kpay_transaction_id: initiation.tid.clone(),
            kpay_ref_id: Some(initiation.refid.clone()),
            ..Default::default()
        },
        &json!({ "kpay_initiation": initiation.response }),
    )
    .await?;

    // Some wallets settle during initiation.
    let status = kpay.classify(&initiation.response);
    let payment = match status {
        KPayStatus::Pending => payment,
        status => {
            reconciliation::reconcile(conn, payment.id, kpay_signal(status, &initiation.response))
                .await?
                .payment
        }
    };

    let outcome = match payment.status.as_str() {
        "pending" => GatewayOutcome::ok(payment.id, "Please complete the payment on your mobile device.")
            .with_status("pending"),
        _ => outcome_for(&payment),
    };
    Ok(outcome.with_redirect(initiation.redirect_url))
}

/// Current state of a customer's payment. Pending KPay payments are checked
/// with the provider and reconciled first.
pub async fn refresh_payment_status(
    state: &AppState,
    user_id: i32,
    payment_id: i32,
) -> Result<GatewayOutcome, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let payment: PaymentEntity = payments::table
        .find(payment_id)
        .filter(payments::user_id.eq(user_id))
        .select(PaymentEntity::as_select())
        .first(conn)
        .await?;

    if payment.status != "pending" || payment.payment_method != "kpay" {
        return Ok(outcome_for(&payment));
    }

    let kpay = state.kpay();
    let body = match kpay
        .check_status(payment.kpay_transaction_id.as_deref(), payment.kpay_ref_id.as_deref())
        .await
    {
        Ok(body) => body,
        Err(err) => {
            warn!(payment_id, order_id = payment.order_id, error = %err, "KPay status check failed, keeping payment pending");
            return Ok(outcome_for(&payment));
        }
    };

    let signal = kpay_signal(kpay.classify(&body), &body);
    let reconciled = reconciliation::reconcile(conn, payment.id, signal).await?;
    Ok(outcome_for(&reconciled.payment))
}

#[derive(Debug)]
pub enum StripeEventOutcome {
    Reconciled(Reconciled),
    PaymentNotFound,
    Ignored,
}

pub async fn handle_stripe_event(conn: &mut AsyncPgConnection, event: &Value) -> Result<StripeEventOutcome, AppError> {
    let event_type = event["type"].as_str().unwrap_or_default();
    let Some(parsed) = parse_stripe_event(event) else {
        info!(event_type, "Ignoring unhandled Stripe event");
        return Ok(StripeEventOutcome::Ignored);
    };

    let payment = reconciliation::find_stripe_payment(
        conn,
        parsed.intent_id.as_deref(),
        parsed.payment_id,
        parsed.session_id.as_deref(),
    )
    .await?;

    let Some(payment) = payment else {
        warn!(event_type, intent_id = ?parsed.intent_id, payment_id = ?parsed.payment_id, "No payment matches Stripe event");
        return Ok(StripeEventOutcome::PaymentNotFound);
    };

    // Replace the placeholder intent id once Stripe has assigned the real one.
    if parsed.intent_id.is_some() && payment.stripe_payment_intent_id != parsed.intent_id {
        attach_gateway_refs(
            conn,
            &payment,
            GatewayRefs {
                stripe_payment_intent_id: parsed.intent_id.clone(),
                ..Default::default()
            },
            &Value::Null,
        )
        .await?;
    }

    let reconciled = reconciliation::reconcile(conn, payment.id, parsed.signal).await?;
    info!(
        event_type,
        payment_id = payment.id,
        order_id = payment.order_id,
        transition = ?reconciled.transition,
        dispatched = reconciled.dispatched(),
        "Stripe event reconciled"
    );
    Ok(StripeEventOutcome::Reconciled(reconciled))
}

#[derive(Debug)]
pub enum PostbackError {
    MissingIdentifiers,
    PaymentNotFound,
    Processing(AppError),
}

impl From<AppError> for PostbackError {
    fn from(err: AppError) -> Self {
        PostbackError::Processing(err)
    }
}

/// A postback identifier as text, whether the provider sent a string or a number.
pub fn postback_id(body: &Value, key: &str) -> Option<String> {
    match &body[key] {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

pub async fn handle_kpay_postback(
    conn: &mut AsyncPgConnection,
    codes: &KPayStatusCodes,
    body: &Value,
) -> Result<Reconciled, PostbackError> {
    let tid = postback_id(body, "tid");
    let refid = postback_id(body, "refid");
    if tid.is_none() && refid.is_none() {
        warn!("KPay postback missing transaction identifiers");
        return Err(PostbackError::MissingIdentifiers);
    }

    let payment = reconciliation::find_kpay_payment(conn, tid.as_deref(), refid.as_deref())
        .await?
        .ok_or_else(|| {
            warn!(tid, refid, "KPay postback payment not found");
            PostbackError::PaymentNotFound
        })?;

    if tid.is_some() && payment.kpay_transaction_id.is_none() {
        attach_gateway_refs(
            conn,
            &payment,
            GatewayRefs {
                kpay_transaction_id: tid.clone(),
                ..Default::default()
            },
            &Value::Null,
        )
        .await?;
    }

    let status = kpay::classify_status(kpay::status_code(body), codes);
    let reconciled = reconciliation::reconcile(conn, payment.id, kpay_signal(status, body)).await?;
    info!(
        tid,
        refid,
        payment_id = payment.id,
        order_id = payment.order_id,
        transition = ?reconciled.transition,
        dispatched = reconciled.dispatched(),
        "KPay postback processed"
    );
    Ok(reconciled)
}

/// The latest attempt of an order, for customer order views.
pub async fn latest_attempt(conn: &mut AsyncPgConnection, order_id: i32) -> Result<Option<PaymentEntity>, AppError> {
    Ok(payments::table
        .filter(payments::order_id.eq(order_id))
        .order_by(payments::attempt_number.desc())
        .select(PaymentEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get payments")?)
}
