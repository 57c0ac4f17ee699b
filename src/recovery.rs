//! Failed domain registrations and their retries.
//!
//! Automatic retries are driven by `next_retry_at`: the scheduler stages a
//! retry event for every due record, and the consumer runs one attempt.
//! Manual retries from the admin skip the schedule but not the ceiling.
//! Every attempt claims its record first, so only one caller reaches the
//! registrar.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, dsl::count_star};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::{
    api::registrars::Registrars,
    app_error::AppError,
    checkout::hints::ContactIds,
    config::RecoveryConfig,
    db::DbPool,
    events::{self, AdminNotificationEvent, AdminNotificationKind, RetryRegistrationEvent},
    models::{CreateFailedDomainRegistrationEntity, FailedDomainRegistrationEntity, OrderEntity, OrderItemEntity},
    outbox,
    provisioning::domains,
    schema::{contacts, failed_domain_registrations, order_items, orders},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureStep {
    pub retry_count: i32,
    pub status: &'static str,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// State of a record after one more failed attempt.
pub fn next_failure_step(retry_count: i32, max_retries: i32, now: DateTime<Utc>, delay: Duration) -> FailureStep {
    let retry_count = retry_count + 1;
    if retry_count >= max_retries {
        FailureStep {
            retry_count,
            status: "abandoned",
            next_retry_at: None,
        }
    } else {
        FailureStep {
            retry_count,
            status: "pending",
            next_retry_at: Some(now + delay_of(delay)),
        }
    }
}

fn delay_of(delay: Duration) -> TimeDelta {
    TimeDelta::from_std(delay).unwrap_or(TimeDelta::hours(1))
}

pub fn append_attempt(attempts: &Value, attempt: i32, reason: &str, at: DateTime<Utc>) -> Value {
    let mut list = attempts.as_array().cloned().unwrap_or_default();
    list.push(json!({ "attempt": attempt, "reason": reason, "attempted_at": at }));
    Value::Array(list)
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    Registered { domain_name: String },
    Failed { reason: String },
    Refused,
}

/// Stores a failed registration so it can be retried later.
pub async fn record_failure(
    conn: &mut AsyncPgConnection,
    order: &OrderEntity,
    item: &OrderItemEntity,
    reason: &str,
    contacts: &ContactIds,
    config: &RecoveryConfig,
) -> Result<FailedDomainRegistrationEntity> {
    let now = Utc::now();
    let record = diesel::insert_into(failed_domain_registrations::table)
        .values(CreateFailedDomainRegistrationEntity {
            order_id: order.id,
            order_item_id: item.id,
            domain_name: item.domain_name.clone(),
            failure_reason: reason.to_string(),
            retry_count: 0,
            max_retries: config.max_retries,
            status: "pending".into(),
            contact_ids: serde_json::to_value(contacts)?,
            attempts: append_attempt(&Value::Null, 0, reason, now),
            next_retry_at: Some(now + delay_of(config.retry_delay)),
        })
        .returning(FailedDomainRegistrationEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to record failed registration")?;

    outbox::publish(
        conn,
        events::ADMIN_NOTIFICATION.into(),
        AdminNotificationEvent {
            kind: AdminNotificationKind::RegistrationFailed,
            order_id: order.id,
            subject: format!("Domain registration failed: {}", item.domain_name),
            message: format!("Order {}: {reason}", order.order_number),
        },
    )
    .await
    .context("Failed to send outbox")?;

    warn!(order_id = order.id, domain = item.domain_name, failed_registration_id = record.id, reason, "Registration failure recorded");
    Ok(record)
}

/// One retry attempt, shared by the scheduled job and the admin action.
pub async fn retry_registration(
    conn: &mut AsyncPgConnection,
    registrars: &Registrars,
    config: &RecoveryConfig,
    record_id: i32,
) -> Result<RetryOutcome, AppError> {
    let record: FailedDomainRegistrationEntity = failed_domain_registrations::table
        .find(record_id)
        .select(FailedDomainRegistrationEntity::as_select())
        .first(conn)
        .await?;

    let claimed = if record.can_retry() {
        claim(conn, record.id, &["pending"], None).await?
    } else {
        None
    };
    let Some(record) = claimed else {
        info!(
            failed_registration_id = record.id,
            status = record.status,
            retry_count = record.retry_count,
            "Registration cannot be retried"
        );
        return Ok(RetryOutcome::Refused);
    };

    let contacts = ContactIds::from_value(&record.contact_ids).unwrap_or_default();
    match attempt(conn, registrars, &record, &contacts).await {
        Ok(Attempt::Registered(domain_name)) => Ok(RetryOutcome::Registered { domain_name }),
        Ok(Attempt::Failed { order, reason }) => {
            register_failed_attempt(conn, &record, &order, &reason, config).await?;
            Ok(RetryOutcome::Failed { reason })
        }
        Err(err) => {
            release(conn, record.id, "pending").await;
            Err(err)
        }
    }
}

/// Registers a failed item by hand with contacts chosen by an admin.
/// Abandoned records qualify too; resolved ones do not.
pub async fn manual_register(
    conn: &mut AsyncPgConnection,
    registrars: &Registrars,
    record_id: i32,
    chosen: ContactIds,
) -> Result<RetryOutcome, AppError> {
    let Some(resolved) = chosen.resolve() else {
        return Err(AppError::BadRequest("A registrant contact is required".into()));
    };
    let ids = [resolved.registrant, resolved.admin, resolved.tech, resolved.billing];
    let known: Vec<i32> = contacts::table
        .filter(contacts::id.eq_any(ids))
        .select(contacts::id)
        .get_results(conn)
        .await
        .context("Failed to get contacts")?;
    if let Some(missing) = ids.into_iter().find(|id| !known.contains(id)) {
        return Err(AppError::BadRequest(format!("Contact {missing} does not exist")));
    }

    let record: FailedDomainRegistrationEntity = failed_domain_registrations::table
        .find(record_id)
        .select(FailedDomainRegistrationEntity::as_select())
        .first(conn)
        .await?;
    let previous_status = record.status.clone();
    let contact_value = serde_json::to_value(chosen).context("Failed to encode contacts")?;

    let Some(record) = claim(conn, record.id, &["pending", "abandoned"], Some(contact_value)).await? else {
        return Ok(RetryOutcome::Refused);
    };

    match attempt(conn, registrars, &record, &chosen).await {
        Ok(Attempt::Registered(domain_name)) => {
            info!(failed_registration_id = record.id, domain = domain_name, "Manual domain registration succeeded");
            Ok(RetryOutcome::Registered { domain_name })
        }
        Ok(Attempt::Failed { reason, .. }) => {
            warn!(failed_registration_id = record.id, domain = record.domain_name, reason, "Manual domain registration failed");
            let now = Utc::now();
            diesel::update(
                failed_domain_registrations::table
                    .find(record.id)
                    .filter(failed_domain_registrations::status.eq("retrying")),
            )
            .set((
                failed_domain_registrations::status.eq(previous_status.as_str()),
                failed_domain_registrations::failure_reason.eq(&reason),
                failed_domain_registrations::attempts.eq(append_attempt(&record.attempts, record.retry_count, &reason, now)),
                failed_domain_registrations::last_attempted_at.eq(Some(now)),
            ))
            .execute(conn)
            .await
            .context("Failed to update failed registration")?;
            Ok(RetryOutcome::Failed { reason })
        }
        Err(err) => {
            release(conn, record.id, &previous_status).await;
            Err(err)
        }
    }
}

/// Moves a record to `retrying` if it is still in one of `from`. Exactly one
/// concurrent caller gets the record back.
async fn claim(
    conn: &mut AsyncPgConnection,
    record_id: i32,
    from: &[&str],
    contact_ids: Option<Value>,
) -> Result<Option<FailedDomainRegistrationEntity>, AppError> {
    let target = failed_domain_registrations::table
        .find(record_id)
        .filter(failed_domain_registrations::status.eq_any(from.to_vec()));

    let claimed = match contact_ids {
        Some(contact_ids) => {
            diesel::update(target)
                .set((
                    failed_domain_registrations::status.eq("retrying"),
                    failed_domain_registrations::contact_ids.eq(contact_ids),
                ))
                .returning(FailedDomainRegistrationEntity::as_returning())
                .get_result(conn)
                .await
        }
        None => {
            diesel::update(target.filter(failed_domain_registrations::retry_count.lt(failed_domain_registrations::max_retries)))
                .set(failed_domain_registrations::status.eq("retrying"))
                .returning(FailedDomainRegistrationEntity::as_returning())
                .get_result(conn)
                .await
        }
    };

    Ok(claimed.optional().context("Failed to claim failed registration")?)
}

async fn release(conn: &mut AsyncPgConnection, record_id: i32, status: &str) {
    let released = diesel::update(
        failed_domain_registrations::table
            .find(record_id)
            .filter(failed_domain_registrations::status.eq("retrying")),
    )
    .set(failed_domain_registrations::status.eq(status))
    .execute(conn)
    .await;

    if let Err(err) = released {
        error!(failed_registration_id = record_id, error = ?err, "Failed to release claimed registration");
    }
}

enum Attempt {
    Registered(String),
    Failed { order: OrderEntity, reason: String },
}

/// Calls the registrar for a claimed record. Registrar failures come back as
/// [`Attempt::Failed`]; `Err` is left for infrastructure errors.
async fn attempt(
    conn: &mut AsyncPgConnection,
    registrars: &Registrars,
    record: &FailedDomainRegistrationEntity,
    contacts: &ContactIds,
) -> Result<Attempt, AppError> {
    let order: OrderEntity = orders::table
        .find(record.order_id)
        .select(OrderEntity::as_select())
        .first(conn)
        .await?;
    let item: OrderItemEntity = order_items::table
        .find(record.order_item_id)
        .select(OrderItemEntity::as_select())
        .first(conn)
        .await?;

    match domains::register(conn, registrars, &order, &item, contacts).await {
        Ok(domain) => {
            resolve(conn, record).await?;
            info!(failed_registration_id = record.id, domain = domain.name, "Registration retry succeeded");
            Ok(Attempt::Registered(domain.name))
        }
        Err(err) => Ok(Attempt::Failed {
            order,
            reason: err.to_string(),
        }),
    }
}

async fn resolve(conn: &mut AsyncPgConnection, record: &FailedDomainRegistrationEntity) -> Result<(), AppError> {
    let record_id = record.id;
    let order_id = record.order_id;
    conn.transaction(move |conn| {
        Box::pin(async move {
            let now = Utc::now();
            diesel::update(failed_domain_registrations::table.find(record_id))
                .set((
                    failed_domain_registrations::status.eq("resolved"),
                    failed_domain_registrations::resolved_at.eq(Some(now)),
                    failed_domain_registrations::last_attempted_at.eq(Some(now)),
                    failed_domain_registrations::next_retry_at.eq(None::<DateTime<Utc>>),
                ))
                .execute(conn)
                .await
                .context("Failed to resolve failed registration")?;

            let remaining: i64 = failed_domain_registrations::table
                .filter(failed_domain_registrations::order_id.eq(order_id))
                .filter(failed_domain_registrations::status.eq_any(["pending", "retrying"]))
                .select(count_star())
                .first(conn)
                .await
                .context("Failed to count pending registrations")?;

            if remaining == 0 {
                diesel::update(
                    orders::table
                        .find(order_id)
                        .filter(orders::status.eq_any(["partially_completed", "requires_attention"])),
                )
                .set(orders::status.eq("completed"))
                .execute(conn)
                .await
                .context("Failed to complete order")?;
            }

            Ok::<(), AppError>(())
        })
    })
    .await
}

async fn register_failed_attempt(
    conn: &mut AsyncPgConnection,
    record: &FailedDomainRegistrationEntity,
    order: &OrderEntity,
    reason: &str,
    config: &RecoveryConfig,
) -> Result<(), AppError> {
    let now = Utc::now();
    let step = next_failure_step(record.retry_count, record.max_retries, now, config.retry_delay);
    let attempts = append_attempt(&record.attempts, step.retry_count, reason, now);
    let record_id = record.id;
    let previous_count = record.retry_count;
    let domain_name = record.domain_name.clone();
    let order_id = order.id;
    let order_number = order.order_number.clone();
    let reason = reason.to_string();

    conn.transaction(move |conn| {
        Box::pin(async move {
            let updated: Option<FailedDomainRegistrationEntity> = diesel::update(
                failed_domain_registrations::table
                    .find(record_id)
                    .filter(failed_domain_registrations::status.eq("retrying"))
                    .filter(failed_domain_registrations::retry_count.eq(previous_count)),
            )
            .set((
                failed_domain_registrations::retry_count.eq(step.retry_count),
                failed_domain_registrations::failure_reason.eq(&reason),
                failed_domain_registrations::attempts.eq(attempts),
                failed_domain_registrations::status.eq(step.status),
                failed_domain_registrations::last_attempted_at.eq(Some(now)),
                failed_domain_registrations::next_retry_at.eq(step.next_retry_at),
            ))
            .returning(FailedDomainRegistrationEntity::as_returning())
            .get_result(conn)
            .await
            .optional()
            .context("Failed to update failed registration")?;

            let Some(updated) = updated else {
                warn!(failed_registration_id = record_id, "Failed registration changed concurrently");
                return Ok(());
            };

            warn!(
                failed_registration_id = updated.id,
                domain = domain_name,
                retry_count = updated.retry_count,
                status = updated.status,
                "Registration retry failed"
            );

            if updated.status == "abandoned" {
                outbox::publish(
                    conn,
                    events::ADMIN_NOTIFICATION.into(),
                    AdminNotificationEvent {
                        kind: AdminNotificationKind::RegistrationAbandoned,
                        order_id,
                        subject: format!("Domain registration abandoned: {domain_name}"),
                        message: format!(
                            "Order {order_number}: gave up after {} attempts. Last error: {reason}",
                            updated.retry_count
                        ),
                    },
                )
                .await
                .context("Failed to send outbox")?;
            }

            Ok::<(), AppError>(())
        })
    })
    .await
}

/// Marks a pending record abandoned.
pub async fn abandon(conn: &mut AsyncPgConnection, record_id: i32) -> Result<FailedDomainRegistrationEntity, AppError> {
    let updated: Option<FailedDomainRegistrationEntity> = diesel::update(
        failed_domain_registrations::table
            .find(record_id)
            .filter(failed_domain_registrations::status.eq("pending")),
    )
    .set((
        failed_domain_registrations::status.eq("abandoned"),
        failed_domain_registrations::next_retry_at.eq(None::<DateTime<Utc>>),
    ))
    .returning(FailedDomainRegistrationEntity::as_returning())
    .get_result(conn)
    .await
    .optional()
    .context("Failed to abandon failed registration")?;

    match updated {
        Some(record) => Ok(record),
        None => {
            failed_domain_registrations::table
                .find(record_id)
                .select(failed_domain_registrations::id)
                .first::<i32>(conn)
                .await?;
            Err(AppError::BadRequest("Only pending registrations can be abandoned".into()))
        }
    }
}

/// Retries every retryable record, optionally for one order only.
pub async fn retry_all(
    conn: &mut AsyncPgConnection,
    registrars: &Registrars,
    config: &RecoveryConfig,
    order_id: Option<i32>,
) -> Result<Vec<(i32, RetryOutcome)>, AppError> {
    let mut query = failed_domain_registrations::table
        .filter(failed_domain_registrations::status.eq("pending"))
        .filter(failed_domain_registrations::retry_count.lt(failed_domain_registrations::max_retries))
        .select(failed_domain_registrations::id)
        .order_by(failed_domain_registrations::id.asc())
        .into_boxed();
    if let Some(order_id) = order_id {
        query = query.filter(failed_domain_registrations::order_id.eq(order_id));
    }
    let ids: Vec<i32> = query
        .get_results(conn)
        .await
        .context("Failed to get retryable registrations")?;

    let mut outcomes = Vec::with_capacity(ids.len());
    for id in ids {
        let outcome = retry_registration(conn, registrars, config, id).await?;
        outcomes.push((id, outcome));
    }
    Ok(outcomes)
}

/// Stages a retry event for each due record and pushes its schedule back
/// so the next tick does not enqueue it again.
pub async fn schedule_due(conn: &mut AsyncPgConnection, config: &RecoveryConfig) -> Result<usize> {
    let delay = delay_of(config.retry_delay);
    conn.transaction(move |conn| {
        Box::pin(async move {
            let now = Utc::now();
            let due: Vec<i32> = failed_domain_registrations::table
                .filter(failed_domain_registrations::status.eq("pending"))
                .filter(failed_domain_registrations::retry_count.lt(failed_domain_registrations::max_retries))
                .filter(failed_domain_registrations::next_retry_at.le(now))
                .select(failed_domain_registrations::id)
                .for_update()
                .skip_locked()
                .get_results(conn)
                .await
                .context("Failed to get due registrations")?;

            for id in &due {
                outbox::publish(
                    conn,
                    events::RETRY_REGISTRATION.into(),
                    RetryRegistrationEvent {
                        failed_registration_id: *id,
                    },
                )
                .await?;
            }

            if !due.is_empty() {
                diesel::update(failed_domain_registrations::table.filter(failed_domain_registrations::id.eq_any(&due)))
                    .set(failed_domain_registrations::next_retry_at.eq(Some(now + delay)))
                    .execute(conn)
                    .await
                    .context("Failed to reschedule registrations")?;
            }

            Ok::<usize, anyhow::Error>(due.len())
        })
    })
    .await
}

pub async fn run_scheduler(pool: DbPool, config: RecoveryConfig) {
    let mut ticker = tokio::time::interval(config.scheduler_interval);
    loop {
        ticker.tick().await;
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = ?err, "Retry scheduler could not obtain a DB connection");
                continue;
            }
        };
        match schedule_due(&mut conn, &config).await {
            Ok(0) => {}
            Ok(scheduled) => info!(scheduled, "Scheduled registration retries"),
            Err(err) => warn!(error = ?err, "Retry scheduler failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn record(status: &str, retry_count: i32, max_retries: i32) -> FailedDomainRegistrationEntity {
        let now = Utc::now();
        FailedDomainRegistrationEntity {
            id: 1,
            order_id: 1,
            order_item_id: 1,
            domain_name: "example.rw".into(),
            failure_reason: "timeout".into(),
            retry_count,
            max_retries,
            status: status.into(),
            contact_ids: json!({"registrant": 1}),
            attempts: json!([]),
            last_attempted_at: None,
            next_retry_at: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn exhausted_records_cannot_be_retried() {
        assert!(!record("pending", 3, 3).can_retry());
        assert!(!record("resolved", 0, 3).can_retry());
        assert!(!record("abandoned", 1, 3).can_retry());
        assert!(record("pending", 2, 3).can_retry());
    }

    #[test]
    fn failures_reschedule_until_the_ceiling() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let delay = Duration::from_secs(3600);

        let step = next_failure_step(0, 3, now, delay);
        assert_eq!(step.retry_count, 1);
        assert_eq!(step.status, "pending");
        assert_eq!(step.next_retry_at, Some(Utc.with_ymd_and_hms(2025, 1, 1, 13, 0, 0).unwrap()));

        let last = next_failure_step(2, 3, now, delay);
        assert_eq!(last.retry_count, 3);
        assert_eq!(last.status, "abandoned");
        assert_eq!(last.next_retry_at, None);
    }

    #[test]
    fn attempts_accumulate() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let attempts = append_attempt(&Value::Null, 0, "timeout", at);
        let attempts = append_attempt(&attempts, 1, "unavailable", at);
        assert_eq!(attempts.as_array().map(Vec::len), Some(2));
        assert_eq!(attempts[0]["reason"], json!("timeout"));
        assert_eq!(attempts[1]["attempt"], json!(1));
    }

    proptest! {
        // Simulates the retry loop against a registrar that always fails.
        #[test]
        fn registrar_is_called_at_most_max_retries_times(start in 0i32..6, max in 0i32..6) {
            let now = Utc::now();
            let mut current = record("pending", start, max);
            let mut calls = 0;
            for _ in 0..10 {
                if !current.can_retry() {
                    break;
                }
                calls += 1;
                let step = next_failure_step(current.retry_count, current.max_retries, now, Duration::from_secs(1));
                current.retry_count = step.retry_count;
                current.status = step.status.into();
            }
            prop_assert_eq!(calls, (max - start).max(0));
            prop_assert!(current.retry_count <= max.max(start));
        }
    }
}
