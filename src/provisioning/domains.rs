use anyhow::{Context, anyhow};
use chrono::{DateTime, Months, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, upsert::excluded};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde_json::Value;
use tracing::{error, info};

use crate::{
    api::registrars::{RegistrarReceipt, Registrars, RegistrationRequest, RenewalRequest},
    checkout::hints::ContactIds,
    models::{CreateDomainEntity, CreateDomainRenewalEntity, DomainEntity, OrderEntity, OrderItemEntity},
    provisioning::ProvisioningError,
    schema::{domain_renewals, domains, order_items},
};

/// Contacts captured at checkout. An order placed with a single selected
/// contact uses it as the registrant, and the other roles follow it.
pub fn order_contacts(metadata: &Value) -> ContactIds {
    let mut contacts = ContactIds::from_value(&metadata["contact_ids"]).unwrap_or_default();
    if contacts.registrant.is_none() {
        contacts.registrant = metadata["selected_contact_id"]
            .as_i64()
            .and_then(|id| i32::try_from(id).ok());
    }
    contacts
}

/// Contacts captured on the order win over the ones on the item.
pub fn choose_contacts(order: &ContactIds, item: &ContactIds) -> ContactIds {
    if order.registrant.is_some() { *order } else { *item }
}

/// New expiry after renewing for `years`, counted from the later of the
/// current expiry and now.
pub fn renewal_expiry(current: Option<DateTime<Utc>>, now: DateTime<Utc>, years: i32) -> Option<DateTime<Utc>> {
    let base = current.filter(|expiry| *expiry > now).unwrap_or(now);
    let months = u32::try_from(years.max(1)).ok()?.checked_mul(12)?;
    base.checked_add_months(Months::new(months))
}

/// Registers the item's domain and links the resulting domain to the item.
pub async fn register(
    conn: &mut AsyncPgConnection,
    registrars: &Registrars,
    order: &OrderEntity,
    item: &OrderItemEntity,
    contacts: &ContactIds,
) -> Result<DomainEntity, ProvisioningError> {
    let resolved = contacts
        .resolve()
        .ok_or_else(|| ProvisioningError::MissingContacts(item.domain_name.clone()))?;

    let registrar = registrars.for_registration(&item.domain_name);
    let years = item.years.max(1);

    let receipt: RegistrarReceipt = registrar
        .register_domain(&RegistrationRequest {
            domain_name: item.domain_name.clone(),
            years,
            contacts: resolved,
        })
        .await
        .inspect_err(|err| {
            error!(order_id = order.id, domain = item.domain_name, registrar = %registrar.kind(), error = %err, "Domain registration failed");
        })?;

    let now = Utc::now();
    let expires_at = receipt.expires_at.or_else(|| renewal_expiry(None, now, years));

    let domain = diesel::insert_into(domains::table)
        .values(CreateDomainEntity {
            owner_id: order.user_id,
            name: item.domain_name.clone(),
            registrar: registrar.kind().to_string(),
            status: "active".into(),
            registered_at: Some(now),
            expires_at,
        })
        .on_conflict(domains::name)
        .do_update()
        .set((
            domains::owner_id.eq(excluded(domains::owner_id)),
            domains::registrar.eq(excluded(domains::registrar)),
            domains::status.eq(excluded(domains::status)),
            domains::registered_at.eq(excluded(domains::registered_at)),
            domains::expires_at.eq(excluded(domains::expires_at)),
        ))
        .returning(DomainEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to save registered domain")?;

    diesel::update(order_items::table.find(item.id))
        .set(order_items::domain_id.eq(Some(domain.id)))
        .execute(conn)
        .await
        .context("Failed to link domain to order item")?;

    info!(order_id = order.id, domain = domain.name, registrar = domain.registrar, "Domain provisioned");
    Ok(domain)
}

/// Renews an existing domain of the order's customer.
pub async fn renew(
    conn: &mut AsyncPgConnection,
    registrars: &Registrars,
    order: &OrderEntity,
    item: &OrderItemEntity,
    domain_id: Option<i32>,
) -> Result<(), ProvisioningError> {
    let domain: Option<DomainEntity> = match domain_id {
        Some(id) => domains::table
            .find(id)
            .select(DomainEntity::as_select())
            .first(conn)
            .await
            .optional()?,
        None => domains::table
            .filter(domains::name.eq(item.domain_name.to_lowercase()))
            .select(DomainEntity::as_select())
            .first(conn)
            .await
            .optional()?,
    };

    let domain = domain.ok_or_else(|| ProvisioningError::DomainNotFound(item.domain_name.clone()))?;
    if domain.owner_id != order.user_id {
        return Err(ProvisioningError::DomainNotOwned(domain.name));
    }

    let years = item.years.max(1);
    let outcome = match registrars.for_stored(&domain.registrar) {
        Ok(registrar) => registrar
            .renew_domain(&RenewalRequest {
                domain_name: domain.name.clone(),
                years,
                current_expiry: domain.expires_at,
            })
            .await
            .map(|_| ()),
        Err(err) => Err(err),
    };

    let mut renewal = CreateDomainRenewalEntity {
        domain_id: domain.id,
        order_id: order.id,
        years,
        amount: item.total_amount,
        currency: item.currency.clone(),
        old_expiry_date: domain.expires_at,
        new_expiry_date: None,
        status: "completed".into(),
        failure_reason: None,
    };

    if let Err(err) = outcome {
        error!(order_id = order.id, domain = domain.name, registrar = domain.registrar, error = %err, "Domain renewal failed");
        renewal.status = "failed".into();
        renewal.failure_reason = Some(err.to_string());
        diesel::insert_into(domain_renewals::table)
            .values(renewal)
            .execute(conn)
            .await
            .context("Failed to record domain renewal")?;
        return Err(err.into());
    }

    let now = Utc::now();
    let new_expiry = renewal_expiry(domain.expires_at, now, years)
        .ok_or_else(|| anyhow!("Renewed expiry of {} is out of range", domain.name))?;
    renewal.new_expiry_date = Some(new_expiry);

    diesel::update(domains::table.find(domain.id))
        .set((
            domains::expires_at.eq(Some(new_expiry)),
            domains::last_renewed_at.eq(Some(now)),
            domains::status.eq("active"),
        ))
        .execute(conn)
        .await
        .context("Failed to extend domain expiry")?;

    diesel::insert_into(domain_renewals::table)
        .values(renewal)
        .execute(conn)
        .await
        .context("Failed to record domain renewal")?;

    diesel::update(order_items::table.find(item.id))
        .set(order_items::domain_id.eq(Some(domain.id)))
        .execute(conn)
        .await
        .context("Failed to link domain to order item")?;

    info!(order_id = order.id, domain = domain.name, expires_at = %new_expiry, "Domain renewed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn renewal_extends_from_future_expiry() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let expiry = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(
            renewal_expiry(Some(expiry), now, 2),
            Some(Utc.with_ymd_and_hms(2027, 6, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn lapsed_domains_renew_from_now() {
        let now = Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap();
        let expiry = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        assert_eq!(
            renewal_expiry(Some(expiry), now, 1),
            Some(Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap())
        );
        assert_eq!(renewal_expiry(None, now, 0), renewal_expiry(None, now, 1));
    }

    #[test]
    fn absurd_terms_have_no_expiry() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(renewal_expiry(None, now, i32::MAX), None);
    }

    #[test]
    fn selected_contact_stands_in_for_the_registrant() {
        let metadata = json!({"contact_ids": {}, "selected_contact_id": 7});
        let contacts = order_contacts(&metadata);
        assert_eq!(contacts.registrant, Some(7));
        assert_eq!(contacts.resolve().map(|c| (c.admin, c.tech, c.billing)), Some((7, 7, 7)));

        let explicit = json!({"contact_ids": {"registrant": 3, "admin": 4}, "selected_contact_id": 7});
        assert_eq!(order_contacts(&explicit).registrant, Some(3));
        assert_eq!(order_contacts(&json!({})), ContactIds::default());
    }

    #[test]
    fn order_contacts_take_precedence() {
        let order = ContactIds {
            registrant: Some(1),
            ..Default::default()
        };
        let item = ContactIds {
            registrant: Some(9),
            admin: Some(9),
            ..Default::default()
        };
        assert_eq!(choose_contacts(&order, &item), order);
        assert_eq!(choose_contacts(&ContactIds::default(), &item), item);
    }
}
