//! Typed provisioning hints carried on each order item.
//!
//! On disk they stay a JSON object with the key names the rest of the
//! billing system already reads (`hosting_plan_id`, `hosting_plan_pricing_id`,
//! `billing_cycle`, `subscription_id`, `duration_months`, `linked_domain`,
//! `contact_ids`). The legacy `hosting_plan_price_id` key is accepted on read.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use utoipa::ToSchema;

use crate::pricing::{BillingCycle, ItemType};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HintError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {0}")]
    Invalid(&'static str),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, ToSchema)]
pub struct ContactIds {
    pub registrant: Option<i32>,
    pub admin: Option<i32>,
    pub tech: Option<i32>,
    pub billing: Option<i32>,
}

/// A full contact set for a registrar call.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedContacts {
    pub registrant: i32,
    pub admin: i32,
    pub tech: i32,
    pub billing: i32,
}

impl ContactIds {
    pub fn is_empty(&self) -> bool {
        self.registrant.is_none() && self.admin.is_none() && self.tech.is_none() && self.billing.is_none()
    }

    /// Single-contact mode: roles left empty reuse the registrant.
    pub fn resolve(&self) -> Option<ResolvedContacts> {
        let registrant = self.registrant?;
        Some(ResolvedContacts {
            registrant,
            admin: self.admin.unwrap_or(registrant),
            tech: self.tech.unwrap_or(registrant),
            billing: self.billing.unwrap_or(registrant),
        })
    }

    pub fn from_value(value: &Value) -> Result<Self, HintError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        if !value.is_object() {
            return Err(HintError::Invalid("contact_ids"));
        }
        Ok(Self {
            registrant: int_field(value, "registrant")?,
            admin: int_field(value, "admin")?,
            tech: int_field(value, "tech")?,
            billing: int_field(value, "billing")?,
        })
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemHint {
    Domain {
        contact_ids: ContactIds,
    },
    Renewal {
        domain_id: Option<i32>,
    },
    Hosting {
        plan_id: i32,
        pricing_id: i32,
        billing_cycle: BillingCycle,
        linked_domain: Option<String>,
        duration_months: i32,
    },
    SubscriptionRenewal {
        subscription_id: i32,
        billing_cycle: Option<BillingCycle>,
        duration_months: i32,
    },
}

impl ItemHint {
    /// Validates the loosely-typed attributes of a line of the given type.
    /// `billing_cycle` is the line-level cycle, used when the attributes have none.
    pub fn parse(
        item_type: ItemType,
        attributes: &Value,
        quantity: i32,
        billing_cycle: Option<BillingCycle>,
    ) -> Result<Self, HintError> {
        let empty = Value::Object(Map::new());
        let attributes = match attributes {
            Value::Null => &empty,
            Value::Object(_) => attributes,
            _ => return Err(HintError::Invalid("attributes")),
        };
        let cycle = cycle_field(attributes)?.or(billing_cycle);
        let duration = int_field(attributes, "duration_months")?;
        if duration.is_some_and(|months| months <= 0) {
            return Err(HintError::Invalid("duration_months"));
        }

        match item_type {
            ItemType::Registration | ItemType::Transfer => Ok(ItemHint::Domain {
                contact_ids: ContactIds::from_value(attributes.get("contact_ids").unwrap_or(&Value::Null))?,
            }),
            ItemType::Renewal => Ok(ItemHint::Renewal {
                domain_id: int_field(attributes, "domain_id")?,
            }),
            ItemType::Hosting => Ok(ItemHint::Hosting {
                plan_id: int_field(attributes, "hosting_plan_id")?.ok_or(HintError::Missing("hosting_plan_id"))?,
                pricing_id: int_field(attributes, "hosting_plan_pricing_id")?
                    .or(int_field(attributes, "hosting_plan_price_id")?)
                    .ok_or(HintError::Missing("hosting_plan_pricing_id"))?,
                billing_cycle: cycle.unwrap_or(BillingCycle::Monthly),
                linked_domain: attributes
                    .get("linked_domain")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from),
                duration_months: duration.unwrap_or(quantity.max(1)),
            }),
            ItemType::SubscriptionRenewal => Ok(ItemHint::SubscriptionRenewal {
                subscription_id: int_field(attributes, "subscription_id")?
                    .ok_or(HintError::Missing("subscription_id"))?,
                billing_cycle: cycle,
                duration_months: duration.unwrap_or(quantity.max(1)),
            }),
        }
    }

    /// JSON form stored in `order_items.metadata`.
    pub fn to_metadata(&self) -> Value {
        match self {
            ItemHint::Domain { contact_ids } if contact_ids.is_empty() => json!({}),
            ItemHint::Domain { contact_ids } => json!({ "contact_ids": contact_ids }),
            ItemHint::Renewal { domain_id: Some(id) } => json!({ "domain_id": id }),
            ItemHint::Renewal { domain_id: None } => json!({}),
            ItemHint::Hosting {
                plan_id,
                pricing_id,
                billing_cycle,
                linked_domain,
                duration_months,
            } => {
                let mut metadata = json!({
                    "hosting_plan_id": plan_id,
                    "hosting_plan_pricing_id": pricing_id,
                    "billing_cycle": billing_cycle.as_str(),
                    "duration_months": duration_months,
                });
                if let Some(domain) = linked_domain {
                    metadata["linked_domain"] = json!(domain);
                }
                metadata
            }
            ItemHint::SubscriptionRenewal {
                subscription_id,
                billing_cycle,
                duration_months,
            } => {
                let mut metadata = json!({
                    "subscription_id": subscription_id,
                    "duration_months": duration_months,
                });
                if let Some(cycle) = billing_cycle {
                    metadata["billing_cycle"] = json!(cycle.as_str());
                }
                metadata
            }
        }
    }
}

fn int_field(value: &Value, key: &'static str) -> Result<Option<i32>, HintError> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(Some)
            .ok_or(HintError::Invalid(key)),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| HintError::Invalid(key)),
        Some(_) => Err(HintError::Invalid(key)),
    }
}

fn cycle_field(value: &Value) -> Result<Option<BillingCycle>, HintError> {
    match value.get("billing_cycle") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => BillingCycle::from_str(s)
            .map(Some)
            .map_err(|_| HintError::Invalid("billing_cycle")),
        Some(_) => Err(HintError::Invalid("billing_cycle")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosting_hint_accepts_legacy_price_key_and_string_ids() {
        let attributes = json!({
            "hosting_plan_id": "4",
            "hosting_plan_price_id": 9,
            "billing_cycle": "annually",
        });
        let hint = ItemHint::parse(ItemType::Hosting, &attributes, 12, None).unwrap();
        assert_eq!(
            hint,
            ItemHint::Hosting {
                plan_id: 4,
                pricing_id: 9,
                billing_cycle: BillingCycle::Annually,
                linked_domain: None,
                duration_months: 12,
            }
        );
        assert_eq!(hint.to_metadata()["hosting_plan_pricing_id"], json!(9));
    }

    #[test]
    fn hosting_hint_requires_plan_and_price() {
        let err = ItemHint::parse(ItemType::Hosting, &json!({"hosting_plan_id": 1}), 1, None);
        assert_eq!(err, Err(HintError::Missing("hosting_plan_pricing_id")));
    }

    #[test]
    fn subscription_renewal_requires_subscription() {
        let err = ItemHint::parse(ItemType::SubscriptionRenewal, &json!({}), 3, None);
        assert_eq!(err, Err(HintError::Missing("subscription_id")));
    }

    #[test]
    fn metadata_round_trips_through_parse() {
        let hint = ItemHint::SubscriptionRenewal {
            subscription_id: 7,
            billing_cycle: Some(BillingCycle::Quarterly),
            duration_months: 6,
        };
        let parsed = ItemHint::parse(ItemType::SubscriptionRenewal, &hint.to_metadata(), 1, None).unwrap();
        assert_eq!(parsed, hint);
    }

    #[test]
    fn single_contact_mode_fills_every_role() {
        let contacts = ContactIds {
            registrant: Some(3),
            tech: Some(5),
            ..Default::default()
        };
        assert_eq!(
            contacts.resolve(),
            Some(ResolvedContacts {
                registrant: 3,
                admin: 3,
                tech: 5,
                billing: 3,
            })
        );
        assert_eq!(ContactIds::default().resolve(), None);
    }
}
