//! Registrar collaborators. Each registrar sits behind its own gateway
//! service speaking JSON over HTTP.

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info};

use crate::{api::ApiUrls, checkout::hints::ResolvedContacts};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrarError {
    #[error("The domain {0} is no longer available for registration.")]
    Unavailable(String),

    #[error("{0}")]
    Rejected(String),

    #[error("{0} is unreachable")]
    Unreachable(String),

    #[error("Unexpected response from {0}")]
    InvalidResponse(String),

    #[error("Unknown registrar: {0}")]
    UnknownRegistrar(String),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RegistrarKind {
    Namecheap,
    Epp,
}

impl RegistrarKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrarKind::Namecheap => "namecheap",
            RegistrarKind::Epp => "epp",
        }
    }

    /// Registry used for new registrations of `domain_name`.
    pub fn for_domain(domain_name: &str) -> Self {
        if domain_name.trim().to_lowercase().ends_with(".rw") {
            RegistrarKind::Epp
        } else {
            RegistrarKind::Namecheap
        }
    }
}

impl fmt::Display for RegistrarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistrarKind {
    type Err = RegistrarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "namecheap" => Ok(RegistrarKind::Namecheap),
            "epp" => Ok(RegistrarKind::Epp),
            other => Err(RegistrarError::UnknownRegistrar(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub domain_name: String,
    pub years: i32,
    pub contacts: ResolvedContacts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalRequest {
    pub domain_name: String,
    pub years: i32,
    pub current_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarReceipt {
    pub expires_at: Option<DateTime<Utc>>,
    pub reference: Option<String>,
}

#[async_trait]
pub trait DomainRegistrar: Send + Sync {
    fn kind(&self) -> RegistrarKind;

    async fn register_domain(&self, request: &RegistrationRequest) -> Result<RegistrarReceipt, RegistrarError>;

    async fn renew_domain(&self, request: &RenewalRequest) -> Result<RegistrarReceipt, RegistrarError>;
}

fn rejection(domain_name: &str, message: String) -> RegistrarError {
    let lowered = message.to_lowercase();
    if lowered.contains("not available") || lowered.contains("already registered") {
        RegistrarError::Unavailable(domain_name.to_string())
    } else {
        RegistrarError::Rejected(message)
    }
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

async fn post_json(client: &Client, url: String, body: Value, service: &str) -> Result<Value, RegistrarError> {
    let response = client
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|_| RegistrarError::Unreachable(service.into()))?;

    if response.status().is_server_error() {
        return Err(RegistrarError::Unreachable(service.into()));
    }

    response
        .json()
        .await
        .map_err(|_| RegistrarError::InvalidResponse(service.into()))
}

pub struct NamecheapRegistrar {
    client: Client,
    base_url: String,
}

impl NamecheapRegistrar {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    fn receipt(domain_name: &str, body: Value) -> Result<RegistrarReceipt, RegistrarError> {
        if body["success"].as_bool() != Some(true) {
            let message = body["message"]
                .as_str()
                .unwrap_or("Registrar rejected the request")
                .to_string();
            return Err(rejection(domain_name, message));
        }
        Ok(RegistrarReceipt {
            expires_at: parse_date(&body["expires_at"]),
            reference: body["order_id"].as_str().map(String::from),
        })
    }
}

#[async_trait]
impl DomainRegistrar for NamecheapRegistrar {
    fn kind(&self) -> RegistrarKind {
        RegistrarKind::Namecheap
    }

    async fn register_domain(&self, request: &RegistrationRequest) -> Result<RegistrarReceipt, RegistrarError> {
        let body = post_json(
            &self.client,
            format!("{}/domains/create", self.base_url),
            json!({
                "domain": request.domain_name,
                "years": request.years,
                "contacts": request.contacts,
            }),
            "NamecheapGateway",
        )
        .await?;

        let receipt = Self::receipt(&request.domain_name, body)?;
        info!(domain = request.domain_name, registrar = "namecheap", "Domain registered");
        Ok(receipt)
    }

    async fn renew_domain(&self, request: &RenewalRequest) -> Result<RegistrarReceipt, RegistrarError> {
        let body = post_json(
            &self.client,
            format!("{}/domains/renew", self.base_url),
            json!({
                "domain": request.domain_name,
                "years": request.years,
            }),
            "NamecheapGateway",
        )
        .await?;

        Self::receipt(&request.domain_name, body)
    }
}

/// EPP result codes 1000 (completed) and 1001 (pending action) are successes.
pub struct EppRegistrar {
    client: Client,
    base_url: String,
}

impl EppRegistrar {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    fn receipt(domain_name: &str, body: Value) -> Result<RegistrarReceipt, RegistrarError> {
        match body["code"].as_i64() {
            Some(1000) | Some(1001) => Ok(RegistrarReceipt {
                expires_at: parse_date(&body["ex_date"]),
                reference: body["tr_id"].as_str().map(String::from),
            }),
            Some(code) => {
                let message = body["msg"].as_str().unwrap_or("EPP command failed");
                error!(domain = domain_name, code, message, "EPP command failed");
                Err(rejection(domain_name, format!("{message} (code {code})")))
            }
            None => Err(RegistrarError::InvalidResponse("EppGateway".into())),
        }
    }
}

#[async_trait]
impl DomainRegistrar for EppRegistrar {
    fn kind(&self) -> RegistrarKind {
        RegistrarKind::Epp
    }

    async fn register_domain(&self, request: &RegistrationRequest) -> Result<RegistrarReceipt, RegistrarError> {
        let body = post_json(
            &self.client,
            format!("{}/domains", self.base_url),
            json!({
                "name": request.domain_name,
                "period": request.years,
                "registrant": request.contacts.registrant,
                "contacts": {
                    "admin": request.contacts.admin,
                    "tech": request.contacts.tech,
                    "billing": request.contacts.billing,
                },
            }),
            "EppGateway",
        )
        .await?;

        let receipt = Self::receipt(&request.domain_name, body)?;
        info!(domain = request.domain_name, registrar = "epp", "Domain registered");
        Ok(receipt)
    }

    async fn renew_domain(&self, request: &RenewalRequest) -> Result<RegistrarReceipt, RegistrarError> {
        let body = post_json(
            &self.client,
            format!("{}/domains/{}/renew", self.base_url, request.domain_name),
            json!({
                "period": request.years,
                "cur_exp_date": request.current_expiry.map(|d| d.date_naive().to_string()),
            }),
            "EppGateway",
        )
        .await?;

        Self::receipt(&request.domain_name, body)
    }
}

/// One client per registrar, picked by [`RegistrarKind`].
#[derive(Clone)]
pub struct Registrars {
    namecheap: Arc<dyn DomainRegistrar>,
    epp: Arc<dyn DomainRegistrar>,
}

impl Registrars {
    pub fn new(namecheap: Arc<dyn DomainRegistrar>, epp: Arc<dyn DomainRegistrar>) -> Self {
        Self { namecheap, epp }
    }

    pub fn from_urls(client: Client, urls: &ApiUrls) -> Self {
        Self::new(
            Arc::new(NamecheapRegistrar::new(client.clone(), urls.namecheap_gateway_url.clone())),
            Arc::new(EppRegistrar::new(client, urls.epp_gateway_url.clone())),
        )
    }

    pub fn get(&self, kind: RegistrarKind) -> Arc<dyn DomainRegistrar> {
        match kind {
            RegistrarKind::Namecheap => self.namecheap.clone(),
            RegistrarKind::Epp => self.epp.clone(),
        }
    }

    pub fn for_registration(&self, domain_name: &str) -> Arc<dyn DomainRegistrar> {
        self.get(RegistrarKind::for_domain(domain_name))
    }

    /// Registrar holding an existing domain, by its stored registrar name.
    pub fn for_stored(&self, registrar: &str) -> Result<Arc<dyn DomainRegistrar>, RegistrarError> {
        Ok(self.get(registrar.parse()?))
    }
}
