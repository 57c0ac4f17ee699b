pub mod kpay;
pub mod registrars;
pub mod stripe;

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

pub struct ApiUrls {
    pub namecheap_gateway_url: String,
    pub epp_gateway_url: String,
}

impl ApiUrls {
    pub fn init() -> Self {
        Self {
            namecheap_gateway_url: Self::get_namecheap_gateway_url(),
            epp_gateway_url: Self::get_epp_gateway_url(),
        }
    }

    pub fn get_namecheap_gateway_url() -> String {
        std::env::var("NAMECHEAP_GATEWAY_URL")
            .unwrap_or("http://localhost:3000/namecheap-gateway".to_string())
    }

    pub fn get_epp_gateway_url() -> String {
        std::env::var("EPP_GATEWAY_URL").unwrap_or("http://localhost:3000/epp-gateway".to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0} is unreachable")]
    Unreachable(String),

    #[error("{0}")]
    Rejected(String),

    #[error("Unexpected response from {0}")]
    InvalidResponse(String),
}

/// Uniform result of a gateway call, safe to show to the customer.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct GatewayOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub payment_id: Option<i32>,
    pub redirect_url: Option<String>,
    pub status: Option<String>,
}

impl GatewayOutcome {
    pub fn ok(payment_id: i32, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            payment_id: Some(payment_id),
            redirect_url: None,
            status: None,
        }
    }

    pub fn failed(payment_id: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
            payment_id,
            redirect_url: None,
            status: None,
        }
    }

    pub fn with_redirect(mut self, url: Option<String>) -> Self {
        self.redirect_url = url;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}
