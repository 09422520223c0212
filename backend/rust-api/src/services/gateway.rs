use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::config::PaymentGatewayConfig;
use crate::models::PaymentMethod;
use crate::utils::retry::{retry_with_config, RetryConfig};

type HmacSha256 = Hmac<Sha256>;

/// Order created on the gateway side for a pending payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub external_payment_id: String,
    /// QR code content or redirect URL shown to the payer
    pub payment_target: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(
        &self,
        method: PaymentMethod,
        amount: f64,
        reference: &str,
    ) -> Result<GatewayOrder>;
}

/// Picks the HTTP gateway when a base URL is configured, the simulated one otherwise.
pub fn gateway_from_config(config: &PaymentGatewayConfig) -> Result<Arc<dyn PaymentGateway>> {
    match &config.base_url {
        Some(base_url) => {
            tracing::info!("Using HTTP payment gateway at {}", base_url);
            Ok(Arc::new(HttpGateway::new(config)?))
        }
        None => {
            tracing::info!("PAYMENT_GATEWAY_URL not set, using simulated gateway");
            Ok(Arc::new(SimulatedGateway::new(config)))
        }
    }
}

fn sign(secret: &str, payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid signing key: {}", e))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn format_amount(amount: f64) -> String {
    format!("{:.2}", amount)
}

/// WeChat/Alipay stand-in: builds signed payment URLs locally, no network.
pub struct SimulatedGateway {
    merchant_id: String,
    signing_secret: String,
    notify_url: String,
}

impl SimulatedGateway {
    pub fn new(config: &PaymentGatewayConfig) -> Self {
        Self {
            merchant_id: config.merchant_id.clone(),
            signing_secret: config.signing_secret.clone(),
            notify_url: config.notify_url.clone(),
        }
    }

    fn base_for(method: PaymentMethod) -> (&'static str, &'static str) {
        match method {
            PaymentMethod::Wechat => (
                "WX",
                "https://wx.tenpay.com/cgi-bin/mmpayweb-bin/checkmweb",
            ),
            PaymentMethod::Alipay => ("AL", "https://openapi.alipay.com/gateway.do"),
            PaymentMethod::BankTransfer | PaymentMethod::Other => {
                ("MN", "https://pay.local/checkout")
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_payment(
        &self,
        method: PaymentMethod,
        amount: f64,
        reference: &str,
    ) -> Result<GatewayOrder> {
        let (prefix, base) = Self::base_for(method);
        let external_payment_id = format!("{}{}", prefix, Uuid::new_v4().simple()).to_uppercase();
        let total_amount = format_amount(amount);

        // Signed fields in lexicographic order
        let canonical = format!(
            "merchant_id={}&notify_url={}&out_trade_no={}&reference={}&total_amount={}",
            self.merchant_id, self.notify_url, external_payment_id, reference, total_amount
        );
        let signature = sign(&self.signing_secret, &canonical)?;

        let url = Url::parse_with_params(
            base,
            &[
                ("merchant_id", self.merchant_id.as_str()),
                ("notify_url", self.notify_url.as_str()),
                ("out_trade_no", external_payment_id.as_str()),
                ("reference", reference),
                ("total_amount", total_amount.as_str()),
                ("sign", signature.as_str()),
            ],
        )
        .context("Failed to build simulated payment URL")?;

        tracing::info!(
            "Simulated {} order created: out_trade_no={}, amount={}",
            method.as_str(),
            external_payment_id,
            total_amount
        );

        Ok(GatewayOrder {
            external_payment_id,
            payment_target: url.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    merchant_id: &'a str,
    method: &'a str,
    total_amount: String,
    reference: &'a str,
    notify_url: &'a str,
}

#[derive(Debug, thiserror::Error)]
enum OrderError {
    #[error("payment gateway unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("payment gateway returned status {0}")]
    Status(reqwest::StatusCode),
}

impl OrderError {
    /// Network failures, 5xx and 429 are worth another try; other statuses are final.
    fn is_transient(&self) -> bool {
        match self {
            OrderError::Transport(e) => !e.is_decode(),
            OrderError::Status(status) => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    order_id: String,
    payment_url: String,
}

/// Client for an external gateway speaking JSON over HTTP, with HMAC-signed bodies.
pub struct HttpGateway {
    client: Client,
    endpoint: Url,
    merchant_id: String,
    signing_secret: String,
    notify_url: String,
}

impl HttpGateway {
    pub fn new(config: &PaymentGatewayConfig) -> Result<Self> {
        let base = config
            .base_url
            .as_deref()
            .context("Payment gateway base URL is not configured")?;
        let endpoint = Url::parse(base)
            .and_then(|url| url.join("v1/orders"))
            .context("Invalid payment gateway URL")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build payment gateway HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            merchant_id: config.merchant_id.clone(),
            signing_secret: config.signing_secret.clone(),
            notify_url: config.notify_url.clone(),
        })
    }

    async fn post_order(&self, body: &str, signature: &str) -> Result<GatewayOrder, OrderError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header("X-Merchant-Id", &self.merchant_id)
            .header("X-Signature", signature)
            .body(body.to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::warn!("Payment gateway returned status {}", response.status());
            return Err(OrderError::Status(response.status()));
        }

        let order: CreateOrderResponse = response.json().await?;

        Ok(GatewayOrder {
            external_payment_id: order.order_id,
            payment_target: order.payment_url,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_payment(
        &self,
        method: PaymentMethod,
        amount: f64,
        reference: &str,
    ) -> Result<GatewayOrder> {
        let request = CreateOrderRequest {
            merchant_id: &self.merchant_id,
            method: method.as_str(),
            total_amount: format_amount(amount),
            reference,
            notify_url: &self.notify_url,
        };
        let body = serde_json::to_string(&request).context("Failed to encode gateway order")?;
        let signature = sign(&self.signing_secret, &body)?;

        let order = retry_with_config(
            RetryConfig::gateway(),
            || self.post_order(&body, &signature),
            OrderError::is_transient,
        )
        .await
        .context("Failed to create gateway order")?;

        tracing::info!(
            "Gateway order created: order_id={}, reference={}",
            order.external_payment_id,
            reference
        );
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PaymentGatewayConfig {
        PaymentGatewayConfig {
            base_url: None,
            merchant_id: "m-1".to_string(),
            signing_secret: "secret".to_string(),
            notify_url: "http://localhost/webhook".to_string(),
        }
    }

    #[tokio::test]
    async fn simulated_order_carries_signature_and_reference() {
        let gateway = SimulatedGateway::new(&config());
        let order = gateway
            .create_payment(PaymentMethod::Alipay, 75.0, "pay-1")
            .await
            .unwrap();

        assert!(order.external_payment_id.starts_with("AL"));
        let url = Url::parse(&order.payment_target).unwrap();
        assert_eq!(url.host_str(), Some("openapi.alipay.com"));

        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["total_amount"], "75.00");
        assert_eq!(params["reference"], "pay-1");

        let canonical = format!(
            "merchant_id=m-1&notify_url=http://localhost/webhook&out_trade_no={}&reference=pay-1&total_amount=75.00",
            order.external_payment_id
        );
        assert_eq!(params["sign"], sign("secret", &canonical).unwrap());
    }

    #[tokio::test]
    async fn simulated_orders_get_distinct_ids() {
        let gateway = SimulatedGateway::new(&config());
        let a = gateway.create_payment(PaymentMethod::Wechat, 10.0, "p").await.unwrap();
        let b = gateway.create_payment(PaymentMethod::Wechat, 10.0, "p").await.unwrap();
        assert_ne!(a.external_payment_id, b.external_payment_id);
    }

    #[test]
    fn only_transient_gateway_statuses_are_retried() {
        assert!(OrderError::Status(reqwest::StatusCode::BAD_GATEWAY).is_transient());
        assert!(OrderError::Status(reqwest::StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!OrderError::Status(reqwest::StatusCode::BAD_REQUEST).is_transient());
        assert!(!OrderError::Status(reqwest::StatusCode::UNAUTHORIZED).is_transient());
    }

    #[test]
    fn http_gateway_requires_valid_url() {
        let mut cfg = config();
        cfg.base_url = Some("not a url".to_string());
        assert!(HttpGateway::new(&cfg).is_err());

        cfg.base_url = Some("https://gateway.example.com/".to_string());
        let gateway = HttpGateway::new(&cfg).unwrap();
        assert_eq!(gateway.endpoint.as_str(), "https://gateway.example.com/v1/orders");
    }
}
