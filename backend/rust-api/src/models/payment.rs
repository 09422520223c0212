use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::account::MembershipLevel;
use super::bson_time;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Wechat,
    Alipay,
    BankTransfer,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Wechat => "wechat",
            PaymentMethod::Alipay => "alipay",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusinessType {
    Course,
    Subscription,
    Membership,
    Other,
}

impl BusinessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessType::Course => "course",
            BusinessType::Subscription => "subscription",
            BusinessType::Membership => "membership",
            BusinessType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    /// Forward-only, refund is the single move out of `completed`.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Completed)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Pending, PaymentStatus::Cancelled)
                | (PaymentStatus::Completed, PaymentStatus::Refunded)
        )
    }
}

/// Status reported by the gateway webhook
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Success,
    Failed,
    Cancelled,
}

impl GatewayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayStatus::Success => "success",
            GatewayStatus::Failed => "failed",
            GatewayStatus::Cancelled => "cancelled",
        }
    }

    /// Payment status a pending payment moves to, if any.
    pub fn resulting_status(&self) -> Option<PaymentStatus> {
        match self {
            GatewayStatus::Success => None,
            GatewayStatus::Failed => Some(PaymentStatus::Failed),
            GatewayStatus::Cancelled => Some(PaymentStatus::Cancelled),
        }
    }
}

fn default_currency() -> String {
    "CNY".to_string()
}

/// Payment document stored in the "payments" collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    /// Charged amount, after discount
    pub amount: f64,
    /// Amount before any promotion
    pub original_amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub method: PaymentMethod,
    #[serde(rename = "type")]
    pub business_type: BusinessType,
    pub status: PaymentStatus,
    /// Course id or package id, depending on `business_type`
    pub target_ref: String,
    /// External gateway reference, unique when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub payment_target: Option<String>,
    #[serde(default)]
    pub gateway_status: Option<GatewayStatus>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub sms_verified: bool,
    #[serde(default)]
    pub verified_by: Option<String>,
    #[serde(default, with = "bson_time::optional")]
    pub verification_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub promotion_code: Option<String>,
    #[serde(default)]
    pub discount_amount: f64,
    #[serde(default)]
    pub refund_reason: Option<String>,
    #[serde(default, with = "bson_time::optional")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(with = "bson_time::required")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_time::required")]
    pub updated_at: DateTime<Utc>,
}

/// Who verified a payment and when; written together with the status flip.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentCompletion {
    pub verifier_id: String,
    pub completed_at: DateTime<Utc>,
}

impl Payment {
    pub fn apply_completion(&mut self, completion: &PaymentCompletion) {
        self.status = PaymentStatus::Completed;
        self.verified = true;
        self.verified_by = Some(completion.verifier_id.clone());
        self.verification_time = Some(completion.completed_at);
        self.completed_at = Some(completion.completed_at);
        self.updated_at = completion.completed_at;
    }
}

/// Business side effect applied in the same unit of work as the completion.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementEffect {
    Enroll {
        user_id: String,
        course_id: String,
    },
    Membership {
        user_id: String,
        level: MembershipLevel,
        expires_at: DateTime<Utc>,
    },
    None,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutRequest {
    pub business_type: BusinessType,
    #[validate(length(min = 1, message = "target_ref must not be empty"))]
    pub target_ref: String,
    pub method: PaymentMethod,
    /// Required for membership/subscription; courses are charged their list price
    #[validate(range(exclusive_min = 0.0, message = "amount must be positive"))]
    pub amount: Option<f64>,
    pub promotion_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GatewayNotification {
    pub external_payment_id: String,
    pub status: GatewayStatus,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SmsVerifyRequest {
    #[validate(length(equal = 6, message = "code must have 6 digits"))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    #[validate(length(min = 1, max = 500, message = "reason must be 1-500 characters"))]
    pub reason: String,
}

/// Payment as returned to API clients
#[derive(Debug, Serialize)]
pub struct PaymentView {
    pub id: String,
    pub user_id: String,
    pub amount: f64,
    pub original_amount: f64,
    pub discount_amount: f64,
    pub currency: String,
    pub method: PaymentMethod,
    pub business_type: BusinessType,
    pub status: PaymentStatus,
    pub target_ref: String,
    pub transaction_id: Option<String>,
    pub payment_target: Option<String>,
    pub verified: bool,
    pub sms_verified: bool,
    pub verified_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Payment> for PaymentView {
    fn from(payment: Payment) -> Self {
        PaymentView {
            id: payment.id,
            user_id: payment.user_id,
            amount: payment.amount,
            original_amount: payment.original_amount,
            discount_amount: payment.discount_amount,
            currency: payment.currency,
            method: payment.method,
            business_type: payment.business_type,
            status: payment.status,
            target_ref: payment.target_ref,
            transaction_id: payment.transaction_id,
            payment_target: payment.payment_target,
            verified: payment.verified,
            sms_verified: payment.sms_verified,
            verified_by: payment.verified_by,
            completed_at: payment.completed_at,
            created_at: payment.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Completed));
        assert!(PaymentStatus::Completed.can_transition_to(PaymentStatus::Refunded));
        assert!(!PaymentStatus::Completed.can_transition_to(PaymentStatus::Pending));
        assert!(!PaymentStatus::Completed.can_transition_to(PaymentStatus::Completed));
        assert!(!PaymentStatus::Failed.can_transition_to(PaymentStatus::Completed));
        assert!(!PaymentStatus::Refunded.can_transition_to(PaymentStatus::Completed));
    }
}
