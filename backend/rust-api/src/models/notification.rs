use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::account::{MembershipLevel, UserRole};
use super::payment::BusinessType;

/// Recipient of a best-effort notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTarget {
    User(String),
    Role(UserRole),
    Topic(String),
}

impl NotifyTarget {
    /// Pub/sub channel the event is published on.
    pub fn channel(&self) -> String {
        match self {
            NotifyTarget::User(user_id) => format!("notifications:user:{}", user_id),
            NotifyTarget::Role(role) => format!("notifications:role:{}", role.as_str()),
            NotifyTarget::Topic(topic) => format!("notifications:topic:{}", topic),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    AttemptTimedOut {
        attempt_id: String,
        quiz_id: String,
    },
    AttemptGraded {
        attempt_id: String,
        score: f64,
        passed: bool,
    },
    EnrollmentGranted {
        payment_id: String,
        course_id: String,
    },
    MembershipActivated {
        payment_id: String,
        level: MembershipLevel,
        expires_at: DateTime<Utc>,
    },
    PaymentCompleted {
        payment_id: String,
        user_id: String,
        amount: f64,
        business_type: BusinessType,
    },
    PaymentFailed {
        payment_id: String,
    },
    PaymentSmsCode {
        payment_id: String,
        code: String,
    },
    ReferralRewardEarned {
        code: String,
        referred_user_id: String,
        reward: f64,
    },
}

impl NotificationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NotificationEvent::AttemptTimedOut { .. } => "attempt_timed_out",
            NotificationEvent::AttemptGraded { .. } => "attempt_graded",
            NotificationEvent::EnrollmentGranted { .. } => "enrollment_granted",
            NotificationEvent::MembershipActivated { .. } => "membership_activated",
            NotificationEvent::PaymentCompleted { .. } => "payment_completed",
            NotificationEvent::PaymentFailed { .. } => "payment_failed",
            NotificationEvent::PaymentSmsCode { .. } => "payment_sms_code",
            NotificationEvent::ReferralRewardEarned { .. } => "referral_reward_earned",
        }
    }
}
