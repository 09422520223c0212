//! Persistence seams for the grading, promotion and settlement services.
//!
//! Every write that decides a state transition is conditional: it names the
//! state the caller read, and reports `false` when another writer got there
//! first. Services turn a `false` into a re-read, then into
//! [`crate::error::CoreError::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Attempt, AttemptStatus, Course, GatewayStatus, Payment, PaymentCompletion, PaymentStatus,
    Promotion, PromotionUsage, Question, Quiz, QuizStatus, SettlementEffect, User,
};

pub mod memory;
pub mod mongo;
pub mod sms_codes;

pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use sms_codes::{CodeCheck, MemorySmsCodeStore, RedisSmsCodeStore, SmsCodeStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Unique key already taken
    Duplicate,
}

#[async_trait]
pub trait QuizStore: Send + Sync {
    async fn find_quiz(&self, quiz_id: &str) -> anyhow::Result<Option<Quiz>>;

    async fn find_questions(&self, question_ids: &[String]) -> anyhow::Result<Vec<Question>>;

    async fn find_question(&self, question_id: &str) -> anyhow::Result<Option<Question>>;

    /// Moves the quiz to `next` only if its status is one of `expected`.
    async fn set_quiz_status(
        &self,
        quiz_id: &str,
        expected: &[QuizStatus],
        next: QuizStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn find_attempt(&self, attempt_id: &str) -> anyhow::Result<Option<Attempt>>;

    async fn count_attempts(&self, user_id: &str, quiz_id: &str) -> anyhow::Result<u32>;

    /// Fails with `Duplicate` when (user, quiz, attempt number) is already taken.
    async fn insert_attempt(&self, attempt: &Attempt) -> anyhow::Result<InsertOutcome>;

    /// Replaces the stored attempt if it still has `expected_status` and `expected_revision`.
    async fn replace_attempt_if(
        &self,
        attempt: &Attempt,
        expected_status: AttemptStatus,
        expected_revision: i64,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait PromotionStore: Send + Sync {
    async fn find_promotion(&self, code: &str) -> anyhow::Result<Option<Promotion>>;

    /// Appends `usage` and bumps the use counter in one write, only while the
    /// promotion is active, below its total quota and below the per-user limit.
    async fn record_usage_guarded(&self, code: &str, usage: &PromotionUsage)
        -> anyhow::Result<bool>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn find_payment(&self, payment_id: &str) -> anyhow::Result<Option<Payment>>;

    async fn find_by_transaction_id(&self, transaction_id: &str)
        -> anyhow::Result<Option<Payment>>;

    /// Latest pending payment for the same user, target and amount created after `since`.
    async fn find_recent_pending(
        &self,
        user_id: &str,
        target_ref: &str,
        original_amount: f64,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Option<Payment>>;

    async fn insert_payment(&self, payment: &Payment) -> anyhow::Result<()>;

    async fn attach_gateway_order(
        &self,
        payment_id: &str,
        transaction_id: &str,
        payment_target: &str,
    ) -> anyhow::Result<bool>;

    /// Stores the webhook status on a pending payment, moving it to `next` when given.
    async fn record_gateway_status(
        &self,
        payment_id: &str,
        status: GatewayStatus,
        next: Option<PaymentStatus>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn mark_sms_verified(&self, payment_id: &str, now: DateTime<Utc>)
        -> anyhow::Result<bool>;

    /// Completes a pending, SMS-verified payment and applies `effect` as one unit.
    /// Returns `false` without touching anything if the payment is no longer pending.
    async fn settle(
        &self,
        payment_id: &str,
        completion: &PaymentCompletion,
        effect: &SettlementEffect,
    ) -> anyhow::Result<bool>;

    async fn transition_status(
        &self,
        payment_id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        refund_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_user(&self, user_id: &str) -> anyhow::Result<Option<User>>;

    async fn find_course(&self, course_id: &str) -> anyhow::Result<Option<Course>>;
}
