use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{
    AccountStore, AttemptStore, InsertOutcome, PaymentStore, PromotionStore, QuizStore,
};
use crate::models::{
    Attempt, AttemptStatus, Course, GatewayStatus, Payment, PaymentCompletion, PaymentStatus,
    Promotion, PromotionUsage, Question, Quiz, QuizStatus, SettlementEffect, User,
};
use crate::promotions;

#[derive(Default)]
struct Collections {
    quizzes: HashMap<String, Quiz>,
    questions: HashMap<String, Question>,
    attempts: HashMap<String, Attempt>,
    promotions: HashMap<String, Promotion>,
    payments: HashMap<String, Payment>,
    users: HashMap<String, User>,
    courses: HashMap<String, Course>,
}

/// Process-local store behind one lock. Every conditional write checks and
/// mutates under the same guard, matching the Mongo filters.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_quiz(&self, quiz: Quiz) {
        self.inner.lock().await.quizzes.insert(quiz.id.clone(), quiz);
    }

    pub async fn insert_question(&self, question: Question) {
        self.inner
            .lock()
            .await
            .questions
            .insert(question.id.clone(), question);
    }

    pub async fn insert_promotion(&self, promotion: Promotion) {
        self.inner
            .lock()
            .await
            .promotions
            .insert(promotion.code.clone(), promotion);
    }

    pub async fn insert_user(&self, user: User) {
        self.inner.lock().await.users.insert(user.id.clone(), user);
    }

    pub async fn insert_course(&self, course: Course) {
        self.inner
            .lock()
            .await
            .courses
            .insert(course.id.clone(), course);
    }

    pub async fn put_payment(&self, payment: Payment) {
        self.inner
            .lock()
            .await
            .payments
            .insert(payment.id.clone(), payment);
    }

    pub async fn put_attempt(&self, attempt: Attempt) {
        self.inner
            .lock()
            .await
            .attempts
            .insert(attempt.id.clone(), attempt);
    }
}

#[async_trait]
impl QuizStore for MemoryStore {
    async fn find_quiz(&self, quiz_id: &str) -> Result<Option<Quiz>> {
        Ok(self.inner.lock().await.quizzes.get(quiz_id).cloned())
    }

    async fn find_questions(&self, question_ids: &[String]) -> Result<Vec<Question>> {
        let guard = self.inner.lock().await;
        Ok(question_ids
            .iter()
            .filter_map(|id| guard.questions.get(id).cloned())
            .collect())
    }

    async fn find_question(&self, question_id: &str) -> Result<Option<Question>> {
        Ok(self.inner.lock().await.questions.get(question_id).cloned())
    }

    async fn set_quiz_status(
        &self,
        quiz_id: &str,
        expected: &[QuizStatus],
        next: QuizStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        match guard.quizzes.get_mut(quiz_id) {
            Some(quiz) if expected.contains(&quiz.status) => {
                quiz.status = next;
                quiz.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn find_attempt(&self, attempt_id: &str) -> Result<Option<Attempt>> {
        Ok(self.inner.lock().await.attempts.get(attempt_id).cloned())
    }

    async fn count_attempts(&self, user_id: &str, quiz_id: &str) -> Result<u32> {
        let guard = self.inner.lock().await;
        Ok(guard
            .attempts
            .values()
            .filter(|a| a.user_id == user_id && a.quiz_id == quiz_id)
            .count() as u32)
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<InsertOutcome> {
        let mut guard = self.inner.lock().await;
        let taken = guard.attempts.values().any(|a| {
            a.id == attempt.id
                || (a.user_id == attempt.user_id
                    && a.quiz_id == attempt.quiz_id
                    && a.attempt_number == attempt.attempt_number)
        });
        if taken {
            return Ok(InsertOutcome::Duplicate);
        }
        guard.attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn replace_attempt_if(
        &self,
        attempt: &Attempt,
        expected_status: AttemptStatus,
        expected_revision: i64,
    ) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        match guard.attempts.get_mut(&attempt.id) {
            Some(stored)
                if stored.status == expected_status && stored.revision == expected_revision =>
            {
                *stored = attempt.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl PromotionStore for MemoryStore {
    async fn find_promotion(&self, code: &str) -> Result<Option<Promotion>> {
        Ok(self.inner.lock().await.promotions.get(code).cloned())
    }

    async fn record_usage_guarded(&self, code: &str, usage: &PromotionUsage) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let Some(promotion) = guard.promotions.get_mut(code) else {
            return Ok(false);
        };

        if !promotions::is_valid(promotion, usage.used_at)
            || !promotions::has_user_quota(promotion, &usage.user_id)
        {
            return Ok(false);
        }

        promotion.used_by.push(usage.clone());
        promotion.current_uses += 1;
        promotion.updated_at = usage.used_at;
        Ok(true)
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn find_payment(&self, payment_id: &str) -> Result<Option<Payment>> {
        Ok(self.inner.lock().await.payments.get(payment_id).cloned())
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Payment>> {
        let guard = self.inner.lock().await;
        Ok(guard
            .payments
            .values()
            .find(|p| p.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    async fn find_recent_pending(
        &self,
        user_id: &str,
        target_ref: &str,
        original_amount: f64,
        since: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let guard = self.inner.lock().await;
        Ok(guard
            .payments
            .values()
            .filter(|p| {
                p.user_id == user_id
                    && p.target_ref == target_ref
                    && p.original_amount == original_amount
                    && p.status == PaymentStatus::Pending
                    && p.created_at >= since
            })
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.payments.contains_key(&payment.id) {
            anyhow::bail!("Payment {} already exists", payment.id);
        }
        guard.payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn attach_gateway_order(
        &self,
        payment_id: &str,
        transaction_id: &str,
        payment_target: &str,
    ) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let taken = guard
            .payments
            .values()
            .any(|p| p.id != payment_id && p.transaction_id.as_deref() == Some(transaction_id));
        if taken {
            anyhow::bail!("Transaction id {} already in use", transaction_id);
        }
        match guard.payments.get_mut(payment_id) {
            Some(p) if p.status == PaymentStatus::Pending => {
                p.transaction_id = Some(transaction_id.to_string());
                p.payment_target = Some(payment_target.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_gateway_status(
        &self,
        payment_id: &str,
        status: GatewayStatus,
        next: Option<PaymentStatus>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        match guard.payments.get_mut(payment_id) {
            Some(p) if p.status == PaymentStatus::Pending => {
                p.gateway_status = Some(status);
                if let Some(next) = next {
                    p.status = next;
                }
                p.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_sms_verified(&self, payment_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        match guard.payments.get_mut(payment_id) {
            Some(p) if p.status == PaymentStatus::Pending => {
                p.sms_verified = true;
                p.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn settle(
        &self,
        payment_id: &str,
        completion: &PaymentCompletion,
        effect: &SettlementEffect,
    ) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let data = &mut *guard;

        let settleable = data
            .payments
            .get(payment_id)
            .map(|p| p.status == PaymentStatus::Pending && p.sms_verified)
            .unwrap_or(false);
        if !settleable {
            return Ok(false);
        }

        // Nothing is written unless the effect target exists.
        let user_id = match effect {
            SettlementEffect::Enroll { user_id, .. } | SettlementEffect::Membership { user_id, .. } => {
                Some(user_id)
            }
            SettlementEffect::None => None,
        };
        if let Some(user_id) = user_id {
            if !data.users.contains_key(user_id) {
                anyhow::bail!("User {} disappeared during settlement", user_id);
            }
        }

        let at = completion.completed_at;
        match effect {
            SettlementEffect::Enroll { user_id, course_id } => {
                if let Some(user) = data.users.get_mut(user_id) {
                    if !user.enrolled_courses.contains(course_id) {
                        user.enrolled_courses.push(course_id.clone());
                    }
                    user.updated_at = at;
                }
                if let Some(course) = data.courses.get_mut(course_id) {
                    if !course.enrollment_payment_ids.iter().any(|id| id == payment_id) {
                        course.enrollment_payment_ids.push(payment_id.to_string());
                        course.enrollment_count += 1;
                        course.updated_at = at;
                    }
                }
            }
            SettlementEffect::Membership {
                user_id,
                level,
                expires_at,
            } => {
                if let Some(user) = data.users.get_mut(user_id) {
                    user.membership_level = *level;
                    user.membership_expiry = Some(*expires_at);
                    user.membership_payment_id = Some(payment_id.to_string());
                    user.updated_at = at;
                }
            }
            SettlementEffect::None => {}
        }

        if let Some(payment) = data.payments.get_mut(payment_id) {
            payment.apply_completion(completion);
        }
        Ok(true)
    }

    async fn transition_status(
        &self,
        payment_id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        refund_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        match guard.payments.get_mut(payment_id) {
            Some(p) if p.status == from => {
                p.status = to;
                if let Some(reason) = refund_reason {
                    p.refund_reason = Some(reason.to_string());
                }
                p.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.inner.lock().await.users.get(user_id).cloned())
    }

    async fn find_course(&self, course_id: &str) -> Result<Option<Course>> {
        Ok(self.inner.lock().await.courses.get(course_id).cloned())
    }
}
