use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};

use super::{
    AccountStore, AttemptStore, InsertOutcome, PaymentStore, PromotionStore, QuizStore,
};
use crate::models::{
    Attempt, AttemptStatus, Course, GatewayStatus, Payment, PaymentCompletion, PaymentStatus,
    Promotion, PromotionUsage, Question, Quiz, QuizStatus, SettlementEffect, User,
};
use crate::models::bson_time::to_bson_date;

const QUIZZES: &str = "quizzes";
const QUESTIONS: &str = "questions";
const ATTEMPTS: &str = "quiz_attempts";
const PROMOTIONS: &str = "promotions";
const PAYMENTS: &str = "payments";
const USERS: &str = "users";
const COURSES: &str = "courses";

/// MongoDB-backed store. Settlement needs a replica set for transactions.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    pub fn new(client: Client, db: Database) -> Self {
        Self { client, db }
    }

    fn quizzes(&self) -> Collection<Quiz> {
        self.db.collection(QUIZZES)
    }

    fn questions(&self) -> Collection<Question> {
        self.db.collection(QUESTIONS)
    }

    fn attempts(&self) -> Collection<Attempt> {
        self.db.collection(ATTEMPTS)
    }

    fn promotions(&self) -> Collection<Promotion> {
        self.db.collection(PROMOTIONS)
    }

    fn payments(&self) -> Collection<Payment> {
        self.db.collection(PAYMENTS)
    }

    /// Creates the unique indexes the conditional writes rely on.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.attempts()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "quiz_id": 1, "attempt_number": 1 })
                    .options(unique())
                    .build(),
            )
            .await
            .context("Failed to create attempt number index")?;

        self.promotions()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "code": 1 })
                    .options(unique())
                    .build(),
            )
            .await
            .context("Failed to create promotion code index")?;

        self.payments()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "transaction_id": 1 })
                    .options(IndexOptions::builder().unique(true).sparse(true).build())
                    .build(),
            )
            .await
            .context("Failed to create payment transaction index")?;

        self.payments()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "target_ref": 1, "created_at": -1 })
                    .build(),
            )
            .await
            .context("Failed to create payment lookup index")?;

        tracing::info!("MongoDB indexes ensured");
        Ok(())
    }

    async fn settle_in_session(
        &self,
        session: &mut ClientSession,
        payment_id: &str,
        completion: &PaymentCompletion,
        effect: &SettlementEffect,
    ) -> Result<bool> {
        let completed_at = to_bson_date(completion.completed_at);

        let flipped = self
            .payments()
            .update_one(
                doc! {
                    "_id": payment_id,
                    "status": PaymentStatus::Pending.as_str(),
                    "sms_verified": true,
                },
                doc! {
                    "$set": {
                        "status": PaymentStatus::Completed.as_str(),
                        "verified": true,
                        "verified_by": &completion.verifier_id,
                        "verification_time": completed_at,
                        "completed_at": completed_at,
                        "updated_at": completed_at,
                    }
                },
            )
            .session(&mut *session)
            .await
            .context("Failed to flip payment to completed")?;

        if flipped.matched_count == 0 {
            return Ok(false);
        }

        let users: Collection<Document> = self.db.collection(USERS);
        match effect {
            SettlementEffect::Enroll { user_id, course_id } => {
                let user = users
                    .update_one(
                        doc! { "_id": user_id },
                        doc! {
                            "$addToSet": { "enrolled_courses": course_id },
                            "$set": { "updated_at": completed_at },
                        },
                    )
                    .session(&mut *session)
                    .await
                    .context("Failed to enroll user")?;
                if user.matched_count == 0 {
                    anyhow::bail!("User {} disappeared during settlement", user_id);
                }

                let courses: Collection<Document> = self.db.collection(COURSES);
                courses
                    .update_one(
                        doc! { "_id": course_id, "enrollment_payment_ids": { "$ne": payment_id } },
                        doc! {
                            "$addToSet": { "enrollment_payment_ids": payment_id },
                            "$inc": { "enrollment_count": 1_i64 },
                            "$set": { "updated_at": completed_at },
                        },
                    )
                    .session(&mut *session)
                    .await
                    .context("Failed to increment course enrollment")?;
            }
            SettlementEffect::Membership {
                user_id,
                level,
                expires_at,
            } => {
                let user = users
                    .update_one(
                        doc! { "_id": user_id },
                        doc! {
                            "$set": {
                                "membership_level": level.as_str(),
                                "membership_expiry": to_bson_date(*expires_at),
                                "membership_payment_id": payment_id,
                                "updated_at": completed_at,
                            }
                        },
                    )
                    .session(&mut *session)
                    .await
                    .context("Failed to activate membership")?;
                if user.matched_count == 0 {
                    anyhow::bail!("User {} disappeared during settlement", user_id);
                }
            }
            SettlementEffect::None => {}
        }

        Ok(true)
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    if let mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref we)) =
        *err.kind
    {
        return we.code == 11000;
    }
    false
}

#[async_trait]
impl QuizStore for MongoStore {
    async fn find_quiz(&self, quiz_id: &str) -> Result<Option<Quiz>> {
        self.quizzes()
            .find_one(doc! { "_id": quiz_id })
            .await
            .context("Failed to load quiz")
    }

    async fn find_questions(&self, question_ids: &[String]) -> Result<Vec<Question>> {
        let cursor = self
            .questions()
            .find(doc! { "_id": { "$in": question_ids } })
            .await
            .context("Failed to query questions")?;
        cursor
            .try_collect()
            .await
            .context("Failed to read questions")
    }

    async fn find_question(&self, question_id: &str) -> Result<Option<Question>> {
        self.questions()
            .find_one(doc! { "_id": question_id })
            .await
            .context("Failed to load question")
    }

    async fn set_quiz_status(
        &self,
        quiz_id: &str,
        expected: &[QuizStatus],
        next: QuizStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let expected: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
        let result = self
            .quizzes()
            .update_one(
                doc! { "_id": quiz_id, "status": { "$in": expected } },
                doc! { "$set": { "status": next.as_str(), "updated_at": to_bson_date(now) } },
            )
            .await
            .context("Failed to update quiz status")?;
        Ok(result.matched_count == 1)
    }
}

#[async_trait]
impl AttemptStore for MongoStore {
    async fn find_attempt(&self, attempt_id: &str) -> Result<Option<Attempt>> {
        self.attempts()
            .find_one(doc! { "_id": attempt_id })
            .await
            .context("Failed to load attempt")
    }

    async fn count_attempts(&self, user_id: &str, quiz_id: &str) -> Result<u32> {
        let count = self
            .attempts()
            .count_documents(doc! { "user_id": user_id, "quiz_id": quiz_id })
            .await
            .context("Failed to count attempts")?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<InsertOutcome> {
        match self.attempts().insert_one(attempt).await {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_duplicate_key(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert attempt")),
        }
    }

    async fn replace_attempt_if(
        &self,
        attempt: &Attempt,
        expected_status: AttemptStatus,
        expected_revision: i64,
    ) -> Result<bool> {
        let result = self
            .attempts()
            .replace_one(
                doc! {
                    "_id": &attempt.id,
                    "status": expected_status.as_str(),
                    "revision": expected_revision,
                },
                attempt,
            )
            .await
            .context("Failed to replace attempt")?;
        Ok(result.matched_count == 1)
    }
}

#[async_trait]
impl PromotionStore for MongoStore {
    async fn find_promotion(&self, code: &str) -> Result<Option<Promotion>> {
        self.promotions()
            .find_one(doc! { "code": code })
            .await
            .context("Failed to load promotion")
    }

    async fn record_usage_guarded(&self, code: &str, usage: &PromotionUsage) -> Result<bool> {
        let used_at = to_bson_date(usage.used_at);
        let entry = bson::to_bson(usage).context("Failed to encode promotion usage")?;

        let filter = doc! {
            "code": code,
            "is_active": true,
            "start_date": { "$lte": used_at },
            "$or": [
                { "end_date": null },
                { "end_date": { "$gte": used_at } },
            ],
            "$expr": {
                "$and": [
                    { "$lt": [
                        { "$size": {
                            "$filter": {
                                "input": { "$ifNull": ["$used_by", []] },
                                "as": "u",
                                "cond": { "$eq": ["$$u.user_id", &usage.user_id] },
                            }
                        } },
                        "$limit_per_user",
                    ] },
                    { "$or": [
                        { "$eq": ["$max_uses", 0] },
                        { "$lt": ["$current_uses", "$max_uses"] },
                    ] },
                ]
            },
        };

        let result = self
            .promotions()
            .update_one(
                filter,
                doc! {
                    "$push": { "used_by": entry },
                    "$inc": { "current_uses": 1 },
                    "$set": { "updated_at": used_at },
                },
            )
            .await
            .context("Failed to record promotion usage")?;

        Ok(result.modified_count == 1)
    }
}

#[async_trait]
impl PaymentStore for MongoStore {
    async fn find_payment(&self, payment_id: &str) -> Result<Option<Payment>> {
        self.payments()
            .find_one(doc! { "_id": payment_id })
            .await
            .context("Failed to load payment")
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<Payment>> {
        self.payments()
            .find_one(doc! { "transaction_id": transaction_id })
            .await
            .context("Failed to load payment by transaction id")
    }

    async fn find_recent_pending(
        &self,
        user_id: &str,
        target_ref: &str,
        original_amount: f64,
        since: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        self.payments()
            .find_one(doc! {
                "user_id": user_id,
                "target_ref": target_ref,
                "original_amount": original_amount,
                "status": PaymentStatus::Pending.as_str(),
                "created_at": { "$gte": to_bson_date(since) },
            })
            .sort(doc! { "created_at": -1 })
            .await
            .context("Failed to look up recent payments")
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        self.payments()
            .insert_one(payment)
            .await
            .context("Failed to insert payment")?;
        Ok(())
    }

    async fn attach_gateway_order(
        &self,
        payment_id: &str,
        transaction_id: &str,
        payment_target: &str,
    ) -> Result<bool> {
        let result = self
            .payments()
            .update_one(
                doc! { "_id": payment_id, "status": PaymentStatus::Pending.as_str() },
                doc! { "$set": {
                    "transaction_id": transaction_id,
                    "payment_target": payment_target,
                } },
            )
            .await
            .context("Failed to attach gateway order")?;
        Ok(result.matched_count == 1)
    }

    async fn record_gateway_status(
        &self,
        payment_id: &str,
        status: GatewayStatus,
        next: Option<PaymentStatus>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut set = doc! {
            "gateway_status": status.as_str(),
            "updated_at": to_bson_date(now),
        };
        if let Some(next) = next {
            set.insert("status", next.as_str());
        }

        let result = self
            .payments()
            .update_one(
                doc! { "_id": payment_id, "status": PaymentStatus::Pending.as_str() },
                doc! { "$set": set },
            )
            .await
            .context("Failed to record gateway status")?;
        Ok(result.matched_count == 1)
    }

    async fn mark_sms_verified(&self, payment_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = self
            .payments()
            .update_one(
                doc! { "_id": payment_id, "status": PaymentStatus::Pending.as_str() },
                doc! { "$set": { "sms_verified": true, "updated_at": to_bson_date(now) } },
            )
            .await
            .context("Failed to mark payment SMS-verified")?;
        Ok(result.matched_count == 1)
    }

    async fn settle(
        &self,
        payment_id: &str,
        completion: &PaymentCompletion,
        effect: &SettlementEffect,
    ) -> Result<bool> {
        let mut session = self
            .client
            .start_session()
            .await
            .context("Failed to start settlement session")?;
        session
            .start_transaction()
            .await
            .context("Failed to start settlement transaction")?;

        match self
            .settle_in_session(&mut session, payment_id, completion, effect)
            .await
        {
            Ok(true) => {
                session
                    .commit_transaction()
                    .await
                    .context("Failed to commit settlement")?;
                Ok(true)
            }
            Ok(false) => {
                session.abort_transaction().await.ok();
                Ok(false)
            }
            Err(e) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    tracing::warn!("Failed to abort settlement transaction: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    async fn transition_status(
        &self,
        payment_id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        refund_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut set = doc! { "status": to.as_str(), "updated_at": to_bson_date(now) };
        if let Some(reason) = refund_reason {
            set.insert("refund_reason", reason);
        }

        let result = self
            .payments()
            .update_one(
                doc! { "_id": payment_id, "status": from.as_str() },
                doc! { "$set": set },
            )
            .await
            .context("Failed to update payment status")?;
        Ok(result.matched_count == 1)
    }
}

#[async_trait]
impl AccountStore for MongoStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        self.db
            .collection::<User>(USERS)
            .find_one(doc! { "_id": user_id })
            .await
            .context("Failed to load user")
    }

    async fn find_course(&self, course_id: &str) -> Result<Option<Course>> {
        self.db
            .collection::<Course>(COURSES)
            .find_one(doc! { "_id": course_id })
            .await
            .context("Failed to load course")
    }
}
