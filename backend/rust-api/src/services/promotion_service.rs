use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::notifier::Notifier;
use super::AppState;
use crate::error::{CoreError, CoreResult, PolicyCode};
use crate::metrics::{self, PROMOTION_REDEMPTIONS_TOTAL};
use crate::models::{
    NotificationEvent, NotifyTarget, Promotion, PromotionQuote, PromotionType, PromotionUsage,
};
use crate::promotions;
use crate::stores::PromotionStore;

pub struct PromotionService {
    promotions: Arc<dyn PromotionStore>,
    notifier: Arc<dyn Notifier>,
}

impl PromotionService {
    pub fn new(state: &AppState) -> Self {
        Self {
            promotions: state.promotions.clone(),
            notifier: state.notifier.clone(),
        }
    }

    /// Prices a purchase with the code without redeeming it. `can_use` is
    /// false when the user has already spent their share of the code.
    pub async fn quote(
        &self,
        code: &str,
        user_id: &str,
        product_id: &str,
        purchase_amount: f64,
    ) -> CoreResult<PromotionQuote> {
        self.quote_at(code, user_id, product_id, purchase_amount, Utc::now())
            .await
    }

    pub async fn quote_at(
        &self,
        code: &str,
        user_id: &str,
        product_id: &str,
        purchase_amount: f64,
        now: DateTime<Utc>,
    ) -> CoreResult<PromotionQuote> {
        let (promotion, discount) = self
            .check_eligible(code, product_id, purchase_amount, now)
            .await?;

        Ok(PromotionQuote {
            can_use: promotions::has_user_quota(&promotion, user_id),
            code: promotion.code,
            discount,
            final_amount: promotions::round_currency(purchase_amount - discount),
        })
    }

    /// Checks the code against the purchase, redeems it and returns the price to charge.
    pub async fn verify_and_apply(
        &self,
        code: &str,
        user_id: &str,
        product_id: &str,
        purchase_amount: f64,
    ) -> CoreResult<PromotionQuote> {
        self.verify_and_apply_at(code, user_id, product_id, purchase_amount, Utc::now())
            .await
    }

    pub async fn verify_and_apply_at(
        &self,
        code: &str,
        user_id: &str,
        product_id: &str,
        purchase_amount: f64,
        now: DateTime<Utc>,
    ) -> CoreResult<PromotionQuote> {
        let (promotion, discount) = self
            .check_eligible(code, product_id, purchase_amount, now)
            .await
            .inspect_err(|err| match err.policy_code() {
                Some(PolicyCode::PromotionInvalid) => self.record_result("invalid"),
                Some(PolicyCode::PromotionNotApplicable) => self.record_result("not_applicable"),
                Some(PolicyCode::PromotionBelowMinimum) => self.record_result("below_minimum"),
                _ => {}
            })?;

        self.record_usage_at(&promotion.code, user_id, purchase_amount, now)
            .await?;

        Ok(PromotionQuote {
            code: promotion.code,
            discount,
            final_amount: promotions::round_currency(purchase_amount - discount),
            can_use: true,
        })
    }

    /// Loads the code and runs the checks that do not depend on the buyer.
    /// Returns the promotion with the rounded discount.
    async fn check_eligible(
        &self,
        code: &str,
        product_id: &str,
        purchase_amount: f64,
        now: DateTime<Utc>,
    ) -> CoreResult<(Promotion, f64)> {
        if !purchase_amount.is_finite() || purchase_amount < 0.0 {
            return Err(CoreError::validation("purchase_amount must not be negative"));
        }

        let code = promotions::normalize_code(code);
        let promotion = self.load(&code).await?;

        if !promotions::is_valid(&promotion, now) {
            return Err(invalid(&code));
        }
        if !promotions::applies_to(&promotion, product_id) {
            return Err(CoreError::policy(
                PolicyCode::PromotionNotApplicable,
                format!("Promotion {} does not apply to {}", code, product_id),
            ));
        }
        if purchase_amount < promotion.min_purchase_amount {
            return Err(CoreError::policy(
                PolicyCode::PromotionBelowMinimum,
                format!(
                    "Promotion {} requires a purchase of at least {:.2}",
                    code, promotion.min_purchase_amount
                ),
            ));
        }

        let discount = promotions::round_currency(promotions::calculate_discount(
            &promotion,
            purchase_amount,
            now,
        ));
        Ok((promotion, discount))
    }

    pub async fn record_usage(
        &self,
        code: &str,
        user_id: &str,
        purchase_amount: f64,
    ) -> CoreResult<Promotion> {
        self.record_usage_at(code, user_id, purchase_amount, Utc::now())
            .await
    }

    /// Appends a ledger entry through the guarded write. When the write is
    /// refused the promotion is re-read to report why; a refusal that the
    /// fresh state does not explain is retried once.
    pub async fn record_usage_at(
        &self,
        code: &str,
        user_id: &str,
        purchase_amount: f64,
        now: DateTime<Utc>,
    ) -> CoreResult<Promotion> {
        let code = promotions::normalize_code(code);

        for round in 1..=2 {
            let promotion = self.load(&code).await?;
            if !promotions::has_user_quota(&promotion, user_id) {
                self.record_result("user_limit");
                return Err(CoreError::policy(
                    PolicyCode::PromotionUserLimitReached,
                    format!(
                        "Promotion {} already used {} time(s) by this user",
                        code, promotion.limit_per_user
                    ),
                ));
            }
            if !promotions::is_valid(&promotion, now) {
                self.record_result("invalid");
                return Err(invalid(&code));
            }

            let usage = promotions::usage_entry(&promotion, user_id, purchase_amount, now);
            if self.promotions.record_usage_guarded(&code, &usage).await? {
                self.record_result("redeemed");
                tracing::info!(
                    "Promotion redeemed: code={}, user={}, amount={}",
                    code,
                    user_id,
                    purchase_amount
                );
                let mut updated = promotion;
                updated.current_uses += 1;
                updated.used_by.push(usage.clone());
                self.reward_referrer(&updated, &usage).await;
                return Ok(updated);
            }

            metrics::record_conflict("promotion");
            tracing::warn!(
                "Promotion usage write refused, re-reading: code={}, user={}, round={}",
                code,
                user_id,
                round
            );
        }

        Err(CoreError::conflict(format!(
            "Promotion {} was modified concurrently, retry the request",
            code
        )))
    }

    async fn reward_referrer(&self, promotion: &Promotion, usage: &PromotionUsage) {
        if promotion.promotion_type != PromotionType::Referral || usage.reward <= 0.0 {
            return;
        }
        self.notifier
            .notify(
                NotifyTarget::User(promotion.creator_id.clone()),
                NotificationEvent::ReferralRewardEarned {
                    code: promotion.code.clone(),
                    referred_user_id: usage.user_id.clone(),
                    reward: usage.reward,
                },
            )
            .await;
    }

    async fn load(&self, code: &str) -> CoreResult<Promotion> {
        self.promotions
            .find_promotion(code)
            .await?
            .ok_or_else(|| CoreError::not_found("promotion", code))
    }

    fn record_result(&self, result: &str) {
        PROMOTION_REDEMPTIONS_TOTAL.with_label_values(&[result]).inc();
    }
}

fn invalid(code: &str) -> CoreError {
    CoreError::policy(
        PolicyCode::PromotionInvalid,
        format!("Promotion {} is not active, expired or used up", code),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support;
    use crate::stores::MemoryStore;
    use chrono::Duration;

    fn promotion(code: &str) -> Promotion {
        let now = Utc::now();
        Promotion {
            id: format!("id-{}", code),
            code: code.to_string(),
            creator_id: "creator".to_string(),
            promotion_type: PromotionType::Discount,
            description: String::new(),
            discount_rate: 20.0,
            fixed_amount: 5.0,
            referral_reward: 0.0,
            start_date: now - Duration::days(1),
            end_date: Some(now + Duration::days(30)),
            max_uses: 0,
            current_uses: 0,
            limit_per_user: 1,
            min_purchase_amount: 50.0,
            applicable_products: vec![],
            is_active: true,
            used_by: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    async fn service_with(promotion: Promotion) -> (PromotionService, Arc<MemoryStore>) {
        let (state, store) = test_support::state();
        store.insert_promotion(promotion).await;
        (PromotionService::new(&state), store)
    }

    #[tokio::test]
    async fn applies_discount_and_records_usage() {
        let (service, store) = service_with(promotion("SPRING")).await;

        let quote = service
            .verify_and_apply("spring", "u1", "course-1", 100.0)
            .await
            .unwrap();

        assert_eq!(quote.code, "SPRING");
        assert_eq!(quote.discount, 25.0);
        assert_eq!(quote.final_amount, 75.0);

        let stored = store.find_promotion("SPRING").await.unwrap().unwrap();
        assert_eq!(stored.current_uses, 1);
        assert_eq!(stored.used_by[0].user_id, "u1");
    }

    #[tokio::test]
    async fn quote_leaves_the_ledger_untouched() {
        let (service, store) = service_with(promotion("PEEK")).await;

        let quote = service.quote("peek", "u1", "course-1", 100.0).await.unwrap();
        assert_eq!(quote.final_amount, 75.0);
        assert!(quote.can_use);
        let stored = store.find_promotion("PEEK").await.unwrap().unwrap();
        assert_eq!(stored.current_uses, 0);

        service
            .verify_and_apply("PEEK", "u1", "course-1", 100.0)
            .await
            .unwrap();
        let quote = service.quote("PEEK", "u1", "course-1", 100.0).await.unwrap();
        assert!(!quote.can_use);
    }

    #[tokio::test]
    async fn second_use_by_same_user_is_refused() {
        let (service, _) = service_with(promotion("ONCE")).await;

        service.record_usage("ONCE", "u1", 100.0).await.unwrap();
        let err = service.record_usage("ONCE", "u1", 100.0).await.unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::PromotionUserLimitReached));

        service.record_usage("ONCE", "u2", 100.0).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_uses_by_same_user_admit_one() {
        let (service, store) = service_with(promotion("RACE")).await;

        let (a, b) = tokio::join!(
            service.record_usage("RACE", "u1", 100.0),
            service.record_usage("RACE", "u1", 100.0)
        );

        let failures: Vec<_> = [a, b].into_iter().filter_map(Result::err).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].policy_code(),
            Some(PolicyCode::PromotionUserLimitReached)
        );
        let stored = store.find_promotion("RACE").await.unwrap().unwrap();
        assert_eq!(stored.current_uses, 1);
    }

    #[tokio::test]
    async fn exhausted_promotion_is_invalid() {
        let mut p = promotion("GONE");
        p.max_uses = 1;
        p.current_uses = 1;
        let (service, _) = service_with(p).await;

        let err = service
            .verify_and_apply("GONE", "u1", "course-1", 100.0)
            .await
            .unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::PromotionInvalid));
    }

    #[tokio::test]
    async fn product_and_minimum_checks_run_before_redemption() {
        let mut p = promotion("ONLY");
        p.applicable_products = vec!["course-2".to_string()];
        let (service, store) = service_with(p).await;

        let err = service
            .verify_and_apply("ONLY", "u1", "course-1", 100.0)
            .await
            .unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::PromotionNotApplicable));

        let err = service
            .verify_and_apply("ONLY", "u1", "course-2", 10.0)
            .await
            .unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::PromotionBelowMinimum));

        let stored = store.find_promotion("ONLY").await.unwrap().unwrap();
        assert_eq!(stored.current_uses, 0);
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let (service, _) = service_with(promotion("SPRING")).await;
        let err = service
            .verify_and_apply("NOPE", "u1", "course-1", 100.0)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }
}
