//! Promotion rules: validity window, quota, discount math.
//!
//! Everything here is pure. Redemption itself goes through
//! [`crate::stores::PromotionStore::record_usage_guarded`] so the quota and
//! per-user limit are enforced by a single conditional write.

use chrono::{DateTime, Utc};

use crate::models::{Promotion, PromotionUsage};

/// Codes are stored upper-cased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

pub fn is_valid(promotion: &Promotion, now: DateTime<Utc>) -> bool {
    if !promotion.is_active {
        return false;
    }
    if now < promotion.start_date {
        return false;
    }
    if let Some(end) = promotion.end_date {
        if now > end {
            return false;
        }
    }
    !is_exhausted(promotion)
}

pub fn is_exhausted(promotion: &Promotion) -> bool {
    promotion.max_uses > 0 && promotion.current_uses >= promotion.max_uses
}

/// Discount for a purchase, never more than the purchase itself.
pub fn calculate_discount(promotion: &Promotion, purchase_amount: f64, now: DateTime<Utc>) -> f64 {
    if !is_valid(promotion, now) || purchase_amount < promotion.min_purchase_amount {
        return 0.0;
    }

    let percent = purchase_amount * promotion.discount_rate / 100.0;
    let discount = percent + promotion.fixed_amount;

    discount.clamp(0.0, purchase_amount.max(0.0))
}

/// Empty product list means the promotion covers everything.
pub fn applies_to(promotion: &Promotion, product_id: &str) -> bool {
    promotion.applicable_products.is_empty()
        || promotion.applicable_products.iter().any(|p| p == product_id)
}

pub fn has_user_quota(promotion: &Promotion, user_id: &str) -> bool {
    promotion.usage_count_for(user_id) < promotion.limit_per_user
}

pub fn usage_entry(
    promotion: &Promotion,
    user_id: &str,
    purchase_amount: f64,
    now: DateTime<Utc>,
) -> PromotionUsage {
    PromotionUsage {
        user_id: user_id.to_string(),
        used_at: now,
        amount: purchase_amount,
        reward: promotion.referral_reward,
    }
}

/// Rounds to cents.
pub fn round_currency(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PromotionType;
    use chrono::Duration;

    fn promotion() -> Promotion {
        let now = Utc::now();
        Promotion {
            id: "p1".to_string(),
            code: "SPRING".to_string(),
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

    #[test]
    fn percent_and_fixed_discounts_stack() {
        let p = promotion();
        let discount = calculate_discount(&p, 100.0, Utc::now());
        assert_eq!(discount, 25.0);
        assert_eq!(round_currency(100.0 - discount), 75.0);
    }

    #[test]
    fn below_minimum_purchase_gets_nothing() {
        let p = promotion();
        assert_eq!(calculate_discount(&p, 49.99, Utc::now()), 0.0);
    }

    #[test]
    fn discount_is_capped_at_purchase_amount() {
        let mut p = promotion();
        p.min_purchase_amount = 0.0;
        p.fixed_amount = 500.0;
        assert_eq!(calculate_discount(&p, 60.0, Utc::now()), 60.0);
    }

    #[test]
    fn exhausted_promotion_is_invalid_even_inside_window() {
        let mut p = promotion();
        p.max_uses = 1;
        p.current_uses = 1;
        p.end_date = None;
        assert!(!is_valid(&p, Utc::now()));
        assert_eq!(calculate_discount(&p, 100.0, Utc::now()), 0.0);
    }

    #[test]
    fn unlimited_when_max_uses_is_zero() {
        let mut p = promotion();
        p.current_uses = 10_000;
        assert!(is_valid(&p, Utc::now()));
    }

    #[test]
    fn window_and_active_flag_are_respected() {
        let now = Utc::now();
        let mut p = promotion();
        assert!(!is_valid(&p, p.start_date - Duration::seconds(1)));
        assert!(!is_valid(&p, now + Duration::days(31)));

        p.end_date = None;
        assert!(is_valid(&p, now + Duration::days(3650)));

        p.is_active = false;
        assert!(!is_valid(&p, now));
    }

    #[test]
    fn empty_product_list_applies_everywhere() {
        let mut p = promotion();
        assert!(applies_to(&p, "course-1"));
        p.applicable_products = vec!["course-2".to_string()];
        assert!(!applies_to(&p, "course-1"));
        assert!(applies_to(&p, "course-2"));
    }

    #[test]
    fn per_user_quota_counts_ledger_entries() {
        let mut p = promotion();
        assert!(has_user_quota(&p, "u1"));
        let entry = usage_entry(&p, "u1", 100.0, Utc::now());
        p.used_by.push(entry);
        assert!(!has_user_quota(&p, "u1"));
        assert!(has_user_quota(&p, "u2"));
    }

    #[test]
    fn codes_are_case_normalized() {
        assert_eq!(normalize_code("  spring24 "), "SPRING24");
    }
}
