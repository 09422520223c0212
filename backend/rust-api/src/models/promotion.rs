use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::bson_time;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromotionType {
    Referral,
    Discount,
    Gift,
    Campaign,
}

/// Ledger entry, one per redemption. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionUsage {
    pub user_id: String,
    #[serde(with = "bson_time::required")]
    pub used_at: DateTime<Utc>,
    pub amount: f64,
    pub reward: f64,
}

fn default_limit_per_user() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Promotion document stored in the "promotions" collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promotion {
    #[serde(rename = "_id")]
    pub id: String,
    /// Upper-cased, unique
    pub code: String,
    pub creator_id: String,
    #[serde(rename = "type")]
    pub promotion_type: PromotionType,
    #[serde(default)]
    pub description: String,
    /// Percent, 0-100
    #[serde(default)]
    pub discount_rate: f64,
    #[serde(default)]
    pub fixed_amount: f64,
    #[serde(default)]
    pub referral_reward: f64,
    #[serde(with = "bson_time::required")]
    pub start_date: DateTime<Utc>,
    #[serde(default, with = "bson_time::optional")]
    pub end_date: Option<DateTime<Utc>>,
    /// 0 means unlimited
    #[serde(default)]
    pub max_uses: u32,
    #[serde(default)]
    pub current_uses: u32,
    #[serde(default = "default_limit_per_user")]
    pub limit_per_user: u32,
    #[serde(default)]
    pub min_purchase_amount: f64,
    /// Empty means every product
    #[serde(default)]
    pub applicable_products: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub used_by: Vec<PromotionUsage>,
    #[serde(with = "bson_time::required")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_time::required")]
    pub updated_at: DateTime<Utc>,
}

impl Promotion {
    pub fn usage_count_for(&self, user_id: &str) -> u32 {
        self.used_by.iter().filter(|u| u.user_id == user_id).count() as u32
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyPromotionRequest {
    #[validate(length(min = 1, max = 64, message = "code must be 1-64 characters"))]
    pub code: String,
    #[validate(length(min = 1, message = "product_id must not be empty"))]
    pub product_id: String,
    #[validate(range(min = 0.0, message = "purchase_amount must not be negative"))]
    pub purchase_amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionQuote {
    pub code: String,
    pub discount: f64,
    pub final_amount: f64,
    pub can_use: bool,
}
