use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::bson_time;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Student,
    Teacher,
    Admin,
    Supervisor,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Student => "student",
            UserRole::Teacher => "teacher",
            UserRole::Admin => "admin",
            UserRole::Supervisor => "supervisor",
        }
    }

    pub fn from_claim(role: &str) -> Option<Self> {
        match role {
            "student" => Some(UserRole::Student),
            "teacher" => Some(UserRole::Teacher),
            "admin" => Some(UserRole::Admin),
            "supervisor" => Some(UserRole::Supervisor),
            _ => None,
        }
    }

    /// Teachers and admins may correct short-answer scores.
    pub fn can_grade(&self) -> bool {
        matches!(self, UserRole::Teacher | UserRole::Admin)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MembershipLevel {
    #[default]
    Free,
    Basic,
    Premium,
    Vip,
}

impl MembershipLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipLevel::Free => "free",
            MembershipLevel::Basic => "basic",
            MembershipLevel::Premium => "premium",
            MembershipLevel::Vip => "vip",
        }
    }
}

impl FromStr for MembershipLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(MembershipLevel::Free),
            "basic" => Ok(MembershipLevel::Basic),
            "premium" => Ok(MembershipLevel::Premium),
            "vip" => Ok(MembershipLevel::Vip),
            other => Err(format!("unknown membership package '{}'", other)),
        }
    }
}

/// User document stored in the "users" collection (fields the core touches)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub enrolled_courses: Vec<String>,
    #[serde(default)]
    pub membership_level: MembershipLevel,
    #[serde(default, with = "bson_time::optional")]
    pub membership_expiry: Option<DateTime<Utc>>,
    /// Payment that granted the current membership
    #[serde(default)]
    pub membership_payment_id: Option<String>,
    #[serde(with = "bson_time::required")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_time::required")]
    pub updated_at: DateTime<Utc>,
}

/// Course document stored in the "courses" collection (fields the core touches)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub enrollment_count: i64,
    /// Payments already counted in `enrollment_count`
    #[serde(default)]
    pub enrollment_payment_ids: Vec<String>,
    #[serde(with = "bson_time::required")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_time::required")]
    pub updated_at: DateTime<Utc>,
}
