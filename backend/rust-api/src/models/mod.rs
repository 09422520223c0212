pub mod account;
pub mod attempt;
pub mod bson_time;
pub mod notification;
pub mod payment;
pub mod promotion;
pub mod question;
pub mod quiz;

pub use account::{Course, MembershipLevel, User, UserRole};
pub use attempt::{AnswerRecord, Attempt, AttemptStatus, AttemptView, ScoreResult};
pub use notification::{NotificationEvent, NotifyTarget};
pub use payment::{
    BusinessType, GatewayStatus, Payment, PaymentCompletion, PaymentMethod, PaymentStatus,
    PaymentView, SettlementEffect,
};
pub use promotion::{Promotion, PromotionQuote, PromotionType, PromotionUsage};
pub use question::{Difficulty, Question, QuestionOption, QuestionType, SubmittedAnswer};
pub use quiz::{Quiz, QuizStatus};
