use serde::Serialize;

/// Business-rule refusals. The string form is the stable code returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyCode {
    QuizNotPublished,
    QuizNotPublishable,
    ReattemptNotAllowed,
    MaxAttemptsReached,
    AttemptNotOwned,
    AttemptNotInProgress,
    AttemptTimedOut,
    AttemptNotGradable,
    QuestionNotManuallyGraded,
    GraderRoleRequired,
    PromotionInvalid,
    PromotionNotApplicable,
    PromotionBelowMinimum,
    PromotionUserLimitReached,
    PaymentNotPending,
    PaymentNotCompleted,
    SmsNotVerified,
    SmsCodeInvalid,
    DuplicatePayment,
}

impl PolicyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyCode::QuizNotPublished => "QUIZ_NOT_PUBLISHED",
            PolicyCode::QuizNotPublishable => "QUIZ_NOT_PUBLISHABLE",
            PolicyCode::ReattemptNotAllowed => "REATTEMPT_NOT_ALLOWED",
            PolicyCode::MaxAttemptsReached => "MAX_ATTEMPTS_REACHED",
            PolicyCode::AttemptNotOwned => "ATTEMPT_NOT_OWNED",
            PolicyCode::AttemptNotInProgress => "ATTEMPT_NOT_IN_PROGRESS",
            PolicyCode::AttemptTimedOut => "ATTEMPT_TIMED_OUT",
            PolicyCode::AttemptNotGradable => "ATTEMPT_NOT_GRADABLE",
            PolicyCode::QuestionNotManuallyGraded => "QUESTION_NOT_MANUALLY_GRADED",
            PolicyCode::GraderRoleRequired => "GRADER_ROLE_REQUIRED",
            PolicyCode::PromotionInvalid => "PROMOTION_INVALID",
            PolicyCode::PromotionNotApplicable => "PROMOTION_NOT_APPLICABLE",
            PolicyCode::PromotionBelowMinimum => "PROMOTION_BELOW_MINIMUM",
            PolicyCode::PromotionUserLimitReached => "PROMOTION_USER_LIMIT_REACHED",
            PolicyCode::PaymentNotPending => "PAYMENT_NOT_PENDING",
            PolicyCode::PaymentNotCompleted => "PAYMENT_NOT_COMPLETED",
            PolicyCode::SmsNotVerified => "SMS_NOT_VERIFIED",
            PolicyCode::SmsCodeInvalid => "SMS_CODE_INVALID",
            PolicyCode::DuplicatePayment => "DUPLICATE_PAYMENT",
        }
    }
}

impl std::fmt::Display for PolicyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type shared by the grading, promotion and settlement services.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{message}")]
    Policy { code: PolicyCode, message: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    pub fn policy(code: PolicyCode, message: impl Into<String>) -> Self {
        CoreError::Policy {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        CoreError::Conflict(message.into())
    }

    /// Machine-readable code surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::Policy { code, .. } => code.as_str(),
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn policy_code(&self) -> Option<PolicyCode> {
        match self {
            CoreError::Policy { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Conflict(_))
    }
}

impl From<validator::ValidationErrors> for CoreError {
    fn from(errors: validator::ValidationErrors) -> Self {
        CoreError::Validation(errors.to_string())
    }
}
