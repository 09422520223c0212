#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use eduplatform_api::{
    config::{Config, PaymentGatewayConfig},
    create_router,
    middlewares::auth::{JwtClaims, JwtService},
    models::{
        Course, Difficulty, MembershipLevel, NotificationEvent, NotifyTarget, Promotion,
        PromotionType, Question, QuestionOption, QuestionType, Quiz, QuizStatus, User, UserRole,
    },
    services::{notifier::Notifier, AppState},
    stores::{MemorySmsCodeStore, MemoryStore},
};

pub const JWT_SECRET: &str = "integration-secret";

/// Keeps every notification so tests can assert on side effects.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(NotifyTarget, NotificationEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(NotifyTarget, NotificationEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|(_, e)| e.name()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, target: NotifyTarget, event: NotificationEvent) {
        self.events.lock().unwrap().push((target, event));
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub codes: Arc<MemorySmsCodeStore>,
    pub notifier: Arc<RecordingNotifier>,
    jwt: JwtService,
}

pub fn test_config() -> Config {
    Config {
        mongo_uri: "mongodb://unused".to_string(),
        redis_uri: "redis://unused".to_string(),
        mongo_database: "eduplatform_test".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        payment: PaymentGatewayConfig {
            base_url: None,
            merchant_id: "merchant-test".to_string(),
            signing_secret: "signing-test".to_string(),
            notify_url: "http://localhost/api/v1/payments/webhook".to_string(),
        },
        sms_code_ttl_seconds: 300,
    }
}

pub fn create_test_app() -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let store = Arc::new(MemoryStore::new());
    let codes = Arc::new(MemorySmsCodeStore::new());
    let notifier = Arc::new(RecordingNotifier::default());

    let state = AppState::in_memory(test_config(), store.clone())
        .with_sms_codes(codes.clone())
        .with_notifier(notifier.clone());

    TestApp {
        router: create_router(Arc::new(state)),
        store,
        codes,
        notifier,
        jwt: JwtService::new(JWT_SECRET),
    }
}

impl TestApp {
    pub fn token(&self, user_id: &str, role: UserRole) -> String {
        self.jwt
            .generate_token(&JwtClaims::for_user(user_id, role, 3600))
            .unwrap()
    }

    /// Sends one request through the router and returns status plus JSON body
    /// (`Value::Null` for an empty body).
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, Some(token), Some(body)).await
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, Some(token), None).await
    }
}

pub fn quiz(id: &str, questions: &[&str]) -> Quiz {
    Quiz {
        id: id.to_string(),
        course_id: "course-1".to_string(),
        title: "Ownership and borrowing".to_string(),
        description: String::new(),
        time_limit_minutes: 30,
        passing_score: 60.0,
        questions: questions.iter().map(|q| q.to_string()).collect(),
        difficulty: Difficulty::Beginner,
        status: QuizStatus::Published,
        allow_reattempt: true,
        max_attempts: 3,
        show_answers: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn single_choice(id: &str, quiz_id: &str, correct: usize) -> Question {
    Question {
        id: id.to_string(),
        quiz_id: quiz_id.to_string(),
        text: format!("Question {}", id),
        question_type: QuestionType::SingleChoice,
        options: (0..4)
            .map(|i| QuestionOption {
                text: format!("option {}", i),
                is_correct: i == correct,
            })
            .collect(),
        correct_answer: None,
        explanation: String::new(),
        score: 1.0,
        difficulty: Difficulty::Beginner,
        tags: vec![],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn multi_choice(id: &str, quiz_id: &str, correct: &[usize]) -> Question {
    Question {
        question_type: QuestionType::MultiChoice,
        options: (0..4)
            .map(|i| QuestionOption {
                text: format!("option {}", i),
                is_correct: correct.contains(&i),
            })
            .collect(),
        ..single_choice(id, quiz_id, 0)
    }
}

pub fn short_answer(id: &str, quiz_id: &str, score: f64) -> Question {
    Question {
        question_type: QuestionType::ShortAnswer,
        options: vec![],
        score,
        ..single_choice(id, quiz_id, 0)
    }
}

pub fn user(id: &str) -> User {
    User {
        id: id.to_string(),
        name: format!("User {}", id),
        phone: String::new(),
        role: UserRole::Student,
        enrolled_courses: vec![],
        membership_level: MembershipLevel::Free,
        membership_expiry: None,
        membership_payment_id: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn course(id: &str, price: f64) -> Course {
    Course {
        id: id.to_string(),
        title: format!("Course {}", id),
        price,
        enrollment_count: 0,
        enrollment_payment_ids: vec![],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn promotion(code: &str) -> Promotion {
    Promotion {
        id: format!("promo-{}", code.to_lowercase()),
        code: code.to_string(),
        creator_id: "teacher-1".to_string(),
        promotion_type: PromotionType::Discount,
        description: String::new(),
        discount_rate: 20.0,
        fixed_amount: 5.0,
        referral_reward: 0.0,
        start_date: Utc::now() - Duration::days(1),
        end_date: Some(Utc::now() + Duration::days(30)),
        max_uses: 0,
        current_uses: 0,
        limit_per_user: 1,
        min_purchase_amount: 50.0,
        applicable_products: vec![],
        is_active: true,
        used_by: vec![],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
