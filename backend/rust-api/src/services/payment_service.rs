use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::gateway::PaymentGateway;
use super::notifier::Notifier;
use super::promotion_service::PromotionService;
use super::{with_conflict_retry, AppState};
use crate::error::{CoreError, CoreResult, PolicyCode};
use crate::metrics::PAYMENTS_SETTLED_TOTAL;
use crate::models::payment::{CheckoutRequest, GatewayNotification};
use crate::models::{
    BusinessType, MembershipLevel, NotificationEvent, NotifyTarget, Payment, PaymentCompletion,
    PaymentStatus, SettlementEffect, UserRole,
};
use crate::stores::sms_codes::payment_code_key;
use crate::stores::{AccountStore, CodeCheck, PaymentStore, SmsCodeStore};

/// Window in which an identical pending checkout is treated as a double submit.
const DUPLICATE_WINDOW_MINUTES: i64 = 30;

/// Wrong verification codes tolerated before the issued code is revoked.
const MAX_SMS_CODE_MISSES: u32 = 5;

/// Membership granted by a settled payment lasts this long, whatever the package.
const MEMBERSHIP_TERM_MONTHS: u32 = 12;

pub struct PaymentService {
    payments: Arc<dyn PaymentStore>,
    accounts: Arc<dyn AccountStore>,
    sms_codes: Arc<dyn SmsCodeStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    promotions: PromotionService,
    sms_code_ttl: Duration,
}

impl PaymentService {
    pub fn new(state: &AppState) -> Self {
        Self {
            payments: state.payments.clone(),
            accounts: state.accounts.clone(),
            sms_codes: state.sms_codes.clone(),
            gateway: state.gateway.clone(),
            notifier: state.notifier.clone(),
            promotions: PromotionService::new(state),
            sms_code_ttl: Duration::from_secs(state.config.sms_code_ttl_seconds),
        }
    }

    pub async fn checkout(&self, user_id: &str, request: CheckoutRequest) -> CoreResult<Payment> {
        self.checkout_at(user_id, request, Utc::now()).await
    }

    /// Creates a pending payment and its gateway order.
    pub async fn checkout_at(
        &self,
        user_id: &str,
        request: CheckoutRequest,
        now: DateTime<Utc>,
    ) -> CoreResult<Payment> {
        let original_amount = match request.business_type {
            BusinessType::Course => {
                let course = self
                    .accounts
                    .find_course(&request.target_ref)
                    .await?
                    .ok_or_else(|| CoreError::not_found("course", &request.target_ref))?;
                course.price
            }
            _ => request.amount.ok_or_else(|| {
                CoreError::validation(format!(
                    "amount is required for {} payments",
                    request.business_type.as_str()
                ))
            })?,
        };
        if !original_amount.is_finite() || original_amount < 0.0 {
            return Err(CoreError::validation("amount must not be negative"));
        }

        let since = now - ChronoDuration::minutes(DUPLICATE_WINDOW_MINUTES);
        if let Some(existing) = self
            .payments
            .find_recent_pending(user_id, &request.target_ref, original_amount, since)
            .await?
        {
            return Err(CoreError::policy(
                PolicyCode::DuplicatePayment,
                format!(
                    "Payment {} for {} is already pending, finish or cancel it first",
                    existing.id, request.target_ref
                ),
            ));
        }

        let (amount, discount_amount, promotion_code) = match request.promotion_code.as_deref() {
            Some(code) if !code.trim().is_empty() => {
                let quote = self
                    .promotions
                    .verify_and_apply_at(code, user_id, &request.target_ref, original_amount, now)
                    .await?;
                (quote.final_amount, quote.discount, Some(quote.code))
            }
            _ => (original_amount, 0.0, None),
        };

        let mut payment = Payment {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            amount,
            original_amount,
            currency: "CNY".to_string(),
            method: request.method,
            business_type: request.business_type,
            status: PaymentStatus::Pending,
            target_ref: request.target_ref,
            transaction_id: None,
            payment_target: None,
            gateway_status: None,
            verified: false,
            sms_verified: false,
            verified_by: None,
            verification_time: None,
            promotion_code,
            discount_amount,
            refund_reason: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.payments.insert_payment(&payment).await?;

        let order = match self
            .gateway
            .create_payment(payment.method, payment.amount, &payment.id)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                tracing::error!("Gateway order failed for payment {}: {:#}", payment.id, e);
                self.payments
                    .transition_status(
                        &payment.id,
                        PaymentStatus::Pending,
                        PaymentStatus::Failed,
                        None,
                        now,
                    )
                    .await?;
                self.notifier
                    .notify(
                        NotifyTarget::User(payment.user_id.clone()),
                        NotificationEvent::PaymentFailed {
                            payment_id: payment.id.clone(),
                        },
                    )
                    .await;
                return Err(CoreError::Internal(
                    e.context(format!("Payment gateway rejected payment {}", payment.id)),
                ));
            }
        };

        self.payments
            .attach_gateway_order(&payment.id, &order.external_payment_id, &order.payment_target)
            .await?;
        payment.transaction_id = Some(order.external_payment_id);
        payment.payment_target = Some(order.payment_target);

        tracing::info!(
            "Payment created: id={}, user={}, type={}, amount={}, discount={}",
            payment.id,
            user_id,
            payment.business_type.as_str(),
            payment.amount,
            payment.discount_amount
        );
        Ok(payment)
    }

    pub async fn apply_gateway_notification(
        &self,
        notification: GatewayNotification,
    ) -> CoreResult<Payment> {
        self.apply_gateway_notification_at(notification, Utc::now())
            .await
    }

    /// Records the gateway's verdict. Payments that already left `pending` are
    /// returned unchanged so redelivered webhooks stay harmless.
    pub async fn apply_gateway_notification_at(
        &self,
        notification: GatewayNotification,
        now: DateTime<Utc>,
    ) -> CoreResult<Payment> {
        let external_id = notification.external_payment_id.as_str();
        let payment = self
            .payments
            .find_by_transaction_id(external_id)
            .await?
            .ok_or_else(|| CoreError::not_found("payment", external_id))?;

        if payment.status != PaymentStatus::Pending {
            tracing::info!(
                "Ignoring gateway status {} for payment {} in state {}",
                notification.status.as_str(),
                payment.id,
                payment.status.as_str()
            );
            return Ok(payment);
        }

        let next = notification.status.resulting_status();
        let applied = self
            .payments
            .record_gateway_status(&payment.id, notification.status, next, now)
            .await?;
        if applied && next == Some(PaymentStatus::Failed) {
            self.notifier
                .notify(
                    NotifyTarget::User(payment.user_id.clone()),
                    NotificationEvent::PaymentFailed {
                        payment_id: payment.id.clone(),
                    },
                )
                .await;
        }

        tracing::info!(
            "Gateway status recorded: payment={}, status={}, applied={}",
            payment.id,
            notification.status.as_str(),
            applied
        );
        self.load(&payment.id).await
    }

    /// Issues a one-time verification code for the admin confirming the payment.
    pub async fn request_sms_code(&self, payment_id: &str, admin_id: &str) -> CoreResult<Duration> {
        let payment = self.load(payment_id).await?;
        ensure_pending(&payment)?;

        let code = rand::rng().random_range(100_000..1_000_000).to_string();
        self.sms_codes
            .put(&payment_code_key(payment_id), &code, self.sms_code_ttl)
            .await?;

        self.notifier
            .notify(
                NotifyTarget::User(admin_id.to_string()),
                NotificationEvent::PaymentSmsCode {
                    payment_id: payment_id.to_string(),
                    code,
                },
            )
            .await;

        tracing::info!(
            "Verification code issued: payment={}, admin={}",
            payment_id,
            admin_id
        );
        Ok(self.sms_code_ttl)
    }

    pub async fn confirm_sms_code(&self, payment_id: &str, code: &str) -> CoreResult<Payment> {
        self.confirm_sms_code_at(payment_id, code, Utc::now()).await
    }

    pub async fn confirm_sms_code_at(
        &self,
        payment_id: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Payment> {
        let payment = self.load(payment_id).await?;
        ensure_pending(&payment)?;

        match self
            .sms_codes
            .consume_if_matches(&payment_code_key(payment_id), code.trim(), MAX_SMS_CODE_MISSES)
            .await?
        {
            CodeCheck::Accepted => {}
            CodeCheck::Rejected => {
                return Err(CoreError::policy(
                    PolicyCode::SmsCodeInvalid,
                    "Verification code is wrong or expired",
                ));
            }
            CodeCheck::Revoked => {
                tracing::warn!(
                    "Verification code revoked after {} misses: payment={}",
                    MAX_SMS_CODE_MISSES,
                    payment_id
                );
                return Err(CoreError::policy(
                    PolicyCode::SmsCodeInvalid,
                    "Too many wrong codes, request a new verification code",
                ));
            }
        }

        if !self.payments.mark_sms_verified(payment_id, now).await? {
            let current = self.load(payment_id).await?;
            ensure_pending(&current)?;
        }

        tracing::info!("Payment SMS verified: payment={}", payment_id);
        self.load(payment_id).await
    }

    pub async fn complete_payment(&self, payment_id: &str, admin_id: &str) -> CoreResult<Payment> {
        self.complete_payment_at(payment_id, admin_id, Utc::now())
            .await
    }

    /// Completes a pending, SMS-verified payment and grants what it paid for,
    /// both in one unit of work. A second call fails with `PAYMENT_NOT_PENDING`.
    pub async fn complete_payment_at(
        &self,
        payment_id: &str,
        admin_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Payment> {
        let (payment, effect) = with_conflict_retry("payment", payment_id, move || {
            self.try_complete(payment_id, admin_id, now)
        })
        .await?;

        PAYMENTS_SETTLED_TOTAL
            .with_label_values(&[payment.business_type.as_str()])
            .inc();
        tracing::info!(
            "Payment completed: id={}, user={}, type={}, verifier={}",
            payment.id,
            payment.user_id,
            payment.business_type.as_str(),
            admin_id
        );

        self.announce_settlement(&payment, &effect).await;
        Ok(payment)
    }

    async fn try_complete(
        &self,
        payment_id: &str,
        admin_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<(Payment, SettlementEffect)>> {
        let mut payment = self.load(payment_id).await?;
        ensure_pending(&payment)?;
        if !payment.sms_verified {
            return Err(CoreError::policy(
                PolicyCode::SmsNotVerified,
                format!("Payment {} has not passed SMS verification", payment_id),
            ));
        }

        let effect = self.settlement_effect(&payment, now).await?;
        let completion = PaymentCompletion {
            verifier_id: admin_id.to_string(),
            completed_at: now,
        };

        if !self.payments.settle(payment_id, &completion, &effect).await? {
            return Ok(None);
        }

        payment.apply_completion(&completion);
        Ok(Some((payment, effect)))
    }

    async fn settlement_effect(
        &self,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> CoreResult<SettlementEffect> {
        if self.accounts.find_user(&payment.user_id).await?.is_none() {
            return Err(CoreError::not_found("user", &payment.user_id));
        }

        match payment.business_type {
            BusinessType::Course => {
                if self.accounts.find_course(&payment.target_ref).await?.is_none() {
                    return Err(CoreError::not_found("course", &payment.target_ref));
                }
                Ok(SettlementEffect::Enroll {
                    user_id: payment.user_id.clone(),
                    course_id: payment.target_ref.clone(),
                })
            }
            BusinessType::Membership => {
                let level: MembershipLevel =
                    payment.target_ref.parse().map_err(CoreError::Validation)?;
                let expires_at = now
                    .checked_add_months(Months::new(MEMBERSHIP_TERM_MONTHS))
                    .ok_or_else(|| anyhow::anyhow!("Membership expiry out of range"))?;
                Ok(SettlementEffect::Membership {
                    user_id: payment.user_id.clone(),
                    level,
                    expires_at,
                })
            }
            BusinessType::Subscription | BusinessType::Other => Ok(SettlementEffect::None),
        }
    }

    async fn announce_settlement(&self, payment: &Payment, effect: &SettlementEffect) {
        let completed = NotificationEvent::PaymentCompleted {
            payment_id: payment.id.clone(),
            user_id: payment.user_id.clone(),
            amount: payment.amount,
            business_type: payment.business_type,
        };
        self.notifier
            .notify(NotifyTarget::User(payment.user_id.clone()), completed.clone())
            .await;
        self.notifier
            .notify(NotifyTarget::Role(UserRole::Admin), completed)
            .await;

        let granted = match effect {
            SettlementEffect::Enroll { course_id, .. } => Some(NotificationEvent::EnrollmentGranted {
                payment_id: payment.id.clone(),
                course_id: course_id.clone(),
            }),
            SettlementEffect::Membership {
                level, expires_at, ..
            } => Some(NotificationEvent::MembershipActivated {
                payment_id: payment.id.clone(),
                level: *level,
                expires_at: *expires_at,
            }),
            SettlementEffect::None => None,
        };
        if let Some(event) = granted {
            self.notifier
                .notify(NotifyTarget::User(payment.user_id.clone()), event)
                .await;
        }
    }

    pub async fn refund_payment(
        &self,
        payment_id: &str,
        admin_id: &str,
        reason: &str,
    ) -> CoreResult<Payment> {
        self.refund_payment_at(payment_id, admin_id, reason, Utc::now())
            .await
    }

    /// Marks a completed payment refunded. Enrollment and membership stay granted.
    pub async fn refund_payment_at(
        &self,
        payment_id: &str,
        admin_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Payment> {
        let payment = with_conflict_retry("payment", payment_id, move || {
            self.try_refund(payment_id, reason, now)
        })
        .await?;

        tracing::info!(
            "Payment refunded: id={}, admin={}, reason={}",
            payment_id,
            admin_id,
            reason
        );
        Ok(payment)
    }

    async fn try_refund(
        &self,
        payment_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Payment>> {
        let mut payment = self.load(payment_id).await?;
        if !payment.status.can_transition_to(PaymentStatus::Refunded) {
            return Err(CoreError::policy(
                PolicyCode::PaymentNotCompleted,
                format!(
                    "Payment {} is {}, only completed payments can be refunded",
                    payment_id,
                    payment.status.as_str()
                ),
            ));
        }

        if !self
            .payments
            .transition_status(
                payment_id,
                PaymentStatus::Completed,
                PaymentStatus::Refunded,
                Some(reason),
                now,
            )
            .await?
        {
            return Ok(None);
        }

        payment.status = PaymentStatus::Refunded;
        payment.refund_reason = Some(reason.to_string());
        payment.updated_at = now;
        Ok(Some(payment))
    }

    /// Payment as seen by its payer or an admin. Other users get `NotFound`
    /// so payment ids do not leak.
    pub async fn get_payment(
        &self,
        payment_id: &str,
        user_id: &str,
        role: UserRole,
    ) -> CoreResult<Payment> {
        let payment = self.load(payment_id).await?;
        if role != UserRole::Admin && payment.user_id != user_id {
            return Err(CoreError::not_found("payment", payment_id));
        }
        Ok(payment)
    }

    async fn load(&self, payment_id: &str) -> CoreResult<Payment> {
        self.payments
            .find_payment(payment_id)
            .await?
            .ok_or_else(|| CoreError::not_found("payment", payment_id))
    }
}

fn ensure_pending(payment: &Payment) -> CoreResult<()> {
    if payment.status == PaymentStatus::Pending {
        return Ok(());
    }
    Err(CoreError::policy(
        PolicyCode::PaymentNotPending,
        format!(
            "Payment {} is {}, expected pending",
            payment.id,
            payment.status.as_str()
        ),
    ))
}
