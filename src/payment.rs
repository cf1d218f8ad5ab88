//! QR-based payment flow against the Bakong processor.
//!
//! A payment starts as a pending row carrying a KHQR-style payload and a
//! fixed expiry window. Status moves forward either by polling the processor
//! or by a signed webhook; both funnel through the same idempotent completion
//! path.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::config::BakongConfig;
use crate::enrollment;
use crate::error::ApiError;
use crate::models::{Course, Payment, PaymentState};
use crate::notify::{self, Recipients};

type HmacSha256 = Hmac<Sha256>;

pub fn generate_transaction_id<R: Rng>(rng: &mut R) -> String {
    format!("TXN{}{:06}", Utc::now().format("%Y%m%d%H%M%S"), rng.gen_range(0..1_000_000))
}

/// EMV-style field layout kept as an opaque string; the CRC the vendor SDK
/// would append is replaced by the payload digest we poll with.
pub fn build_khqr_payload(cfg: &BakongConfig, transaction_id: &str, amount: f64) -> String {
    format!(
        "00020101021229{:02}{}52045999530311654{:02}{:.2}5802KH59{:02}{}62{:02}{}",
        cfg.merchant_account.len(),
        cfg.merchant_account,
        format!("{:.2}", amount).len(),
        amount,
        cfg.merchant_name.len(),
        cfg.merchant_name,
        transaction_id.len(),
        transaction_id,
    )
}

/// Digest the processor is polled by. Kept at 32 hex chars for wire
/// compatibility with Bakong's md5 lookup field.
pub fn payload_hash(qr_string: &str) -> String {
    let digest = Sha256::digest(qr_string.as_bytes());
    hex::encode(&digest[..16])
}

pub fn is_expired(payment: &Payment, now: DateTime<Utc>) -> bool {
    now > payment.expires_at
}

/// Constant-time HMAC-SHA256 check over the raw webhook body.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    constant_time_compare(computed.as_slice(), &expected)
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// --- external processor client ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalStatus {
    Success { reference: Option<String> },
    Failed(String),
    /// Not settled yet, or the processor was unreachable (fail-closed).
    Pending,
}

#[derive(Deserialize)]
struct CheckResponse {
    #[serde(rename = "responseCode")]
    response_code: i32,
    #[serde(rename = "errorCode")]
    error_code: Option<i32>,
    #[serde(rename = "externalRef")]
    external_ref: Option<String>,
}

#[derive(Clone)]
pub struct BakongClient {
    http: reqwest::Client,
    base_url: String,
}

impl BakongClient {
    pub fn new(cfg: &BakongConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Polls the processor by payload hash. Transport errors are reported as
    /// Pending so a flaky link never fails a payable QR; an auth rejection
    /// means the integration is misconfigured and surfaces as a service error.
    pub async fn check_by_hash(&self, hash: &str) -> Result<ExternalStatus, ApiError> {
        let url = format!("{}/v1/check_transaction_by_md5", self.base_url);
        let result = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "md5": hash }))
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "payment status check unreachable");
                return Ok(ExternalStatus::Pending);
            }
        };
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            tracing::error!("payment processor rejected credentials");
            return Err(ApiError::External);
        }
        let body: CheckResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "payment status check returned malformed body");
                return Ok(ExternalStatus::Pending);
            }
        };

        Ok(match (body.response_code, body.error_code) {
            (0, _) => ExternalStatus::Success {
                reference: body.external_ref,
            },
            // transaction not found yet: the payer simply hasn't scanned
            (_, Some(1)) => ExternalStatus::Pending,
            (code, _) => ExternalStatus::Failed(format!("processor code {}", code)),
        })
    }
}

// --- state transitions ---

pub async fn initiate(
    tx: &mut Transaction<'_, Postgres>,
    cfg: &BakongConfig,
    student_id: Uuid,
    course: &Course,
) -> Result<Payment, ApiError> {
    if course.is_free() {
        return Err(ApiError::validation("course_id", "course is free"));
    }
    if let Some(enrollment) = enrollment::find_live(tx, student_id, course.id).await? {
        if enrollment.payment_status == crate::models::EnrollmentPaymentStatus::Paid {
            return Err(ApiError::AlreadyPaid);
        }
    }

    // an unexpired pending QR is reused instead of minting a new one
    let now = Utc::now();
    let existing = sqlx::query_as::<_, Payment>(
        r#"
        SELECT * FROM payments
        WHERE student_id = $1 AND course_id = $2 AND status = 'pending' AND expires_at > $3
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(student_id)
    .bind(course.id)
    .bind(now)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(payment) = existing {
        return Ok(payment);
    }

    let transaction_id = generate_transaction_id(&mut rand::thread_rng());
    let qr_string = build_khqr_payload(cfg, &transaction_id, course.price);
    let hash = payload_hash(&qr_string);
    let expires_at = now + Duration::from_std(cfg.qr_ttl).unwrap_or_else(|_| Duration::minutes(15));

    let payment = sqlx::query_as::<_, Payment>(
        r#"
        INSERT INTO payments
          (student_id, course_id, amount, method, transaction_id, status, qr_string, md5_hash, expires_at)
        VALUES ($1, $2, $3, 'bakong_qr', $4, 'pending', $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(student_id)
    .bind(course.id)
    .bind(course.price)
    .bind(&transaction_id)
    .bind(&qr_string)
    .bind(&hash)
    .bind(expires_at)
    .fetch_one(&mut **tx)
    .await?;

    tracing::info!(payment_id = %payment.id, transaction_id = %transaction_id, "payment initiated");
    Ok(payment)
}

/// Refreshes a payment's status: terminal states short-circuit, an expired
/// pending QR fails locally without touching the processor, anything else
/// polls and applies the outcome.
pub async fn observe_status(
    tx: &mut Transaction<'_, Postgres>,
    client: &BakongClient,
    payment: Payment,
) -> Result<Payment, ApiError> {
    if payment.status == PaymentState::Completed {
        return Ok(payment);
    }
    if payment.status != PaymentState::Pending {
        return Ok(payment);
    }

    let now = Utc::now();
    if is_expired(&payment, now) {
        let updated = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET status = 'failed', external_status = 'expired'
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .fetch_one(&mut **tx)
        .await?;
        return Ok(updated);
    }

    match client.check_by_hash(&payment.md5_hash).await? {
        ExternalStatus::Success { reference } => complete(tx, payment, reference.as_deref()).await,
        ExternalStatus::Failed(reason) => {
            let updated = sqlx::query_as::<_, Payment>(
                r#"
                UPDATE payments SET status = 'failed', external_status = $1
                WHERE id = $2
                RETURNING *
                "#,
            )
            .bind(&reason)
            .bind(payment.id)
            .fetch_one(&mut **tx)
            .await?;
            Ok(updated)
        }
        ExternalStatus::Pending => Ok(payment),
    }
}

/// Idempotent completion: payment update, enrollment sync, and notifications
/// all ride the caller's transaction.
pub async fn complete(
    tx: &mut Transaction<'_, Postgres>,
    payment: Payment,
    external_status: Option<&str>,
) -> Result<Payment, ApiError> {
    if payment.status == PaymentState::Completed {
        return Ok(payment);
    }

    let updated = sqlx::query_as::<_, Payment>(
        r#"
        UPDATE payments
        SET status = 'completed', completed_at = $1, external_status = COALESCE($2, external_status)
        WHERE id = $3
        RETURNING *
        "#,
    )
    .bind(Utc::now())
    .bind(external_status)
    .bind(payment.id)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE enrollments SET payment_status = 'paid'
        WHERE student_id = $1 AND course_id = $2 AND status IN ('active', 'completed')
        "#,
    )
    .bind(payment.student_id)
    .bind(payment.course_id)
    .execute(&mut **tx)
    .await?;

    notify::send(
        tx,
        Recipients::SingleUser(payment.student_id),
        "Payment received",
        &format!("Your payment {} was completed.", updated.transaction_id),
    )
    .await?;
    notify::send(
        tx,
        Recipients::AllAdmins,
        "Payment completed",
        &format!("Payment {} was completed.", updated.transaction_id),
    )
    .await?;

    tracing::info!(payment_id = %updated.id, "payment completed");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn config() -> BakongConfig {
        BakongConfig {
            base_url: "https://api-bakong.example".into(),
            merchant_account: "merchant@devb".into(),
            merchant_name: "LMS".into(),
            webhook_secret: "topsecret".into(),
            request_timeout: StdDuration::from_secs(5),
            qr_ttl: StdDuration::from_secs(900),
        }
    }

    fn payment(expires_at: DateTime<Utc>, status: PaymentState) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            amount: 25.0,
            method: "bakong_qr".into(),
            transaction_id: "TXN20260829000000000001".into(),
            status,
            qr_string: "payload".into(),
            md5_hash: payload_hash("payload"),
            expires_at,
            external_status: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn payload_embeds_merchant_and_amount() {
        let qr = build_khqr_payload(&config(), "TXN1", 25.0);
        assert!(qr.starts_with("000201"));
        assert!(qr.contains("merchant@devb"));
        assert!(qr.contains("25.00"));
        assert!(qr.contains("TXN1"));
    }

    #[test]
    fn payload_hash_is_stable_and_md5_sized() {
        let a = payload_hash("payload");
        let b = payload_hash("payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, payload_hash("other"));
    }

    #[test]
    fn transaction_ids_are_distinct() {
        let mut rng = rand::thread_rng();
        let a = generate_transaction_id(&mut rng);
        let b = generate_transaction_id(&mut rng);
        assert!(a.starts_with("TXN"));
        assert_ne!(a, b);
    }

    #[test]
    fn expiry_is_a_strict_boundary() {
        let now = Utc::now();
        let p = payment(now + Duration::minutes(1), PaymentState::Pending);
        assert!(!is_expired(&p, now));
        assert!(is_expired(&p, now + Duration::minutes(2)));
    }

    #[test]
    fn webhook_signature_round_trips() {
        let body = br#"{"transaction_id":"TXN1","status":"success"}"#;
        let sig = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, &sig));
        assert!(!verify_signature("wrong", body, &sig));
        assert!(!verify_signature("topsecret", b"tampered", &sig));
        assert!(!verify_signature("topsecret", body, "not-hex"));
    }
}
