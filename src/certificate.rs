//! Certificate issuance, revocation, and public verification.

use chrono::{Datelike, Utc};
use rand::Rng;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::enrollment;
use crate::error::ApiError;
use crate::models::Certificate;
use crate::notify::{self, Recipients};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_SUFFIX_LEN: usize = 8;

/// Human-readable code: `CERT-<year>-<8 chars>` from an alphabet without
/// the lookalikes 0/O/1/I.
pub fn generate_code<R: Rng>(year: i32, rng: &mut R) -> String {
    let suffix: String = (0..CODE_SUFFIX_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect();
    format!("CERT-{}-{}", year, suffix)
}

pub fn verification_url(app_url: &str, code: &str) -> String {
    format!("{}/api/certificates/verify/{}", app_url.trim_end_matches('/'), code)
}

/// Issues a certificate for the pair. Requires an enrollment row to exist but
/// intentionally not that it is completed, matching the upstream behavior.
pub async fn issue(
    tx: &mut Transaction<'_, Postgres>,
    student_id: Uuid,
    course_id: Uuid,
    app_url: &str,
) -> Result<Certificate, ApiError> {
    let existing: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM certificates WHERE student_id = $1 AND course_id = $2",
    )
    .bind(student_id)
    .bind(course_id)
    .fetch_one(&mut **tx)
    .await?;
    if existing > 0 {
        return Err(ApiError::AlreadyIssued);
    }

    let enrollment = enrollment::find_for_pair(tx, student_id, course_id)
        .await?
        .ok_or(ApiError::NotEnrolled)?;

    let code = unique_code(tx).await?;
    let url = verification_url(app_url, &code);

    let certificate = sqlx::query_as::<_, Certificate>(
        r#"
        INSERT INTO certificates (student_id, course_id, code, issue_date, verification_url)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(student_id)
    .bind(course_id)
    .bind(&code)
    .bind(Utc::now())
    .bind(&url)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query("UPDATE enrollments SET certificate_issued = TRUE WHERE id = $1")
        .bind(enrollment.id)
        .execute(&mut **tx)
        .await?;

    notify::send(
        tx,
        Recipients::SingleUser(student_id),
        "Certificate issued",
        &format!("Your certificate {} is ready.", code),
    )
    .await?;

    tracing::info!(certificate_id = %certificate.id, code = %code, "certificate issued");
    Ok(certificate)
}

pub async fn revoke(
    tx: &mut Transaction<'_, Postgres>,
    certificate: &Certificate,
) -> Result<(), ApiError> {
    sqlx::query("DELETE FROM certificates WHERE id = $1")
        .bind(certificate.id)
        .execute(&mut **tx)
        .await?;
    // resets the flag only if the enrollment is still around
    sqlx::query(
        "UPDATE enrollments SET certificate_issued = FALSE WHERE student_id = $1 AND course_id = $2",
    )
    .bind(certificate.student_id)
    .bind(certificate.course_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn find_by_code(
    tx: &mut Transaction<'_, Postgres>,
    code: &str,
) -> Result<Option<Certificate>, ApiError> {
    let row = sqlx::query_as::<_, Certificate>("SELECT * FROM certificates WHERE code = $1")
        .bind(code)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row)
}

async fn unique_code(tx: &mut Transaction<'_, Postgres>) -> Result<String, ApiError> {
    let year = Utc::now().year();
    loop {
        let code = generate_code(year, &mut rand::thread_rng());
        let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM certificates WHERE code = $1")
            .bind(&code)
            .fetch_one(&mut **tx)
            .await?;
        if taken == 0 {
            return Ok(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_carry_prefix_and_year() {
        let code = generate_code(2026, &mut rand::thread_rng());
        assert!(code.starts_with("CERT-2026-"));
        assert_eq!(code.len(), "CERT-2026-".len() + CODE_SUFFIX_LEN);
    }

    #[test]
    fn a_thousand_codes_do_not_collide() {
        let mut rng = rand::thread_rng();
        let codes: HashSet<String> = (0..1000).map(|_| generate_code(2026, &mut rng)).collect();
        assert_eq!(codes.len(), 1000);
    }

    #[test]
    fn codes_avoid_lookalike_characters() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let code = generate_code(2026, &mut rng);
            let suffix = &code["CERT-2026-".len()..];
            assert!(suffix.chars().all(|c| !"0O1I".contains(c)), "{}", code);
        }
    }

    #[test]
    fn verification_url_tolerates_trailing_slash() {
        assert_eq!(
            verification_url("https://lms.example.com/", "CERT-2026-ABCD2345"),
            "https://lms.example.com/api/certificates/verify/CERT-2026-ABCD2345"
        );
    }
}
