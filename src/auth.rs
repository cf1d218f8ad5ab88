//! Registration, login, and bearer-token extraction.
//!
//! Tokens are opaque uuids stored server-side; a request presents one as
//! `Authorization: Bearer <token>` and the extractor resolves it to a user.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::RequestPartsExt;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{AuthResponse, LoginReq, RegisterReq, User, UserRole};
use crate::routes::AppState;

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| ApiError::Internal)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

pub fn validate_registration(req: &RegisterReq) -> Result<(), ApiError> {
    if !req.email.contains('@') {
        return Err(ApiError::validation("email", "must be a valid email address"));
    }
    if req.password.len() < 8 {
        return Err(ApiError::validation("password", "must be at least 8 characters"));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::validation("name", "must not be empty"));
    }
    Ok(())
}

pub async fn register(
    tx: &mut Transaction<'_, Postgres>,
    req: &RegisterReq,
) -> Result<AuthResponse, ApiError> {
    validate_registration(req)?;

    let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = $1")
        .bind(&req.email)
        .fetch_one(&mut **tx)
        .await?;
    if taken > 0 {
        return Err(ApiError::validation("email", "already registered"));
    }

    let password_hash = hash_password(&req.password)?;
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (email, password_hash, name, role)
        VALUES ($1, $2, $3, 'student')
        RETURNING *
        "#,
    )
    .bind(&req.email)
    .bind(&password_hash)
    .bind(&req.name)
    .fetch_one(&mut **tx)
    .await?;

    let token = issue_token(tx, user.id).await?;
    tracing::info!(user_id = %user.id, "user registered");
    Ok(AuthResponse { token, user })
}

pub async fn login(
    tx: &mut Transaction<'_, Postgres>,
    req: &LoginReq,
) -> Result<AuthResponse, ApiError> {
    let user = sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE email = $1 AND is_active",
    )
    .bind(&req.email)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(ApiError::InvalidCredentials)?;

    if !verify_password(&req.password, &user.password_hash) {
        return Err(ApiError::InvalidCredentials);
    }

    let token = issue_token(tx, user.id).await?;
    Ok(AuthResponse { token, user })
}

async fn issue_token(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<Uuid, ApiError> {
    let token: Uuid = sqlx::query_scalar(
        "INSERT INTO api_tokens (user_id) VALUES ($1) RETURNING token",
    )
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(token)
}

/// The authenticated caller.
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| ApiError::InvalidCredentials)?;
        let token: Uuid = bearer
            .token()
            .parse()
            .map_err(|_| ApiError::InvalidCredentials)?;

        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT u.* FROM users u
            JOIN api_tokens t ON t.user_id = u.id
            WHERE t.token = $1 AND u.is_active
            "#,
        )
        .bind(token)
        .fetch_optional(&state.db)
        .await?
        .ok_or(ApiError::InvalidCredentials)?;

        Ok(AuthUser(user))
    }
}

/// Same as [`AuthUser`] but restricted to admins.
pub struct AdminUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        if user.role != UserRole::Admin {
            return Err(ApiError::PermissionDenied);
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trips() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(verify_password("correct horse battery", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn malformed_hash_never_verifies() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn registration_input_is_validated() {
        let valid = RegisterReq {
            email: "student@example.com".into(),
            password: "longenough".into(),
            name: "Student".into(),
        };
        assert!(validate_registration(&valid).is_ok());

        let mut bad_email = valid.clone();
        bad_email.email = "nope".into();
        assert!(matches!(
            validate_registration(&bad_email),
            Err(ApiError::Validation(_))
        ));

        let mut short_password = valid.clone();
        short_password.password = "short".into();
        assert!(matches!(
            validate_registration(&short_password),
            Err(ApiError::Validation(_))
        ));

        let mut blank_name = valid;
        blank_name.name = "  ".into();
        assert!(matches!(
            validate_registration(&blank_name),
            Err(ApiError::Validation(_))
        ));
    }
}
