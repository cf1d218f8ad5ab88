use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{self, AdminUser, AuthUser};
use crate::config::Config;
use crate::db::Db;
use crate::error::ApiError;
use crate::models::*;
use crate::payment::BakongClient;
use crate::{certificate, enrollment, payment, progress, quiz};

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Config,
    pub bakong: BakongClient,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/courses", get(list_courses))
        .route("/api/courses/:id", get(get_course))
        .route("/api/enrollments", post(create_enrollment))
        .route("/api/enrollments/:id", get(get_enrollment).delete(drop_enrollment))
        .route("/api/lessons/:id/progress", put(update_lesson_progress))
        .route("/api/quizzes/:id", get(get_quiz))
        .route("/api/quizzes/:id/attempts", post(start_attempt))
        .route("/api/quizzes/attempts/:id", put(submit_attempt).get(get_attempt))
        .route("/api/payments", post(create_payment))
        .route("/api/payments/:id", get(get_payment))
        .route("/api/payments/webhook", post(payment_webhook))
        .route("/api/certificates", post(issue_certificate))
        .route("/api/certificates/:id", delete(revoke_certificate))
        .route("/api/certificates/verify/:code", get(verify_certificate))
        .route("/api/notifications", get(list_notifications))
        .with_state(state)
}

fn ok<T: serde::Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

// --- auth ---

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterReq>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let response = auth::register(&mut tx, &req).await?;
    tx.commit().await?;
    Ok(ok(response))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let response = auth::login(&mut tx, &req).await?;
    tx.commit().await?;
    Ok(ok(response))
}

// --- courses ---

async fn list_courses(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let courses = sqlx::query_as::<_, Course>(
        "SELECT * FROM courses WHERE status = 'published' ORDER BY created_at DESC",
    )
    .fetch_all(&state.db)
    .await?;
    Ok(ok(courses))
}

async fn get_course(
    State(state): State<AppState>,
    Path(course_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let course = sqlx::query_as::<_, Course>(
        "SELECT * FROM courses WHERE id = $1 AND status = 'published'",
    )
    .bind(course_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(ApiError::NotFound)?;
    let lessons = sqlx::query_as::<_, Lesson>(
        "SELECT * FROM lessons WHERE course_id = $1 ORDER BY position",
    )
    .bind(course_id)
    .fetch_all(&state.db)
    .await?;
    Ok(ok(json!({ "course": course, "lessons": lessons })))
}

// --- enrollments ---

async fn create_enrollment(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<EnrollReq>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let enrollment = enrollment::enroll(&mut tx, user.id, req.course_id).await?;
    tx.commit().await?;
    Ok(ok(enrollment))
}

async fn get_enrollment(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(enrollment_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let enrollment = fetch_owned_enrollment(&mut tx, &user, enrollment_id).await?;
    // viewing an enrollment counts as accessing the course
    if enrollment.student_id == user.id {
        enrollment::record_access(&mut tx, enrollment.id).await?;
    }
    tx.commit().await?;
    Ok(ok(enrollment))
}

async fn drop_enrollment(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(enrollment_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let enrollment = fetch_owned_enrollment(&mut tx, &user, enrollment_id).await?;
    let dropped = enrollment::drop_enrollment(&mut tx, &enrollment).await?;
    tx.commit().await?;
    Ok(ok(dropped))
}

/// Ownership mismatches are masked as NotFound so ids cannot be probed.
async fn fetch_owned_enrollment(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user: &User,
    enrollment_id: Uuid,
) -> Result<Enrollment, ApiError> {
    let enrollment = sqlx::query_as::<_, Enrollment>(
        "SELECT * FROM enrollments WHERE id = $1",
    )
    .bind(enrollment_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(ApiError::NotFound)?;
    if enrollment.student_id != user.id && user.role != UserRole::Admin {
        return Err(ApiError::NotFound);
    }
    Ok(enrollment)
}

// --- lesson progress ---

async fn update_lesson_progress(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(lesson_id): Path<Uuid>,
    Json(patch): Json<ProgressPatch>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let lesson = sqlx::query_as::<_, Lesson>("SELECT * FROM lessons WHERE id = $1")
        .bind(lesson_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NotFound)?;
    let updated = progress::update_progress(&mut tx, user.id, &lesson, &patch).await?;
    tx.commit().await?;
    Ok(ok(updated))
}

// --- quizzes ---

async fn get_quiz(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(quiz_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let quiz = fetch_quiz(&mut tx, quiz_id).await?;
    ensure_quiz_access(&mut tx, &user, quiz_id).await?;
    let questions = fetch_questions_with_options(&mut tx, quiz_id).await?;
    tx.commit().await?;
    let view = QuizView {
        questions: quiz::present_questions(&quiz, questions),
        quiz,
    };
    Ok(ok(view))
}

async fn start_attempt(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(quiz_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let quiz = fetch_quiz(&mut tx, quiz_id).await?;
    ensure_quiz_access(&mut tx, &user, quiz_id).await?;
    let attempt = quiz::start_attempt(&mut tx, user.id, &quiz).await?;
    let questions = fetch_questions_with_options(&mut tx, quiz_id).await?;
    tx.commit().await?;
    Ok(ok(json!({
        "attempt": attempt,
        "questions": quiz::present_questions(&quiz, questions),
    })))
}

async fn submit_attempt(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(attempt_id): Path<Uuid>,
    Json(req): Json<SubmitAttemptReq>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let attempt = fetch_attempt(&mut tx, attempt_id).await?;
    let quiz = fetch_quiz(&mut tx, attempt.quiz_id).await?;
    let finalized = quiz::submit_attempt(&mut tx, user.id, &attempt, &quiz, &req.answers).await?;
    tx.commit().await?;
    Ok(ok(finalized))
}

async fn get_attempt(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(attempt_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let attempt = fetch_attempt(&mut tx, attempt_id).await?;
    let quiz = fetch_quiz(&mut tx, attempt.quiz_id).await?;
    let answers = quiz::attempt_answers(&mut tx, user.id, &attempt, &quiz).await?;
    tx.commit().await?;
    Ok(ok(AttemptView { attempt, answers }))
}

async fn fetch_quiz(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    quiz_id: Uuid,
) -> Result<Quiz, ApiError> {
    sqlx::query_as::<_, Quiz>("SELECT * FROM quizzes WHERE id = $1")
        .bind(quiz_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ApiError::NotFound)
}

async fn fetch_attempt(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    attempt_id: Uuid,
) -> Result<QuizAttempt, ApiError> {
    sqlx::query_as::<_, QuizAttempt>("SELECT * FROM quiz_attempts WHERE id = $1")
        .bind(attempt_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ApiError::NotFound)
}

/// Quiz access follows lesson access: the quiz must be attached to a lesson
/// in a course the student holds a live enrollment for.
async fn ensure_quiz_access(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user: &User,
    quiz_id: Uuid,
) -> Result<(), ApiError> {
    if user.role == UserRole::Admin {
        return Ok(());
    }
    let course_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT course_id FROM lessons WHERE quiz_id = $1 LIMIT 1",
    )
    .bind(quiz_id)
    .fetch_optional(&mut **tx)
    .await?;
    let course_id = course_id.ok_or(ApiError::NotFound)?;
    enrollment::find_live(tx, user.id, course_id)
        .await?
        .ok_or(ApiError::NotEnrolled)?;
    Ok(())
}

async fn fetch_questions_with_options(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    quiz_id: Uuid,
) -> Result<Vec<(QuizQuestion, Vec<QuizOption>)>, ApiError> {
    let questions = sqlx::query_as::<_, QuizQuestion>(
        "SELECT * FROM quiz_questions WHERE quiz_id = $1",
    )
    .bind(quiz_id)
    .fetch_all(&mut **tx)
    .await?;
    let mut out = Vec::with_capacity(questions.len());
    for question in questions {
        let options = sqlx::query_as::<_, QuizOption>(
            "SELECT * FROM quiz_options WHERE question_id = $1",
        )
        .bind(question.id)
        .fetch_all(&mut **tx)
        .await?;
        out.push((question, options));
    }
    Ok(out)
}

// --- payments ---

async fn create_payment(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<InitiatePaymentReq>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let course = sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = $1")
        .bind(req.course_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NotFound)?;
    let created = payment::initiate(&mut tx, &state.config.bakong, user.id, &course).await?;
    tx.commit().await?;
    Ok(ok(created))
}

async fn get_payment(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let row = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NotFound)?;
    if row.student_id != user.id && user.role != UserRole::Admin {
        return Err(ApiError::NotFound);
    }
    let observed = payment::observe_status(&mut tx, &state.bakong, row).await?;
    tx.commit().await?;
    Ok(ok(observed))
}

#[derive(Deserialize)]
struct WebhookPayload {
    transaction_id: String,
    status: String,
    reference: Option<String>,
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get("x-bakong-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::PermissionDenied)?;
    if !payment::verify_signature(&state.config.bakong.webhook_secret, &body, signature) {
        tracing::warn!("webhook rejected: bad signature");
        return Err(ApiError::PermissionDenied);
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|_| ApiError::validation("body", "malformed webhook payload"))?;

    let mut tx = state.db.begin().await?;
    let row = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE transaction_id = $1",
    )
    .bind(&payload.transaction_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ApiError::NotFound)?;

    let updated = if payload.status == "success" {
        payment::complete(&mut tx, row, payload.reference.as_deref()).await?
    } else {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET status = 'failed', external_status = $1
            WHERE id = $2 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(&payload.status)
        .bind(row.id)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(row)
    };
    tx.commit().await?;
    Ok(ok(updated))
}

// --- certificates ---

async fn issue_certificate(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<IssueCertificateReq>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let cert = certificate::issue(
        &mut tx,
        req.student_id,
        req.course_id,
        &state.config.app_url,
    )
    .await?;
    tx.commit().await?;
    Ok(ok(cert))
}

async fn revoke_certificate(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(certificate_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let cert = sqlx::query_as::<_, Certificate>(
        "SELECT * FROM certificates WHERE id = $1",
    )
    .bind(certificate_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ApiError::NotFound)?;
    certificate::revoke(&mut tx, &cert).await?;
    tx.commit().await?;
    Ok(ok(json!({ "revoked": true })))
}

// --- notifications ---

async fn list_notifications(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Value>, ApiError> {
    let notifications = sqlx::query_as::<_, Notification>(
        "SELECT * FROM notifications WHERE user_id = $1 ORDER BY created_at DESC LIMIT 50",
    )
    .bind(user.id)
    .fetch_all(&state.db)
    .await?;
    Ok(ok(notifications))
}

async fn verify_certificate(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mut tx = state.db.begin().await?;
    let cert = certificate::find_by_code(&mut tx, &code)
        .await?
        .ok_or(ApiError::NotFound)?;
    tx.commit().await?;
    Ok(ok(cert))
}
