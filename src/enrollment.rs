//! Enrollment lifecycle: eligibility checks, state transitions, access stamps.
//!
//! State machine: active -> completed (driven by progress aggregation),
//! active -> dropped (student-initiated), active -> expired (administrative).
//! Dropped and expired rows stay behind for history and do not block
//! re-enrollment.

use chrono::Utc;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{
    Course, CourseStatus, Enrollment, EnrollmentPaymentStatus, EnrollmentStatus, UserRole,
};
use crate::notify::{self, Recipients};

/// Pure eligibility rule. `has_live_enrollment` covers the (student, course)
/// pair; `live_count` is the course-wide active+completed total.
pub fn check_eligibility(
    course: &Course,
    has_live_enrollment: bool,
    live_count: i64,
) -> Result<(), ApiError> {
    if course.status != CourseStatus::Published {
        return Err(ApiError::CourseUnavailable);
    }
    if has_live_enrollment {
        return Err(ApiError::AlreadyEnrolled);
    }
    if let Some(limit) = course.enrollment_limit {
        if live_count >= i64::from(limit) {
            return Err(ApiError::CapacityExceeded);
        }
    }
    Ok(())
}

pub async fn enroll(
    tx: &mut Transaction<'_, Postgres>,
    student_id: Uuid,
    course_id: Uuid,
) -> Result<Enrollment, ApiError> {
    let course = sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = $1")
        .bind(course_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ApiError::NotFound)?;

    let has_live: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM enrollments
        WHERE student_id = $1 AND course_id = $2 AND status IN ('active', 'completed')
        "#,
    )
    .bind(student_id)
    .bind(course_id)
    .fetch_one(&mut **tx)
    .await?;

    let live_count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM enrollments
        WHERE course_id = $1 AND status IN ('active', 'completed')
        "#,
    )
    .bind(course_id)
    .fetch_one(&mut **tx)
    .await?;

    check_eligibility(&course, has_live > 0, live_count)?;

    // A concurrent winner makes this insert trip the partial unique index;
    // the loser surfaces a database error rather than a duplicate row.
    let enrollment = sqlx::query_as::<_, Enrollment>(
        r#"
        INSERT INTO enrollments (student_id, course_id, status, payment_status, progress_percentage)
        VALUES ($1, $2, 'active', $3, 0)
        RETURNING *
        "#,
    )
    .bind(student_id)
    .bind(course_id)
    .bind(if course.is_free() {
        EnrollmentPaymentStatus::Paid
    } else {
        EnrollmentPaymentStatus::Pending
    })
    .fetch_one(&mut **tx)
    .await?;

    notify::send(
        tx,
        Recipients::ByRole(UserRole::Admin),
        "New enrollment",
        &format!("A student enrolled in \"{}\".", course.title),
    )
    .await?;

    tracing::info!(enrollment_id = %enrollment.id, course_id = %course_id, "student enrolled");
    Ok(enrollment)
}

pub async fn drop_enrollment(
    tx: &mut Transaction<'_, Postgres>,
    enrollment: &Enrollment,
) -> Result<Enrollment, ApiError> {
    if enrollment.status == EnrollmentStatus::Completed {
        return Err(ApiError::InvalidTransition);
    }
    let updated = sqlx::query_as::<_, Enrollment>(
        "UPDATE enrollments SET status = 'dropped' WHERE id = $1 RETURNING *",
    )
    .bind(enrollment.id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(updated)
}

pub async fn record_access(
    tx: &mut Transaction<'_, Postgres>,
    enrollment_id: Uuid,
) -> Result<(), ApiError> {
    sqlx::query("UPDATE enrollments SET last_accessed_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(enrollment_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// The student's enrollment for a course, if any row exists (any status).
pub async fn find_for_pair(
    tx: &mut Transaction<'_, Postgres>,
    student_id: Uuid,
    course_id: Uuid,
) -> Result<Option<Enrollment>, ApiError> {
    let row = sqlx::query_as::<_, Enrollment>(
        r#"
        SELECT * FROM enrollments
        WHERE student_id = $1 AND course_id = $2
        ORDER BY enrolled_at DESC
        LIMIT 1
        "#,
    )
    .bind(student_id)
    .bind(course_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

/// The live (active/completed) enrollment granting content access, if any.
pub async fn find_live(
    tx: &mut Transaction<'_, Postgres>,
    student_id: Uuid,
    course_id: Uuid,
) -> Result<Option<Enrollment>, ApiError> {
    let row = sqlx::query_as::<_, Enrollment>(
        r#"
        SELECT * FROM enrollments
        WHERE student_id = $1 AND course_id = $2 AND status IN ('active', 'completed')
        "#,
    )
    .bind(student_id)
    .bind(course_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course(status: CourseStatus, limit: Option<i32>) -> Course {
        Course {
            id: Uuid::new_v4(),
            title: "Intro to Rust".into(),
            description: None,
            price: 25.0,
            status,
            enrollment_limit: limit,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn published_course_with_room_is_enrollable() {
        let c = course(CourseStatus::Published, Some(10));
        assert!(check_eligibility(&c, false, 3).is_ok());
    }

    #[test]
    fn unpublished_course_rejects_enrollment() {
        for status in [CourseStatus::Draft, CourseStatus::Archived] {
            let c = course(status, None);
            assert!(matches!(
                check_eligibility(&c, false, 0),
                Err(ApiError::CourseUnavailable)
            ));
        }
    }

    #[test]
    fn live_enrollment_blocks_duplicate() {
        let c = course(CourseStatus::Published, None);
        assert!(matches!(
            check_eligibility(&c, true, 1),
            Err(ApiError::AlreadyEnrolled)
        ));
    }

    #[test]
    fn capacity_one_admits_first_rejects_second() {
        let c = course(CourseStatus::Published, Some(1));
        // student A
        assert!(check_eligibility(&c, false, 0).is_ok());
        // student B, while A's enrollment is still live
        assert!(matches!(
            check_eligibility(&c, false, 1),
            Err(ApiError::CapacityExceeded)
        ));
    }

    #[test]
    fn unlimited_course_ignores_count() {
        let c = course(CourseStatus::Published, None);
        assert!(check_eligibility(&c, false, 100_000).is_ok());
    }

    #[test]
    fn dropped_history_does_not_block_reenrollment() {
        // a dropped row is not "live", so the pair check sees false
        let c = course(CourseStatus::Published, Some(5));
        assert!(check_eligibility(&c, false, 2).is_ok());
    }
}
