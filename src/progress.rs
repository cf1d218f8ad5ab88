//! Per-lesson progress tracking and the enrollment-level aggregate it drives.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::enrollment;
use crate::error::ApiError;
use crate::models::{Enrollment, EnrollmentStatus, Lesson, LessonProgress, ProgressPatch, ProgressStatus};

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Course-level completion ratio. `None` when the course has no lessons: a
/// zero-lesson course must never auto-complete.
pub fn aggregate_percentage(completed_lessons: i64, total_lessons: i64) -> Option<f64> {
    if total_lessons == 0 {
        return None;
    }
    Some(round2(completed_lessons as f64 / total_lessons as f64 * 100.0))
}

pub fn validate_patch(patch: &ProgressPatch) -> Result<(), ApiError> {
    if let Some(pct) = patch.progress_percentage {
        if !(0.0..=100.0).contains(&pct) {
            return Err(ApiError::validation(
                "progress_percentage",
                "must be between 0 and 100",
            ));
        }
    }
    if patch.time_spent_minutes.map_or(false, |t| t < 0) {
        return Err(ApiError::validation("time_spent_minutes", "must be >= 0"));
    }
    if patch.video_position_seconds.map_or(false, |v| v < 0) {
        return Err(ApiError::validation("video_position_seconds", "must be >= 0"));
    }
    if patch.scroll_position.map_or(false, |s| s < 0) {
        return Err(ApiError::validation("scroll_position", "must be >= 0"));
    }
    Ok(())
}

/// Applies a partial update in place. Completion forces the percentage to 100
/// and stamps `completed_at` exactly once. A completed lesson never regresses:
/// status and percentage patches are ignored once `completed_at` is set, while
/// time and position fields stay updatable for revisits.
pub fn apply_patch(progress: &mut LessonProgress, patch: &ProgressPatch, now: DateTime<Utc>) {
    let already_completed = progress.completed_at.is_some();
    if let Some(pct) = patch.progress_percentage {
        if !already_completed {
            progress.progress_percentage = round2(pct);
        }
    }
    if let Some(minutes) = patch.time_spent_minutes {
        progress.time_spent_minutes = minutes;
    }
    if let Some(seconds) = patch.video_position_seconds {
        progress.video_position_seconds = seconds;
    }
    if let Some(offset) = patch.scroll_position {
        progress.scroll_position = offset;
    }
    if let Some(status) = patch.status {
        if !already_completed {
            progress.status = status;
            if status == ProgressStatus::Completed {
                progress.progress_percentage = 100.0;
                progress.completed_at = Some(now);
            }
        }
    }
    progress.last_accessed_at = now;
}

pub async fn update_progress(
    tx: &mut Transaction<'_, Postgres>,
    student_id: Uuid,
    lesson: &Lesson,
    patch: &ProgressPatch,
) -> Result<LessonProgress, ApiError> {
    validate_patch(patch)?;

    let enrollment = enrollment::find_live(tx, student_id, lesson.course_id)
        .await?
        .ok_or(ApiError::NotEnrolled)?;

    let now = Utc::now();
    let mut progress = match fetch(tx, student_id, lesson.id).await? {
        Some(existing) => existing,
        // first access creates the row and stamps first_accessed_at
        None => {
            sqlx::query_as::<_, LessonProgress>(
                r#"
                INSERT INTO lesson_progress (student_id, lesson_id, status, first_accessed_at, last_accessed_at)
                VALUES ($1, $2, 'in_progress', $3, $3)
                RETURNING *
                "#,
            )
            .bind(student_id)
            .bind(lesson.id)
            .bind(now)
            .fetch_one(&mut **tx)
            .await?
        }
    };

    apply_patch(&mut progress, patch, now);

    let updated = sqlx::query_as::<_, LessonProgress>(
        r#"
        UPDATE lesson_progress
        SET status = $1, progress_percentage = $2, time_spent_minutes = $3,
            video_position_seconds = $4, scroll_position = $5,
            last_accessed_at = $6, completed_at = $7
        WHERE id = $8
        RETURNING *
        "#,
    )
    .bind(progress.status)
    .bind(progress.progress_percentage)
    .bind(progress.time_spent_minutes)
    .bind(progress.video_position_seconds)
    .bind(progress.scroll_position)
    .bind(progress.last_accessed_at)
    .bind(progress.completed_at)
    .bind(progress.id)
    .fetch_one(&mut **tx)
    .await?;

    refresh_enrollment_aggregate(tx, &enrollment, now).await?;
    Ok(updated)
}

/// Recomputes the enrollment's course-wide percentage and flips it to
/// completed at 100%. A completed enrollment is frozen: its percentage is
/// never rewritten, even if lessons are added to the course afterwards.
async fn refresh_enrollment_aggregate(
    tx: &mut Transaction<'_, Postgres>,
    enrollment: &Enrollment,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    if enrollment.status != EnrollmentStatus::Active {
        return Ok(());
    }

    let total_lessons: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM lessons WHERE course_id = $1")
            .bind(enrollment.course_id)
            .fetch_one(&mut **tx)
            .await?;

    let completed_lessons: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM lesson_progress lp
        JOIN lessons l ON l.id = lp.lesson_id
        WHERE lp.student_id = $1 AND l.course_id = $2 AND lp.status = 'completed'
        "#,
    )
    .bind(enrollment.student_id)
    .bind(enrollment.course_id)
    .fetch_one(&mut **tx)
    .await?;

    let Some(percentage) = aggregate_percentage(completed_lessons, total_lessons) else {
        return Ok(());
    };

    if percentage >= 100.0 {
        sqlx::query(
            r#"
            UPDATE enrollments
            SET progress_percentage = $1, status = 'completed', completed_at = $2
            WHERE id = $3
            "#,
        )
        .bind(percentage)
        .bind(now)
        .bind(enrollment.id)
        .execute(&mut **tx)
        .await?;
        tracing::info!(enrollment_id = %enrollment.id, "course completed");
    } else {
        sqlx::query("UPDATE enrollments SET progress_percentage = $1 WHERE id = $2")
            .bind(percentage)
            .bind(enrollment.id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn fetch(
    tx: &mut Transaction<'_, Postgres>,
    student_id: Uuid,
    lesson_id: Uuid,
) -> Result<Option<LessonProgress>, ApiError> {
    let row = sqlx::query_as::<_, LessonProgress>(
        "SELECT * FROM lesson_progress WHERE student_id = $1 AND lesson_id = $2",
    )
    .bind(student_id)
    .bind(lesson_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_progress(now: DateTime<Utc>) -> LessonProgress {
        LessonProgress {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            lesson_id: Uuid::new_v4(),
            status: ProgressStatus::InProgress,
            progress_percentage: 0.0,
            time_spent_minutes: 0,
            video_position_seconds: 0,
            scroll_position: 0,
            first_accessed_at: now,
            last_accessed_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn zero_lessons_short_circuits_aggregation() {
        assert_eq!(aggregate_percentage(0, 0), None);
    }

    #[test]
    fn aggregate_rounds_to_two_decimals() {
        assert_eq!(aggregate_percentage(1, 3), Some(33.33));
        assert_eq!(aggregate_percentage(2, 3), Some(66.67));
        assert_eq!(aggregate_percentage(3, 3), Some(100.0));
    }

    #[test]
    fn completing_forces_full_percentage() {
        let now = Utc::now();
        let mut p = fresh_progress(now);
        let patch = ProgressPatch {
            status: Some(ProgressStatus::Completed),
            progress_percentage: Some(40.0),
            ..Default::default()
        };
        apply_patch(&mut p, &patch, now);
        assert_eq!(p.progress_percentage, 100.0);
        assert_eq!(p.completed_at, Some(now));
        assert_eq!(p.status, ProgressStatus::Completed);
    }

    #[test]
    fn recompleting_does_not_restamp() {
        let first = Utc::now();
        let mut p = fresh_progress(first);
        let patch = ProgressPatch {
            status: Some(ProgressStatus::Completed),
            ..Default::default()
        };
        apply_patch(&mut p, &patch, first);

        let later = first + chrono::Duration::minutes(5);
        apply_patch(&mut p, &patch, later);
        assert_eq!(p.completed_at, Some(first));
        assert_eq!(p.last_accessed_at, later);
    }

    #[test]
    fn completed_lesson_never_regresses() {
        let first = Utc::now();
        let mut p = fresh_progress(first);
        apply_patch(
            &mut p,
            &ProgressPatch {
                status: Some(ProgressStatus::Completed),
                ..Default::default()
            },
            first,
        );

        // a later patch trying to walk the lesson back is ignored, so the
        // course aggregate keeps counting it as completed
        let later = first + chrono::Duration::minutes(10);
        apply_patch(
            &mut p,
            &ProgressPatch {
                status: Some(ProgressStatus::InProgress),
                progress_percentage: Some(40.0),
                time_spent_minutes: Some(55),
                ..Default::default()
            },
            later,
        );
        assert_eq!(p.status, ProgressStatus::Completed);
        assert_eq!(p.progress_percentage, 100.0);
        assert_eq!(p.completed_at, Some(first));
        // revisit bookkeeping still flows
        assert_eq!(p.time_spent_minutes, 55);
        assert_eq!(p.last_accessed_at, later);
    }

    #[test]
    fn partial_patch_leaves_other_fields() {
        let now = Utc::now();
        let mut p = fresh_progress(now);
        p.time_spent_minutes = 12;
        let patch = ProgressPatch {
            video_position_seconds: Some(90),
            ..Default::default()
        };
        apply_patch(&mut p, &patch, now);
        assert_eq!(p.time_spent_minutes, 12);
        assert_eq!(p.video_position_seconds, 90);
        assert_eq!(p.status, ProgressStatus::InProgress);
    }

    #[test]
    fn patch_bounds_are_validated() {
        let over = ProgressPatch {
            progress_percentage: Some(100.5),
            ..Default::default()
        };
        assert!(matches!(validate_patch(&over), Err(ApiError::Validation(_))));

        let negative = ProgressPatch {
            time_spent_minutes: Some(-1),
            ..Default::default()
        };
        assert!(matches!(validate_patch(&negative), Err(ApiError::Validation(_))));

        assert!(validate_patch(&ProgressPatch::default()).is_ok());
    }
}
