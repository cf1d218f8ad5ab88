//! Quiz attempt lifecycle and scoring.
//!
//! An attempt moves not_started -> in_progress (row created, submitted_at
//! null) -> submitted (score finalized). Submitted attempts are immutable.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use sqlx::{Postgres, Transaction};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{
    AnswerSubmission, AnswerView, OptionView, QuestionView, Quiz, QuizAnswer, QuizAttempt,
    QuizOption, QuizQuestion,
};
use crate::progress::round2;

pub fn check_attempt_limit(max_attempts: Option<i32>, used: i64) -> Result<(), ApiError> {
    if let Some(max) = max_attempts {
        if used >= i64::from(max) {
            return Err(ApiError::AttemptLimitReached);
        }
    }
    Ok(())
}

/// What starting an attempt should do for this (quiz, student) pair.
#[derive(Debug)]
pub enum AttemptStart {
    /// An open attempt already exists; hand it back, never open a second.
    Resume(QuizAttempt),
    /// No open attempt; create one with this number.
    New { attempt_number: i32 },
}

/// Resume-or-create decision. An open attempt always resumes, even when the
/// pair is at its attempt limit; the limit only gates new rows.
pub fn decide_start(
    open: Option<QuizAttempt>,
    max_attempts: Option<i32>,
    used: i64,
) -> Result<AttemptStart, ApiError> {
    if let Some(attempt) = open {
        return Ok(AttemptStart::Resume(attempt));
    }
    check_attempt_limit(max_attempts, used)?;
    Ok(AttemptStart::New {
        attempt_number: (used + 1) as i32,
    })
}

/// Gate for mutating an attempt: the requester must own it and it must still
/// be open. Submitted attempts are terminal.
pub fn check_submittable(attempt: &QuizAttempt, requester_id: Uuid) -> Result<(), ApiError> {
    if attempt.student_id != requester_id {
        return Err(ApiError::AttemptNotOwned);
    }
    if attempt.is_submitted() {
        return Err(ApiError::AlreadySubmitted);
    }
    Ok(())
}

/// Grades one answer. Choice questions are scored off the selected option's
/// correctness flag; short-answer and essay are recorded ungraded (0 points,
/// manual grading happens elsewhere).
pub fn grade_answer(
    question: &QuizQuestion,
    options: &[QuizOption],
    selected_option_id: Option<Uuid>,
) -> (bool, f64) {
    if !question.question_type.auto_graded() {
        return (false, 0.0);
    }
    let correct = selected_option_id
        .and_then(|id| options.iter().find(|o| o.id == id))
        .map(|o| o.is_correct)
        .unwrap_or(false);
    if correct {
        (true, question.points)
    } else {
        (false, 0.0)
    }
}

pub fn score_percentage(total_points: f64, max_points: f64) -> f64 {
    if max_points <= 0.0 {
        0.0
    } else {
        round2(total_points / max_points * 100.0)
    }
}

pub fn minutes_between(started_at: DateTime<Utc>, now: DateTime<Utc>) -> i32 {
    let seconds = (now - started_at).num_seconds().max(0);
    (seconds as f64 / 60.0).round() as i32
}

/// Correct options are shown only after submission, and only when the quiz
/// opts in.
pub fn reveal_correct_answers(quiz: &Quiz, attempt: &QuizAttempt) -> bool {
    quiz.show_correct_answers && attempt.is_submitted()
}

/// Builds the student-facing question list. Randomized ordering (questions
/// and, independently, each question's options) is presentation-only and
/// never persisted.
pub fn present_questions(
    quiz: &Quiz,
    mut questions: Vec<(QuizQuestion, Vec<QuizOption>)>,
) -> Vec<QuestionView> {
    if quiz.randomize_questions {
        let mut rng = rand::thread_rng();
        questions.shuffle(&mut rng);
        for (_, options) in questions.iter_mut() {
            options.shuffle(&mut rng);
        }
    } else {
        questions.sort_by_key(|(q, _)| q.position);
        for (_, options) in questions.iter_mut() {
            options.sort_by_key(|o| o.position);
        }
    }
    questions
        .into_iter()
        .map(|(q, options)| QuestionView {
            id: q.id,
            question_text: q.question_text,
            question_type: q.question_type,
            points: q.points,
            options: options
                .into_iter()
                .map(|o| OptionView {
                    id: o.id,
                    option_text: o.option_text,
                })
                .collect(),
        })
        .collect()
}

/// Starts (or resumes) an attempt. An open attempt for the pair is returned
/// unchanged; otherwise a new row is created with the next attempt number and
/// the quiz's full point total.
pub async fn start_attempt(
    tx: &mut Transaction<'_, Postgres>,
    student_id: Uuid,
    quiz: &Quiz,
) -> Result<QuizAttempt, ApiError> {
    let open = sqlx::query_as::<_, QuizAttempt>(
        r#"
        SELECT * FROM quiz_attempts
        WHERE quiz_id = $1 AND student_id = $2 AND submitted_at IS NULL
        ORDER BY attempt_number DESC
        LIMIT 1
        "#,
    )
    .bind(quiz.id)
    .bind(student_id)
    .fetch_optional(&mut **tx)
    .await?;

    let used: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM quiz_attempts WHERE quiz_id = $1 AND student_id = $2",
    )
    .bind(quiz.id)
    .bind(student_id)
    .fetch_one(&mut **tx)
    .await?;

    let attempt_number = match decide_start(open, quiz.max_attempts, used)? {
        AttemptStart::Resume(attempt) => return Ok(attempt),
        AttemptStart::New { attempt_number } => attempt_number,
    };

    let max_points: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(points), 0) FROM quiz_questions WHERE quiz_id = $1",
    )
    .bind(quiz.id)
    .fetch_one(&mut **tx)
    .await?;

    let attempt = sqlx::query_as::<_, QuizAttempt>(
        r#"
        INSERT INTO quiz_attempts (quiz_id, student_id, attempt_number, started_at, max_points)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(quiz.id)
    .bind(student_id)
    .bind(attempt_number)
    .bind(Utc::now())
    .bind(max_points)
    .fetch_one(&mut **tx)
    .await?;

    tracing::info!(attempt_id = %attempt.id, quiz_id = %quiz.id, number = attempt.attempt_number, "attempt started");
    Ok(attempt)
}

/// Grades and finalizes an attempt. Answer rows and the attempt update share
/// the caller's transaction, so a failure partway persists nothing.
pub async fn submit_attempt(
    tx: &mut Transaction<'_, Postgres>,
    requester_id: Uuid,
    attempt: &QuizAttempt,
    quiz: &Quiz,
    answers: &[AnswerSubmission],
) -> Result<QuizAttempt, ApiError> {
    check_submittable(attempt, requester_id)?;

    let questions = sqlx::query_as::<_, QuizQuestion>(
        "SELECT * FROM quiz_questions WHERE quiz_id = $1",
    )
    .bind(quiz.id)
    .fetch_all(&mut **tx)
    .await?;
    let options = sqlx::query_as::<_, QuizOption>(
        r#"
        SELECT o.* FROM quiz_options o
        JOIN quiz_questions q ON q.id = o.question_id
        WHERE q.quiz_id = $1
        "#,
    )
    .bind(quiz.id)
    .fetch_all(&mut **tx)
    .await?;

    let mut total_points = 0.0;
    let mut seen: HashSet<Uuid> = HashSet::new();
    for submission in answers {
        let question = questions
            .iter()
            .find(|q| q.id == submission.question_id)
            .ok_or_else(|| ApiError::validation("answers", "unknown question for this quiz"))?;
        if !seen.insert(question.id) {
            return Err(ApiError::validation("answers", "duplicate answer for a question"));
        }
        let question_options: Vec<QuizOption> = options
            .iter()
            .filter(|o| o.question_id == question.id)
            .cloned()
            .collect();
        let (is_correct, points_earned) =
            grade_answer(question, &question_options, submission.selected_option_id);
        total_points += points_earned;

        sqlx::query(
            r#"
            INSERT INTO quiz_answers
              (attempt_id, question_id, selected_option_id, answer_text, is_correct, points_earned)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(attempt.id)
        .bind(question.id)
        .bind(submission.selected_option_id)
        .bind(submission.answer_text.as_deref())
        .bind(is_correct)
        .bind(points_earned)
        .execute(&mut **tx)
        .await?;
    }

    // unanswered questions still count toward max_points (precomputed at start)
    let now = Utc::now();
    let score = score_percentage(total_points, attempt.max_points);
    let passed = score >= quiz.passing_score;

    let finalized = sqlx::query_as::<_, QuizAttempt>(
        r#"
        UPDATE quiz_attempts
        SET submitted_at = $1, total_points = $2, score_percentage = $3,
            passed = $4, time_taken_minutes = $5
        WHERE id = $6 AND submitted_at IS NULL
        RETURNING *
        "#,
    )
    .bind(now)
    .bind(total_points)
    .bind(score)
    .bind(passed)
    .bind(minutes_between(attempt.started_at, now))
    .bind(attempt.id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(ApiError::AlreadySubmitted)?;

    tracing::info!(
        attempt_id = %finalized.id,
        score = finalized.score_percentage,
        passed = finalized.passed,
        "attempt submitted"
    );
    Ok(finalized)
}

/// Owner-only attempt view; ownership misses are masked as NotFound.
pub async fn attempt_answers(
    tx: &mut Transaction<'_, Postgres>,
    requester_id: Uuid,
    attempt: &QuizAttempt,
    quiz: &Quiz,
) -> Result<Vec<AnswerView>, ApiError> {
    if attempt.student_id != requester_id {
        return Err(ApiError::NotFound);
    }
    let answers = sqlx::query_as::<_, QuizAnswer>(
        "SELECT * FROM quiz_answers WHERE attempt_id = $1",
    )
    .bind(attempt.id)
    .fetch_all(&mut **tx)
    .await?;

    let reveal = reveal_correct_answers(quiz, attempt);
    let mut views = Vec::with_capacity(answers.len());
    for answer in answers {
        let correct_option_id = if reveal {
            sqlx::query_scalar::<_, Uuid>(
                "SELECT id FROM quiz_options WHERE question_id = $1 AND is_correct LIMIT 1",
            )
            .bind(answer.question_id)
            .fetch_optional(&mut **tx)
            .await?
        } else {
            None
        };
        views.push(AnswerView {
            question_id: answer.question_id,
            selected_option_id: answer.selected_option_id,
            answer_text: answer.answer_text,
            is_correct: answer.is_correct,
            points_earned: answer.points_earned,
            correct_option_id,
        });
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuestionType;

    fn quiz(passing_score: f64, randomize: bool) -> Quiz {
        Quiz {
            id: Uuid::new_v4(),
            title: "Checkpoint".into(),
            time_limit_minutes: None,
            passing_score,
            max_attempts: Some(3),
            show_correct_answers: false,
            randomize_questions: randomize,
            created_at: Utc::now(),
        }
    }

    fn question(quiz_id: Uuid, qtype: QuestionType, points: f64) -> QuizQuestion {
        QuizQuestion {
            id: Uuid::new_v4(),
            quiz_id,
            question_text: "?".into(),
            question_type: qtype,
            points,
            position: 0,
            explanation: None,
        }
    }

    fn option(question_id: Uuid, is_correct: bool) -> QuizOption {
        QuizOption {
            id: Uuid::new_v4(),
            question_id,
            option_text: "opt".into(),
            is_correct,
            position: 0,
        }
    }

    fn open_attempt(quiz_id: Uuid, student_id: Uuid, number: i32) -> QuizAttempt {
        QuizAttempt {
            id: Uuid::new_v4(),
            quiz_id,
            student_id,
            attempt_number: number,
            started_at: Utc::now(),
            submitted_at: None,
            total_points: 0.0,
            max_points: 10.0,
            score_percentage: 0.0,
            passed: false,
            time_taken_minutes: None,
        }
    }

    #[test]
    fn correct_option_earns_full_points() {
        let q = question(Uuid::new_v4(), QuestionType::MultipleChoice, 10.0);
        let right = option(q.id, true);
        let wrong = option(q.id, false);
        let options = vec![right.clone(), wrong.clone()];

        assert_eq!(grade_answer(&q, &options, Some(right.id)), (true, 10.0));
        assert_eq!(grade_answer(&q, &options, Some(wrong.id)), (false, 0.0));
    }

    #[test]
    fn missing_selection_is_incorrect() {
        let q = question(Uuid::new_v4(), QuestionType::TrueFalse, 5.0);
        let options = vec![option(q.id, true), option(q.id, false)];
        assert_eq!(grade_answer(&q, &options, None), (false, 0.0));
        // a selection that isn't one of the question's options scores nothing
        assert_eq!(grade_answer(&q, &options, Some(Uuid::new_v4())), (false, 0.0));
    }

    #[test]
    fn free_text_questions_are_never_auto_graded() {
        for qtype in [QuestionType::ShortAnswer, QuestionType::Essay] {
            let q = question(Uuid::new_v4(), qtype, 20.0);
            assert_eq!(grade_answer(&q, &[], None), (false, 0.0));
        }
    }

    #[test]
    fn half_marks_on_a_two_question_quiz_fails_at_seventy() {
        // 2 questions x 10 points, one answered correctly
        let quiz = quiz(70.0, false);
        let score = score_percentage(10.0, 20.0);
        assert_eq!(score, 50.0);
        assert!(!(score >= quiz.passing_score));
    }

    #[test]
    fn empty_quiz_scores_zero() {
        assert_eq!(score_percentage(0.0, 0.0), 0.0);
    }

    #[test]
    fn exact_passing_score_passes() {
        let quiz = quiz(70.0, false);
        let score = score_percentage(14.0, 20.0);
        assert_eq!(score, 70.0);
        assert!(score >= quiz.passing_score);
    }

    #[test]
    fn attempt_limit_counts_all_attempts() {
        assert!(check_attempt_limit(Some(3), 2).is_ok());
        assert!(matches!(
            check_attempt_limit(Some(3), 3),
            Err(ApiError::AttemptLimitReached)
        ));
        // unlimited
        assert!(check_attempt_limit(None, 500).is_ok());
    }

    #[test]
    fn time_taken_rounds_to_whole_minutes() {
        let start = Utc::now();
        assert_eq!(minutes_between(start, start + chrono::Duration::seconds(89)), 1);
        assert_eq!(minutes_between(start, start + chrono::Duration::seconds(95)), 2);
        // clock skew never goes negative
        assert_eq!(minutes_between(start, start - chrono::Duration::seconds(30)), 0);
    }

    #[test]
    fn starting_resumes_the_open_attempt() {
        let quiz_id = Uuid::new_v4();
        let student = Uuid::new_v4();
        let existing = open_attempt(quiz_id, student, 2);
        let existing_id = existing.id;

        // resuming wins even with the limit fully consumed
        match decide_start(Some(existing), Some(2), 2) {
            Ok(AttemptStart::Resume(a)) => assert_eq!(a.id, existing_id),
            other => panic!("expected resume, got {other:?}"),
        }
    }

    #[test]
    fn starting_fresh_takes_the_next_number() {
        match decide_start(None, Some(3), 1) {
            Ok(AttemptStart::New { attempt_number }) => assert_eq!(attempt_number, 2),
            other => panic!("expected new attempt, got {other:?}"),
        }
        // no open attempt and no headroom
        assert!(matches!(
            decide_start(None, Some(3), 3),
            Err(ApiError::AttemptLimitReached)
        ));
    }

    #[test]
    fn submitted_attempt_rejects_resubmission() {
        let student = Uuid::new_v4();
        let mut attempt = open_attempt(Uuid::new_v4(), student, 1);
        assert!(check_submittable(&attempt, student).is_ok());
        assert!(matches!(
            check_submittable(&attempt, Uuid::new_v4()),
            Err(ApiError::AttemptNotOwned)
        ));

        attempt.submitted_at = Some(Utc::now());
        assert!(matches!(
            check_submittable(&attempt, student),
            Err(ApiError::AlreadySubmitted)
        ));
    }

    #[test]
    fn reveal_requires_submission_and_opt_in() {
        let mut q = quiz(60.0, false);
        let mut attempt = open_attempt(q.id, Uuid::new_v4(), 1);
        assert!(!reveal_correct_answers(&q, &attempt));
        attempt.submitted_at = Some(Utc::now());
        assert!(!reveal_correct_answers(&q, &attempt));
        q.show_correct_answers = true;
        assert!(reveal_correct_answers(&q, &attempt));
    }

    #[test]
    fn shuffling_keeps_the_same_question_set() {
        let quiz = quiz(60.0, true);
        let input: Vec<(QuizQuestion, Vec<QuizOption>)> = (0..6)
            .map(|_| {
                let q = question(quiz.id, QuestionType::MultipleChoice, 1.0);
                let opts = vec![option(q.id, true), option(q.id, false)];
                (q, opts)
            })
            .collect();
        let expected: HashSet<Uuid> = input.iter().map(|(q, _)| q.id).collect();
        let views = present_questions(&quiz, input);
        let got: HashSet<Uuid> = views.iter().map(|v| v.id).collect();
        assert_eq!(expected, got);
        assert!(views.iter().all(|v| v.options.len() == 2));
    }

    #[test]
    fn fixed_order_follows_positions() {
        let quiz = quiz(60.0, false);
        let mut first = question(quiz.id, QuestionType::TrueFalse, 1.0);
        first.position = 2;
        let mut second = question(quiz.id, QuestionType::TrueFalse, 1.0);
        second.position = 1;
        let views = present_questions(&quiz, vec![(first.clone(), vec![]), (second.clone(), vec![])]);
        assert_eq!(views[0].id, second.id);
        assert_eq!(views[1].id, first.id);
    }
}
