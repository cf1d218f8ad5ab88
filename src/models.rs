use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- closed enums (each mapped to a Postgres enum type) ---

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "user_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Student,
    Admin,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "course_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CourseStatus {
    Draft,
    Published,
    Archived,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "enrollment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Dropped,
    Expired,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "enrollment_payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentPaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "payment_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Completed,
    Failed,
    Refunded,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "lesson_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LessonType {
    Video,
    Text,
    Quiz,
    Assignment,
    Document,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "progress_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "question_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
    Essay,
}

impl QuestionType {
    /// Choice-type questions are the only ones the system grades itself.
    pub fn auto_graded(self) -> bool {
        matches!(self, QuestionType::MultipleChoice | QuestionType::TrueFalse)
    }
}

// --- rows ---

#[derive(sqlx::FromRow, Serialize, Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub role: UserRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub price: f64,
    pub status: CourseStatus,
    pub enrollment_limit: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl Course {
    pub fn is_free(&self) -> bool {
        self.price <= 0.0
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Lesson {
    pub id: Uuid,
    pub course_id: Uuid,
    pub module_id: Option<Uuid>,
    pub title: String,
    pub position: i32,
    pub lesson_type: LessonType,
    pub quiz_id: Option<Uuid>,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Enrollment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub status: EnrollmentStatus,
    pub payment_status: EnrollmentPaymentStatus,
    pub progress_percentage: f64,
    pub certificate_issued: bool,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct LessonProgress {
    pub id: Uuid,
    pub student_id: Uuid,
    pub lesson_id: Uuid,
    pub status: ProgressStatus,
    pub progress_percentage: f64,
    pub time_spent_minutes: i32,
    pub video_position_seconds: i32,
    pub scroll_position: i32,
    pub first_accessed_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Quiz {
    pub id: Uuid,
    pub title: String,
    pub time_limit_minutes: Option<i32>,
    pub passing_score: f64,
    pub max_attempts: Option<i32>,
    pub show_correct_answers: bool,
    pub randomize_questions: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct QuizQuestion {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub question_text: String,
    pub question_type: QuestionType,
    pub points: f64,
    pub position: i32,
    pub explanation: Option<String>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct QuizOption {
    pub id: Uuid,
    pub question_id: Uuid,
    pub option_text: String,
    pub is_correct: bool,
    pub position: i32,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct QuizAttempt {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub student_id: Uuid,
    pub attempt_number: i32,
    pub started_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub total_points: f64,
    pub max_points: f64,
    pub score_percentage: f64,
    pub passed: bool,
    pub time_taken_minutes: Option<i32>,
}

impl QuizAttempt {
    pub fn is_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct QuizAnswer {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub question_id: Uuid,
    pub selected_option_id: Option<Uuid>,
    pub answer_text: Option<String>,
    pub is_correct: bool,
    pub points_earned: f64,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Payment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub amount: f64,
    pub method: String,
    pub transaction_id: String,
    pub status: PaymentState,
    pub qr_string: String,
    pub md5_hash: String,
    pub expires_at: DateTime<Utc>,
    pub external_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Certificate {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub code: String,
    pub issue_date: DateTime<Utc>,
    pub verification_url: String,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

// --- request payloads ---

#[derive(Deserialize, Debug, Clone)]
pub struct RegisterReq {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LoginReq {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct EnrollReq {
    pub course_id: Uuid,
}

/// Partial update; absent fields are left unchanged.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProgressPatch {
    pub status: Option<ProgressStatus>,
    pub progress_percentage: Option<f64>,
    pub time_spent_minutes: Option<i32>,
    pub video_position_seconds: Option<i32>,
    pub scroll_position: Option<i32>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AnswerSubmission {
    pub question_id: Uuid,
    pub selected_option_id: Option<Uuid>,
    pub answer_text: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SubmitAttemptReq {
    pub answers: Vec<AnswerSubmission>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct InitiatePaymentReq {
    pub course_id: Uuid,
}

#[derive(Deserialize, Debug, Clone)]
pub struct IssueCertificateReq {
    pub student_id: Uuid,
    pub course_id: Uuid,
}

// --- response shapes ---

#[derive(Serialize, Debug, Clone)]
pub struct AuthResponse {
    pub token: Uuid,
    pub user: User,
}

/// A question as shown to a student taking the quiz: correctness flags and
/// explanations stripped.
#[derive(Serialize, Debug, Clone)]
pub struct QuestionView {
    pub id: Uuid,
    pub question_text: String,
    pub question_type: QuestionType,
    pub points: f64,
    pub options: Vec<OptionView>,
}

#[derive(Serialize, Debug, Clone)]
pub struct OptionView {
    pub id: Uuid,
    pub option_text: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct QuizView {
    pub quiz: Quiz,
    pub questions: Vec<QuestionView>,
}

#[derive(Serialize, Debug, Clone)]
pub struct AttemptView {
    pub attempt: QuizAttempt,
    pub answers: Vec<AnswerView>,
}

#[derive(Serialize, Debug, Clone)]
pub struct AnswerView {
    pub question_id: Uuid,
    pub selected_option_id: Option<Uuid>,
    pub answer_text: Option<String>,
    pub is_correct: bool,
    pub points_earned: f64,
    /// Present only when the quiz reveals answers and the attempt is submitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_option_id: Option<Uuid>,
}
