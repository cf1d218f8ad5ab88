//! In-app notifications with an explicit recipient-selection strategy,
//! replacing ad hoc per-call-site recipient queries.

use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::UserRole;

#[derive(Debug, Clone)]
pub enum Recipients {
    SingleUser(Uuid),
    AllAdmins,
    ByRole(UserRole),
}

pub async fn send(
    tx: &mut Transaction<'_, Postgres>,
    recipients: Recipients,
    title: &str,
    body: &str,
) -> Result<u64, ApiError> {
    let user_ids: Vec<Uuid> = match recipients {
        Recipients::SingleUser(id) => vec![id],
        Recipients::AllAdmins => {
            sqlx::query_scalar("SELECT id FROM users WHERE role = 'admin' AND is_active")
                .fetch_all(&mut **tx)
                .await?
        }
        Recipients::ByRole(role) => {
            sqlx::query_scalar("SELECT id FROM users WHERE role = $1 AND is_active")
                .bind(role)
                .fetch_all(&mut **tx)
                .await?
        }
    };

    let mut delivered = 0;
    for user_id in user_ids {
        sqlx::query("INSERT INTO notifications (user_id, title, body) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(title)
            .bind(body)
            .execute(&mut **tx)
            .await?;
        delivered += 1;
    }
    Ok(delivered)
}
