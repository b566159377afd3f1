use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db::models::Broadcaster;
use crate::error::{AppError, AppResult};

pub struct BroadcasterRepository;

impl BroadcasterRepository {
    /// List every tracked broadcaster
    pub async fn list_all(pool: &SqlitePool) -> AppResult<Vec<Broadcaster>> {
        let rows = sqlx::query(
            r#"
            SELECT id, twitch_id, twitch_login, twitch_display_name, created_at, updated_at
            FROM broadcasters
            ORDER BY twitch_login
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows.iter().map(map_row).collect())
    }

    pub async fn find_by_twitch_id(
        pool: &SqlitePool,
        twitch_id: &str,
    ) -> AppResult<Option<Broadcaster>> {
        let row = sqlx::query(
            r#"
            SELECT id, twitch_id, twitch_login, twitch_display_name, created_at, updated_at
            FROM broadcasters
            WHERE twitch_id = ?
            "#,
        )
        .bind(twitch_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.as_ref().map(map_row))
    }
}

fn map_row(r: &SqliteRow) -> Broadcaster {
    Broadcaster {
        id: r.get("id"),
        twitch_id: r.get("twitch_id"),
        twitch_login: r.get("twitch_login"),
        twitch_display_name: r.get("twitch_display_name"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}
