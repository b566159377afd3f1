use sqlx::{Row, SqlitePool};

use crate::db::models::{
    CategoryEntry, Session, SessionState, SessionUpdate, SessionVariant, SessionVisibility,
};
use crate::error::{AppError, AppResult};

pub struct SessionRepository;

impl SessionRepository {
    /// Load a session together with its ordered category history
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT
                id, broadcaster_id, title, state, visibility, variants,
                thumbnail_static, thumbnail_animated, started_at, ended_at
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        let Some(r) = row else {
            return Ok(None);
        };

        let state: String = r.get("state");
        let visibility: String = r.get("visibility");
        let variants: String = r.get("variants");

        let categories = Self::categories(pool, id).await?;

        Ok(Some(Session {
            id: r.get("id"),
            broadcaster_id: r.get("broadcaster_id"),
            title: r.get("title"),
            categories,
            state: SessionState::from_str(&state).ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!("Invalid session state: {}", state))
            })?,
            visibility: SessionVisibility::from_str(&visibility).ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "Invalid session visibility: {}",
                    visibility
                ))
            })?,
            variants: serde_json::from_str::<Vec<SessionVariant>>(&variants)
                .map_err(|e| AppError::Internal(e.into()))?,
            thumbnail_static: r.get("thumbnail_static"),
            thumbnail_animated: r.get("thumbnail_animated"),
            started_at: r.get("started_at"),
            ended_at: r.get("ended_at"),
        }))
    }

    async fn categories(pool: &SqlitePool, session_id: &str) -> AppResult<Vec<CategoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, category_id, name, url
            FROM session_categories
            WHERE session_id = ?
            ORDER BY seq
            "#,
        )
        .bind(session_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| CategoryEntry {
                timestamp: r.get("timestamp"),
                category_id: r.get("category_id"),
                name: r.get("name"),
                url: r.get("url"),
            })
            .collect())
    }

    /// Set the title and append the category entry (if any) in one transaction.
    ///
    /// Returns `NotFound` if the session row does not exist.
    pub async fn apply_update(
        pool: &SqlitePool,
        session_id: &str,
        update: &SessionUpdate,
    ) -> AppResult<()> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        let result = sqlx::query("UPDATE sessions SET title = ? WHERE id = ?")
            .bind(&update.title)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Session {}", session_id)));
        }

        if let Some(ref category) = update.push_category {
            sqlx::query(
                r#"
                INSERT INTO session_categories (session_id, timestamp, category_id, name, url)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(session_id)
            .bind(category.timestamp)
            .bind(&category.category_id)
            .bind(&category.name)
            .bind(&category.url)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;
        }

        tx.commit().await.map_err(AppError::Database)?;
        Ok(())
    }
}
