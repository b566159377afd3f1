use sqlx::SqlitePool;
#[cfg(test)]
use sqlx::Row;
use uuid::Uuid;

#[cfg(test)]
use crate::db::models::ChatSender;
use crate::db::models::{ChatRecord, CreateChatRecord};
use crate::error::{AppError, AppResult};

pub struct ChatRepository;

impl ChatRepository {
    /// Insert one chat record. The unique index on the upstream message id
    /// rejects a second insert for the same message.
    pub async fn insert(pool: &SqlitePool, data: CreateChatRecord) -> AppResult<ChatRecord> {
        let id = Uuid::new_v4().to_string();
        let badges =
            serde_json::to_string(&data.badges).map_err(|e| AppError::Internal(e.into()))?;
        let emotes =
            serde_json::to_string(&data.emotes).map_err(|e| AppError::Internal(e.into()))?;

        sqlx::query(
            r#"
            INSERT INTO chat_messages (
                id, session_id, twitch_message_id, user_id, login, display_name, color,
                timestamp, content, badges, emotes
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&data.session_id)
        .bind(&data.sender.message_id)
        .bind(&data.sender.user_id)
        .bind(&data.sender.login)
        .bind(&data.sender.display_name)
        .bind(&data.sender.color)
        .bind(data.timestamp)
        .bind(&data.content)
        .bind(&badges)
        .bind(&emotes)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(ChatRecord {
            id,
            session_id: data.session_id,
            sender: data.sender,
            timestamp: data.timestamp,
            content: data.content,
            badges: data.badges,
            emotes: data.emotes,
        })
    }

    /// Bulk delete for a moderation clear. Returns the number of removed records.
    pub async fn delete_by_session_and_user(
        pool: &SqlitePool,
        session_id: &str,
        user_id: &str,
    ) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM chat_messages WHERE session_id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    #[cfg(test)]
    pub async fn list_by_session(pool: &SqlitePool, session_id: &str) -> AppResult<Vec<ChatRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, twitch_message_id, user_id, login, display_name, color,
                   timestamp, content, badges, emotes
            FROM chat_messages
            WHERE session_id = ?
            ORDER BY timestamp, id
            "#,
        )
        .bind(session_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        rows.into_iter()
            .map(|r| {
                let badges: String = r.get("badges");
                let emotes: String = r.get("emotes");
                Ok(ChatRecord {
                    id: r.get("id"),
                    session_id: r.get("session_id"),
                    sender: ChatSender {
                        message_id: r.get("twitch_message_id"),
                        user_id: r.get("user_id"),
                        login: r.get("login"),
                        display_name: r.get("display_name"),
                        color: r.get("color"),
                    },
                    timestamp: r.get("timestamp"),
                    content: r.get("content"),
                    badges: serde_json::from_str(&badges)
                        .map_err(|e| AppError::Internal(e.into()))?,
                    emotes: serde_json::from_str(&emotes)
                        .map_err(|e| AppError::Internal(e.into()))?,
                })
            })
            .collect()
    }
}
