//! Test-only helpers: an in-memory store with migrations applied and row inserters.

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::Broadcaster;

pub async fn pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");

    pool
}

pub async fn broadcaster(pool: &SqlitePool, twitch_id: &str, login: &str) -> Broadcaster {
    let now = Utc::now();
    let b = Broadcaster {
        id: Uuid::new_v4().to_string(),
        twitch_id: twitch_id.to_string(),
        twitch_login: login.to_string(),
        twitch_display_name: login.to_uppercase(),
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO broadcasters (id, twitch_id, twitch_login, twitch_display_name, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&b.id)
    .bind(&b.twitch_id)
    .bind(&b.twitch_login)
    .bind(&b.twitch_display_name)
    .bind(b.created_at)
    .bind(b.updated_at)
    .execute(pool)
    .await
    .expect("insert broadcaster");

    b
}

/// Insert a live session with no categories; returns its id.
pub async fn session(pool: &SqlitePool, broadcaster_id: &str) -> String {
    let id = Uuid::new_v4().to_string();

    sqlx::query("INSERT INTO sessions (id, broadcaster_id, title, started_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(broadcaster_id)
        .bind("initial title")
        .bind(Utc::now())
        .execute(pool)
        .await
        .expect("insert session");

    id
}
