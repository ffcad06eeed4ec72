use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::config::AppConfig;

/// Rolling conversation history, keyed by session fingerprint.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

        Self::connect(&config.sqlite_dsn(), 10).await
    }

    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)
            .with_context(|| format!("invalid sqlite dsn {dsn}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to open history database")?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_key TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS messages_session_key ON messages (session_key, id);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to migrate history database")?;

        Ok(())
    }

    pub async fn save_message(&self, session_key: &str, role: &str, content: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (session_key, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_key)
        .bind(role)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The newest `limit` messages for a session, oldest first.
    pub async fn latest_messages(
        &self,
        session_key: &str,
        limit: i64,
    ) -> Result<Vec<(String, String)>> {
        if limit <= 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            SELECT role, content
            FROM messages
            WHERE session_key = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(session_key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out: Vec<(String, String)> = rows
            .into_iter()
            .map(|r| (r.get::<String, _>("role"), r.get::<String, _>("content")))
            .collect();
        out.reverse();
        Ok(out)
    }

    pub async fn delete_session_messages(&self, session_key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE session_key = ?")
            .bind(session_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
