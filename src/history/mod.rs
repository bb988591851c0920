//! Conversation transcript persistence
//!
//! Append-only per-session history with success statistics. The sqlite
//! store creates its schema lazily on first use; the in-memory store
//! backs tests and runs without a writable filesystem.

use crate::error::WorkflowError;
use crate::models::{FailureReason, Role, SessionStatistics, Turn, TurnStatus};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

/// Trait for transcript persistence
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<()>;

    /// All turns of a session in insertion order.
    async fn session_turns(&self, session_id: &str) -> Result<Vec<Turn>>;

    /// Most recent successful turns, newest first.
    async fn recent_successful(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>>;

    async fn statistics(&self, session_id: &str) -> Result<SessionStatistics>;

    /// Delete a session's turns, returning how many were removed.
    async fn clear_session(&self, session_id: &str) -> Result<u64>;
}

fn compute_statistics(turns: &[Turn]) -> SessionStatistics {
    let total = turns.len() as u64;
    let success = turns
        .iter()
        .filter(|t| t.status == TurnStatus::Success)
        .count() as u64;
    let failed = total - success;

    let mut failure_reasons: HashMap<String, u64> = HashMap::new();
    for turn in turns {
        if let Some(reason) = turn.failure_reason {
            *failure_reasons.entry(reason.as_str().to_string()).or_insert(0) += 1;
        }
    }

    SessionStatistics {
        total_messages: total,
        success_count: success,
        failed_count: failed,
        success_rate: if total > 0 {
            success as f64 / total as f64
        } else {
            0.0
        },
        failure_reasons,
    }
}

//
// ================= In-memory store =================
//

/// Process-local transcript store.
#[derive(Clone, Default)]
pub struct InMemoryTranscriptStore {
    sessions: Arc<RwLock<HashMap<String, Vec<Turn>>>>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    async fn session_turns(&self, session_id: &str) -> Result<Vec<Turn>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn recent_successful(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let sessions = self.sessions.read().await;
        let turns = sessions.get(session_id).cloned().unwrap_or_default();
        Ok(turns
            .into_iter()
            .rev()
            .filter(|t| t.status == TurnStatus::Success)
            .take(limit)
            .collect())
    }

    async fn statistics(&self, session_id: &str) -> Result<SessionStatistics> {
        let sessions = self.sessions.read().await;
        let turns = sessions.get(session_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(compute_statistics(turns))
    }

    async fn clear_session(&self, session_id: &str) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .remove(session_id)
            .map(|turns| turns.len() as u64)
            .unwrap_or(0))
    }
}

//
// ================= Sqlite store =================
//

pub struct SqliteTranscriptStore {
    pool: SqlitePool,
    schema: OnceCell<()>,
}

impl SqliteTranscriptStore {
    pub fn new(database_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePool::connect_lazy(&format!("sqlite://{}?mode=rwc", database_path))
            .map_err(|e| WorkflowError::Database(format!("Failed to open database: {}", e)))?;

        Ok(Self {
            pool,
            schema: OnceCell::new(),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS chat_history (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        session_id TEXT NOT NULL,
                        role TEXT NOT NULL,
                        content TEXT NOT NULL,
                        agent_name TEXT,
                        status TEXT NOT NULL DEFAULT 'success',
                        failure_reason TEXT,
                        quality_score REAL,
                        metadata TEXT,
                        timestamp TEXT NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(db_error)?;

                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_chat_history_session \
                     ON chat_history(session_id)",
                )
                .execute(&self.pool)
                .await
                .map_err(db_error)?;

                info!("Transcript schema ready");
                Ok::<(), WorkflowError>(())
            })
            .await?;
        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> WorkflowError {
    WorkflowError::Database(e.to_string())
}

fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<Turn> {
    let role: String = row.try_get("role").map_err(db_error)?;
    let status: String = row.try_get("status").map_err(db_error)?;
    let failure_reason: Option<String> = row.try_get("failure_reason").map_err(db_error)?;
    let metadata: Option<String> = row.try_get("metadata").map_err(db_error)?;
    let timestamp: String = row.try_get("timestamp").map_err(db_error)?;

    Ok(Turn {
        role: match role.as_str() {
            "assistant" => Role::Assistant,
            _ => Role::User,
        },
        content: row.try_get("content").map_err(db_error)?,
        agent_name: row.try_get("agent_name").map_err(db_error)?,
        status: match status.as_str() {
            "failed" => TurnStatus::Failed,
            _ => TurnStatus::Success,
        },
        failure_reason: failure_reason.as_deref().and_then(|r| match r {
            "empty" => Some(FailureReason::Empty),
            "error" => Some(FailureReason::Error),
            "incorrect" => Some(FailureReason::Incorrect),
            _ => None,
        }),
        quality_score: row.try_get("quality_score").map_err(db_error)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        timestamp: timestamp
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[async_trait]
impl TranscriptStore for SqliteTranscriptStore {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<()> {
        self.ensure_schema().await?;

        let metadata = turn
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO chat_history
                (session_id, role, content, agent_name, status,
                 failure_reason, quality_score, metadata, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(&turn.agent_name)
        .bind(turn.status.as_str())
        .bind(turn.failure_reason.map(|r| r.as_str()))
        .bind(turn.quality_score)
        .bind(metadata)
        .bind(turn.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn session_turns(&self, session_id: &str) -> Result<Vec<Turn>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT * FROM chat_history WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_turn).collect()
    }

    async fn recent_successful(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT * FROM chat_history \
             WHERE session_id = ? AND status = 'success' \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_turn).collect()
    }

    async fn statistics(&self, session_id: &str) -> Result<SessionStatistics> {
        let turns = self.session_turns(session_id).await?;
        Ok(compute_statistics(&turns))
    }

    async fn clear_session(&self, session_id: &str) -> Result<u64> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM chat_history WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(
        role: Role,
        content: &str,
        status: TurnStatus,
        failure_reason: Option<FailureReason>,
    ) -> Turn {
        Turn {
            role,
            content: content.to_string(),
            agent_name: matches!(role, Role::Assistant).then(|| "report_generator".to_string()),
            status,
            failure_reason,
            quality_score: matches!(status, TurnStatus::Success).then_some(4.0),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    async fn seeded_store() -> InMemoryTranscriptStore {
        let store = InMemoryTranscriptStore::new();
        let session = "session-1";

        let turns = [
            turn(Role::User, "애플 주가 알려줘", TurnStatus::Success, None),
            turn(Role::Assistant, "애플 주가는 178.25달러입니다", TurnStatus::Success, None),
            turn(Role::User, "차트도 그려줘", TurnStatus::Success, None),
            turn(
                Role::Assistant,
                "차트 생성에 실패했습니다",
                TurnStatus::Failed,
                Some(FailureReason::Error),
            ),
            turn(Role::Assistant, "차트를 생성했습니다", TurnStatus::Success, None),
            turn(
                Role::Assistant,
                "",
                TurnStatus::Failed,
                Some(FailureReason::Empty),
            ),
        ];
        for t in &turns {
            store.append(session, t).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_session_turns_in_order() {
        let store = seeded_store().await;
        let turns = store.session_turns("session-1").await.unwrap();
        assert_eq!(turns.len(), 6);
        assert_eq!(turns[0].content, "애플 주가 알려줘");
        assert_eq!(turns[5].status, TurnStatus::Failed);
    }

    #[tokio::test]
    async fn test_recent_successful_newest_first() {
        let store = seeded_store().await;
        let recent = store.recent_successful("session-1", 10).await.unwrap();
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].content, "차트를 생성했습니다");
        assert!(recent.iter().all(|t| t.status == TurnStatus::Success));

        let limited = store.recent_successful("session-1", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_statistics() {
        let store = seeded_store().await;
        let stats = store.statistics("session-1").await.unwrap();
        assert_eq!(stats.total_messages, 6);
        assert_eq!(stats.success_count, 4);
        assert_eq!(stats.failed_count, 2);
        assert!((stats.success_rate - 4.0 / 6.0).abs() < 1e-9);
        assert_eq!(stats.failure_reasons.get("error"), Some(&1));
        assert_eq!(stats.failure_reasons.get("empty"), Some(&1));
    }

    #[tokio::test]
    async fn test_clear_session() {
        let store = seeded_store().await;
        let removed = store.clear_session("session-1").await.unwrap();
        assert_eq!(removed, 6);
        assert!(store.session_turns("session-1").await.unwrap().is_empty());

        let stats = store.statistics("session-1").await.unwrap();
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_empty() {
        let store = InMemoryTranscriptStore::new();
        assert!(store.session_turns("nope").await.unwrap().is_empty());
        assert_eq!(store.clear_session("nope").await.unwrap(), 0);
    }
}
