//! SQLite-backed session store (WAL mode).
//!
//! Implements the `SessionStore` port: sessions form a tree via
//! `parent_session_id`; entries are an append log ordered by rowid;
//! state blobs, remembered permissions, and usage logs hang off the
//! session row.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::ports::session_store::{
    RememberedDecision, RememberedPermission, SessionEntry, SessionEntryKind, SessionStore,
    UsageRecord,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    parent_session_id TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS session_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entries_session ON session_entries(session_id, seq);
CREATE TABLE IF NOT EXISTS state_blobs (
    session_id TEXT NOT NULL REFERENCES sessions(id),
    name TEXT NOT NULL,
    blob TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (session_id, name)
);
CREATE TABLE IF NOT EXISTS remembered_permissions (
    session_id TEXT NOT NULL REFERENCES sessions(id),
    tool TEXT NOT NULL,
    pattern TEXT NOT NULL,
    decision TEXT NOT NULL,
    PRIMARY KEY (session_id, tool, pattern)
);
CREATE TABLE IF NOT EXISTS usage_log (
    session_id TEXT NOT NULL REFERENCES sessions(id),
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cost_usd REAL NOT NULL
);
";

/// The store.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (creating if needed) the database at `path` and bootstrap
    /// the schema.
    pub async fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let url = format!("sqlite:{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .with_context(|| format!("failed to open session database at {path}"))?;
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .context("failed to enable WAL mode")?;
        Self::bootstrap(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. Pinned to one connection so every
    /// query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory session database")?;
        Self::bootstrap(&pool).await?;
        Ok(Self { pool })
    }

    async fn bootstrap(pool: &SqlitePool) -> Result<()> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(pool)
                .await
                .context("failed to bootstrap session schema")?;
        }
        Ok(())
    }

    /// The parent of a session, if any.
    pub async fn parent_of(&self, session_id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT parent_session_id FROM sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch session")?;
        Ok(row
            .and_then(|r| r.get::<Option<String>, _>(0))
            .and_then(|s| Uuid::parse_str(&s).ok()))
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, parent_session_id: Option<Uuid>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO sessions (id, parent_session_id, created_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(parent_session_id.map(|p| p.to_string()))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .context("failed to insert session")?;
        Ok(id)
    }

    async fn append_entry(&self, session_id: Uuid, entry: SessionEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_entries (id, session_id, kind, content, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(session_id.to_string())
        .bind(entry.kind.as_str())
        .bind(serde_json::to_string(&entry.content).context("failed to serialize entry content")?)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to append session entry")?;
        Ok(())
    }

    async fn load_entries(&self, session_id: Uuid) -> Result<Vec<SessionEntry>> {
        let rows = sqlx::query(
            "SELECT id, kind, content, created_at FROM session_entries \
             WHERE session_id = ? ORDER BY seq",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to load session entries")?;

        rows.into_iter()
            .map(|row| {
                let kind_str: String = row.get("kind");
                let kind = SessionEntryKind::parse_str(&kind_str)
                    .with_context(|| format!("unknown entry kind '{kind_str}'"))?;
                let content: Value = serde_json::from_str(&row.get::<String, _>("content"))
                    .context("failed to deserialize entry content")?;
                let created_at: DateTime<Utc> =
                    DateTime::parse_from_rfc3339(&row.get::<String, _>("created_at"))
                        .context("invalid entry timestamp")?
                        .with_timezone(&Utc);
                Ok(SessionEntry {
                    id: Uuid::parse_str(&row.get::<String, _>("id")).context("invalid entry id")?,
                    kind,
                    content,
                    created_at,
                })
            })
            .collect()
    }

    async fn save_state_blob(&self, session_id: Uuid, name: Option<&str>, blob: Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO state_blobs (session_id, name, blob, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (session_id, name) DO UPDATE SET blob = excluded.blob, \
             updated_at = excluded.updated_at",
        )
        .bind(session_id.to_string())
        .bind(name.unwrap_or("default"))
        .bind(serde_json::to_string(&blob).context("failed to serialize state blob")?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to save state blob")?;
        Ok(())
    }

    async fn load_state_blob(&self, session_id: Uuid, name: Option<&str>) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT blob FROM state_blobs WHERE session_id = ? AND name = ?")
            .bind(session_id.to_string())
            .bind(name.unwrap_or("default"))
            .fetch_optional(&self.pool)
            .await
            .context("failed to load state blob")?;
        row.map(|r| {
            serde_json::from_str(&r.get::<String, _>("blob"))
                .context("failed to deserialize state blob")
        })
        .transpose()
    }

    async fn remember_permission(
        &self,
        session_id: Uuid,
        permission: RememberedPermission,
    ) -> Result<()> {
        let decision = match permission.decision {
            RememberedDecision::Always => "always",
            RememberedDecision::Never => "never",
        };
        sqlx::query(
            "INSERT INTO remembered_permissions (session_id, tool, pattern, decision) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (session_id, tool, pattern) DO UPDATE SET decision = excluded.decision",
        )
        .bind(session_id.to_string())
        .bind(&permission.tool)
        .bind(&permission.pattern)
        .bind(decision)
        .execute(&self.pool)
        .await
        .context("failed to remember permission")?;
        Ok(())
    }

    async fn remembered_permissions(&self, session_id: Uuid) -> Result<Vec<RememberedPermission>> {
        let rows = sqlx::query(
            "SELECT tool, pattern, decision FROM remembered_permissions WHERE session_id = ?",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to load remembered permissions")?;

        rows.into_iter()
            .map(|row| {
                let decision = match row.get::<String, _>("decision").as_str() {
                    "always" => RememberedDecision::Always,
                    _ => RememberedDecision::Never,
                };
                Ok(RememberedPermission {
                    tool: row.get("tool"),
                    pattern: row.get("pattern"),
                    decision,
                })
            })
            .collect()
    }

    async fn record_usage(&self, session_id: Uuid, usage: UsageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_log (session_id, model, input_tokens, output_tokens, cost_usd) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id.to_string())
        .bind(&usage.model)
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cost_usd)
        .execute(&self.pool)
        .await
        .context("failed to record usage")?;
        Ok(())
    }

    async fn usage_summary(&self, session_id: Uuid) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            "SELECT model, SUM(input_tokens) AS input_tokens, SUM(output_tokens) AS output_tokens, \
             SUM(cost_usd) AS cost_usd FROM usage_log WHERE session_id = ? GROUP BY model \
             ORDER BY model",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to aggregate usage")?;

        Ok(rows
            .into_iter()
            .map(|row| UsageRecord {
                model: row.get("model"),
                input_tokens: row.get::<i64, _>("input_tokens") as u64,
                output_tokens: row.get::<i64, _>("output_tokens") as u64,
                cost_usd: row.get("cost_usd"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_entries_load_in_append_order() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let session = store.create_session(None).await.unwrap();

        for i in 0..3 {
            store
                .append_entry(
                    session,
                    SessionEntry::new(SessionEntryKind::Message, json!({"n": i})),
                )
                .await
                .unwrap();
        }

        let entries = store.load_entries(session).await.unwrap();
        assert_eq!(entries.len(), 3);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.content["n"], json!(i));
            assert_eq!(entry.kind, SessionEntryKind::Message);
        }
    }

    #[tokio::test]
    async fn test_session_tree_via_parent() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let root = store.create_session(None).await.unwrap();
        let child = store.create_session(Some(root)).await.unwrap();

        assert_eq!(store.parent_of(child).await.unwrap(), Some(root));
        assert_eq!(store.parent_of(root).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_state_blob_upsert_and_named_slots() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let session = store.create_session(None).await.unwrap();

        store.save_state_blob(session, None, json!({"v": 1})).await.unwrap();
        store.save_state_blob(session, None, json!({"v": 2})).await.unwrap();
        store.save_state_blob(session, Some("plan"), json!({"steps": 3})).await.unwrap();

        let latest = store.load_state_blob(session, None).await.unwrap().unwrap();
        assert_eq!(latest["v"], json!(2));
        let plan = store.load_state_blob(session, Some("plan")).await.unwrap().unwrap();
        assert_eq!(plan["steps"], json!(3));
        assert!(store.load_state_blob(session, Some("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remembered_permissions_round_trip() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let session = store.create_session(None).await.unwrap();

        store
            .remember_permission(
                session,
                RememberedPermission {
                    tool: "bash".into(),
                    pattern: "git *".into(),
                    decision: RememberedDecision::Always,
                },
            )
            .await
            .unwrap();
        // Re-answering the same pattern overwrites the decision.
        store
            .remember_permission(
                session,
                RememberedPermission {
                    tool: "bash".into(),
                    pattern: "git *".into(),
                    decision: RememberedDecision::Never,
                },
            )
            .await
            .unwrap();

        let permissions = store.remembered_permissions(session).await.unwrap();
        assert_eq!(permissions.len(), 1);
        assert_eq!(permissions[0].decision, RememberedDecision::Never);
    }

    #[tokio::test]
    async fn test_usage_aggregated_per_model() {
        let store = SqliteSessionStore::in_memory().await.unwrap();
        let session = store.create_session(None).await.unwrap();

        for (model, input, output, cost) in [
            ("sonnet", 1_000, 500, 0.01),
            ("sonnet", 2_000, 700, 0.02),
            ("haiku", 300, 100, 0.001),
        ] {
            store
                .record_usage(
                    session,
                    UsageRecord {
                        model: model.to_string(),
                        input_tokens: input,
                        output_tokens: output,
                        cost_usd: cost,
                    },
                )
                .await
                .unwrap();
        }

        let summary = store.usage_summary(session).await.unwrap();
        assert_eq!(summary.len(), 2);
        let sonnet = summary.iter().find(|u| u.model == "sonnet").unwrap();
        assert_eq!(sonnet.input_tokens, 3_000);
        assert_eq!(sonnet.output_tokens, 1_200);
        assert!((sonnet.cost_usd - 0.03).abs() < 1e-9);
    }
}
