use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Every statement is idempotent, so re-running on an existing
/// database is a no-op.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Normalized platform events, keyed by connector + platform id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            connector_id TEXT NOT NULL,
            platform_id TEXT NOT NULL,
            event_kind TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            author TEXT,
            content TEXT NOT NULL,
            thread_id TEXT,
            parent_id TEXT,
            file_refs_json TEXT NOT NULL DEFAULT '[]',
            feature_refs_json TEXT NOT NULL DEFAULT '[]',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(connector_id, platform_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Ingestion jobs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            connector_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            checkpoint INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER,
            finished_at INTEGER,
            error_message TEXT,
            lease_expires_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one pending-or-running job per connector
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_active
        ON jobs(connector_id) WHERE status IN ('pending', 'running')
        "#,
    )
    .execute(pool)
    .await?;

    // Per-connector sync checkpoints
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            connector_id TEXT PRIMARY KEY,
            last_event_ts INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Knowledge graph nodes, keyed by kind + source id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            source_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(kind, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Knowledge graph edges, keyed by endpoints + kind. Endpoint
    // existence is checked by the store at write time; traversal prunes
    // edges whose endpoint has since disappeared.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            id TEXT PRIMARY KEY,
            source_entity_id TEXT NOT NULL,
            target_entity_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            strength REAL NOT NULL DEFAULT 0.5,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_entity_id, target_entity_id, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Typed payloads hanging off entities, 1:1 by entity id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS decisions (
            entity_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            rationale TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            decided_at INTEGER NOT NULL,
            source_event_ids_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS discussions (
            entity_id TEXT PRIMARY KEY,
            summary TEXT NOT NULL,
            participants_json TEXT NOT NULL DEFAULT '[]',
            source_event_ids_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS features (
            entity_id TEXT PRIMARY KEY,
            summary TEXT NOT NULL DEFAULT '',
            source_event_ids_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_history (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            platform_event_id TEXT NOT NULL,
            change_summary TEXT NOT NULL,
            author TEXT,
            changed_at INTEGER NOT NULL,
            UNIQUE(entity_id, platform_event_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_thread ON events(thread_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_connector ON events(connector_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_entity_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_entity_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_history_entity ON file_history(entity_id)")
        .execute(pool)
        .await?;

    Ok(())
}
