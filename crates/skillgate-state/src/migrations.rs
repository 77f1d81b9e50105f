//! SurrealDB schema initialization for skillgate governance tables
//!
//! Safe to call on every connection: every definition uses `IF NOT EXISTS`,
//! so reopening a durable (`surrealkv://`) database is idempotent.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StateError;
use crate::Result;

/// Initialize all skillgate tables.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing skillgate SurrealDB schema");

    init_grants_table(db).await?;
    init_checkpoints_table(db).await?;
    init_receipts_table(db).await?;

    info!("skillgate schema initialization complete");
    Ok(())
}

/// `grants`: one row per (agent_id, skill_id, security_hash).
///
/// Rows bound to an outdated hash stay in the table but are never returned by
/// lookups, which always filter on the caller's current hash.
async fn init_grants_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing grants table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS grants SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_grant_key ON TABLE grants
            COLUMNS agent_id, skill_id, security_hash UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_grant_agent_skill ON TABLE grants
            COLUMNS agent_id, skill_id;
    "#;

    run(db, sql).await
}

/// `checkpoints`: single-use human approvals for side-effecting calls.
async fn init_checkpoints_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing checkpoints table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS checkpoints SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_checkpoint_id ON TABLE checkpoints
            COLUMNS checkpoint_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_checkpoint_key ON TABLE checkpoints
            COLUMNS agent_id, skill_id, security_hash;
    "#;

    run(db, sql).await
}

/// `receipts`: append-only provenance log.
///
/// Constraints:
/// - `invocation_id` is unique (one receipt per invocation)
/// - secondary index on (agent_id, skill_id, recorded_at) for audits
/// - updates and deletes are not permitted for record users
async fn init_receipts_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing receipts table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS receipts SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_receipt_invocation ON TABLE receipts
            COLUMNS invocation_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_receipt_key_time ON TABLE receipts
            COLUMNS agent_id, skill_id, recorded_at;
        DEFINE INDEX IF NOT EXISTS idx_receipt_key_seq ON TABLE receipts
            COLUMNS agent_id, skill_id, seq UNIQUE;
    "#;

    run(db, sql).await
}

async fn run(db: &Surreal<Any>, sql: &str) -> Result<()> {
    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?
        .check()
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}
