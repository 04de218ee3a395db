//! Database schema definitions using SurrealQL.

use crate::{DbError, get_db};

/// Initialize the database schema.
pub async fn init_schema() -> Result<(), DbError> {
    let db = get_db()?;

    tracing::info!("Initializing ledger schema");
    db.query(LEDGER_SCHEMA).await?.check()?;

    Ok(())
}

/// Processed-message ledger. Record ids are queue message ids.
const LEDGER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS ingest_ledger SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS message_id ON ingest_ledger TYPE string;
DEFINE FIELD IF NOT EXISTS bucket ON ingest_ledger TYPE option<string>;
DEFINE FIELD IF NOT EXISTS key ON ingest_ledger TYPE option<string>;
DEFINE FIELD IF NOT EXISTS disposition ON ingest_ledger TYPE string
    ASSERT $value IN ["applied", "dead_lettered"];
-- RFC 3339 with fixed precision so string order is time order
DEFINE FIELD IF NOT EXISTS recorded_at ON ingest_ledger TYPE string;

DEFINE INDEX IF NOT EXISTS ledger_disposition ON ingest_ledger FIELDS disposition;
DEFINE INDEX IF NOT EXISTS ledger_recorded ON ingest_ledger FIELDS recorded_at;
"#;
