//! Embedded migration runner for the metadata schema (spec §6.1). Applies
//! every numbered `.sql` file under a directory in order, the same
//! "extension_sql! with a name" bootstrap idea as the reference
//! implementation's `src/lib.rs`, minus the Postgres-extension machinery:
//! here a standalone `tokio-postgres` client just executes each file as one
//! batch statement. Files are idempotent (`CREATE TABLE IF NOT EXISTS`), so
//! there is no separate migrations-applied tracking table.

use std::path::Path;

use tokio_postgres::Client;
use tracing::info;

use crate::error::EngineError;

/// Applies every `*.sql` file in `dir`, sorted by filename, against `client`.
pub async fn run(client: &Client, dir: &Path) -> Result<(), EngineError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| EngineError::Internal(format!("reading migrations dir {}: {e}", dir.display())))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|ext| ext.to_str()) == Some("sql"))
        .collect();
    entries.sort();

    for path in entries {
        let sql = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Internal(format!("reading migration {}: {e}", path.display())))?;
        info!(file = %path.display(), "applying migration");
        client.batch_execute(&sql).await?;
    }
    Ok(())
}
