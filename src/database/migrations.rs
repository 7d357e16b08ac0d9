use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");

    create_scan_records_table(pool).await?;
    create_scan_records_indexes(pool).await?;

    info!("Database migrations completed successfully");
    Ok(())
}

async fn create_scan_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_records (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            code TEXT NOT NULL,
            scanned_at DATETIME NOT NULL,
            sync_state TEXT NOT NULL DEFAULT 'pending' CHECK (sync_state IN ('pending', 'synced')),
            server_id INTEGER,
            synced_at DATETIME,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_scan_records_indexes(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scan_records_sync_state ON scan_records (sync_state)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scan_records_session ON scan_records (session_id, scanned_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
