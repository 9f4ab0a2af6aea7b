pub mod models;
pub mod store;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};

pub async fn create_pool(db_path: &str) -> anyhow::Result<SqlitePool> {
    // An in-memory database lives on a single connection; more would each
    // see their own empty store.
    let (url, max_connections) = if db_path == ":memory:" {
        ("sqlite::memory:".to_string(), 1)
    } else {
        (format!("sqlite:{}?mode=rwc", db_path), 5)
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await?;

    info!(path = %db_path, "Database connected");
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    // Enable WAL mode and foreign keys
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(pool).await?;

    let migrations = [include_str!("../../migrations/001_initial_schema.sql")];

    for migration_sql in &migrations {
        for statement in migration_sql.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
    }

    info!("Database migrations applied");
    Ok(())
}

async fn try_open(db_path: &str) -> anyhow::Result<SqlitePool> {
    let pool = create_pool(db_path).await?;
    run_migrations(&pool).await?;
    let verdict: String = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_one(&pool)
        .await?;
    if verdict != "ok" {
        pool.close().await;
        anyhow::bail!("integrity check failed: {verdict}");
    }
    Ok(pool)
}

/// Open the database, recovering from corruption: first reload the newest
/// auto-backup, then fall back to an empty store.
pub async fn open_with_recovery(db_path: &str) -> anyhow::Result<SqlitePool> {
    match try_open(db_path).await {
        Ok(pool) => return Ok(pool),
        Err(error) => warn!(error = %error, "Database failed to open"),
    }

    let backup_dir = std::path::Path::new(db_path)
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("db_bkp");
    let mut auto_backups: Vec<std::path::PathBuf> = std::fs::read_dir(&backup_dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with(store::AUTO_BACKUP_PREFIX))
                })
                .collect()
        })
        .unwrap_or_default();
    auto_backups.sort();

    if let Some(latest) = auto_backups.last() {
        warn!(backup = %latest.display(), "Recovering database from latest auto-backup");
        let _ = std::fs::remove_file(db_path);
        std::fs::copy(latest, db_path)?;
        match try_open(db_path).await {
            Ok(pool) => return Ok(pool),
            Err(error) => warn!(error = %error, "Backup recovery failed"),
        }
    }

    warn!("Resetting to an empty database");
    let _ = std::fs::remove_file(db_path);
    try_open(db_path).await
}
