// SQLite pool setup and schema migrations.
// Imports the SQLite connection and pool builders from SQLx and the `info` logger from `tracing`.
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

// A versioned migration embedded in the binary.
struct Migration {
    // Migration number; migrations are applied in ascending order.
    version: i32,
    // Descriptive name, recorded in `schema_migrations`.
    name: &'static str,
    // SQL text. `&'static str` because the file is compiled into the binary.
    sql: &'static str,
}

// Every migration the schema needs. Order matters.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_records",
        // `include_str!` embeds the file contents at compile time.
        sql: include_str!("../migrations/001_create_records.sql"),
    },
    Migration {
        version: 2,
        name: "create_rate_limit_attempts",
        sql: include_str!("../migrations/002_create_rate_limit_attempts.sql"),
    },
    Migration {
        version: 3,
        name: "index_record_owners",
        sql: include_str!("../migrations/003_index_record_owners.sql"),
    },
];

// Opens (or creates) the database, applies pending migrations and returns the pool.
pub async fn init_database(db_file: &str) -> Result<SqlitePool, sqlx::Error> {
    // `:memory:` gets a throwaway database, used by tests.
    let in_memory = db_file == ":memory:";
    let url = if in_memory {
        "sqlite::memory:".to_string()
    } else {
        // `mode=rwc`: read-write, create the file if missing.
        format!("sqlite:{}?mode=rwc", db_file)
    };

    // --- Per-connection SQLite settings ---
    let options = SqliteConnectOptions::from_str(&url)?
        // WAL lets readers proceed while a write is in progress.
        // An in-memory database has no file to log to, so it keeps its journal in RAM.
        .journal_mode(if in_memory {
            SqliteJournalMode::Memory
        } else {
            SqliteJournalMode::Wal
        })
        // `NORMAL`: fewer fsyncs, safe under WAL except on power loss.
        .synchronous(SqliteSynchronous::Normal)
        // Wait up to 5s on a locked database before failing.
        .busy_timeout(Duration::from_secs(5));

    // --- Pool sizing ---
    // Every connection to `:memory:` opens its own database, so keep exactly one
    // and never let it idle out or be recycled.
    let pool = SqlitePoolOptions::new()
        // Up to 10 concurrent connections on a file database.
        .max_connections(if in_memory { 1 } else { 10 })
        .min_connections(if in_memory { 1 } else { 0 })
        // Close connections idle for 10 minutes.
        .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(600)) })
        // Recycle connections after 30 minutes.
        .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
        .connect_with(options)
        .await?;

    // `temp_store = MEMORY`: temporary tables live in RAM.
    sqlx::query("PRAGMA temp_store = MEMORY").execute(&pool).await?;
    // `cache_size = -64000`: 64MB page cache, fewer disk reads.
    sqlx::query("PRAGMA cache_size = -64000").execute(&pool).await?;

    // --- Migration bookkeeping ---
    // One row per applied migration.
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
    )
    .execute(&pool)
    .await?;

    // Walks the migrations in order.
    for migration in MIGRATIONS {
        // Has this version already been recorded?
        let applied =
            sqlx::query_as::<_, (i32,)>("SELECT version FROM schema_migrations WHERE version = ?")
                .bind(migration.version)
                .fetch_optional(&pool)
                .await?
                .is_some();

        // Already applied: nothing to do.
        if applied {
            info!("Migration {} already applied, skipping", migration.version);
            continue;
        }

        info!("Running migration {}: {}", migration.version, migration.name);

        // Schema change and bookkeeping row commit together or not at all.
        let mut tx = pool.begin().await?;
        // `raw_sql` runs every statement of the file, not just the first.
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        // Records the migration as applied.
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(current_timestamp_ms())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Migration {} applied successfully", migration.version);
    }

    // Refreshes planner statistics so the new indexes get used.
    sqlx::query("ANALYZE").execute(&pool).await?;

    info!("Database initialization complete");
    Ok(pool)
}

// Wall-clock milliseconds since the Unix epoch, for `applied_at`.
fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        // A clock before 1970 records 0 rather than failing start-up.
        .unwrap_or_default()
}
