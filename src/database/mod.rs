pub mod schema;
pub mod utils;

use std::path::{Path, PathBuf};

use diesel::r2d2::{self, ConnectionManager};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = r2d2::PooledConnection<ConnectionManager<SqliteConnection>>;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database initialization error: {0}")]
    Init(String),

    #[error("database migration error: {0}")]
    Migration(String),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("diesel error: {0}")]
    Diesel(#[from] diesel::result::Error),
}

/// Default database location: `<data dir>/conductor/conductor.db`.
pub fn default_database_path() -> Result<PathBuf, DbError> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| DbError::Init("could not determine local data directory".to_string()))?;
    let dir = base.join("conductor");
    std::fs::create_dir_all(&dir)
        .map_err(|e| DbError::Init(format!("failed to create data directory: {e}")))?;
    Ok(dir.join("conductor.db"))
}

/// Open (creating if needed) the SQLite database at `path`, build the r2d2
/// pool and run any pending embedded migrations.
pub fn init_at(path: &Path) -> Result<DbPool, DbError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| DbError::Init(format!("failed to create database directory: {e}")))?;
    }
    let db_url = path.to_string_lossy().to_string();

    log::info!("initializing database at: {db_url}");

    let manager = ConnectionManager::<SqliteConnection>::new(&db_url);
    let pool = r2d2::Pool::builder()
        .max_size(10)
        .build(manager)
        .map_err(|e| DbError::Init(format!("failed to create connection pool: {e}")))?;

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| DbError::Migration(e.to_string()))?;

    Ok(pool)
}

/// Open the database at the default location.
pub fn init_default() -> Result<DbPool, DbError> {
    let path = default_database_path()?;
    init_at(&path)
}
