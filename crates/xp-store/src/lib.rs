mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod row;
mod sqlite;

use std::path::Path;
use std::sync::Arc;

use xp_config::StoreConfig;
use xp_core::{ExperimentStore, StoreError};

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Open the store described by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ExperimentStore>, StoreError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Sqlite(sqlite) => Ok(Arc::new(SqliteStore::open(Path::new(&sqlite.path))?)),
        #[cfg(feature = "postgres")]
        StoreConfig::Postgres(pg) => Ok(Arc::new(PostgresStore::connect(pg).await?)),
        #[cfg(not(feature = "postgres"))]
        StoreConfig::Postgres(_) => Err(StoreError::Other(
            "Postgres store requires the 'postgres' feature".to_string(),
        )),
    }
}
