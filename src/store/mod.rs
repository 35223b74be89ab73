//! Persistence layer: the append-only relay correlation table.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{MessageKey, NewRelayRecord, RelayRecord, RelayStore};

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::Result;

/// Open the store configured in `[storage]`.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn RelayStore>> {
    let store: Arc<dyn RelayStore> = match &config.database {
        Some(path) => Arc::new(LibSqlStore::new_local(path).await?),
        None => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}
