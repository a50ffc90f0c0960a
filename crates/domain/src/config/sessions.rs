use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for the durable session/message store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    /// Path to the SQLite database file. `sessions.db-wal`/`-shm` siblings
    /// are created alongside it once WAL mode is enabled.
    #[serde(default = "d_db_path")]
    pub db_path: PathBuf,
    /// Size of the connection pool backing the store. One writer at a time
    /// is enforced by SQLite itself under WAL; extra connections only help
    /// concurrent readers.
    #[serde(default = "d_pool_size")]
    pub pool_size: u32,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            db_path: d_db_path(),
            pool_size: d_pool_size(),
        }
    }
}

fn d_db_path() -> PathBuf {
    PathBuf::from("./data/sessions.db")
}

fn d_pool_size() -> u32 {
    8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_size_is_nonzero() {
        assert!(SessionStoreConfig::default().pool_size > 0);
    }
}
