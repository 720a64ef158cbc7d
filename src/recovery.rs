//! # Recovery
//!
//! Purges cache entries from previously-captured commit logs. Callers that
//! persist [`QueryLog`] records (from [`crate::Transaction::query_logs`])
//! can delete the corresponding entries when the commit log suggests the
//! cache holds stale state.

use crate::error::Result;
use crate::index::CacheKey;
use crate::server::KVServer;
use crate::tx::QueryLog;

/// Delete every logged key from the cache server
pub async fn recover(server: &dyn KVServer, logs: &[QueryLog]) -> Result<()> {
    for log in logs {
        let key = CacheKey::from_parts(log.key.clone(), log.hash);
        server.delete(&key).await?;
        log::info!("recovered cache key {}", log.key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::CacheTier;
    use crate::server::{InMemoryServer, KVServer};
    use crate::value::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn test_recover_deletes_logged_keys() {
        let server = InMemoryServer::new();
        let id = Value::from(1u64);
        let key = CacheKey::build(CacheTier::Slc, "user_logins", "", &[("id", &id)], None);
        server.set(&key, b"payload", Duration::ZERO, None).await.unwrap();

        let logs = vec![QueryLog::new(&key, CacheTier::Slc, "set", String::new())];
        recover(&server, &logs).await.unwrap();
        assert!(server.get(&key).await.unwrap().is_none());
    }
}
