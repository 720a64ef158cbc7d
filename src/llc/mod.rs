//! # Last-Level Cache
//!
//! Generic tag-keyed cache of raw byte values, sharing the transaction
//! stash and pending-operation machinery of the typed tiers. Per-tag
//! options select the server, expiration and lock discipline; there is no
//! database behind it, so a miss is simply a miss.

use crate::config::{LlcConfig, ResolvedTagOption};
use crate::error::{CacheError, Result};
use crate::index::{CacheKey, CacheTier};
use crate::server::{KVServer, ServerSelector};
use crate::tx::stash::{PendingCommand, PendingOp, QueryLog, Stash};
use std::sync::Arc;
use std::time::Duration;

/// Tag-keyed byte-value cache
pub struct LastLevelCache {
    config: LlcConfig,
    server: Arc<dyn KVServer>,
    selector: Option<ServerSelector>,
}

impl LastLevelCache {
    /// Create the last-level cache over a server
    pub fn new(
        config: LlcConfig,
        server: Arc<dyn KVServer>,
        selector: Option<ServerSelector>,
    ) -> Self {
        Self {
            config,
            server,
            selector,
        }
    }

    fn opt(&self, tag: &str) -> ResolvedTagOption {
        self.config.tag(tag)
    }

    fn server_addr(&self, opt: &ResolvedTagOption, key: &CacheKey) -> String {
        if let Some(pinned) = &opt.server {
            return pinned.clone();
        }
        self.selector
            .as_ref()
            .and_then(|s| s.select(key.hash()))
            .map(str::to_string)
            .unwrap_or_default()
    }

    fn schedule(
        &self,
        stash: &mut Stash,
        opt: &ResolvedTagOption,
        key: CacheKey,
        command: PendingCommand,
    ) {
        let name = match command {
            PendingCommand::Set { .. } => "set",
            PendingCommand::Add { .. } => "add",
            PendingCommand::Delete => "delete",
        };
        let log = QueryLog::new(&key, CacheTier::Llc, name, self.server_addr(opt, &key));
        stash.push_pending(PendingOp { key, command, log });
    }

    async fn lock(&self, stash: &mut Stash, opt: &ResolvedTagOption, key: &CacheKey) -> Result<()> {
        if !opt.pessimistic_lock {
            return Ok(());
        }
        let lock_key = key.lock_key();
        if stash.holds_lock(&lock_key) {
            return Ok(());
        }
        let created = self.server.add(&lock_key, b"1", opt.lock_expiration).await?;
        if !created {
            return Err(CacheError::Locked(lock_key.as_str().to_string()));
        }
        stash.push_lock(lock_key);
        Ok(())
    }

    /// Read a value: stash first, then the server
    pub async fn find(&self, stash: &mut Stash, tag: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let opt = self.opt(tag);
        let cache_key = CacheKey::llc(tag, key);
        let key_str = cache_key.as_str().to_string();
        if let Some(buffered) = stash.llc_value(&key_str) {
            return Ok(buffered.clone());
        }
        match self.server.get(&cache_key).await? {
            Some(entry) => {
                if opt.optimistic_lock {
                    stash.set_cas(key_str.clone(), entry.cas);
                }
                stash.set_llc_value(key_str, Some(entry.value.clone()));
                Ok(Some(entry.value))
            }
            None => Ok(None),
        }
    }

    /// Store a new value; applies as `add`, so an existing entry survives
    pub async fn create(
        &self,
        stash: &mut Stash,
        tag: &str,
        key: &str,
        value: Vec<u8>,
        expiration: Option<Duration>,
    ) -> Result<()> {
        let opt = self.opt(tag);
        let cache_key = CacheKey::llc(tag, key);
        self.lock(stash, &opt, &cache_key).await?;
        stash.set_llc_value(cache_key.as_str().to_string(), Some(value.clone()));
        let expiration = expiration.unwrap_or(opt.expiration);
        self.schedule(
            stash,
            &opt,
            cache_key,
            PendingCommand::Add { value, expiration },
        );
        Ok(())
    }

    /// Store a value unconditionally
    pub async fn update(
        &self,
        stash: &mut Stash,
        tag: &str,
        key: &str,
        value: Vec<u8>,
        expiration: Option<Duration>,
    ) -> Result<()> {
        let opt = self.opt(tag);
        let cache_key = CacheKey::llc(tag, key);
        self.lock(stash, &opt, &cache_key).await?;
        stash.set_llc_value(cache_key.as_str().to_string(), Some(value.clone()));
        let expiration = expiration.unwrap_or(opt.expiration);
        self.schedule(
            stash,
            &opt,
            cache_key,
            PendingCommand::Set {
                value,
                expiration,
                with_cas: opt.optimistic_lock,
            },
        );
        Ok(())
    }

    /// Delete a value
    pub async fn delete(&self, stash: &mut Stash, tag: &str, key: &str) -> Result<()> {
        let opt = self.opt(tag);
        let cache_key = CacheKey::llc(tag, key);
        self.lock(stash, &opt, &cache_key).await?;
        stash.set_llc_value(cache_key.as_str().to_string(), None);
        self.schedule(stash, &opt, cache_key, PendingCommand::Delete);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::InMemoryServer;

    fn llc() -> (LastLevelCache, Arc<InMemoryServer>) {
        let server = Arc::new(InMemoryServer::new());
        (
            LastLevelCache::new(LlcConfig::default(), server.clone(), None),
            server,
        )
    }

    #[tokio::test]
    async fn test_read_your_own_write() {
        let (llc, _server) = llc();
        let mut stash = Stash::new();
        llc.create(&mut stash, "sessions", "token", b"abc".to_vec(), None)
            .await
            .unwrap();
        // The write is buffered, not applied, yet visible within the tx.
        let value = llc.find(&mut stash, "sessions", "token").await.unwrap();
        assert_eq!(value, Some(b"abc".to_vec()));
        assert_eq!(stash.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_masks_server_value() {
        let (llc, server) = llc();
        let cache_key = CacheKey::llc("sessions", "token");
        server
            .set(&cache_key, b"abc", Duration::ZERO, None)
            .await
            .unwrap();

        let mut stash = Stash::new();
        assert!(llc
            .find(&mut stash, "sessions", "token")
            .await
            .unwrap()
            .is_some());
        llc.delete(&mut stash, "sessions", "token").await.unwrap();
        assert!(llc
            .find(&mut stash, "sessions", "token")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_pessimistic_tag_lock() {
        let server = Arc::new(InMemoryServer::new());
        let mut config = LlcConfig::default();
        config.tags.insert(
            "sessions".to_string(),
            crate::config::TagOption {
                pessimistic_lock: Some(true),
                ..Default::default()
            },
        );
        let llc = LastLevelCache::new(config, server.clone(), None);

        let mut first = Stash::new();
        llc.update(&mut first, "sessions", "token", b"a".to_vec(), None)
            .await
            .unwrap();

        let mut second = Stash::new();
        let err = llc
            .update(&mut second, "sessions", "token", b"b".to_vec(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Locked(_)));
    }
}
