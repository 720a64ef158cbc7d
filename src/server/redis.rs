//! # Redis-Backed Key/Value Server
//!
//! [`KVServer`] adapter over one or more Redis instances. Keys are routed
//! onto instances by the consistent-hash selector; a table (or tag) can be
//! pinned to a fixed instance. CAS tokens are not provided by the Redis
//! protocol, so reads report token 0 and conditional sets store
//! unconditionally; tables that need optimistic locking belong on a
//! memcached-compatible server.

use crate::error::{CacheError, Result};
use crate::index::CacheKey;
use crate::server::{KVEntry, KVServer, ServerSelector};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;

/// Redis adapter
pub struct RedisServer {
    selector: ServerSelector,
    conns: Vec<ConnectionManager>,
    pins: HashMap<String, usize>,
}

impl RedisServer {
    /// Connect to every address. Addresses may omit the `redis://` scheme.
    pub async fn connect(addrs: Vec<String>) -> Result<Self> {
        Self::connect_with_pins(addrs, HashMap::new()).await
    }

    /// Connect with per-table pinned addresses
    pub async fn connect_with_pins(
        addrs: Vec<String>,
        table_pins: HashMap<String, String>,
    ) -> Result<Self> {
        if addrs.is_empty() {
            return Err(CacheError::Config(
                "redis server requires at least one address".to_string(),
            ));
        }
        let mut conns = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            let url = if addr.contains("://") {
                addr.clone()
            } else {
                format!("redis://{}", addr)
            };
            let client = redis::Client::open(url.as_str())
                .map_err(|e| CacheError::server_permanent(format!("open {}: {}", addr, e)))?;
            let conn = ConnectionManager::new(client)
                .await
                .map_err(|e| CacheError::server_transient(format!("connect {}: {}", addr, e)))?;
            conns.push(conn);
        }
        let selector = ServerSelector::new(addrs.clone());
        let mut pins = HashMap::new();
        for (table, addr) in table_pins {
            let index = selector.index_of(&addr).ok_or_else(|| {
                CacheError::Config(format!(
                    "pinned server {} for table {} is not a configured address",
                    addr, table
                ))
            })?;
            pins.insert(table, index);
        }
        Ok(Self {
            selector,
            conns,
            pins,
        })
    }

    /// Instance index a key routes to: pinned table first, hash ring
    /// otherwise
    fn route(&self, key: &CacheKey) -> usize {
        if !self.pins.is_empty() {
            // Keys embed the table as their third segment.
            if let Some(table) = key.as_str().split('/').nth(2) {
                if let Some(index) = self.pins.get(table) {
                    return *index;
                }
            }
        }
        self.selector.select_index(key.hash()).unwrap_or(0)
    }

    fn conn_for(&self, key: &CacheKey) -> ConnectionManager {
        self.conns[self.route(key)].clone()
    }

    fn transient(err: redis::RedisError) -> CacheError {
        CacheError::server_transient(err.to_string())
    }
}

#[async_trait]
impl KVServer for RedisServer {
    async fn get(&self, key: &CacheKey) -> Result<Option<KVEntry>> {
        let mut conn = self.conn_for(key);
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key.as_str())
            .query_async(&mut conn)
            .await
            .map_err(Self::transient)?;
        Ok(value.map(|value| KVEntry { value, cas: 0 }))
    }

    async fn get_multi(&self, keys: &[CacheKey]) -> Result<HashMap<String, KVEntry>> {
        // Group keys per instance so each MGET stays node-local, then fan
        // the node fetches out concurrently.
        let mut grouped: HashMap<usize, Vec<&CacheKey>> = HashMap::new();
        for key in keys {
            grouped.entry(self.route(key)).or_default().push(key);
        }
        let fetches = grouped.into_iter().map(|(index, node_keys)| {
            let mut conn = self.conns[index].clone();
            async move {
                let mut cmd = redis::cmd("MGET");
                for key in &node_keys {
                    cmd.arg(key.as_str());
                }
                let values: Vec<Option<Vec<u8>>> = cmd
                    .query_async(&mut conn)
                    .await
                    .map_err(Self::transient)?;
                Ok::<_, crate::error::CacheError>(
                    node_keys
                        .iter()
                        .zip(values)
                        .filter_map(|(key, value)| {
                            value.map(|value| {
                                (key.as_str().to_string(), KVEntry { value, cas: 0 })
                            })
                        })
                        .collect::<Vec<_>>(),
                )
            }
        });
        let mut out = HashMap::with_capacity(keys.len());
        for node_entries in futures::future::join_all(fetches).await {
            out.extend(node_entries?);
        }
        Ok(out)
    }

    async fn add(&self, key: &CacheKey, value: &[u8], expiration: Duration) -> Result<bool> {
        let mut conn = self.conn_for(key);
        let mut cmd = redis::cmd("SET");
        cmd.arg(key.as_str()).arg(value);
        if !expiration.is_zero() {
            cmd.arg("PX").arg(expiration.as_millis() as u64);
        }
        cmd.arg("NX");
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(Self::transient)?;
        Ok(reply.is_some())
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: &[u8],
        expiration: Duration,
        _cas: Option<u64>,
    ) -> Result<()> {
        let mut conn = self.conn_for(key);
        let mut cmd = redis::cmd("SET");
        cmd.arg(key.as_str()).arg(value);
        if !expiration.is_zero() {
            cmd.arg("PX").arg(expiration.as_millis() as u64);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(Self::transient)?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        let mut conn = self.conn_for(key);
        redis::cmd("DEL")
            .arg(key.as_str())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(Self::transient)?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        for conn in &self.conns {
            let mut conn = conn.clone();
            redis::cmd("FLUSHDB")
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(Self::transient)?;
        }
        Ok(())
    }
}
