//! # Consistent-Hash Server Selection
//!
//! Maps a cache key's 32-bit content hash onto one of the configured server
//! addresses through a ring of virtual nodes, so that adding or removing a
//! server only remaps the keys adjacent to its virtual nodes.

use crate::value::fnv1a32;
use std::collections::BTreeMap;

/// Virtual nodes per physical server
const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Consistent-hash ring over server addresses
#[derive(Debug, Clone)]
pub struct ServerSelector {
    ring: BTreeMap<u32, usize>,
    addrs: Vec<String>,
}

impl ServerSelector {
    /// Build a ring with the default virtual-node count
    pub fn new(addrs: Vec<String>) -> Self {
        Self::with_virtual_nodes(addrs, DEFAULT_VIRTUAL_NODES)
    }

    /// Build a ring with an explicit virtual-node count
    pub fn with_virtual_nodes(addrs: Vec<String>, virtual_nodes: usize) -> Self {
        let mut ring = BTreeMap::new();
        for (index, addr) in addrs.iter().enumerate() {
            for vnode in 0..virtual_nodes.max(1) {
                let point = fnv1a32(format!("{}#{}", addr, vnode).as_bytes());
                ring.insert(point, index);
            }
        }
        Self { ring, addrs }
    }

    /// Configured addresses
    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Index of the server owning a hash
    pub fn select_index(&self, hash: u32) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, index)| *index)
    }

    /// Address of the server owning a hash
    pub fn select(&self, hash: u32) -> Option<&str> {
        self.select_index(hash).map(|i| self.addrs[i].as_str())
    }

    /// Index of a pinned address, used for per-table server overrides
    pub fn index_of(&self, addr: &str) -> Option<usize> {
        self.addrs.iter().position(|a| a == addr)
    }
}
