//! # Cache Keys
//!
//! Deterministic cache-key construction and parsing. The wire format is
//!
//! ```text
//! r/{slc|llc}/{table-or-tag}[/{uq|idx}]/col#val[&col#val]*
//! lock variant: <key>/lock
//! ```
//!
//! Values render in their canonical string form. For a given row the
//! primary-key cache key is the unique canonical storage location for the
//! value; unique and non-unique index keys store references (primary keys).

use crate::error::{CacheError, Result};
use crate::value::{fnv1a32, Value};

/// Cache tier a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Second-level cache (table rows)
    Slc,
    /// Last-level cache (tagged blobs)
    Llc,
}

impl CacheTier {
    fn segment(&self) -> &'static str {
        match self {
            CacheTier::Slc => "slc",
            CacheTier::Llc => "llc",
        }
    }
}

/// Suffix marking a pessimistic lock sibling
const LOCK_SUFFIX: &str = "/lock";

/// A fully-built cache key: canonical string plus server-selection hash.
///
/// Keys are immutable; the hash is computed once at construction, either
/// over the shard-key column's value (keeping all keys of one logical row on
/// one server) or over the full key string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
    hash: u32,
}

impl CacheKey {
    /// Build a key from column/value pairs.
    ///
    /// `index_tag` is empty for primary keys, `"uq"` for unique indexes and
    /// `"idx"` for non-unique indexes. When `shard_value` is given the hash
    /// is computed over it instead of the full key string.
    pub fn build(
        tier: CacheTier,
        table: &str,
        index_tag: &str,
        pairs: &[(&str, &Value)],
        shard_value: Option<&Value>,
    ) -> Self {
        let mut key = String::with_capacity(16 + table.len() + pairs.len() * 16);
        key.push_str("r/");
        key.push_str(tier.segment());
        key.push('/');
        key.push_str(table);
        if !index_tag.is_empty() {
            key.push('/');
            key.push_str(index_tag);
        }
        key.push('/');
        for (i, (column, value)) in pairs.iter().enumerate() {
            if i > 0 {
                key.push('&');
            }
            key.push_str(column);
            key.push('#');
            key.push_str(&value.canonical_string());
        }
        let hash = match shard_value {
            Some(value) => value.hash32(),
            None => fnv1a32(key.as_bytes()),
        };
        Self { key, hash }
    }

    /// Rebuild a key from its string form, recomputing the hash the same
    /// way the original construction did. The canonical string of a value
    /// hashes identically whether derived from the typed value or from its
    /// rendering inside the key, so no type information is needed.
    pub fn from_raw(raw: &str, shard_column: Option<&str>) -> Result<Self> {
        let parsed = Self::parse(raw)?;
        let hash = shard_column
            .and_then(|shard| {
                parsed
                    .columns
                    .iter()
                    .find(|(column, _)| column == shard)
                    .map(|(_, value)| fnv1a32(value.as_bytes()))
            })
            .unwrap_or_else(|| fnv1a32(raw.as_bytes()));
        Ok(Self {
            key: raw.to_string(),
            hash,
        })
    }

    /// Rebuild a key from a recorded string and hash (recovery path)
    pub fn from_parts(key: String, hash: u32) -> Self {
        Self { key, hash }
    }

    /// Build a last-level cache key for a tagged user key
    pub fn llc(tag: &str, user_key: &str) -> Self {
        let value = Value::from(user_key);
        Self::build(CacheTier::Llc, tag, "", &[("key", &value)], None)
    }

    /// Key string
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Server-selection hash
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Lock sibling of this key. Shares the hash so the lock lands on the
    /// same server as its parent.
    pub fn lock_key(&self) -> CacheKey {
        CacheKey {
            key: format!("{}{}", self.key, LOCK_SUFFIX),
            hash: self.hash,
        }
    }

    /// Whether this is a lock sibling
    pub fn is_lock(&self) -> bool {
        self.key.ends_with(LOCK_SUFFIX)
    }

    /// Parse a key string back into its parts. Required for negative-cache
    /// admission and fallback invalidation.
    pub fn parse(raw: &str) -> Result<ParsedCacheKey> {
        let (body, is_lock) = match raw.strip_suffix(LOCK_SUFFIX) {
            Some(body) => (body, true),
            None => (raw, false),
        };
        let mut segments = body.splitn(5, '/');
        let prefix = segments.next().unwrap_or_default();
        if prefix != "r" {
            return Err(CacheError::Decode(format!("malformed cache key: {}", raw)));
        }
        let tier = match segments.next() {
            Some("slc") => CacheTier::Slc,
            Some("llc") => CacheTier::Llc,
            _ => return Err(CacheError::Decode(format!("malformed cache key: {}", raw))),
        };
        let table = segments
            .next()
            .ok_or_else(|| CacheError::Decode(format!("malformed cache key: {}", raw)))?
            .to_string();
        let third = segments
            .next()
            .ok_or_else(|| CacheError::Decode(format!("malformed cache key: {}", raw)))?;
        let (index_tag, pair_segment) = match third {
            "uq" | "idx" => (
                third.to_string(),
                segments
                    .next()
                    .ok_or_else(|| CacheError::Decode(format!("malformed cache key: {}", raw)))?,
            ),
            _ => (String::new(), third),
        };
        let mut columns = Vec::new();
        for pair in pair_segment.split('&') {
            let (column, value) = pair.split_once('#').ok_or_else(|| {
                CacheError::Decode(format!("malformed cache key pair: {}", pair))
            })?;
            columns.push((column.to_string(), value.to_string()));
        }
        Ok(ParsedCacheKey {
            tier,
            table,
            index_tag,
            columns,
            is_lock,
        })
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// A cache key decomposed back into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCacheKey {
    /// Cache tier
    pub tier: CacheTier,
    /// Table (second level) or tag (last level)
    pub table: String,
    /// `""`, `"uq"` or `"idx"`
    pub index_tag: String,
    /// Column name / canonical value pairs
    pub columns: Vec<(String, String)>,
    /// Whether the key is a lock sibling
    pub is_lock: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_key_format() {
        let id = Value::from(1u64);
        let key = CacheKey::build(CacheTier::Slc, "user_logins", "", &[("id", &id)], None);
        assert_eq!(key.as_str(), "r/slc/user_logins/id#1");
    }

    #[test]
    fn test_composite_unique_key_format() {
        let user_id = Value::from(1u64);
        let session_id = Value::from(2u64);
        let key = CacheKey::build(
            CacheTier::Slc,
            "user_logins",
            "uq",
            &[("user_id", &user_id), ("user_session_id", &session_id)],
            None,
        );
        assert_eq!(
            key.as_str(),
            "r/slc/user_logins/uq/user_id#1&user_session_id#2"
        );
    }

    #[test]
    fn test_distinct_tuples_never_collide() {
        let one = Value::from(1u64);
        let two = Value::from(2u64);
        let a = CacheKey::build(CacheTier::Slc, "t", "idx", &[("a", &one), ("b", &two)], None);
        let b = CacheKey::build(CacheTier::Slc, "t", "idx", &[("a", &two), ("b", &one)], None);
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_shard_value_pins_hash() {
        let user_id = Value::from(9u64);
        let session_a = Value::from(1u64);
        let session_b = Value::from(2u64);
        let a = CacheKey::build(
            CacheTier::Slc,
            "user_logins",
            "uq",
            &[("user_id", &user_id), ("user_session_id", &session_a)],
            Some(&user_id),
        );
        let b = CacheKey::build(
            CacheTier::Slc,
            "user_logins",
            "uq",
            &[("user_id", &user_id), ("user_session_id", &session_b)],
            Some(&user_id),
        );
        // Different keys, same server partition.
        assert_ne!(a.as_str(), b.as_str());
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_lock_key() {
        let id = Value::from(1u64);
        let key = CacheKey::build(CacheTier::Slc, "user_logins", "", &[("id", &id)], None);
        let lock = key.lock_key();
        assert_eq!(lock.as_str(), "r/slc/user_logins/id#1/lock");
        assert!(lock.is_lock());
        assert_eq!(lock.hash(), key.hash());
    }

    #[test]
    fn test_parse_round_trip() {
        let user_id = Value::from(1u64);
        let param = Value::from(10u64);
        let key = CacheKey::build(
            CacheTier::Slc,
            "user_logins",
            "idx",
            &[("user_id", &user_id), ("login_param_id", &param)],
            None,
        );
        let parsed = CacheKey::parse(key.as_str()).unwrap();
        assert_eq!(parsed.tier, CacheTier::Slc);
        assert_eq!(parsed.table, "user_logins");
        assert_eq!(parsed.index_tag, "idx");
        assert_eq!(
            parsed.columns,
            vec![
                ("user_id".to_string(), "1".to_string()),
                ("login_param_id".to_string(), "10".to_string())
            ]
        );
        assert!(!parsed.is_lock);

        let parsed_lock = CacheKey::parse(key.lock_key().as_str()).unwrap();
        assert!(parsed_lock.is_lock);
        assert_eq!(parsed_lock.table, "user_logins");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CacheKey::parse("x/slc/t/id#1").is_err());
        assert!(CacheKey::parse("r/??/t/id#1").is_err());
        assert!(CacheKey::parse("r/slc/t/id-1").is_err());
    }

    #[test]
    fn test_llc_key() {
        let key = CacheKey::llc("sessions", "token-abc");
        assert_eq!(key.as_str(), "r/llc/sessions/key#\"token-abc\"");
        let parsed = CacheKey::parse(key.as_str()).unwrap();
        assert_eq!(parsed.tier, CacheTier::Llc);
        assert_eq!(parsed.table, "sessions");
    }
}
