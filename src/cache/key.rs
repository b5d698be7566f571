//! Cache Key Derivation
//!
//! Point keys are `<prefix>:<id>`; search keys are
//! `<prefix>_<index>_<params hash>` with one hash field per 1000-ID shard.
//! The prefix already embeds a hash of the entity shape, so a column change
//! moves every entry of the type to a fresh key space.

use crate::value::Value;

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Derive the cache key prefix of an entity shape.
pub fn cache_prefix(pool: &str, table: &str, shape: &str) -> String {
    let hash = fx_hash(format!("{}\x1f{}\x1f{}", pool, table, shape).as_bytes());
    format!("{:08x}", (hash >> 32) as u32)
}

/// Point-lookup key for one row
#[inline]
pub fn point_key(prefix: &str, id: u64) -> String {
    format!("{}:{}", prefix, id)
}

/// Search key for a cached query with bound parameters.
///
/// Parameters must already be normalised to their column kinds so the same
/// logical value always hashes the same way.
pub fn search_key(prefix: &str, index: &str, params: &[Value]) -> String {
    let joined = params
        .iter()
        .map(Value::sql_literal)
        .collect::<Vec<_>>()
        .join("\x1f");
    format!("{}_{}_{:x}", prefix, index, fx_hash(joined.as_bytes()))
}

/// Hash field addressing shard `k` (0-based) of a search key
#[inline]
pub fn shard_field(shard: usize) -> String {
    (shard + 1).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fx_hash_is_stable() {
        assert_eq!(fx_hash(b"abc"), fx_hash(b"abc"));
        assert_ne!(fx_hash(b"abc"), fx_hash(b"abd"));
    }

    #[test]
    fn test_prefix_changes_with_shape() {
        let a = cache_prefix("default", "User", "ID:uint,Name:str");
        let b = cache_prefix("default", "User", "ID:uint,Name:str,Age:int");
        let c = cache_prefix("other", "User", "ID:uint,Name:str");
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_formats() {
        assert_eq!(point_key("a1b2c3d4", 15), "a1b2c3d4:15");
        let key = search_key("a1b2c3d4", "IndexAge", &[Value::Int(18)]);
        assert!(key.starts_with("a1b2c3d4_IndexAge_"));
        assert_ne!(key, search_key("a1b2c3d4", "IndexAge", &[Value::Int(10)]));
        assert_eq!(shard_field(0), "1");
    }
}
