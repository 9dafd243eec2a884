//! xxHash-based key hashing for `hash_range` subtask partitioning (spec
//! §4.6). Ported from the reference implementation's `src/hash.rs`
//! row-ID hashing: same seed, same NULL/record-separator encoding for
//! composite keys, generalized from a `pg_extern` SQL function to a plain
//! library function since subtasks hash keys in worker code, not inside a
//! running backend.

use xxhash_rust::xxh64;

const SEED: u64 = 0x517cc1b727220a95;

/// Hash a single key value.
pub fn hash_key(input: &str) -> u64 {
    xxh64::xxh64(input.as_bytes(), SEED)
}

/// Hash a composite grouping key, matching NULL and column-boundary
/// handling so two different column splits never collide on the same
/// combined bytes.
pub fn hash_key_parts(parts: &[Option<&str>]) -> u64 {
    let mut combined = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            combined.push('\x1E');
        }
        match part {
            Some(v) => combined.push_str(v),
            None => combined.push_str("\x00NULL\x00"),
        }
    }
    xxh64::xxh64(combined.as_bytes(), SEED)
}

/// Which of `num_buckets` hash-range buckets a key falls into.
pub fn bucket_of(hash: u64, num_buckets: u32) -> u32 {
    (hash % num_buckets as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_key("customer-42"), hash_key("customer-42"));
    }

    #[test]
    fn different_inputs_diverge() {
        assert_ne!(hash_key("a"), hash_key("b"));
    }

    #[test]
    fn composite_key_separator_prevents_collision() {
        let a = hash_key_parts(&[Some("ab"), Some("c")]);
        let b = hash_key_parts(&[Some("a"), Some("bc")]);
        assert_ne!(a, b);
    }

    #[test]
    fn null_marker_distinct_from_literal_null_string() {
        let with_null = hash_key_parts(&[None, Some("b")]);
        let with_literal = hash_key_parts(&[Some("NULL"), Some("b")]);
        assert_ne!(with_null, with_literal);
    }

    #[test]
    fn buckets_stay_in_range() {
        for i in 0..1000u64 {
            let b = bucket_of(hash_key(&i.to_string()), 7);
            assert!(b < 7);
        }
    }
}
