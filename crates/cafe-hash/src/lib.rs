//! cafe-hash: canonical JSON serialization and content-addressed digesting.
//!
//! Every identity in the engine — file blobs, task records, task hashes —
//! is derived from the same two building blocks: a canonical JSON encoding
//! (sorted keys, no insignificant whitespace) and a digest over its UTF-8
//! bytes. The digest algorithm is kept behind [`Digest`] so it can be
//! swapped without touching callers; [`Sha1Digest`] is the only
//! implementation today.

mod canonical;
mod digest;
mod hash;

pub use canonical::canonical_json;
pub use digest::{Digest, Sha1Digest};
pub use hash::{Hash, HashError};

/// Hashes the canonical JSON encoding of `value`.
pub fn hash_json(value: &serde_json::Value) -> Hash {
    hash_str(&canonical_json(value))
}

/// Hashes a UTF-8 string directly (used for file blob contents, task JSON
/// blobs already rendered to a canonical string, and the task hash seed
/// string `[rule_fullname, arg_hashes...]`).
pub fn hash_str(text: &str) -> Hash {
    hash_bytes(text.as_bytes())
}

/// Hashes raw bytes (used for binary file blobs).
pub fn hash_bytes(bytes: &[u8]) -> Hash {
    Hash::from_digest(Sha1Digest::digest(bytes))
}
