use sha1::{Digest as _, Sha1};

/// A narrow interface over a content digest algorithm.
///
/// SHA-1 is used here for content addressing, not cryptographic
/// authentication: determinism and availability matter more than collision
/// resistance. Kept behind this trait so a future replacement is a new
/// impl, not a rewrite of every caller.
pub trait Digest {
    /// Digests `bytes`, returning the raw digest bytes.
    fn digest(bytes: &[u8]) -> Vec<u8>;
}

/// The default, and currently only, digest: SHA-1.
pub struct Sha1Digest;

impl Digest for Sha1Digest {
    fn digest(bytes: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().to_vec()
    }
}
