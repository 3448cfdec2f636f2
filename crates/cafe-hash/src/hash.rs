use std::{fmt, str::FromStr};

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A 40-hex-character SHA-1 digest, used as identity for files, tasks, and
/// template fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 20]);

#[derive(Debug, Error)]
pub enum HashError {
    #[error("hash must be exactly 40 hex characters, got {len}")]
    WrongLength { len: usize },
    #[error("invalid hex in hash: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

impl Hash {
    pub(crate) fn from_digest(bytes: Vec<u8>) -> Self {
        let mut buf = [0u8; 20];
        let len = bytes.len().min(20);
        buf[..len].copy_from_slice(&bytes[..len]);
        Hash(buf)
    }

    /// The two-hex-character shard prefix used for the file store's
    /// `objects/<first-2-hex>/<remaining-38-hex>` layout.
    pub fn shard(&self) -> (String, String) {
        let full = self.to_string();
        (full[..2].to_string(), full[2..].to_string())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(HashError::WrongLength { len: s.len() });
        }
        let mut buf = [0u8; 20];
        for (i, chunk) in buf.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
        }
        Ok(Hash(buf))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_str(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_str;

    #[test]
    fn display_and_parse_round_trip() {
        let h = hash_str("hello");
        let s = h.to_string();
        assert_eq!(s.len(), 40);
        let parsed: Hash = s.parse().unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            "abc".parse::<Hash>(),
            Err(HashError::WrongLength { len: 3 })
        ));
    }

    #[test]
    fn deterministic() {
        assert_eq!(hash_str("same"), hash_str("same"));
        assert_ne!(hash_str("a"), hash_str("b"));
    }
}
