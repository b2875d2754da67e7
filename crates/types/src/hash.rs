//! 32-byte digest type used for block identity.

use std::fmt;

/// Number of bytes in a digest.
pub const HASH_BYTES: usize = 32;

/// A 32-byte digest.
///
/// Block identity is the blake3 digest of the canonical header encoding,
/// excluding the variable seal slots (see [`crate::Header::hash`]).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; HASH_BYTES]);

impl Hash {
    /// The all-zero hash.
    pub const ZERO: Hash = Hash([0u8; HASH_BYTES]);

    /// Digest arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        Hash(*blake3::hash(data).as_bytes())
    }

    /// View as a byte slice.
    pub fn as_bytes(&self) -> &[u8; HASH_BYTES] {
        &self.0
    }

    /// Build from a byte slice, hashing if it is not exactly 32 bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        match <[u8; HASH_BYTES]>::try_from(data) {
            Ok(bytes) => Hash(bytes),
            Err(_) => Self::digest(data),
        }
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form: first four bytes are enough to tell blocks apart in logs.
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}…",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(Hash::digest(b"abc"), Hash::digest(b"abc"));
        assert_ne!(Hash::digest(b"abc"), Hash::digest(b"abd"));
    }

    #[test]
    fn from_bytes_roundtrips_exact_width() {
        let h = Hash::digest(b"block");
        assert_eq!(Hash::from_bytes(h.as_bytes()), h);
    }
}
