//! Fixed-width seal slot for validator signatures.

use std::fmt;

/// Number of bytes in a seal slot (recoverable signature: r ‖ s ‖ v).
pub const SEAL_BYTES: usize = 65;

/// A 65-byte signature slot in a block header.
///
/// Every slot in a header's seal list is either empty (all zeros) or
/// filled. Slot `i` belongs to the validator at index `i` of the header's
/// validator list.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SEAL_BYTES]);

impl Signature {
    /// An empty (all-zero) slot.
    pub const EMPTY: Signature = Signature([0u8; SEAL_BYTES]);

    /// True if this slot has not been filled.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// View as a byte slice.
    pub fn as_bytes(&self) -> &[u8; SEAL_BYTES] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Signature::EMPTY
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "Signature(empty)")
        } else {
            write!(
                f,
                "Signature({:02x}{:02x}{:02x}{:02x}…)",
                self.0[0], self.0[1], self.0[2], self.0[3]
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_detection() {
        assert!(Signature::EMPTY.is_empty());
        let mut sig = Signature::EMPTY;
        sig.0[10] = 1;
        assert!(!sig.is_empty());
    }
}
