//! Generational handle into an [`Arena`](crate::Arena)
//!
//! Handles are lightweight (8 bytes) and reference values owned by an engine.
//! The generation counter makes a handle that outlived its slot fail fast
//! instead of aliasing whatever reused the slot.

use std::fmt;

/// Arena handle (generation-indexed for safety)
///
/// Format: [32-bit index | 32-bit generation]
/// - Index: Slot position in the arena
/// - Generation: Incremented every time the slot is freed
///
/// Example:
/// ```ignore
/// let handle = arena.insert(value);
/// arena.remove(handle)?;
/// // handle is now stale (generation mismatch)
/// assert!(arena.get(handle).is_err());
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Serialize to 64-bit integer (used as a registry key on the script side)
    pub fn to_bits(&self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }

    /// Deserialize from 64-bit integer
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }

    /// Hex form of [`to_bits`](Self::to_bits), stable across the script boundary.
    pub fn to_key(&self) -> String {
        format!("{:x}", self.to_bits())
    }

    pub fn from_key(key: &str) -> Option<Self> {
        u64::from_str_radix(key, 16).ok().map(Self::from_bits)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bits_roundtrip() {
        let handle = Handle::new(7, 3);
        assert_eq!(Handle::from_bits(handle.to_bits()), handle);
        assert_eq!(handle.to_bits(), (3u64 << 32) | 7);
    }

    #[test]
    fn test_key_roundtrip() {
        let handle = Handle::new(u32::MAX, 42);
        assert_eq!(Handle::from_key(&handle.to_key()), Some(handle));
        assert_eq!(Handle::from_key("not hex"), None);
    }

    proptest! {
        #[test]
        fn test_bits_and_keys_roundtrip(index in any::<u32>(), generation in any::<u32>()) {
            let handle = Handle::new(index, generation);
            prop_assert_eq!(Handle::from_bits(handle.to_bits()), handle);
            prop_assert_eq!(Handle::from_key(&handle.to_key()), Some(handle));
        }

        #[test]
        fn test_every_bit_pattern_is_a_handle(bits in any::<u64>()) {
            prop_assert_eq!(Handle::from_bits(bits).to_bits(), bits);
        }
    }
}
