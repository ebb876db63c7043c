//! Tandem Core
//!
//! Host-side building blocks shared by the script bridge:
//! - Generational handles and the arena that owns engine-side host values
//! - Temporal normalization (zone-naive and zoned values to absolute instants)
//! - UTF-16 index helpers for text that crosses into the interpreter
//! - Host exceptions and the per-thread "current exception" state

pub mod arena;
pub mod exception;
pub mod handle;
pub mod temporal;
pub mod text;

pub use arena::{Arena, ArenaError};
pub use exception::HostException;
pub use handle::Handle;

pub use chrono;

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
