//! Generation tags for transport instances.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic tag stamped on every transport adapter at creation.
///
/// Events carry the generation of the adapter that produced them. The
/// connection manager only acts on events whose generation matches the
/// current one, so a late close or message from a torn-down adapter is inert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    /// The generation before any adapter has been created.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The generation that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_is_strictly_greater() {
        let first = Generation::ZERO.next();
        assert!(first > Generation::ZERO);
        assert!(first.next() > first);
        assert_eq!(first.next().get(), 2);
    }

    #[test]
    fn display_prefix() {
        assert_eq!(Generation::new(7).to_string(), "g7");
    }

    #[test]
    fn serde_transparent() {
        let json = serde_json::to_string(&Generation::new(3)).unwrap();
        assert_eq!(json, "3");
    }
}
