//! UUID functionality with fast random generation.
//!
//! Wraps `uuid::Uuid` with v4 generation backed by `fastrand`. Message ids
//! are minted constantly while draining the queue, so the cheaper generator
//! is preferred over a cryptographically secure one; ids only need to be
//! unique, not unpredictable.

use crate::error::Error;
use std::{fmt, ops::Deref, str::FromStr};

/// A wrapper around `uuid::Uuid` that provides additional functionality.
///
/// This type implements `Deref` to `uuid::Uuid`, allowing transparent access
/// to all methods of the underlying UUID type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid(pub uuid::Uuid);

/// Provides transparent access to all methods of the underlying `uuid::Uuid` type.
impl Deref for Uuid {
    type Target = uuid::Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Uuid {
    /// Generates a new random UUID v4 using a fast random number generator.
    ///
    /// Not for security-sensitive contexts where predictability matters.
    #[must_use]
    pub fn fast_v4() -> Self {
        let random_bytes = fastrand::u128(..).to_ne_bytes();
        let uuid = uuid::Builder::from_random_bytes(random_bytes).into_uuid();
        Self(uuid)
    }
}

/// Formats the UUID using the underlying `uuid::Uuid` Display implementation.
impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Parses a UUID string using the underlying `uuid::Uuid` `FromStr` implementation.
impl FromStr for Uuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::from_str(s).map(Self).map_err(Into::into)
    }
}

/// Converts this `Uuid` into a `uuid::Uuid`.
impl From<Uuid> for uuid::Uuid {
    fn from(value: Uuid) -> Self {
        *value
    }
}
