//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings so they can be written
//! straight into container labels and JSON reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }

            /// First `n` characters, for display.
            pub fn short(&self, n: usize) -> &str {
                &self.0[..n.min(self.0.len())]
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<$name> for String {
            fn eq(&self, other: &$name) -> bool {
                *self == other.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Stable 16-character key identifying one workspace's environment.
    EnvKey
);

string_newtype!(
    /// Full blake3 hex digest of the canonical resolved configuration.
    ConfigHash
);

string_newtype!(
    /// Full blake3 hex digest of the canonicalized workspace path.
    WorkspaceHash
);

string_newtype!(
    /// Container identifier as reported by the runtime.
    ContainerId
);

/// Topology kind of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    /// One container, described entirely by the generated overlay.
    Single,
    /// A compose project built from user compose files plus the overlay.
    Compose,
}

impl Plan {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Compose => "compose",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_key_display_and_as_ref() {
        let key = EnvKey::new("abc123");
        assert_eq!(key.to_string(), "abc123");
        assert_eq!(key.as_str(), "abc123");
        assert_eq!(AsRef::<str>::as_ref(&key), "abc123");
    }

    #[test]
    fn config_hash_serde_roundtrip() {
        let hash = ConfigHash::new("deadbeef");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: ConfigHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn short_clamps_to_length() {
        let hash = WorkspaceHash::from("abcdef");
        assert_eq!(hash.short(3), "abc");
        assert_eq!(hash.short(64), "abcdef");
    }

    #[test]
    fn container_id_into_inner() {
        let id = ContainerId::new("c0ffee".to_owned());
        assert_eq!(id.into_inner(), "c0ffee");
    }

    #[test]
    fn plan_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Plan::Compose).unwrap(), "\"compose\"");
        assert_eq!(Plan::Single.to_string(), "single");
    }
}
