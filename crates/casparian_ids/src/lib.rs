//! Typed identifier wrappers shared across Casparian Flow crates.
//!
//! Every identifier in the data model (§3) is an opaque integer key. Wrapping
//! them in distinct newtypes keeps a `FileVersionId` from being passed where a
//! `JobId` is expected, which the underlying `i64`/`u64` would happily allow.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($name:ident, $repr:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name($repr);

        impl $name {
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            pub const fn get(self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $repr {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

// Metadata store primary keys. SQLite rowids are i64; these mirror that.
define_id!(SourceRootId, i64);
define_id!(FileLocationId, i64);
define_id!(FileVersionId, i64);
define_id!(FileHashId, i64);
define_id!(RoutingRuleId, i64);
define_id!(PluginManifestId, i64);

/// The job id. Carried on the wire as an 8-byte big-endian unsigned integer
/// (§6), so this is `u64` rather than `i64` like the other ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Storage-layer view: SQLite has no native u64 column, so job ids are
    /// persisted as `i64` rowids. Job ids this large are not expected in
    /// practice.
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_roundtrip_through_repr() {
        let id = FileVersionId::new(42);
        assert_eq!(id.get(), 42);
        assert_eq!(format!("{id}"), "42");
    }

    #[test]
    fn job_id_roundtrips_through_i64_storage() {
        let id = JobId::new(7);
        assert_eq!(JobId::from_i64(id.as_i64()), id);
    }
}
