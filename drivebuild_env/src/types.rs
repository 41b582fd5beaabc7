//! Identifier newtypes shared by every DriveBuild component.
//!
//! All three identifiers are opaque strings on the wire. Wrapping them keeps
//! a simulation id from being passed where a vehicle id is expected and makes
//! identity comparisons structural.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true for the empty identifier.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of one test run. Minted by the main application and
    /// immutable once assigned.
    SimulationId
);

string_id!(
    /// Identifier of a participant vehicle, unique within its simulation.
    VehicleId
);

string_id!(
    /// Identifier of a simulation node, assigned on first registration.
    NodeId
);

impl NodeId {
    /// Prefix of every minted node id.
    pub const PREFIX: &'static str = "snid_";

    /// Builds the node id with the given numeric suffix.
    pub fn from_suffix(suffix: u64) -> Self {
        Self(format!("{}{}", Self::PREFIX, suffix))
    }
}
