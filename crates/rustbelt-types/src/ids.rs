//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Every persisted entity in the city has a strongly-typed ID so that a crew
//! ID can never be passed where a task ID is expected. All IDs use UUID v7
//! (time-ordered) for efficient database indexing.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a region (fixed geographic division with a hub).
    RegionId
}

define_id! {
    /// Unique identifier for a hex cell in the rust grid.
    HexId
}

define_id! {
    /// Unique identifier for a static feature (road or building).
    FeatureId
}

define_id! {
    /// Unique identifier for a repair task.
    TaskId
}

define_id! {
    /// Unique identifier for a player casting votes.
    VoterId
}

define_id! {
    /// Unique identifier for a work crew.
    CrewId
}

define_id! {
    /// Unique identifier for a scheduled resource transfer.
    TransferId
}

define_id! {
    /// Unique identifier for a narrative feed event.
    FeedEventId
}

define_id! {
    /// Unique identifier for a connector node in the road routing graph.
    NodeId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let crew = CrewId::new();
        let task = TaskId::new();
        assert_ne!(crew.into_inner(), Uuid::nil());
        assert_ne!(task.into_inner(), Uuid::nil());
    }

    #[test]
    fn id_roundtrip_serde() {
        let original = TaskId::new();
        let json = serde_json::to_string(&original).ok();
        assert!(json.is_some());
        let restored: Result<TaskId, _> = serde_json::from_str(json.as_deref().unwrap_or(""));
        assert_eq!(restored.ok(), Some(original));
    }

    #[test]
    fn id_display_matches_uuid() {
        let id = RegionId::new();
        assert_eq!(id.to_string(), id.into_inner().to_string());
    }
}
