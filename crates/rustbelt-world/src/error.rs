//! Error types for the `rustbelt-world` crate.

use rustbelt_types::NodeId;

/// Errors from world-math operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorldError {
    /// A vote weight was zero, NaN or infinite.
    #[error("invalid vote weight: {0}")]
    InvalidVoteWeight(f64),

    /// A tuning parameter was outside its valid range.
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter {
        /// Parameter name as it appears in configuration.
        name: &'static str,
        /// Rejected value.
        value: f64,
    },

    /// A road segment referenced a node the graph does not contain.
    #[error("road graph has no node {0}")]
    UnknownNode(NodeId),
}
