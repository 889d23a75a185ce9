//! Error type shared by the fitting and matching engines.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// All failures reported by this crate.
///
/// Per-cell and per-cluster variants carry the offending identity so that a
/// batch can report them without aborting the remaining work.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The sample set cannot be fitted, e.g. fewer than two distinct voltages.
    #[error("cell '{cell}' has degenerate sample data ({points} usable points)")]
    DegenerateData {
        /// Id of the cell.
        cell: String,
        /// Number of usable points.
        points: usize,
    },

    /// A derived quantity would divide by a zero open-circuit voltage or short-circuit current.
    #[error("cell '{cell}' has zero {quantity}, cannot compute derived metrics")]
    DivideByZero {
        /// Id of the cell.
        cell: String,
        /// The zero quantity, `v_oc` or `i_sc`.
        quantity: &'static str,
    },

    /// An optimizer, metric or condition name that is not known.
    #[error("unresolved {kind} '{name}'")]
    UnresolvedSelector {
        /// What was looked up.
        kind: &'static str,
        /// The unknown name.
        name: String,
    },

    /// A builder was configured with values an operation cannot run with.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong.
        message: String,
    },

    /// Matching a cluster failed.
    #[error("cluster {cluster}: {source}")]
    Cluster {
        /// Id of the cluster.
        cluster: usize,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Attach a cell identity to per-cell errors raised without one.
    pub(crate) fn for_cell(self, id: &str) -> Self {
        match self {
            Self::DegenerateData { cell, points } if cell.is_empty() => Self::DegenerateData {
                cell: id.to_owned(),
                points,
            },
            Self::DivideByZero { cell, quantity } if cell.is_empty() => Self::DivideByZero {
                cell: id.to_owned(),
                quantity,
            },
            other => other,
        }
    }

    pub(crate) fn in_cluster(self, cluster: usize) -> Self {
        Self::Cluster {
            cluster,
            source: Box::new(self),
        }
    }
}
