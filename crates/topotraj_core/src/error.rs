//! Error kinds raised by the pipeline stages.

use thiserror::Error;

/// Root error type for distance, embedding, clustering and fusion failures.
///
/// Every variant aborts the pipeline run. Mesh degeneracy is not an error;
/// it is reported through [`crate::mesh::MeshWarning`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopoError {
    /// Fewer diagrams than the operation needs.
    #[error("empty collection: {required} diagram(s) required, {found} supplied")]
    EmptyCollection { required: usize, found: usize },

    /// A pair with death < birth, or a non-finite value.
    #[error("degenerate diagram {key}: pair {index} has birth {birth} and death {death}")]
    DegenerateDiagram {
        key: String,
        index: usize,
        birth: f64,
        death: f64,
    },

    /// The distance matrix cannot support the requested embedding dimension.
    #[error("insufficient rank: {requested} component(s) requested, {available} available")]
    InsufficientRank { requested: usize, available: usize },

    #[error("invalid cluster count {requested} for {available} diagram(s)")]
    InvalidClusterCount { requested: usize, available: usize },

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
}

pub type TopoResult<T> = Result<T, TopoError>;
