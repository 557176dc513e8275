use thiserror::Error;

use crate::mapping::graph::Uid;

/// Every fatal condition of the build / weight / optimize pipeline.
///
/// Non-fatal conditions (missing cross-subgraph tags, dangling tagpoints,
/// ingestion fetch misses) are never raised as errors, they are counted in
/// the report of the component that hit them.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("malformed observation record: {0}")]
    MalformedRecord(String),

    #[error("unsupported weight vector length {0}")]
    UnsupportedWeightVectorLength(usize),

    #[error("unknown weight preset `{0}`")]
    UnknownWeightPreset(String),

    #[error("vertex {0} does not exist in the graph")]
    UnknownVertex(Uid),

    #[error("vertex {0} already exists in the graph")]
    DuplicateVertex(Uid),

    #[error("vertex {0} has the wrong estimate type for its edge")]
    EstimateMismatch(Uid),

    #[error("solver failure: {0}")]
    SolverFailure(String),

    #[error("chi2 of edge {edge} is not finite")]
    NonFiniteChi2 { edge: usize },

    #[error("g2o line {line}: {reason}")]
    MalformedG2o { line: usize, reason: String },

    #[error("odometry chain has {0} edges, at least one is needed to partition")]
    ChainTooShort(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

