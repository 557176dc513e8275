pub mod builder;
pub mod chi2;
pub mod diagnostics;
pub mod g2o;
pub mod gauss_newton;
pub mod graph;
pub mod ground_truth;
pub mod information;
pub mod optimize;
pub mod se3;
pub mod solver;
pub mod subgraph;
pub mod sweep;
pub mod weights;

pub use builder::{build_graph, BuildOptions};
pub use diagnostics::{extract, ProcessedMap, ResultMap};
pub use gauss_newton::{GaussNewtonSolver, PoseGraphSolver};
pub use graph::{Edge, EdgeKind, Estimate, Graph, Measurement, Uid, Vertex, VertexKind, VertexMode};
pub use ground_truth::{ground_truth_metric, GroundTruth};
pub use information::{set_weights, update_edge_information, ComputeInfParams};
pub use optimize::{optimize, OptimizationOutcome};
pub use solver::{Solver, SolverGraph};
pub use subgraph::{
    compare, odometry_chain, partition, subgraph, transfer_estimates, Partition, PartitionReport,
};
pub use sweep::{sweep, SweepAxis, SweepGrid, SweepMetric};
pub use weights::{WeightPresets, Weights};
