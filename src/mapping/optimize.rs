use log::info;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;

use crate::config::OptimizationConfig;
use crate::error::MapError;
use crate::mapping::diagnostics::{extract, ResultMap};
use crate::mapping::graph::{EdgeId, EdgeKind, Graph};
use crate::mapping::information::{set_weights, update_edge_information};
use crate::mapping::solver::{Chi2Summary, Solver, SolverGraph};

#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// Total chi2 after the last optimization pass.
    pub total_chi2: f64,
    /// Total chi2 of the unoptimized graph under the same weights.
    pub initial_chi2: f64,
    pub result: ResultMap,
    /// The unoptimized state, for before/after comparison.
    pub prior: ResultMap,
    /// Tag edges dropped by the chi2 filter.
    pub filtered_edges: usize,
    pub chi2_by_kind: BTreeMap<EdgeKind, Chi2Summary>,
    /// Optimized solver state, kept for export.
    pub solver_graph: SolverGraph,
}

/// Weighs, optimizes and evaluates `graph`, writing the optimized estimates back onto it.
///
/// With `config.obs_chi2_filter` set, tag edges above the threshold after the
/// first pass are removed from the graph and it is optimized once more.
pub fn optimize<S: Solver + ?Sized>(
    graph: &mut Graph,
    config: &OptimizationConfig,
    solver: &mut S,
) -> Result<OptimizationOutcome, MapError> {
    set_weights(graph, &config.weights, config.scale_by_edge_amount);
    update_edge_information(graph, config.compute_inf_params.clone());

    let mut solver_graph = SolverGraph::from_graph(graph, config.is_sba);
    let prior_graph = solver_graph.clone();
    let initial_chi2 = prior_graph.total_chi2()?;
    solver.optimize(&mut solver_graph)?;

    let mut filtered_edges = 0;
    if let Some(threshold) = config.obs_chi2_filter {
        let outliers: FxHashSet<EdgeId> = solver_graph
            .edge_chi2s()?
            .into_iter()
            .filter(|(id, chi2)| solver_graph.edges[id].kind().is_tag() && *chi2 > threshold)
            .map(|(id, _)| id)
            .collect();
        if !outliers.is_empty() {
            info!(
                "dropping {} tag edges with chi2 above {threshold} and optimizing again",
                outliers.len()
            );
            filtered_edges = outliers.len();
            solver_graph.remove_edges(&outliers);
            graph.edges.retain(|id, _| !outliers.contains(id));
            solver.optimize(&mut solver_graph)?;
        }
    }

    solver_graph.write_back(graph);
    let prior = extract(graph, &prior_graph)?;
    let result = extract(graph, &solver_graph)?;
    let total_chi2 = solver_graph.total_chi2()?;
    let chi2_by_kind = solver_graph.chi2_by_edge_kind()?;
    info!("optimized {} edges: chi2 {initial_chi2:.5} -> {total_chi2:.5}", solver_graph.edges.len());

    Ok(OptimizationOutcome {
        total_chi2,
        initial_chi2,
        result,
        prior,
        filtered_edges,
        chi2_by_kind,
        solver_graph,
    })
}
