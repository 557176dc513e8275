use log::{debug, info, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::OptimizationConfig;
use crate::error::MapError;
use crate::mapping::graph::{EdgeKind, Graph, Uid, VertexMode};
use crate::mapping::optimize::optimize;
use crate::mapping::solver::Solver;
use crate::mapping::weights::Weights;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionReport {
    /// Tags of the first half never seen in the second.
    pub missing_in_g2: usize,
    /// Tags only seen in the second half, removed from it.
    pub deleted_from_g2: usize,
}

/// The odometry chain cut in two at its midpoint.
#[derive(Debug, Clone)]
pub struct Partition {
    /// First half, tags free.
    pub g1: Graph,
    /// Second half, tags pinned.
    pub g2: Graph,
    pub report: PartitionReport,
}

/// Odometry uids in chain order, following odometry edges from the one pose nothing leads to.
pub fn odometry_chain(graph: &Graph) -> Result<Vec<Uid>, MapError> {
    let mut next: FxHashMap<Uid, Uid> = FxHashMap::default();
    let mut has_predecessor: FxHashSet<Uid> = FxHashSet::default();
    for id in graph.sorted_edge_ids() {
        let edge = &graph.edges[&id];
        if edge.kind() == EdgeKind::Odometry {
            next.entry(edge.start).or_insert(edge.end);
            has_predecessor.insert(edge.end);
        }
    }
    let start = graph
        .uids_of(VertexMode::Odometry)
        .into_iter()
        .find(|uid| next.contains_key(uid) && !has_predecessor.contains(uid))
        .or_else(|| next.keys().min().copied())
        .ok_or(MapError::ChainTooShort(0))?;

    let mut chain = vec![start];
    let mut visited: FxHashSet<Uid> = FxHashSet::default();
    visited.insert(start);
    let mut current = start;
    while let Some(&following) = next.get(&current) {
        if !visited.insert(following) {
            break;
        }
        chain.push(following);
        current = following;
    }
    Ok(chain)
}

/// The given odometry poses, every non-odometry vertex they observe and the edges among them.
///
/// Edge ids are those of `graph`.
pub fn subgraph(graph: &Graph, odometry: &[Uid], pin_tags: bool) -> Result<Graph, MapError> {
    let included: FxHashSet<Uid> = odometry.iter().copied().collect();
    let is_odometry = |uid: &Uid| {
        graph
            .vertices
            .get(uid)
            .map_or(false, |v| v.mode() == VertexMode::Odometry)
    };

    let mut members = included.clone();
    for edge in graph.edges.values() {
        for (from, to) in [(edge.start, edge.end), (edge.end, edge.start)] {
            if included.contains(&from) && !is_odometry(&to) {
                members.insert(to);
                if let Some(corners) = edge.corner_ids() {
                    members.extend(corners.iter().copied());
                }
            }
        }
    }

    let mut sub = Graph::new();
    sub.weights = graph.weights.clone();
    sub.compute_inf_params = graph.compute_inf_params.clone();
    let mut uids: Vec<Uid> = members.iter().copied().collect();
    uids.sort_unstable();
    for uid in uids {
        let vertex = graph.vertex(uid)?;
        if pin_tags && vertex.mode() == VertexMode::Tag {
            sub.add_vertex(vertex.pinned())?;
        } else {
            sub.add_vertex(vertex.clone())?;
        }
    }
    for id in graph.sorted_edge_ids() {
        let edge = &graph.edges[&id];
        let inside = [edge.start, edge.end]
            .iter()
            .chain(edge.corner_ids().into_iter().flatten())
            .all(|uid| members.contains(uid));
        if inside {
            sub.insert_edge(id, edge.clone())?;
        }
    }
    Ok(sub)
}

fn tag_uids(graph: &Graph) -> FxHashSet<Uid> {
    graph.uids_of(VertexMode::Tag).into_iter().collect()
}

/// Splits the odometry chain at its middle edge into `g1` (start to mid) and `g2` (mid to end).
///
/// The middle odometry edge belongs to neither half. Tags of `g2` that `g1`
/// never saw cannot be cross-validated and are removed together with their
/// edges and corners.
pub fn partition(graph: &Graph) -> Result<Partition, MapError> {
    let chain = odometry_chain(graph)?;
    let n_edges = chain.len() - 1;
    if n_edges == 0 {
        return Err(MapError::ChainTooShort(0));
    }
    let mid = n_edges / 2;
    let (first, second) = chain.split_at(mid + 1);
    debug!(
        "partitioning chain {} .. {} at {} | {}",
        chain[0],
        chain[n_edges],
        first[first.len() - 1],
        second[0]
    );

    let g1 = subgraph(graph, first, false)?;
    let mut g2 = subgraph(graph, second, true)?;

    let tags1 = tag_uids(&g1);
    let tags2 = tag_uids(&g2);
    let missing_in_g2 = tags1.difference(&tags2).count();
    let mut unmatched: Vec<Uid> = tags2.difference(&tags1).copied().collect();
    unmatched.sort_unstable();
    for uid in &unmatched {
        g2.remove_vertex(*uid);
    }
    if !unmatched.is_empty() {
        let orphans: Vec<Uid> = g2
            .uids_of(VertexMode::TagPoint)
            .into_iter()
            .filter(|uid| !g2.edges.values().any(|e| e.touches(*uid)))
            .collect();
        for uid in orphans {
            g2.remove_vertex(uid);
        }
    }

    let report = PartitionReport {
        missing_in_g2,
        deleted_from_g2: unmatched.len(),
    };
    if report.missing_in_g2 > 0 || report.deleted_from_g2 > 0 {
        warn!(
            "{} tags of the first half are missing from the second, {} tags only in the second half were deleted",
            report.missing_in_g2, report.deleted_from_g2
        );
    }
    Ok(Partition { g1, g2, report })
}

/// Copies estimates of the vertices of the given modes from `from` into the same uids of `to`.
///
/// Returns how many were transferred. Fixed flags of `to` are kept.
pub fn transfer_estimates(from: &Graph, to: &mut Graph, filter_by: &[VertexMode]) -> usize {
    let mut transferred = 0;
    for (uid, vertex) in to.vertices.iter_mut() {
        if !filter_by.contains(&vertex.mode()) {
            continue;
        }
        if let Some(source) = from.vertices.get(uid) {
            vertex.estimate = source.estimate;
            transferred += 1;
        }
    }
    transferred
}

/// Optimizes `g1` with `weights_a`, pins its tags into `g2`, optimizes `g2` with
/// `weights_b` and returns `|chi2(g1) - chi2(g2)|`.
///
/// Works on copies, so the same partition can be compared repeatedly.
pub fn compare<S: Solver + ?Sized>(
    partition: &Partition,
    weights_a: &Weights,
    weights_b: &Weights,
    config: &OptimizationConfig,
    solver: &mut S,
) -> Result<f64, MapError> {
    let mut g1 = partition.g1.clone();
    let mut g2 = partition.g2.clone();

    let config_a = OptimizationConfig {
        weights: weights_a.clone(),
        ..config.clone()
    };
    let chi2_a = optimize(&mut g1, &config_a, solver)?.total_chi2;

    let transferred = transfer_estimates(&g1, &mut g2, &[VertexMode::Tag]);
    debug!("transferred {transferred} tag estimates into the second half");

    let config_b = OptimizationConfig {
        weights: weights_b.clone(),
        ..config.clone()
    };
    let chi2_b = optimize(&mut g2, &config_b, solver)?.total_chi2;

    let delta = (chi2_a - chi2_b).abs();
    info!("subgraph chi2 {chi2_a:.5} vs {chi2_b:.5}, delta {delta:.5}");
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::builder::{build_graph, tests::corridor_record, BuildOptions};
    use crate::mapping::gauss_newton::GaussNewtonSolver;
    use crate::mapping::graph::{Edge, Measurement, Vertex, VertexKind};
    use nalgebra::Isometry3;
    use std::error::Error;

    fn corridor(is_sba: bool) -> Result<Graph, Box<dyn Error>> {
        let record = corridor_record(9, 5, 0.005, 0.005, 11);
        let options = BuildOptions {
            is_sba,
            ..BuildOptions::default()
        };
        Ok(build_graph(&record, &options)?)
    }

    fn odometry_set(graph: &Graph) -> FxHashSet<Uid> {
        graph.uids_of(VertexMode::Odometry).into_iter().collect()
    }

    #[test]
    fn halves_are_disjoint_and_cover_the_chain() -> Result<(), Box<dyn Error>> {
        let graph = corridor(false)?;
        let Partition { g1, g2, .. } = partition(&graph)?;
        let (a, b) = (odometry_set(&g1), odometry_set(&g2));
        assert!(a.is_disjoint(&b));
        assert_eq!(odometry_set(&graph), a.union(&b).copied().collect::<FxHashSet<Uid>>());
        assert_eq!(5, a.len());
        assert_eq!(4, b.len());

        // only the middle odometry edge is lost
        let odometry_edges = g1.count_edges(EdgeKind::Odometry) + g2.count_edges(EdgeKind::Odometry);
        assert_eq!(graph.count_edges(EdgeKind::Odometry) - 1, odometry_edges);
        // every pose keeps its dummy
        assert_eq!(5, g1.count_vertices(VertexMode::Dummy));
        assert_eq!(4, g2.count_vertices(VertexMode::Dummy));
        Ok(())
    }

    #[test]
    fn tag_consistency_between_halves() -> Result<(), Box<dyn Error>> {
        let graph = corridor(false)?;
        let Partition { g1, g2, report } = partition(&graph)?;
        // tag 40 is only seen early, tag 44 only late
        assert_eq!(1, report.missing_in_g2);
        assert_eq!(1, report.deleted_from_g2);

        let tag_ids = |g: &Graph| {
            let mut ids: Vec<i64> = g
                .vertices
                .values()
                .filter_map(|v| match v.kind {
                    VertexKind::Tag { tag_id } => Some(tag_id),
                    _ => None,
                })
                .collect();
            ids.sort_unstable();
            ids
        };
        assert_eq!(vec![40, 41, 42, 43], tag_ids(&g1));
        assert_eq!(vec![41, 42, 43], tag_ids(&g2));
        assert!(g1.vertices.values().filter(|v| v.mode() == VertexMode::Tag).all(|v| !v.is_fixed()));
        assert!(g2.vertices.values().filter(|v| v.mode() == VertexMode::Tag).all(|v| v.is_fixed()));
        Ok(())
    }

    #[test]
    fn deleted_tags_take_their_corners() -> Result<(), Box<dyn Error>> {
        let graph = corridor(true)?;
        let Partition { g2, .. } = partition(&graph)?;
        assert_eq!(
            4 * g2.count_vertices(VertexMode::Tag),
            g2.count_vertices(VertexMode::TagPoint)
        );
        Ok(())
    }

    #[test]
    fn chain_without_edges_is_rejected() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_vertex(Vertex::pose(
            0,
            VertexKind::Odometry { pose_id: 0 },
            Isometry3::identity(),
            true,
        ))?;
        assert!(matches!(partition(&graph), Err(MapError::ChainTooShort(0))));

        graph.add_vertex(Vertex::pose(
            1,
            VertexKind::Odometry { pose_id: 1 },
            Isometry3::identity(),
            false,
        ))?;
        graph.add_edge(Edge::new(0, 1, Measurement::Odometry(Isometry3::identity())))?;
        let halves = partition(&graph)?;
        assert_eq!(vec![0], halves.g1.uids_of(VertexMode::Odometry));
        assert_eq!(vec![1], halves.g2.uids_of(VertexMode::Odometry));
        Ok(())
    }

    #[test]
    fn transfer_copies_tag_estimates_only() -> Result<(), Box<dyn Error>> {
        let graph = corridor(false)?;
        let Partition { mut g1, mut g2, .. } = partition(&graph)?;
        let shared = g2.uids_of(VertexMode::Tag)[0];
        let moved = Isometry3::translation(9.0, 9.0, 9.0);
        if let Some(v) = g1.vertices.get_mut(&shared) {
            v.estimate = crate::mapping::graph::Estimate::Pose(moved);
        }
        let odometry_before = g2.vertices[&g2.uids_of(VertexMode::Odometry)[0]].estimate;

        let n = transfer_estimates(&g1, &mut g2, &[VertexMode::Tag]);
        assert_eq!(g2.count_vertices(VertexMode::Tag), n);
        assert_eq!(Some(&moved), g2.vertices[&shared].estimate.pose());
        assert!(g2.vertices[&shared].is_fixed());
        assert_eq!(odometry_before, g2.vertices[&g2.uids_of(VertexMode::Odometry)[0]].estimate);
        Ok(())
    }

    #[test]
    fn compare_is_repeatable() -> Result<(), Box<dyn Error>> {
        let graph = corridor(false)?;
        let halves = partition(&graph)?;
        let weights = Weights::default();
        let config = OptimizationConfig::default();
        let mut solver = GaussNewtonSolver::default();
        let first = compare(&halves, &weights, &weights, &config, &mut solver)?;
        let second = compare(&halves, &weights, &weights, &config, &mut solver)?;
        assert!(first.is_finite() && first >= 0.0);
        approx::assert_abs_diff_eq!(first, second, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn mismatched_weights_widen_the_delta() -> Result<(), Box<dyn Error>> {
        let graph = corridor(false)?;
        let halves = partition(&graph)?;
        let weights = Weights::default();
        // every edge type trusted a thousand times more on the second half
        let overconfident = Weights::new(
            weights.odometry * 1000.0,
            weights.tag * 1000.0,
            weights.tag_sba * 1000.0,
            weights.dummy * 1000.0,
            weights.odom_tag_ratio(),
        );
        let config = OptimizationConfig::default();
        let mut solver = GaussNewtonSolver::default();

        let same = compare(&halves, &weights, &weights, &config, &mut solver)?;
        let mismatched = compare(&halves, &weights, &overconfident, &config, &mut solver)?;
        assert!(same < mismatched, "{same} vs {mismatched}");
        Ok(())
    }
}
