use log::debug;
use nalgebra::{DVector, Isometry3};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;

use crate::error::MapError;
use crate::mapping::chi2::{chi2, edge_residual};
use crate::mapping::graph::{Edge, EdgeId, EdgeKind, Estimate, Graph, Uid, VertexMode};
use crate::mapping::se3::{odometry_from_sba, odometry_to_sba, tag_from_sba, tag_to_sba};

/// How a vertex estimate is stored in the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameterization {
    /// Same convention as the domain graph.
    Pose,
    /// Local-from-global: the inverse of the domain pose.
    InversePose,
    /// Inverse of the domain pose, shifted one unit along the tag's face normal.
    OffsetInversePose,
    Point,
}

impl Parameterization {
    pub fn to_native(self, estimate: &Estimate) -> Estimate {
        match (self, estimate) {
            (Parameterization::InversePose, Estimate::Pose(p)) => Estimate::Pose(odometry_to_sba(p)),
            (Parameterization::OffsetInversePose, Estimate::Pose(p)) => Estimate::Pose(tag_to_sba(p)),
            _ => *estimate,
        }
    }

    pub fn to_domain(self, estimate: &Estimate) -> Estimate {
        match (self, estimate) {
            (Parameterization::InversePose, Estimate::Pose(p)) => {
                Estimate::Pose(odometry_from_sba(p))
            }
            (Parameterization::OffsetInversePose, Estimate::Pose(p)) => {
                Estimate::Pose(tag_from_sba(p))
            }
            _ => *estimate,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverVertex {
    pub uid: Uid,
    /// Estimate in the solver-native convention.
    pub estimate: Estimate,
    pub fixed: bool,
    pub parameterization: Parameterization,
}

impl SolverVertex {
    pub fn domain_estimate(&self) -> Estimate {
        self.parameterization.to_domain(&self.estimate)
    }
}

/// Per-kind chi2 statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chi2Summary {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Chi2Summary {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Snapshot of a graph in the form the solver works on.
///
/// Under the SBA convention odometry vertices are stored inverted and tags
/// inverted with the unit face offset; everything else is stored as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverGraph {
    pub vertices: FxHashMap<Uid, SolverVertex>,
    pub edges: BTreeMap<EdgeId, Edge>,
    pub is_sba: bool,
}

impl SolverGraph {
    pub fn from_graph(graph: &Graph, is_sba: bool) -> SolverGraph {
        let vertices = graph
            .vertices
            .values()
            .map(|v| {
                let parameterization = match (v.mode(), is_sba) {
                    (VertexMode::TagPoint, _) => Parameterization::Point,
                    (VertexMode::Odometry, true) => Parameterization::InversePose,
                    (VertexMode::Tag, true) => Parameterization::OffsetInversePose,
                    _ => Parameterization::Pose,
                };
                let vertex = SolverVertex {
                    uid: v.uid,
                    estimate: parameterization.to_native(&v.estimate),
                    fixed: v.is_fixed(),
                    parameterization,
                };
                (v.uid, vertex)
            })
            .collect();
        let edges = graph
            .edges
            .iter()
            .map(|(id, e)| (*id, e.clone()))
            .collect();
        SolverGraph {
            vertices,
            edges,
            is_sba,
        }
    }

    pub fn domain_estimate(&self, uid: Uid) -> Option<Estimate> {
        self.vertices.get(&uid).map(SolverVertex::domain_estimate)
    }

    pub fn domain_pose(&self, uid: Uid) -> Option<Isometry3<f64>> {
        self.domain_estimate(uid).and_then(|e| e.pose().copied())
    }

    pub fn edge_residual(&self, edge: &Edge) -> Result<DVector<f64>, MapError> {
        edge_residual(edge, |uid| self.domain_estimate(uid))
    }

    pub fn edge_chi2(&self, id: EdgeId) -> Result<f64, MapError> {
        let edge = self.edges.get(&id).ok_or_else(|| {
            MapError::SolverFailure(format!("edge {id} is not part of the solver graph"))
        })?;
        let value = chi2(&self.edge_residual(edge)?, &edge.information);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(MapError::NonFiniteChi2 { edge: id })
        }
    }

    /// Chi2 of every edge, keyed by edge id.
    pub fn edge_chi2s(&self) -> Result<BTreeMap<EdgeId, f64>, MapError> {
        self.edges
            .keys()
            .map(|id| Ok((*id, self.edge_chi2(*id)?)))
            .collect()
    }

    pub fn total_chi2(&self) -> Result<f64, MapError> {
        Ok(self.edge_chi2s()?.values().sum())
    }

    pub fn chi2_by_edge_kind(&self) -> Result<BTreeMap<EdgeKind, Chi2Summary>, MapError> {
        let mut summaries: BTreeMap<EdgeKind, Chi2Summary> = BTreeMap::new();
        for (id, value) in self.edge_chi2s()? {
            let kind = self.edges[&id].kind();
            let s = summaries.entry(kind).or_insert(Chi2Summary {
                count: 0,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            });
            s.count += 1;
            s.sum += value;
            s.min = s.min.min(value);
            s.max = s.max.max(value);
        }
        Ok(summaries)
    }

    pub fn remove_edges(&mut self, ids: &FxHashSet<EdgeId>) {
        self.edges.retain(|id, _| !ids.contains(id));
    }

    /// Copies the optimized estimates back onto the domain vertices.
    pub fn write_back(&self, graph: &mut Graph) {
        let mut updated = 0;
        for (uid, vertex) in graph.vertices.iter_mut() {
            if let Some(solved) = self.vertices.get(uid) {
                vertex.estimate = solved.domain_estimate();
                updated += 1;
            }
        }
        debug!("wrote {updated} optimized estimates back to the graph");
    }
}

/// Nonlinear least-squares refinement of a solver graph, in place.
pub trait Solver {
    fn optimize(&mut self, graph: &mut SolverGraph) -> Result<(), MapError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::graph::{Measurement, Vertex, VertexKind};
    use nalgebra::Vector3;
    use std::error::Error;

    fn graph() -> Result<Graph, Box<dyn Error>> {
        let mut graph = Graph::new();
        let odom = Isometry3::new(Vector3::new(1.0, 2.0, 0.0), Vector3::new(0.0, 0.0, 0.4));
        let tag = Isometry3::new(Vector3::new(1.5, 2.5, -2.0), Vector3::new(0.3, 0.0, 0.0));
        graph.add_vertex(Vertex::pose(0, VertexKind::Tag { tag_id: 1 }, tag, false))?;
        graph.add_vertex(Vertex::pose(1, VertexKind::Odometry { pose_id: 7 }, odom, true))?;
        graph.add_vertex(Vertex::tagpoint(2, Vector3::new(0.1, 0.1, 0.0)))?;
        graph.add_edge(Edge::new(1, 0, Measurement::TagPose(odom.inverse() * tag)))?;
        Ok(graph)
    }

    #[test]
    fn sba_snapshot_round_trips_domain_estimates() -> Result<(), Box<dyn Error>> {
        let graph = graph()?;
        let solver = SolverGraph::from_graph(&graph, true);
        assert_eq!(
            Parameterization::OffsetInversePose,
            solver.vertices[&0].parameterization
        );
        assert_eq!(Parameterization::InversePose, solver.vertices[&1].parameterization);
        assert_eq!(Parameterization::Point, solver.vertices[&2].parameterization);

        // native odometry estimate is the inverse of the domain pose
        let domain = graph.vertices[&1].estimate.pose().copied().unwrap();
        let native = solver.vertices[&1].estimate.pose().copied().unwrap();
        approx::assert_abs_diff_eq!(
            (native * domain).to_homogeneous(),
            Isometry3::<f64>::identity().to_homogeneous(),
            epsilon = 1e-9
        );

        let mut back = graph.clone();
        solver.write_back(&mut back);
        for uid in [0, 1] {
            let a = graph.vertices[&uid].estimate.pose().copied().unwrap();
            let b = back.vertices[&uid].estimate.pose().copied().unwrap();
            approx::assert_abs_diff_eq!(a.to_homogeneous(), b.to_homogeneous(), epsilon = 1e-9);
        }
        // chi2 is measured in the domain convention, so it does not depend on the storage
        approx::assert_abs_diff_eq!(solver.total_chi2()?, 0.0, epsilon = 1e-12);
        let plain = SolverGraph::from_graph(&graph, false);
        approx::assert_abs_diff_eq!(plain.total_chi2()?, 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn chi2_summary_per_kind() -> Result<(), Box<dyn Error>> {
        let mut graph = graph()?;
        graph.add_edge(Edge::new(1, 0, Measurement::TagPose(Isometry3::identity())))?;
        let solver = SolverGraph::from_graph(&graph, false);
        let summary = solver.chi2_by_edge_kind()?;
        let tags = summary[&EdgeKind::TagPose];
        assert_eq!(2, tags.count);
        approx::assert_abs_diff_eq!(tags.min, 0.0, epsilon = 1e-12);
        assert!(tags.max > 1.0);
        approx::assert_abs_diff_eq!(tags.mean(), tags.sum / 2.0);
        Ok(())
    }

    #[test]
    fn non_finite_chi2_is_an_error() -> Result<(), Box<dyn Error>> {
        let graph = graph()?;
        let mut solver = SolverGraph::from_graph(&graph, false);
        if let Some(edge) = solver.edges.get_mut(&0) {
            edge.information[(0, 0)] = f64::NAN;
        }
        assert!(matches!(
            solver.total_chi2(),
            Err(MapError::NonFiniteChi2 { edge: 0 })
        ));
        Ok(())
    }
}
