#![allow(non_snake_case)]

use log::debug;
use nalgebra::{DMatrix, DVector, Vector3, Vector6};
use nalgebra_sparse::{factorization::CscCholesky, CooMatrix, CscMatrix};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::MapError;
use crate::mapping::chi2::edge_residual;
use crate::mapping::graph::{Edge, Estimate, Uid};
use crate::mapping::se3::box_plus;
use crate::mapping::solver::{Solver, SolverGraph};

const JACOBIAN_STEP: f64 = 1e-6;
const REGULARIZATION: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoseGraphSolver {
    GaussNewton,
    LevenbergMarquardt,
}

/// Sparse Gauss-Newton / Levenberg-Marquardt over the free vertices of a [`SolverGraph`].
///
/// Poses are updated by right-multiplied perturbations of their solver-native
/// estimate, points additively. Jacobians are central differences of the
/// domain-convention residuals. Fixed vertices are left out of the system, so
/// the fixed odometry anchor plays the role of the prior.
#[derive(Debug, Clone)]
pub struct GaussNewtonSolver {
    pub method: PoseGraphSolver,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub initial_lambda: f64,
    errors: Vec<f64>,
}

impl Default for GaussNewtonSolver {
    fn default() -> Self {
        GaussNewtonSolver::new(PoseGraphSolver::LevenbergMarquardt, 50)
    }
}

/// Offset and dimension of every free vertex in the linear system.
struct Layout {
    offsets: FxHashMap<Uid, (usize, usize)>,
    len: usize,
}

impl Layout {
    fn new(graph: &SolverGraph) -> Layout {
        let mut free: Vec<(Uid, usize)> = graph
            .vertices
            .values()
            .filter(|v| !v.fixed)
            .map(|v| match v.estimate {
                Estimate::Pose(_) => (v.uid, 6),
                Estimate::Point(_) => (v.uid, 3),
            })
            .collect();
        free.sort_unstable();
        let mut offsets = FxHashMap::default();
        let mut len = 0;
        for (uid, dim) in free {
            offsets.insert(uid, (len, dim));
            len += dim;
        }
        Layout { offsets, len }
    }
}

fn perturb(estimate: &Estimate, delta: &[f64]) -> Estimate {
    match estimate {
        Estimate::Pose(p) => Estimate::Pose(box_plus(p, &Vector6::from_column_slice(delta))),
        Estimate::Point(p) => Estimate::Point(p + Vector3::from_column_slice(delta)),
    }
}

fn residual_with(
    graph: &SolverGraph,
    edge: &Edge,
    uid: Uid,
    native: &Estimate,
) -> Result<DVector<f64>, MapError> {
    let domain = graph.vertices[&uid].parameterization.to_domain(native);
    edge_residual(edge, |u| {
        if u == uid {
            Some(domain)
        } else {
            graph.domain_estimate(u)
        }
    })
}

fn jacobian(
    graph: &SolverGraph,
    edge: &Edge,
    uid: Uid,
    dim: usize,
) -> Result<DMatrix<f64>, MapError> {
    let estimate = graph.vertices[&uid].estimate;
    let mut J = DMatrix::zeros(edge.measurement.dimension(), dim);
    for k in 0..dim {
        let mut delta = vec![0.0; dim];
        delta[k] = JACOBIAN_STEP;
        let plus = residual_with(graph, edge, uid, &perturb(&estimate, &delta))?;
        delta[k] = -JACOBIAN_STEP;
        let minus = residual_with(graph, edge, uid, &perturb(&estimate, &delta))?;
        J.set_column(k, &((plus - minus) / (2.0 * JACOBIAN_STEP)));
    }
    Ok(J)
}

fn push_block(H: &mut CooMatrix<f64>, i: usize, j: usize, block: &DMatrix<f64>) {
    for r in 0..block.nrows() {
        for c in 0..block.ncols() {
            H.push(i + r, j + c, block[(r, c)]);
        }
    }
}

fn update_nodes(graph: &mut SolverGraph, layout: &Layout, dx: &DVector<f64>) {
    for (uid, (offset, dim)) in &layout.offsets {
        if let Some(vertex) = graph.vertices.get_mut(uid) {
            let delta = dx.rows(*offset, *dim);
            vertex.estimate = perturb(&vertex.estimate, delta.as_slice());
        }
    }
}

impl GaussNewtonSolver {
    pub fn new(method: PoseGraphSolver, max_iterations: usize) -> GaussNewtonSolver {
        GaussNewtonSolver {
            method,
            max_iterations,
            tolerance: 1e-6,
            initial_lambda: 1e-4,
            errors: Vec::new(),
        }
    }

    /// Total chi2 before the first step and after every step of the last run.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    fn build_linear_system(
        &self,
        graph: &SolverGraph,
        layout: &Layout,
        lambda: f64,
    ) -> Result<(CscMatrix<f64>, DVector<f64>), MapError> {
        let mut H = CooMatrix::new(layout.len, layout.len);
        let mut b = DVector::zeros(layout.len);

        for edge in graph.edges.values() {
            let mut involved = vec![edge.start, edge.end];
            if let Some(corners) = edge.corner_ids() {
                involved.extend(corners.iter().copied());
            }
            involved.sort_unstable();
            involved.dedup();

            let mut blocks = Vec::new();
            for uid in involved {
                if let Some(&(offset, dim)) = layout.offsets.get(&uid) {
                    blocks.push((offset, jacobian(graph, edge, uid, dim)?));
                }
            }
            if blocks.is_empty() {
                continue;
            }

            let e = graph.edge_residual(edge)?;
            let omega = &edge.information;
            for (offset_i, J_i) in &blocks {
                let Jt_omega = J_i.transpose() * omega;
                let b_i = &Jt_omega * &e;
                let mut v = b.rows_mut(*offset_i, b_i.len());
                v += &b_i;
                for (offset_j, J_j) in &blocks {
                    push_block(&mut H, *offset_i, *offset_j, &(&Jt_omega * J_j));
                }
            }
        }

        for i in 0..layout.len {
            H.push(i, i, lambda + REGULARIZATION);
        }
        Ok((CscMatrix::from(&H), b))
    }
}

impl Solver for GaussNewtonSolver {
    fn optimize(&mut self, graph: &mut SolverGraph) -> Result<(), MapError> {
        self.errors.clear();
        let layout = Layout::new(graph);
        let mut last_error = graph.total_chi2()?;
        self.errors.push(last_error);
        if layout.len == 0 {
            debug!("nothing to optimize, every vertex is fixed");
            return Ok(());
        }
        debug!(
            "optimizing {} free vertices ({} unknowns) over {} edges, initial error {last_error:.5}",
            layout.offsets.len(),
            layout.len,
            graph.edges.len()
        );

        let mut lambda = match self.method {
            PoseGraphSolver::GaussNewton => 0.0,
            PoseGraphSolver::LevenbergMarquardt => self.initial_lambda,
        };
        for i in 0..self.max_iterations {
            let (H, b) = self.build_linear_system(graph, &layout, lambda)?;
            let cholesky = CscCholesky::factor(&H).map_err(|e| {
                MapError::SolverFailure(format!("cholesky factorization failed: {e}"))
            })?;
            let neg_b = -b;
            let dx = cholesky.solve(&neg_b).column(0).clone_owned();
            if dx.iter().any(|x| !x.is_finite()) {
                return Err(MapError::SolverFailure(format!(
                    "non-finite update at step {i}"
                )));
            }

            let backup = graph.vertices.clone();
            update_nodes(graph, &layout, &dx);
            let norm_dx = dx.norm();
            let error = graph.total_chi2().unwrap_or(f64::INFINITY);

            if self.method == PoseGraphSolver::LevenbergMarquardt && error > last_error {
                graph.vertices = backup; // get back old state
                lambda *= 2.0;
            } else {
                if self.method == PoseGraphSolver::LevenbergMarquardt {
                    lambda /= 2.0;
                }
                if !error.is_finite() {
                    return Err(MapError::SolverFailure(format!(
                        "error diverged at step {i}"
                    )));
                }
                last_error = error;
            }
            self.errors.push(last_error);
            debug!("step {i:3} : |dx| = {norm_dx:3.5}, error = {last_error:3.5}");

            if norm_dx < self.tolerance {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::graph::{Graph, Measurement, Vertex, VertexKind};
    use nalgebra::Isometry3;
    use std::error::Error;

    fn truth() -> (Vec<Isometry3<f64>>, Isometry3<f64>) {
        let poses = (0..4)
            .map(|i| {
                Isometry3::new(
                    Vector3::new(0.5 * i as f64, 0.1 * i as f64, 0.0),
                    Vector3::new(0.0, 0.0, 0.1 * i as f64),
                )
            })
            .collect();
        let tag = Isometry3::new(Vector3::new(1.0, 1.0, -2.0), Vector3::new(0.2, 0.0, 0.0));
        (poses, tag)
    }

    /// Consistent measurements, initial estimates pushed away from the truth.
    fn perturbed_graph() -> Result<Graph, Box<dyn Error>> {
        let (poses, tag) = truth();
        let mut graph = Graph::new();
        graph.add_vertex(Vertex::pose(
            0,
            VertexKind::Tag { tag_id: 1 },
            tag * Isometry3::translation(0.3, -0.2, 0.1),
            false,
        ))?;
        for (i, pose) in poses.iter().enumerate() {
            let nudge = Isometry3::new(Vector3::new(0.0, 0.1, 0.0), Vector3::new(0.0, 0.0, 0.05));
            let estimate = if i == 0 { *pose } else { pose * nudge };
            graph.add_vertex(Vertex::pose(
                i + 1,
                VertexKind::Odometry { pose_id: i as i64 },
                estimate,
                i == 0,
            ))?;
            graph.add_edge(Edge::new(i + 1, 0, Measurement::TagPose(pose.inverse() * tag)))?;
            if i > 0 {
                graph.add_edge(Edge::new(
                    i,
                    i + 1,
                    Measurement::Odometry(poses[i - 1].inverse() * pose),
                ))?;
            }
        }
        Ok(graph)
    }

    fn converges(is_sba: bool, method: PoseGraphSolver) -> Result<(), Box<dyn Error>> {
        let graph = perturbed_graph()?;
        let mut solver_graph = SolverGraph::from_graph(&graph, is_sba);
        let mut solver = GaussNewtonSolver::new(method, 30);
        solver.optimize(&mut solver_graph)?;

        let errors = solver.errors();
        assert!(errors[0] > 1e-2);
        approx::assert_abs_diff_eq!(*errors.last().unwrap(), 0.0, epsilon = 1e-8);

        let (poses, tag) = truth();
        let solved_tag = solver_graph.domain_pose(0).unwrap();
        approx::assert_abs_diff_eq!(
            solved_tag.to_homogeneous(),
            tag.to_homogeneous(),
            epsilon = 1e-4
        );
        let last = solver_graph.domain_pose(4).unwrap();
        approx::assert_abs_diff_eq!(
            last.to_homogeneous(),
            poses[3].to_homogeneous(),
            epsilon = 1e-4
        );
        Ok(())
    }

    #[test]
    fn levenberg_marquardt_recovers_truth() -> Result<(), Box<dyn Error>> {
        converges(false, PoseGraphSolver::LevenbergMarquardt)
    }

    #[test]
    fn gauss_newton_recovers_truth() -> Result<(), Box<dyn Error>> {
        converges(false, PoseGraphSolver::GaussNewton)
    }

    #[test]
    fn sba_parameterization_reaches_same_optimum() -> Result<(), Box<dyn Error>> {
        converges(true, PoseGraphSolver::LevenbergMarquardt)
    }

    #[test]
    fn errors_never_increase_with_damping() -> Result<(), Box<dyn Error>> {
        let graph = perturbed_graph()?;
        let mut solver_graph = SolverGraph::from_graph(&graph, false);
        let mut solver = GaussNewtonSolver::default();
        solver.optimize(&mut solver_graph)?;
        assert!(solver.errors().windows(2).all(|w| w[1] <= w[0]));
        Ok(())
    }

    #[test]
    fn fixed_graph_is_left_alone() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_vertex(Vertex::pose(
            0,
            VertexKind::Odometry { pose_id: 0 },
            Isometry3::identity(),
            true,
        ))?;
        graph.add_vertex(Vertex::pose(1, VertexKind::Dummy, Isometry3::identity(), true))?;
        graph.add_edge(Edge::new(0, 1, Measurement::Dummy(Isometry3::translation(1.0, 0.0, 0.0))))?;
        let mut solver_graph = SolverGraph::from_graph(&graph, false);
        let before = solver_graph.clone();
        GaussNewtonSolver::default().optimize(&mut solver_graph)?;
        assert_eq!(before, solver_graph);
        Ok(())
    }
}
