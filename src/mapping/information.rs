#![allow(non_snake_case)]

use log::debug;
use nalgebra::{DMatrix, DVector, Isometry3, SMatrix, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::mapping::graph::{Edge, EdgeKind, Graph, Measurement};
use crate::mapping::se3::{
    box_plus, flip_y_and_z, project_corners, tag_corner_points, CameraIntrinsics,
};
use crate::mapping::weights::Weights;

const MIN_VARIANCE: f64 = 1e-12;
const JACOBIAN_STEP: f64 = 1e-6;

fn default_tag_size() -> f64 {
    0.172
}

fn default_intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::new(1400.0, 1400.0, 960.0, 720.0)
}

/// Sensor noise used to derive information from first principles instead of identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeInfParams {
    /// Per-axis odometry translation variance.
    pub lin_vel_var: Vector3<f64>,
    /// Odometry rotation variance, shared by the three axes.
    pub ang_vel_var: f64,
    /// Corner detection variance, in squared pixels.
    pub tag_sba_var: f64,
    #[serde(default = "default_tag_size")]
    pub tag_size: f64,
    /// Camera used to propagate pixel noise into tag-pose measurements.
    #[serde(default = "default_intrinsics")]
    pub intrinsics: CameraIntrinsics,
}

impl Default for ComputeInfParams {
    fn default() -> Self {
        ComputeInfParams {
            lin_vel_var: Vector3::repeat(1e-3),
            ang_vel_var: 1e-3,
            tag_sba_var: 1.0,
            tag_size: default_tag_size(),
            intrinsics: default_intrinsics(),
        }
    }
}

/// Assigns `weights` to the graph.
///
/// With `scale_by_edge_amount`, the ratio (and with it the already ratio-scaled
/// odometry vector) is multiplied by tag edges / odometry edges.
pub fn set_weights(graph: &mut Graph, weights: &Weights, scale_by_edge_amount: bool) {
    let mut weights = weights.clone();
    if scale_by_edge_amount {
        let n_odometry = graph.count_edges(EdgeKind::Odometry);
        let n_tags = graph.count_tag_edges();
        if n_odometry > 0 && n_tags > 0 {
            let factor = n_tags as f64 / n_odometry as f64;
            weights.set_odom_tag_ratio(weights.odom_tag_ratio() * factor);
            weights.odometry *= factor;
        } else {
            debug!("edge-amount scaling skipped: {n_tags} tag edges, {n_odometry} odometry edges");
        }
    }
    graph.weights = weights;
}

/// Recomputes every edge's information from the graph weights.
///
/// `information = D^1/2 * S * D^1/2`, with `D` the diagonal of the edge type's weight
/// vector and `S` the edge's prescaling, else the noise-derived base when
/// `compute_inf_params` is given, else identity. Re-running it is a no-op.
pub fn update_edge_information(graph: &mut Graph, compute_inf_params: Option<ComputeInfParams>) {
    graph.compute_inf_params = compute_inf_params;
    let weights = graph.weights.clone();
    let params = graph.compute_inf_params.clone();
    for edge in graph.edges.values_mut() {
        edge.information = edge_information(edge, &weights, params.as_ref());
    }
}

pub fn edge_information(
    edge: &Edge,
    weights: &Weights,
    params: Option<&ComputeInfParams>,
) -> DMatrix<f64> {
    let w = weight_vector(edge.kind(), weights);
    let sqrt_d = DMatrix::from_diagonal(&w.map(|x| x.max(0.0).sqrt()));
    let base = match (&edge.information_prescaling, params) {
        (Some(prescaling), _) => prescaling.clone(),
        (None, Some(params)) => noise_base(&edge.measurement, params),
        (None, None) => DMatrix::identity(w.len(), w.len()),
    };
    &sqrt_d * base * &sqrt_d
}

fn weight_vector(kind: EdgeKind, weights: &Weights) -> DVector<f64> {
    match kind {
        EdgeKind::Odometry => DVector::from_column_slice(weights.odometry.as_slice()),
        EdgeKind::TagPose | EdgeKind::Waypoint => {
            DVector::from_column_slice(weights.tag.as_slice())
        }
        EdgeKind::TagProjection => DVector::from_iterator(
            8,
            weights.tag_sba.iter().copied().cycle().take(8),
        ),
        EdgeKind::Dummy => {
            let d = &weights.dummy;
            DVector::from_column_slice(&[0.0, 0.0, 0.0, d.x, d.y, d.z])
        }
    }
}

fn noise_base(measurement: &Measurement, params: &ComputeInfParams) -> DMatrix<f64> {
    match measurement {
        Measurement::Odometry(_) => {
            let v = &params.lin_vel_var;
            let a = params.ang_vel_var;
            DMatrix::from_diagonal(&DVector::from_iterator(
                6,
                [v.x, v.y, v.z, a, a, a]
                    .iter()
                    .map(|var| 1.0 / var.max(MIN_VARIANCE)),
            ))
        }
        Measurement::TagPose(z) => tag_pose_information(z, params),
        Measurement::TagProjection(_) => {
            DMatrix::identity(8, 8) / params.tag_sba_var.max(MIN_VARIANCE)
        }
        Measurement::Waypoint(_) | Measurement::Dummy(_) => DMatrix::identity(6, 6),
    }
}

/// Pixel noise of the four corners propagated into the pose residual of a tag sighting.
fn tag_pose_information(z: &Isometry3<f64>, params: &ComputeInfParams) -> DMatrix<f64> {
    let corners = tag_corner_points(params.tag_size);
    let flip = flip_y_and_z();
    let pixels = |delta: &Vector6<f64>| {
        project_corners(&params.intrinsics, &(flip * box_plus(z, delta)), &corners)
    };

    let mut J = SMatrix::<f64, 8, 6>::zeros();
    for i in 0..6 {
        let mut delta = Vector6::zeros();
        delta[i] = JACOBIAN_STEP;
        let column = (pixels(&delta) - pixels(&(-delta))) / (2.0 * JACOBIAN_STEP);
        J.set_column(i, &column);
    }

    // residual rotation is the quaternion vector part, half the rotation vector
    let M = SMatrix::<f64, 6, 6>::from_diagonal(&Vector6::new(1.0, 1.0, 1.0, 2.0, 2.0, 2.0));
    let info = M.transpose() * J.transpose() * J * M / params.tag_sba_var.max(MIN_VARIANCE);
    DMatrix::from_column_slice(6, 6, info.as_slice())
}
