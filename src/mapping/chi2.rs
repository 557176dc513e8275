use nalgebra::{DMatrix, DVector, Isometry3, Vector3};

use crate::error::MapError;
use crate::mapping::graph::{Edge, Estimate, Measurement, Projection, Uid};
use crate::mapping::se3::{flip_y_and_z, pose_error, pose_pose_constraint, project_corners};

/// Measured minus predicted corner pixels of a tag seen from an odometry pose.
pub fn projection_residual(
    odometry: &Isometry3<f64>,
    tag: &Isometry3<f64>,
    corners: &[Vector3<f64>; 4],
    projection: &Projection,
) -> DVector<f64> {
    let camera_from_tag = flip_y_and_z() * odometry.inverse() * tag;
    let predicted = project_corners(&projection.intrinsics, &camera_from_tag, corners);
    DVector::from_column_slice((projection.pixels - predicted).as_slice())
}

fn pose_of(uid: Uid, estimate: Option<Estimate>) -> Result<Isometry3<f64>, MapError> {
    match estimate {
        Some(Estimate::Pose(p)) => Ok(p),
        Some(Estimate::Point(_)) => Err(MapError::EstimateMismatch(uid)),
        None => Err(MapError::UnknownVertex(uid)),
    }
}

fn point_of(uid: Uid, estimate: Option<Estimate>) -> Result<Vector3<f64>, MapError> {
    match estimate {
        Some(Estimate::Point(p)) => Ok(p),
        Some(Estimate::Pose(_)) => Err(MapError::EstimateMismatch(uid)),
        None => Err(MapError::UnknownVertex(uid)),
    }
}

/// Residual of one edge against the domain-convention estimates returned by `lookup`.
pub fn edge_residual<F>(edge: &Edge, lookup: F) -> Result<DVector<f64>, MapError>
where
    F: Fn(Uid) -> Option<Estimate>,
{
    let start = pose_of(edge.start, lookup(edge.start))?;
    let end = pose_of(edge.end, lookup(edge.end))?;
    match &edge.measurement {
        Measurement::TagProjection(projection) => {
            let mut corners = [Vector3::zeros(); 4];
            for (corner, uid) in corners.iter_mut().zip(projection.corner_ids) {
                *corner = point_of(uid, lookup(uid))?;
            }
            Ok(projection_residual(&start, &end, &corners, projection))
        }
        Measurement::Odometry(z)
        | Measurement::TagPose(z)
        | Measurement::Waypoint(z)
        | Measurement::Dummy(z) => {
            let e = pose_error(&pose_pose_constraint(&start, &end, z));
            Ok(DVector::from_column_slice(e.as_slice()))
        }
    }
}

pub fn chi2(residual: &DVector<f64>, information: &DMatrix<f64>) -> f64 {
    (residual.transpose() * information * residual).x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::se3::{tag_corner_points, CameraIntrinsics};
    use rustc_hash::FxHashMap;
    use std::error::Error;

    #[test]
    fn consistent_pose_edge_has_zero_chi2() -> Result<(), Box<dyn Error>> {
        let a = Isometry3::new(Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 0.2, 0.0));
        let z = Isometry3::translation(0.0, 1.0, 0.0);
        let mut estimates = FxHashMap::default();
        estimates.insert(0, Estimate::Pose(a));
        estimates.insert(1, Estimate::Pose(a * z));
        let edge = Edge::new(0, 1, Measurement::Odometry(z));
        let r = edge_residual(&edge, |uid| estimates.get(&uid).copied())?;
        approx::assert_abs_diff_eq!(chi2(&r, &edge.information), 0.0, epsilon = 1e-18);

        estimates.insert(1, Estimate::Pose(a * z * Isometry3::translation(0.1, 0.0, 0.0)));
        let r = edge_residual(&edge, |uid| estimates.get(&uid).copied())?;
        approx::assert_abs_diff_eq!(chi2(&r, &(&edge.information * 4.0)), 0.04, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn projection_residual_vanishes_at_truth() -> Result<(), Box<dyn Error>> {
        let k = CameraIntrinsics::new(600.0, 600.0, 320.0, 240.0);
        let odom = Isometry3::translation(0.5, 0.0, 0.0);
        let tag = Isometry3::translation(0.7, 0.1, -2.0);
        let corners = tag_corner_points(0.2);
        let camera_from_tag = flip_y_and_z() * odom.inverse() * tag;
        let projection = Projection {
            pixels: project_corners(&k, &camera_from_tag, &corners),
            corner_ids: [2, 3, 4, 5],
            intrinsics: k,
        };
        let mut estimates = FxHashMap::default();
        estimates.insert(0, Estimate::Pose(odom));
        estimates.insert(1, Estimate::Pose(tag));
        for (uid, c) in (2..6).zip(corners) {
            estimates.insert(uid, Estimate::Point(c));
        }
        let edge = Edge::new(0, 1, Measurement::TagProjection(projection));
        let r = edge_residual(&edge, |uid| estimates.get(&uid).copied())?;
        assert_eq!(8, r.len());
        approx::assert_abs_diff_eq!(r.norm(), 0.0, epsilon = 1e-9);

        estimates.insert(1, Estimate::Pose(Isometry3::translation(0.8, 0.1, -2.0)));
        let r = edge_residual(&edge, |uid| estimates.get(&uid).copied())?;
        // moving the tag along x shifts every corner by f * dx / z pixels
        approx::assert_abs_diff_eq!(r[0], -600.0 * 0.1 / 2.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(r[1], 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn missing_or_mismatched_vertices_error() {
        let edge = Edge::new(0, 1, Measurement::Dummy(Isometry3::identity()));
        assert!(matches!(
            edge_residual(&edge, |_| None),
            Err(MapError::UnknownVertex(0))
        ));
        assert!(matches!(
            edge_residual(&edge, |_| Some(Estimate::Point(Vector3::zeros()))),
            Err(MapError::EstimateMismatch(0))
        ));
    }
}
