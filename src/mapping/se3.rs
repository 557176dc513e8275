use nalgebra::{
    Isometry3, Matrix4, Quaternion, Rotation3, SVector, Translation3, UnitQuaternion,
    Vector2, Vector3, Vector6,
};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// [x, y, z, qx, qy, qz, qw]
pub type PoseVector = SVector<f64, 7>;

/// The eight pixel coordinates of the four tag corners, (u, v) interleaved.
pub type CornerPixels = SVector<f64, 8>;

pub fn iso3(x: f64, y: f64, z: f64, qx: f64, qy: f64, qz: f64, qw: f64) -> Isometry3<f64> {
    let translation = Translation3::new(x, y, z);
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz));
    Isometry3::from_parts(translation, rotation)
}

pub fn pose_from_vector(v: &PoseVector) -> Isometry3<f64> {
    iso3(v[0], v[1], v[2], v[3], v[4], v[5], v[6])
}

pub fn pose_to_vector(pose: &Isometry3<f64>) -> PoseVector {
    let t = &pose.translation.vector;
    let q = pose.rotation.quaternion();
    PoseVector::from_column_slice(&[t.x, t.y, t.z, q.i, q.j, q.k, q.w])
}

/// Homogeneous 4x4 matrix to isometry. The rotation block is re-orthonormalized
/// since phone-reported matrices are only approximately rotations.
pub fn matrix_to_pose(m: &Matrix4<f64>) -> Isometry3<f64> {
    let rotation = Rotation3::from_matrix(&m.fixed_view::<3, 3>(0, 0).into_owned());
    Isometry3::from_parts(
        Translation3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]),
        UnitQuaternion::from_rotation_matrix(&rotation),
    )
}

pub fn pose_from_column_major(entries: &[f64]) -> Isometry3<f64> {
    matrix_to_pose(&Matrix4::from_column_slice(&entries[..16]))
}

pub fn pose_from_row_major(entries: &[f64]) -> Isometry3<f64> {
    matrix_to_pose(&Matrix4::from_row_slice(&entries[..16]))
}

/// Rotation of pi around x: maps the camera (OpenCV) axes onto the phone axes.
/// It is its own inverse.
pub fn flip_y_and_z() -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::identity(),
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), PI),
    )
}

/// Tags are represented in the SBA solver by the pose one unit in front of their face.
fn sba_tag_offset() -> Isometry3<f64> {
    Isometry3::translation(0.0, 0.0, 1.0)
}

pub fn odometry_to_sba(pose: &Isometry3<f64>) -> Isometry3<f64> {
    pose.inverse()
}

pub fn odometry_from_sba(solver_pose: &Isometry3<f64>) -> Isometry3<f64> {
    solver_pose.inverse()
}

pub fn tag_to_sba(pose: &Isometry3<f64>) -> Isometry3<f64> {
    sba_tag_offset() * pose.inverse()
}

pub fn tag_from_sba(solver_pose: &Isometry3<f64>) -> Isometry3<f64> {
    (sba_tag_offset().inverse() * solver_pose).inverse()
}

/// Error transform of a relative-pose measurement `z` between `x1` and `x2`.
pub fn pose_pose_constraint(
    x1: &Isometry3<f64>,
    x2: &Isometry3<f64>,
    z: &Isometry3<f64>,
) -> Isometry3<f64> {
    z.inverse() * x1.inverse() * x2
}

/// Minimal 6-vector of an error transform: translation followed by the
/// imaginary quaternion part, with the quaternion taken on the w >= 0 hemisphere.
pub fn pose_error(error: &Isometry3<f64>) -> Vector6<f64> {
    let t = &error.translation.vector;
    let q = error.rotation.quaternion();
    let sign = if q.w < 0.0 { -1.0 } else { 1.0 };
    Vector6::new(t.x, t.y, t.z, sign * q.i, sign * q.j, sign * q.k)
}

/// Right-multiplied perturbation: translation in the first three rows, rotation vector in the last three.
pub fn box_plus(x: &Isometry3<f64>, delta: &Vector6<f64>) -> Isometry3<f64> {
    let perturbation = Isometry3::new(
        delta.fixed_rows::<3>(0).into_owned(),
        delta.fixed_rows::<3>(3).into_owned(),
    );
    x * perturbation
}

/// Pinhole intrinsics of the camera that captured a tag sighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> CameraIntrinsics {
        CameraIntrinsics { fx, fy, cx, cy }
    }

    pub fn project(&self, p: &Vector3<f64>) -> Vector2<f64> {
        Vector2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        )
    }
}

/// Corners of a square tag in its own frame: bottom-left, bottom-right, top-right, top-left.
pub fn tag_corner_points(tag_size: f64) -> [Vector3<f64>; 4] {
    let h = tag_size / 2.0;
    [
        Vector3::new(-h, -h, 0.0),
        Vector3::new(h, -h, 0.0),
        Vector3::new(h, h, 0.0),
        Vector3::new(-h, h, 0.0),
    ]
}

/// Projects tag-local corner points seen through `camera_from_tag` (OpenCV camera axes).
pub fn project_corners(
    intrinsics: &CameraIntrinsics,
    camera_from_tag: &Isometry3<f64>,
    corners: &[Vector3<f64>; 4],
) -> CornerPixels {
    let mut pixels = CornerPixels::zeros();
    for (i, corner) in corners.iter().enumerate() {
        let uv = intrinsics.project(&(camera_from_tag * nalgebra::Point3::from(*corner)).coords);
        pixels[2 * i] = uv.x;
        pixels[2 * i + 1] = uv.y;
    }
    pixels
}
