use log::debug;
use nalgebra::Isometry3;
use std::collections::BTreeMap;

use crate::error::MapError;
use crate::mapping::diagnostics::ResultMap;
use crate::mapping::se3::{pose_from_vector, PoseVector};

/// Average translation error of `optimized` against `ground_truth`, paired by index.
///
/// Every tag in turn anchors the ground truth onto the optimized map; the
/// error is the mean distance between the anchored ground truth and the
/// optimized positions, averaged over all anchors.
pub fn ground_truth_metric(optimized: &[Isometry3<f64>], ground_truth: &[Isometry3<f64>]) -> f64 {
    let n = optimized.len().min(ground_truth.len());
    if n == 0 {
        return 0.0;
    }
    let mut total = 0.0;
    for anchor in 0..n {
        let to_world = optimized[anchor] * ground_truth[anchor].inverse();
        for (opt, truth) in optimized.iter().zip(ground_truth).take(n) {
            let anchored = to_world * truth;
            total += (anchored.translation.vector - opt.translation.vector).norm();
        }
    }
    total / (n * n) as f64
}

/// Known tag poses of a surveyed environment, by tag id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundTruth {
    pub tags: BTreeMap<i64, Isometry3<f64>>,
}

impl GroundTruth {
    pub fn new(tags: BTreeMap<i64, Isometry3<f64>>) -> GroundTruth {
        GroundTruth { tags }
    }

    /// Parses `{"<tag id>": [x, y, z, qx, qy, qz, qw], ...}`.
    pub fn from_json(text: &str) -> Result<GroundTruth, MapError> {
        let vectors: BTreeMap<i64, [f64; 7]> = serde_json::from_str(text)?;
        let tags = vectors
            .into_iter()
            .map(|(id, v)| (id, pose_from_vector(&PoseVector::from_column_slice(&v))))
            .collect();
        Ok(GroundTruth { tags })
    }

    /// Metric over the tags both maps know. `None` when they share none.
    pub fn metric(&self, optimized: &ResultMap) -> Option<f64> {
        let (opt, truth): (Vec<Isometry3<f64>>, Vec<Isometry3<f64>>) = optimized
            .tags
            .iter()
            .filter_map(|row| Some((row.pose, *self.tags.get(&row.tag_id)?)))
            .unzip();
        debug!(
            "{} of {} optimized tags have a ground truth pose",
            opt.len(),
            optimized.tags.len()
        );
        if opt.is_empty() {
            None
        } else {
            Some(ground_truth_metric(&opt, &truth))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::diagnostics::TagRow;
    use nalgebra::Vector3;
    use std::error::Error;

    fn surveyed() -> Vec<Isometry3<f64>> {
        vec![
            Isometry3::new(Vector3::new(1.0, 0.0, -2.0), Vector3::new(0.0, 0.3, 0.0)),
            Isometry3::new(Vector3::new(2.0, 0.5, -2.0), Vector3::new(0.1, 0.0, 0.0)),
            Isometry3::new(Vector3::new(3.0, 1.0, -1.0), Vector3::zeros()),
        ]
    }

    #[test]
    fn rigidly_moved_map_has_no_error() {
        let truth = surveyed();
        let moved = Isometry3::new(Vector3::new(-4.0, 2.0, 0.5), Vector3::new(0.0, 0.0, 1.2));
        let optimized: Vec<_> = truth.iter().map(|t| moved * t).collect();
        approx::assert_abs_diff_eq!(ground_truth_metric(&optimized, &truth), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn one_displaced_tag() {
        let truth = surveyed()[..2].to_vec();
        let mut optimized = truth.clone();
        optimized[1] = Isometry3::translation(0.0, 0.3, 0.0) * optimized[1];
        // each anchor sees one tag off by 30 cm
        approx::assert_abs_diff_eq!(ground_truth_metric(&optimized, &truth), 0.15, epsilon = 1e-9);
    }

    #[test]
    fn metric_uses_shared_tag_ids() -> Result<(), Box<dyn Error>> {
        let gt = GroundTruth::from_json(
            r#"{"1": [1.0, 0.0, -2.0, 0.0, 0.0, 0.0, 1.0], "2": [2.0, 0.0, -2.0, 0.0, 0.0, 0.0, 1.0]}"#,
        )?;
        let row = |uid, tag_id, x| TagRow {
            uid,
            tag_id,
            pose: Isometry3::translation(x, 0.0, -2.0),
        };
        let map = ResultMap {
            tags: vec![row(0, 1, 5.0), row(1, 2, 6.0), row(2, 99, 0.0)],
            ..ResultMap::default()
        };
        approx::assert_abs_diff_eq!(gt.metric(&map).unwrap(), 0.0, epsilon = 1e-12);

        let unknown = ResultMap {
            tags: vec![row(0, 99, 0.0)],
            ..ResultMap::default()
        };
        assert_eq!(None, gt.metric(&unknown));
        Ok(())
    }
}
