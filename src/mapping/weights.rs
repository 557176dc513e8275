use nalgebra::{DVector, Vector2, Vector3, Vector6};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::MapError;

/// Empirical damping applied to normalized tag_sba weights.
pub const TAG_SBA_SCALE: f64 = 1464.0;

/// Lower bound on the odometry-to-tag ratio.
pub const MIN_ODOM_TAG_RATIO: f64 = 1e-5;

/// Per-axis trust of each measurement type, plus the odometry-vs-landmark ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub odometry: Vector6<f64>,
    pub tag: Vector6<f64>,
    pub tag_sba: Vector2<f64>,
    pub dummy: Vector3<f64>,
    #[serde(deserialize_with = "clamped_ratio")]
    odom_tag_ratio: f64,
}

fn clamped_ratio<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    f64::deserialize(deserializer).map(|r| r.max(MIN_ODOM_TAG_RATIO))
}

impl Default for Weights {
    fn default() -> Self {
        Weights {
            odometry: Vector6::repeat(1.0),
            tag: Vector6::repeat(1.0),
            tag_sba: Vector2::repeat(1.0),
            dummy: Vector3::repeat(1.0),
            odom_tag_ratio: 1.0,
        }
    }
}

fn magnitude_or_one(norm: f64) -> f64 {
    if norm == 0.0 {
        1.0
    } else {
        norm
    }
}

impl Weights {
    pub fn new(
        odometry: Vector6<f64>,
        tag: Vector6<f64>,
        tag_sba: Vector2<f64>,
        dummy: Vector3<f64>,
        odom_tag_ratio: f64,
    ) -> Weights {
        Weights {
            odometry,
            tag,
            tag_sba,
            dummy,
            odom_tag_ratio: odom_tag_ratio.max(MIN_ODOM_TAG_RATIO),
        }
    }

    pub fn odom_tag_ratio(&self) -> f64 {
        self.odom_tag_ratio
    }

    pub fn set_odom_tag_ratio(&mut self, ratio: f64) {
        self.odom_tag_ratio = ratio.max(MIN_ODOM_TAG_RATIO);
    }

    /// Unit-scales the odometry and tag vectors, then applies the ratio to odometry only.
    /// Idempotent.
    pub fn normalize(&mut self) {
        let odom_mag = magnitude_or_one(self.odometry.norm());
        self.odometry *= self.odom_tag_ratio / odom_mag;

        let sba_mag = magnitude_or_one(self.tag_sba.norm());
        self.tag_sba *= 1.0 / (sba_mag * TAG_SBA_SCALE);

        let tag_mag = magnitude_or_one(self.tag.norm());
        self.tag *= 1.0 / tag_mag;
    }

    /// Expands a compact parameter vector into normalized weights.
    ///
    /// | length | layout |
    /// |---|---|
    /// | 1 | ratio |
    /// | 2 | shared position scalar, ratio |
    /// | 3 | odometry position, tag position / sba, ratio |
    /// | 4, 5 | odometry position, odometry rotation, tag position / sba x, tag rotation / sba y, (ratio) |
    /// | 6, 7 | odometry x, y, z, rotation, sba x, sba y, (ratio) |
    /// | 8, 9 | odometry (6), tag_sba (2), (ratio) |
    /// | 12, 13 | odometry (6), tag (6), (ratio) |
    ///
    /// Components a layout does not mention keep their all-ones default.
    pub fn from_parameter_vector(v: &[f64]) -> Result<Weights, MapError> {
        let mut w = Weights::default();
        let ratio = |has_ratio: bool| if has_ratio { v[v.len() - 1] } else { 1.0 };
        let pos_rot = |p: f64, r: f64| Vector6::new(p, p, p, r, r, r);

        match v.len() {
            1 => w.set_odom_tag_ratio(v[0]),
            2 => {
                w.odometry = pos_rot(v[0], 1.0);
                w.tag = pos_rot(v[0], 1.0);
                w.tag_sba = Vector2::new(v[0], 1.0);
                w.set_odom_tag_ratio(v[1]);
            }
            3 => {
                w.odometry = pos_rot(v[0], 1.0);
                w.tag = pos_rot(v[1], 1.0);
                w.tag_sba = Vector2::new(v[1], 1.0);
                w.set_odom_tag_ratio(v[2]);
            }
            n @ (4 | 5) => {
                w.odometry = pos_rot(v[0], v[1]);
                w.tag = pos_rot(v[2], v[3]);
                w.tag_sba = Vector2::new(v[2], v[3]);
                w.set_odom_tag_ratio(ratio(n == 5));
            }
            n @ (6 | 7) => {
                w.odometry = Vector6::new(v[0], v[1], v[2], v[3], v[3], v[3]);
                w.tag = pos_rot(v[4], v[5]);
                w.tag_sba = Vector2::new(v[4], v[5]);
                w.set_odom_tag_ratio(ratio(n == 7));
            }
            n @ (8 | 9) => {
                w.odometry = Vector6::from_column_slice(&v[..6]);
                w.tag_sba = Vector2::new(v[6], v[7]);
                w.set_odom_tag_ratio(ratio(n == 9));
            }
            n @ (12 | 13) => {
                w.odometry = Vector6::from_column_slice(&v[..6]);
                w.tag = Vector6::from_column_slice(&v[6..12]);
                w.set_odom_tag_ratio(ratio(n == 13));
            }
            n => return Err(MapError::UnsupportedWeightVectorLength(n)),
        }
        w.normalize();
        Ok(w)
    }

    /// Flattened view, in the field order odometry, tag, tag_sba, dummy, ratio.
    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_iterator(
            18,
            self.odometry
                .iter()
                .chain(self.tag.iter())
                .chain(self.tag_sba.iter())
                .chain(self.dummy.iter())
                .copied()
                .chain(std::iter::once(self.odom_tag_ratio)),
        )
    }
}

/// Named weight sets, handed to whoever needs to resolve a preset name.
#[derive(Debug, Clone, Default)]
pub struct WeightPresets {
    presets: FxHashMap<String, Weights>,
}

fn exp6(exponents: [f64; 6]) -> Vector6<f64> {
    Vector6::from_column_slice(&exponents).map(|e| (-e).exp())
}

fn exp2(exponents: [f64; 2]) -> Vector2<f64> {
    Vector2::from_column_slice(&exponents).map(|e| (-e).exp())
}

impl WeightPresets {
    pub fn new() -> WeightPresets {
        WeightPresets::default()
    }

    /// The hand-tuned sets the mapping pipeline has historically shipped with.
    pub fn standard() -> WeightPresets {
        let ones3 = Vector3::repeat(1.0);
        let mut presets = WeightPresets::new();
        presets.insert(
            "sensible_default",
            Weights::new(
                exp6([-6.0; 6]),
                exp6([18.0, 18.0, 0.0, 0.0, 0.0, 0.0]),
                exp2([18.0, 18.0]),
                ones3,
                1.0,
            ),
        );
        presets.insert(
            "trust_odom",
            Weights::new(exp6([-3.0; 6]), exp6([10.6; 6]), exp2([10.6; 2]), ones3, 1.0),
        );
        presets.insert(
            "trust_tags",
            Weights::new(exp6([10.0; 6]), exp6([-10.6; 6]), exp2([-10.6; 2]), ones3, 1.0),
        );
        // only tuned for SBA, the pose-tag weights stay at their default
        presets.insert(
            "genetic_results",
            Weights::new(
                exp6([9.25, -7.96, -1.27, 7.71, -1.7, -0.08]),
                Vector6::repeat(1.0),
                exp2([9.91, 8.88]),
                ones3,
                1.0,
            ),
        );
        let best_sweep = Weights::from_parameter_vector(&[8.5_f64.exp(), 10.0_f64.exp()])
            .unwrap_or_default();
        presets.insert("best_sweep", best_sweep);
        presets.insert("identity", Weights::default());
        presets.insert("trust_gravity", Weights::default());
        presets
    }

    pub fn insert(&mut self, name: &str, weights: Weights) {
        self.presets.insert(name.to_string(), weights);
    }

    pub fn get(&self, name: &str) -> Result<&Weights, MapError> {
        self.presets
            .get(name)
            .ok_or_else(|| MapError::UnknownWeightPreset(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.presets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
