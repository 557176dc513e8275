use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::MapError;
use crate::mapping::builder::BuildOptions;
use crate::mapping::gauss_newton::{GaussNewtonSolver, PoseGraphSolver};
use crate::mapping::information::ComputeInfParams;
use crate::mapping::weights::{WeightPresets, Weights};

/// Everything one optimization run needs besides the graph and the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    pub weights: Weights,
    #[serde(default)]
    pub is_sba: bool,
    /// Tag edges whose chi2 exceeds this are dropped and the graph is optimized again.
    #[serde(default)]
    pub obs_chi2_filter: Option<f64>,
    #[serde(default)]
    pub scale_by_edge_amount: bool,
    #[serde(default)]
    pub compute_inf_params: Option<ComputeInfParams>,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        OptimizationConfig {
            weights: Weights::default(),
            is_sba: false,
            obs_chi2_filter: None,
            scale_by_edge_amount: false,
            compute_inf_params: None,
        }
    }
}

/// Settings file of the `tagmap` binary and the ingestion listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Name looked up in [`WeightPresets::standard`] unless `weights` is given.
    #[serde(default = "default_weights_preset")]
    pub weights_preset: String,
    /// Explicit weights, taking precedence over the preset.
    #[serde(default)]
    pub weights: Option<Weights>,
    #[serde(default)]
    pub is_sba: bool,
    #[serde(default)]
    pub obs_chi2_filter: Option<f64>,
    #[serde(default = "default_true")]
    pub scale_by_edge_amount: bool,
    #[serde(default)]
    pub compute_inf_params: Option<ComputeInfParams>,
    #[serde(default = "default_tag_size")]
    pub tag_size: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Quiet window of the ingestion listener.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            weights_preset: default_weights_preset(),
            weights: None,
            is_sba: false,
            obs_chi2_filter: None,
            scale_by_edge_amount: true,
            compute_inf_params: None,
            tag_size: default_tag_size(),
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

fn default_weights_preset() -> String {
    "sensible_default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_tag_size() -> f64 {
    0.172
}

fn default_max_iterations() -> usize {
    50
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_max_wait_ms() -> u64 {
    3000
}

impl Settings {
    pub fn from_json(text: &str) -> Result<Settings, MapError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Settings, MapError> {
        let text = std::fs::read_to_string(path)?;
        Settings::from_json(&text)
    }

    pub fn optimization_config(&self, presets: &WeightPresets) -> Result<OptimizationConfig, MapError> {
        let weights = match &self.weights {
            Some(w) => w.clone(),
            None => presets.get(&self.weights_preset)?.clone(),
        };
        Ok(OptimizationConfig {
            weights,
            is_sba: self.is_sba,
            obs_chi2_filter: self.obs_chi2_filter,
            scale_by_edge_amount: self.scale_by_edge_amount,
            compute_inf_params: self.compute_inf_params.clone(),
        })
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            is_sba: self.is_sba,
            tag_size: self.tag_size,
        }
    }

    pub fn solver(&self) -> GaussNewtonSolver {
        let mut solver = GaussNewtonSolver::new(PoseGraphSolver::LevenbergMarquardt, self.max_iterations);
        solver.tolerance = self.tolerance;
        solver
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}
