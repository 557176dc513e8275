use log::{debug, info, warn};
use std::io::Write;

use crate::config::OptimizationConfig;
use crate::error::MapError;
use crate::mapping::ground_truth::GroundTruth;
use crate::mapping::graph::Graph;
use crate::mapping::optimize::optimize;
use crate::mapping::solver::Solver;
use crate::mapping::subgraph::{compare, Partition};
use crate::mapping::weights::Weights;

/// One swept component of the weight parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepAxis {
    pub name: String,
    pub values: Vec<f64>,
}

impl SweepAxis {
    pub fn new(name: &str, values: Vec<f64>) -> SweepAxis {
        SweepAxis {
            name: name.to_string(),
            values,
        }
    }

    /// `start, start + step, ...` up to but excluding `stop`.
    pub fn range(name: &str, start: f64, stop: f64, step: f64) -> SweepAxis {
        let mut values = Vec::new();
        if step > 0.0 {
            let mut i = 0;
            loop {
                let v = start + i as f64 * step;
                if v >= stop {
                    break;
                }
                values.push(v);
                i += 1;
            }
        }
        SweepAxis::new(name, values)
    }
}

/// What a grid point is scored by. Lower is better for all of them.
#[derive(Debug, Clone, Copy)]
pub enum SweepMetric<'a> {
    /// Total chi2 of the optimized graph.
    TotalChi2,
    /// Chi2 delta between the two halves of a partition, same weights on both sides.
    SubgraphDelta(&'a Partition),
    /// Anchor-aligned tag position error against surveyed poses.
    GroundTruth(&'a GroundTruth),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    pub parameters: Vec<f64>,
    /// NaN when the point could not be evaluated.
    pub metric: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepGrid {
    pub axes: Vec<SweepAxis>,
    /// Row-major over `axes`, the last axis varying fastest.
    pub points: Vec<SweepPoint>,
}

impl SweepGrid {
    /// Point with the lowest metric, ignoring failed ones.
    pub fn best(&self) -> Option<&SweepPoint> {
        self.points
            .iter()
            .filter(|p| !p.metric.is_nan())
            .min_by(|a, b| a.metric.total_cmp(&b.metric))
    }

    pub fn failed(&self) -> usize {
        self.points.iter().filter(|p| p.metric.is_nan()).count()
    }

    /// One row per point: the axis values, then the metric.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), MapError> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header: Vec<&str> = self.axes.iter().map(|a| a.name.as_str()).collect();
        header.push("metric");
        wtr.write_record(&header)?;
        for point in &self.points {
            let row: Vec<String> = point
                .parameters
                .iter()
                .chain(std::iter::once(&point.metric))
                .map(|v| v.to_string())
                .collect();
            wtr.write_record(&row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

fn grid_points(axes: &[SweepAxis], prefix: &mut Vec<f64>, out: &mut Vec<Vec<f64>>) {
    match axes.split_first() {
        None => out.push(prefix.clone()),
        Some((axis, rest)) => {
            for v in &axis.values {
                prefix.push(*v);
                grid_points(rest, prefix, out);
                prefix.pop();
            }
        }
    }
}

fn evaluate<S: Solver + ?Sized>(
    graph: &Graph,
    parameters: &[f64],
    config: &OptimizationConfig,
    metric: SweepMetric,
    solver: &mut S,
) -> Result<f64, MapError> {
    let weights = Weights::from_parameter_vector(parameters)?;
    match metric {
        SweepMetric::TotalChi2 => {
            let config = OptimizationConfig {
                weights,
                ..config.clone()
            };
            Ok(optimize(&mut graph.clone(), &config, solver)?.total_chi2)
        }
        SweepMetric::SubgraphDelta(partition) => compare(partition, &weights, &weights, config, solver),
        SweepMetric::GroundTruth(ground_truth) => {
            let config = OptimizationConfig {
                weights,
                ..config.clone()
            };
            let outcome = optimize(&mut graph.clone(), &config, solver)?;
            Ok(ground_truth.metric(&outcome.result).unwrap_or(f64::NAN))
        }
    }
}

/// Scores every combination of axis values as a weight parameter vector.
///
/// The vector length (the number of axes) must be one `Weights::from_parameter_vector`
/// accepts. Points that fail to optimize are recorded as NaN.
pub fn sweep<S: Solver + ?Sized>(
    graph: &Graph,
    axes: &[SweepAxis],
    config: &OptimizationConfig,
    metric: SweepMetric,
    solver: &mut S,
) -> Result<SweepGrid, MapError> {
    Weights::from_parameter_vector(&vec![1.0; axes.len()])?;

    let mut parameters = Vec::new();
    grid_points(axes, &mut Vec::with_capacity(axes.len()), &mut parameters);
    info!("sweeping {} weight combinations", parameters.len());

    let mut points = Vec::with_capacity(parameters.len());
    for p in parameters {
        let value = match evaluate(graph, &p, config, metric, solver) {
            Ok(v) => v,
            Err(e) => {
                debug!("{p:?}: {e}");
                f64::NAN
            }
        };
        debug!("{p:?}: {value}");
        points.push(SweepPoint {
            parameters: p,
            metric: value,
        });
    }

    let grid = SweepGrid {
        axes: axes.to_vec(),
        points,
    };
    if grid.failed() > 0 {
        warn!("{} of {} sweep points could not be evaluated", grid.failed(), grid.points.len());
    }
    if let Some(best) = grid.best() {
        info!("best weights {:?}: {}", best.parameters, best.metric);
    }
    Ok(grid)
}
