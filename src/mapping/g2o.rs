use core::str::FromStr;
use log::debug;
use nalgebra::Vector3;
use rustc_hash::FxHashMap;
use std::io::Write;

use crate::error::MapError;
use crate::mapping::graph::{Estimate, Graph, Uid};
use crate::mapping::se3::{iso3, pose_to_vector};
use crate::mapping::solver::SolverGraph;

fn numbers<T: FromStr>(line: &[&str], skip: usize, line_no: usize) -> Result<Vec<T>, MapError> {
    line.iter()
        .skip(skip)
        .map(|x| {
            x.parse::<T>().map_err(|_| MapError::MalformedG2o {
                line: line_no,
                reason: format!("`{x}` is not a number"),
            })
        })
        .collect()
}

/// Writes the graph as g2o text: vertices with their domain-convention estimates,
/// `FIX` lines for fixed vertices, and `EDGE_SE3:QUAT` for every relative-pose edge.
///
/// Projection edges have no g2o counterpart here and are skipped. Returns how many were.
pub fn write_g2o<W: Write>(graph: &SolverGraph, mut writer: W) -> Result<usize, MapError> {
    let mut uids: Vec<Uid> = graph.vertices.keys().copied().collect();
    uids.sort_unstable();
    for uid in &uids {
        match graph.domain_estimate(*uid) {
            Some(Estimate::Pose(pose)) => {
                let v = pose_to_vector(&pose);
                writeln!(
                    writer,
                    "VERTEX_SE3:QUAT {uid} {} {} {} {} {} {} {}",
                    v[0], v[1], v[2], v[3], v[4], v[5], v[6]
                )?;
            }
            Some(Estimate::Point(p)) => {
                writeln!(writer, "VERTEX_TRACKXYZ {uid} {} {} {}", p.x, p.y, p.z)?;
            }
            None => {}
        }
    }
    for uid in &uids {
        if graph.vertices[uid].fixed {
            writeln!(writer, "FIX {uid}")?;
        }
    }

    let mut skipped = 0;
    for edge in graph.edges.values() {
        let Some(z) = edge.measurement.relative_pose() else {
            skipped += 1;
            continue;
        };
        let v = pose_to_vector(z);
        let mut line = format!(
            "EDGE_SE3:QUAT {} {} {} {} {} {} {} {} {}",
            edge.start, edge.end, v[0], v[1], v[2], v[3], v[4], v[5], v[6]
        );
        let info = &edge.information;
        for i in 0..info.nrows() {
            for j in i..info.ncols() {
                line.push_str(&format!(" {}", info[(i, j)]));
            }
        }
        writeln!(writer, "{line}")?;
    }
    if skipped > 0 {
        debug!("{skipped} projection edges left out of the g2o export");
    }
    Ok(skipped)
}

/// Reads vertex estimates back from g2o text, ignoring every other line type.
pub fn read_g2o_estimates(text: &str) -> Result<FxHashMap<Uid, Estimate>, MapError> {
    let mut estimates = FxHashMap::default();
    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let line: Vec<&str> = line.split(' ').filter(|x| !x.is_empty()).collect();
        let Some(tag) = line.first() else {
            continue;
        };
        let estimate = match *tag {
            "VERTEX_SE3:QUAT" => {
                let [x, y, z, qx, qy, qz, qw] = numbers(&line, 2, line_no)?[..] else {
                    return Err(MapError::MalformedG2o {
                        line: line_no,
                        reason: "VERTEX_SE3:QUAT needs 7 values".to_string(),
                    });
                };
                Estimate::Pose(iso3(x, y, z, qx, qy, qz, qw))
            }
            "VERTEX_TRACKXYZ" => {
                let [x, y, z] = numbers(&line, 2, line_no)?[..] else {
                    return Err(MapError::MalformedG2o {
                        line: line_no,
                        reason: "VERTEX_TRACKXYZ needs 3 values".to_string(),
                    });
                };
                Estimate::Point(Vector3::new(x, y, z))
            }
            _ => continue,
        };
        let id: Uid = numbers(&line[1..2], 0, line_no)?[0];
        estimates.insert(id, estimate);
    }
    Ok(estimates)
}

/// Overwrites the domain estimates of `graph` with read-back ones. Returns how many were applied.
pub fn apply_estimates(
    graph: &mut Graph,
    estimates: &FxHashMap<Uid, Estimate>,
) -> Result<usize, MapError> {
    for (uid, estimate) in estimates {
        let vertex = graph.vertex(*uid)?;
        let same_shape = matches!(
            (&vertex.estimate, estimate),
            (Estimate::Pose(_), Estimate::Pose(_)) | (Estimate::Point(_), Estimate::Point(_))
        );
        if !same_shape {
            return Err(MapError::EstimateMismatch(*uid));
        }
    }
    for (uid, estimate) in estimates {
        if let Some(vertex) = graph.vertices.get_mut(uid) {
            vertex.estimate = *estimate;
        }
    }
    Ok(estimates.len())
}
