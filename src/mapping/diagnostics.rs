use log::warn;
use nalgebra::{Isometry3, Point3, Vector3};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::MapError;
use crate::mapping::graph::{EdgeKind, Graph, Uid, VertexKind};
use crate::mapping::solver::SolverGraph;

#[derive(Debug, Clone, PartialEq)]
pub struct OdometryRow {
    pub uid: Uid,
    pub pose_id: i64,
    pub pose: Isometry3<f64>,
    /// Chi2 summed over the odometry edges linking this pose to its chain neighbors.
    pub adj_chi2: f64,
    /// Distinct tags observed from this pose.
    pub viz_tags: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagRow {
    pub uid: Uid,
    pub tag_id: i64,
    pub pose: Isometry3<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagPointRow {
    pub uid: Uid,
    pub tag_uid: Uid,
    /// Corner position in the global frame.
    pub position: Vector3<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaypointRow {
    pub uid: Uid,
    pub name: String,
    pub pose: Isometry3<f64>,
}

/// Per-vertex poses and error diagnostics of one solver state, every table sorted by uid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultMap {
    pub odometry: Vec<OdometryRow>,
    pub tags: Vec<TagRow>,
    pub tagpoints: Vec<TagPointRow>,
    pub waypoints: Vec<WaypointRow>,
    /// Tag corners without a projection edge to a parent tag, left out of `tagpoints`.
    pub dangling_tagpoints: usize,
}

/// Extracts the domain-convention poses and the per-pose chi2 of a solver state.
///
/// The vertex kinds come from `graph`, the estimates and chi2 from `solver`.
/// Solver vertices unknown to `graph` are ignored.
pub fn extract(graph: &Graph, solver: &SolverGraph) -> Result<ResultMap, MapError> {
    let chi2s = solver.edge_chi2s()?;
    let mut adj_chi2: FxHashMap<Uid, f64> = FxHashMap::default();
    let mut viz_tags: FxHashMap<Uid, FxHashSet<Uid>> = FxHashMap::default();
    let mut parent_tag: FxHashMap<Uid, Uid> = FxHashMap::default();
    for (id, edge) in &solver.edges {
        match edge.kind() {
            EdgeKind::Odometry => {
                *adj_chi2.entry(edge.start).or_default() += chi2s[id];
                *adj_chi2.entry(edge.end).or_default() += chi2s[id];
            }
            EdgeKind::TagPose | EdgeKind::TagProjection => {
                viz_tags.entry(edge.start).or_default().insert(edge.end);
            }
            _ => {}
        }
        if let Some(corners) = edge.corner_ids() {
            for corner in corners {
                parent_tag.entry(*corner).or_insert(edge.end);
            }
        }
    }

    let mut uids: Vec<Uid> = solver.vertices.keys().copied().collect();
    uids.sort_unstable();

    let mut map = ResultMap::default();
    for uid in uids {
        let Some(vertex) = graph.vertices.get(&uid) else {
            continue;
        };
        let Some(estimate) = solver.domain_estimate(uid) else {
            continue;
        };
        match (&vertex.kind, estimate.pose()) {
            (VertexKind::Odometry { pose_id }, Some(pose)) => map.odometry.push(OdometryRow {
                uid,
                pose_id: *pose_id,
                pose: *pose,
                adj_chi2: adj_chi2.get(&uid).copied().unwrap_or(0.0),
                viz_tags: viz_tags.get(&uid).map_or(0, FxHashSet::len),
            }),
            (VertexKind::Tag { tag_id }, Some(pose)) => map.tags.push(TagRow {
                uid,
                tag_id: *tag_id,
                pose: *pose,
            }),
            (VertexKind::Waypoint { name }, Some(pose)) => map.waypoints.push(WaypointRow {
                uid,
                name: name.clone(),
                pose: *pose,
            }),
            (VertexKind::TagPoint, _) => {
                let parent = parent_tag
                    .get(&uid)
                    .and_then(|tag_uid| Some((*tag_uid, solver.domain_pose(*tag_uid)?)));
                match (parent, estimate.point()) {
                    (Some((tag_uid, tag_pose)), Some(corner)) => {
                        map.tagpoints.push(TagPointRow {
                            uid,
                            tag_uid,
                            position: (tag_pose * Point3::from(*corner)).coords,
                        })
                    }
                    _ => map.dangling_tagpoints += 1,
                }
            }
            (VertexKind::Dummy, _) => {}
            (_, None) => return Err(MapError::EstimateMismatch(uid)),
        }
    }

    if map.dangling_tagpoints > 0 {
        warn!(
            "{} tag corners have no parent tag and were left out",
            map.dangling_tagpoints
        );
    }
    Ok(map)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

fn translation_and_rotation(pose: &Isometry3<f64>) -> (Translation, Rotation) {
    let t = &pose.translation.vector;
    let q = pose.rotation.quaternion();
    (
        Translation {
            x: t.x,
            y: t.y,
            z: t.z,
        },
        Rotation {
            x: q.i,
            y: q.j,
            z: q.k,
            w: q.w,
        },
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagVertex {
    pub translation: Translation,
    pub rotation: Rotation,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OdometryVertex {
    pub translation: Translation,
    pub rotation: Rotation,
    pub pose_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adj_chi2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viz_tags: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointVertex {
    pub translation: Translation,
    pub rotation: Rotation,
    pub id: String,
}

/// Optimized map in the format stored for clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMap {
    pub tag_vertices: Vec<TagVertex>,
    pub odometry_vertices: Vec<OdometryVertex>,
    pub waypoints_vertices: Vec<WaypointVertex>,
}

impl ResultMap {
    /// `with_diagnostics` adds `adjChi2` and `vizTags` to every odometry vertex, or to none.
    pub fn to_processed_map(&self, with_diagnostics: bool) -> ProcessedMap {
        let tag_vertices = self
            .tags
            .iter()
            .map(|row| {
                let (translation, rotation) = translation_and_rotation(&row.pose);
                TagVertex {
                    translation,
                    rotation,
                    id: row.tag_id,
                }
            })
            .collect();
        let odometry_vertices = self
            .odometry
            .iter()
            .map(|row| {
                let (translation, rotation) = translation_and_rotation(&row.pose);
                OdometryVertex {
                    translation,
                    rotation,
                    pose_id: row.pose_id,
                    adj_chi2: with_diagnostics.then_some(row.adj_chi2),
                    viz_tags: with_diagnostics.then_some(row.viz_tags as f64),
                }
            })
            .collect();
        let waypoints_vertices = self
            .waypoints
            .iter()
            .map(|row| {
                let (translation, rotation) = translation_and_rotation(&row.pose);
                WaypointVertex {
                    translation,
                    rotation,
                    id: row.name.clone(),
                }
            })
            .collect();
        ProcessedMap {
            tag_vertices,
            odometry_vertices,
            waypoints_vertices,
        }
    }

    pub fn to_processed_json(&self, with_diagnostics: bool) -> Result<String, MapError> {
        Ok(serde_json::to_string(&self.to_processed_map(with_diagnostics))?)
    }

    pub fn tag_pose(&self, tag_id: i64) -> Option<&Isometry3<f64>> {
        self.tags.iter().find(|t| t.tag_id == tag_id).map(|t| &t.pose)
    }
}
