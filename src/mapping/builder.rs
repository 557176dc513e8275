use log::{info, warn};
use nalgebra::{Isometry3, Translation3};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::data::record::{ObservationRecord, TagSighting, WaypointSighting};
use crate::error::MapError;
use crate::mapping::graph::{Edge, Graph, Measurement, Projection, Uid, Vertex, VertexKind};
use crate::mapping::se3::{flip_y_and_z, tag_corner_points};

fn default_tag_size() -> f64 {
    0.172
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Add tag corners and pixel projection edges where a sighting carries corners.
    #[serde(default)]
    pub is_sba: bool,
    #[serde(default = "default_tag_size")]
    pub tag_size: f64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            is_sba: false,
            tag_size: default_tag_size(),
        }
    }
}

/// Uids handed out up front: tags then waypoints, in order of first appearance.
struct UidTable {
    tags: FxHashMap<i64, Uid>,
    waypoints: FxHashMap<String, Uid>,
    corners: FxHashMap<i64, [Uid; 4]>,
    next: Uid,
}

impl UidTable {
    fn new(
        record: &ObservationRecord,
        tags_by_frame: &FxHashMap<i64, Vec<&TagSighting>>,
        waypoints_by_frame: &FxHashMap<i64, Vec<&WaypointSighting>>,
        is_sba: bool,
    ) -> UidTable {
        let mut next = 0;
        let mut tag_order = Vec::new();
        let mut tags = FxHashMap::default();
        for frame in &record.frames {
            for sighting in tags_by_frame.get(&frame.frame_id).into_iter().flatten() {
                tags.entry(sighting.tag_id).or_insert_with(|| {
                    tag_order.push(sighting.tag_id);
                    next += 1;
                    next - 1
                });
            }
        }
        let mut waypoints = FxHashMap::default();
        for frame in &record.frames {
            for sighting in waypoints_by_frame.get(&frame.frame_id).into_iter().flatten() {
                waypoints.entry(sighting.name.clone()).or_insert_with(|| {
                    next += 1;
                    next - 1
                });
            }
        }
        let mut corners = FxHashMap::default();
        if is_sba {
            for tag_id in tag_order {
                corners.insert(tag_id, [next, next + 1, next + 2, next + 3]);
                next += 4;
            }
        }
        UidTable {
            tags,
            waypoints,
            corners,
            next,
        }
    }

    fn allocate(&mut self) -> Uid {
        self.next += 1;
        self.next - 1
    }
}

/// Builds the pose graph of one observation record.
///
/// Odometry and dummy vertices are interleaved in frame order after the tag,
/// waypoint and (SBA) tag-corner uids. The first odometry vertex is the fixed anchor.
pub fn build_graph(record: &ObservationRecord, options: &BuildOptions) -> Result<Graph, MapError> {
    let frame_ids: FxHashSet<i64> = record.frames.iter().map(|f| f.frame_id).collect();
    let mut tags_by_frame: FxHashMap<i64, Vec<&TagSighting>> = FxHashMap::default();
    let mut waypoints_by_frame: FxHashMap<i64, Vec<&WaypointSighting>> = FxHashMap::default();
    let mut orphans = 0;
    for sighting in &record.tags {
        if frame_ids.contains(&sighting.frame_id) {
            tags_by_frame.entry(sighting.frame_id).or_default().push(sighting);
        } else {
            orphans += 1;
        }
    }
    for sighting in &record.waypoints {
        if frame_ids.contains(&sighting.frame_id) {
            waypoints_by_frame.entry(sighting.frame_id).or_default().push(sighting);
        } else {
            orphans += 1;
        }
    }
    if orphans > 0 {
        warn!("{orphans} sightings reference frames without odometry and were skipped");
    }

    let mut uids = UidTable::new(record, &tags_by_frame, &waypoints_by_frame, options.is_sba);
    let mut graph = Graph::new();

    let corner_points = tag_corner_points(options.tag_size);
    let mut corner_uids: Vec<&[Uid; 4]> = uids.corners.values().collect();
    corner_uids.sort_unstable();
    for ids in corner_uids {
        for (uid, point) in ids.iter().zip(corner_points.iter()) {
            graph.add_vertex(Vertex::tagpoint(*uid, *point))?;
        }
    }

    let flip = flip_y_and_z();
    let mut previous: Option<(Uid, Isometry3<f64>)> = None;
    let mut projection_edges = 0;

    for frame in &record.frames {
        let odom_uid = uids.allocate();
        graph.add_vertex(Vertex::pose(
            odom_uid,
            VertexKind::Odometry {
                pose_id: frame.frame_id,
            },
            frame.pose,
            previous.is_none(),
        ))?;

        for sighting in tags_by_frame.get(&frame.frame_id).into_iter().flatten() {
            let tag_uid = uids.tags[&sighting.tag_id];
            let relative = flip * sighting.camera_from_tag;
            if !graph.vertices.contains_key(&tag_uid) {
                graph.add_vertex(Vertex::pose(
                    tag_uid,
                    VertexKind::Tag {
                        tag_id: sighting.tag_id,
                    },
                    frame.pose * relative,
                    false,
                ))?;
            }
            let projection = match (
                uids.corners.get(&sighting.tag_id),
                sighting.corners,
                record.camera_intrinsics,
            ) {
                (Some(corner_ids), Some(pixels), Some(intrinsics)) => Some(Projection {
                    pixels,
                    corner_ids: *corner_ids,
                    intrinsics,
                }),
                _ => None,
            };
            let measurement = match projection {
                Some(p) => {
                    projection_edges += 1;
                    Measurement::TagProjection(p)
                }
                None => Measurement::TagPose(relative),
            };
            graph.add_edge(Edge::new(odom_uid, tag_uid, measurement))?;
        }

        for sighting in waypoints_by_frame.get(&frame.frame_id).into_iter().flatten() {
            let waypoint_uid = uids.waypoints[&sighting.name];
            if !graph.vertices.contains_key(&waypoint_uid) {
                graph.add_vertex(Vertex::pose(
                    waypoint_uid,
                    VertexKind::Waypoint {
                        name: sighting.name.clone(),
                    },
                    frame.pose * sighting.relative,
                    false,
                ))?;
            }
            graph.add_edge(Edge::new(
                odom_uid,
                waypoint_uid,
                Measurement::Waypoint(sighting.relative),
            ))?;
        }

        if let Some((previous_uid, previous_pose)) = previous {
            graph.add_edge(Edge::new(
                previous_uid,
                odom_uid,
                Measurement::Odometry(previous_pose.inverse() * frame.pose),
            ))?;
        }

        let dummy_uid = uids.allocate();
        let dummy = Isometry3::from_parts(Translation3::identity(), frame.pose.rotation);
        graph.add_vertex(Vertex::pose(dummy_uid, VertexKind::Dummy, dummy, true))?;
        graph.add_edge(Edge::new(
            odom_uid,
            dummy_uid,
            Measurement::Dummy(Isometry3::identity()),
        ))?;

        previous = Some((odom_uid, frame.pose));
    }

    if options.is_sba && projection_edges < graph.count_tag_edges() {
        warn!(
            "{} tag sightings lack corners or intrinsics and use pose edges",
            graph.count_tag_edges() - projection_edges
        );
    }
    info!(
        "built graph with {} vertices and {} edges from {} frames",
        graph.vertices.len(),
        graph.edges.len(),
        record.frames.len()
    );
    Ok(graph)
}
