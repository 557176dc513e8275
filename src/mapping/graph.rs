use nalgebra::{DMatrix, Isometry3, Vector3};
use rustc_hash::FxHashMap;

use crate::error::MapError;
use crate::mapping::information::ComputeInfParams;
use crate::mapping::se3::{CameraIntrinsics, CornerPixels};
use crate::mapping::weights::Weights;

pub type Uid = usize;
pub type EdgeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexMode {
    Odometry,
    Tag,
    TagPoint,
    Waypoint,
    Dummy,
}

/// Per-mode metadata of a vertex.
#[derive(Debug, Clone, PartialEq)]
pub enum VertexKind {
    Odometry { pose_id: i64 },
    Tag { tag_id: i64 },
    /// One corner of a tag, expressed in the tag's own frame.
    TagPoint,
    Waypoint { name: String },
    /// Orientation-only gravity reference attached to one odometry frame.
    Dummy,
}

impl VertexKind {
    pub fn mode(&self) -> VertexMode {
        match self {
            VertexKind::Odometry { .. } => VertexMode::Odometry,
            VertexKind::Tag { .. } => VertexMode::Tag,
            VertexKind::TagPoint => VertexMode::TagPoint,
            VertexKind::Waypoint { .. } => VertexMode::Waypoint,
            VertexKind::Dummy => VertexMode::Dummy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Estimate {
    Pose(Isometry3<f64>),
    Point(Vector3<f64>),
}

impl Estimate {
    pub fn pose(&self) -> Option<&Isometry3<f64>> {
        match self {
            Estimate::Pose(p) => Some(p),
            Estimate::Point(_) => None,
        }
    }

    pub fn point(&self) -> Option<&Vector3<f64>> {
        match self {
            Estimate::Point(p) => Some(p),
            Estimate::Pose(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub uid: Uid,
    pub kind: VertexKind,
    pub estimate: Estimate,
    fixed: bool,
}

impl Vertex {
    /// A 6-DOF vertex. Tagpoints are built with [`Vertex::tagpoint`] instead.
    pub fn pose(uid: Uid, kind: VertexKind, estimate: Isometry3<f64>, fixed: bool) -> Vertex {
        debug_assert!(kind != VertexKind::TagPoint);
        Vertex {
            uid,
            kind,
            estimate: Estimate::Pose(estimate),
            fixed,
        }
    }

    pub fn tagpoint(uid: Uid, corner: Vector3<f64>) -> Vertex {
        Vertex {
            uid,
            kind: VertexKind::TagPoint,
            estimate: Estimate::Point(corner),
            fixed: true,
        }
    }

    pub fn mode(&self) -> VertexMode {
        self.kind.mode()
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Copy of this vertex excluded from optimization.
    pub fn pinned(&self) -> Vertex {
        Vertex {
            fixed: true,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    Odometry,
    TagPose,
    TagProjection,
    Waypoint,
    Dummy,
}

impl EdgeKind {
    /// Tag observations, whichever way they are parameterized.
    pub fn is_tag(self) -> bool {
        matches!(self, EdgeKind::TagPose | EdgeKind::TagProjection)
    }

    pub fn name(self) -> &'static str {
        match self {
            EdgeKind::Odometry => "odometry",
            EdgeKind::TagPose => "tag",
            EdgeKind::TagProjection => "tag_projection",
            EdgeKind::Waypoint => "waypoint",
            EdgeKind::Dummy => "dummy",
        }
    }
}

/// Pixel observation of the four corners of a tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub pixels: CornerPixels,
    pub corner_ids: [Uid; 4],
    pub intrinsics: CameraIntrinsics,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Odometry(Isometry3<f64>),
    TagPose(Isometry3<f64>),
    TagProjection(Projection),
    Waypoint(Isometry3<f64>),
    Dummy(Isometry3<f64>),
}

impl Measurement {
    pub fn kind(&self) -> EdgeKind {
        match self {
            Measurement::Odometry(_) => EdgeKind::Odometry,
            Measurement::TagPose(_) => EdgeKind::TagPose,
            Measurement::TagProjection(_) => EdgeKind::TagProjection,
            Measurement::Waypoint(_) => EdgeKind::Waypoint,
            Measurement::Dummy(_) => EdgeKind::Dummy,
        }
    }

    pub fn relative_pose(&self) -> Option<&Isometry3<f64>> {
        match self {
            Measurement::Odometry(z)
            | Measurement::TagPose(z)
            | Measurement::Waypoint(z)
            | Measurement::Dummy(z) => Some(z),
            Measurement::TagProjection(_) => None,
        }
    }

    /// Dimension of the residual, and so of the information matrix.
    pub fn dimension(&self) -> usize {
        match self {
            Measurement::TagProjection(_) => 8,
            _ => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub start: Uid,
    pub end: Uid,
    pub measurement: Measurement,
    /// Derived from the graph weights by `update_edge_information`.
    pub information: DMatrix<f64>,
    pub information_prescaling: Option<DMatrix<f64>>,
}

impl Edge {
    pub fn new(start: Uid, end: Uid, measurement: Measurement) -> Edge {
        let information = DMatrix::identity(measurement.dimension(), measurement.dimension());
        Edge {
            start,
            end,
            measurement,
            information,
            information_prescaling: None,
        }
    }

    pub fn kind(&self) -> EdgeKind {
        self.measurement.kind()
    }

    pub fn corner_ids(&self) -> Option<&[Uid; 4]> {
        match &self.measurement {
            Measurement::TagProjection(p) => Some(&p.corner_ids),
            _ => None,
        }
    }

    pub fn touches(&self, uid: Uid) -> bool {
        self.start == uid
            || self.end == uid
            || self.corner_ids().map_or(false, |ids| ids.contains(&uid))
    }
}

/// A pose graph and the weights its edge information is derived from.
///
/// One graph is only ever mutated from a single thread.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub vertices: FxHashMap<Uid, Vertex>,
    pub edges: FxHashMap<EdgeId, Edge>,
    pub weights: Weights,
    pub compute_inf_params: Option<ComputeInfParams>,
    next_edge_id: EdgeId,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn add_vertex(&mut self, vertex: Vertex) -> Result<(), MapError> {
        if self.vertices.contains_key(&vertex.uid) {
            return Err(MapError::DuplicateVertex(vertex.uid));
        }
        self.vertices.insert(vertex.uid, vertex);
        Ok(())
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<EdgeId, MapError> {
        let id = self.next_edge_id;
        self.insert_edge(id, edge)?;
        Ok(id)
    }

    /// Inserts under a caller-chosen id, used when deriving subgraphs that keep the parent's ids.
    pub fn insert_edge(&mut self, id: EdgeId, edge: Edge) -> Result<(), MapError> {
        for uid in [edge.start, edge.end]
            .iter()
            .chain(edge.corner_ids().into_iter().flatten())
        {
            if !self.vertices.contains_key(uid) {
                return Err(MapError::UnknownVertex(*uid));
            }
        }
        self.edges.insert(id, edge);
        self.next_edge_id = self.next_edge_id.max(id + 1);
        Ok(())
    }

    pub fn vertex(&self, uid: Uid) -> Result<&Vertex, MapError> {
        self.vertices.get(&uid).ok_or(MapError::UnknownVertex(uid))
    }

    /// Removes a vertex and every edge touching it.
    pub fn remove_vertex(&mut self, uid: Uid) -> Option<Vertex> {
        let vertex = self.vertices.remove(&uid)?;
        self.edges.retain(|_, edge| !edge.touches(uid));
        Some(vertex)
    }

    pub fn count_edges(&self, kind: EdgeKind) -> usize {
        self.edges.values().filter(|e| e.kind() == kind).count()
    }

    pub fn count_tag_edges(&self) -> usize {
        self.edges.values().filter(|e| e.kind().is_tag()).count()
    }

    pub fn count_vertices(&self, mode: VertexMode) -> usize {
        self.vertices.values().filter(|v| v.mode() == mode).count()
    }

    /// Uids of one vertex mode in ascending order.
    pub fn uids_of(&self, mode: VertexMode) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self
            .vertices
            .values()
            .filter(|v| v.mode() == mode)
            .map(|v| v.uid)
            .collect();
        uids.sort_unstable();
        uids
    }

    /// Edge ids in ascending order, for deterministic traversal.
    pub fn sorted_edge_ids(&self) -> Vec<EdgeId> {
        let mut ids: Vec<EdgeId> = self.edges.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
