use nalgebra::Isometry3;
use serde::Deserialize;
use serde_json::Value;

use crate::error::MapError;
use crate::mapping::se3::{
    pose_from_column_major, pose_from_row_major, CameraIntrinsics, CornerPixels,
};

pub const POSE_ROW: usize = 18;
pub const TAG_ROW: usize = 19;
pub const LOCATION_ROW: usize = 18;
pub const CORNER_ROW: usize = 8;

/// Arrays in a record may arrive flat or already split into rows.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Numbers {
    Flat(Vec<f64>),
    Nested(Vec<Vec<f64>>),
}

impl Numbers {
    fn rows(self, width: usize, what: &str) -> Result<Vec<Vec<f64>>, MapError> {
        let flat: Vec<f64> = match self {
            Numbers::Flat(v) => v,
            Numbers::Nested(rows) => {
                if let Some(bad) = rows.iter().find(|r| r.len() % width != 0) {
                    return Err(MapError::MalformedRecord(format!(
                        "{what} row of length {} is not a multiple of {width}",
                        bad.len()
                    )));
                }
                rows.into_iter().flatten().collect()
            }
        };
        if flat.len() % width != 0 {
            return Err(MapError::MalformedRecord(format!(
                "{what} has {} values, not reshapable to rows of {width}",
                flat.len()
            )));
        }
        if flat.iter().any(|x| !x.is_finite()) {
            return Err(MapError::MalformedRecord(format!("{what} has non-finite values")));
        }
        Ok(flat.chunks(width).map(<[f64]>::to_vec).collect())
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    pose_data: Numbers,
    tag_data: Vec<Numbers>,
    #[serde(default)]
    location_data: Vec<Vec<Value>>,
    #[serde(default)]
    tag_corners: Option<Vec<Numbers>>,
    #[serde(default)]
    camera_intrinsics: Option<[f64; 4]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OdometryFrame {
    pub frame_id: i64,
    pub pose: Isometry3<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagSighting {
    pub frame_id: i64,
    pub tag_id: i64,
    /// Tag pose in the camera (OpenCV) frame.
    pub camera_from_tag: Isometry3<f64>,
    pub corners: Option<CornerPixels>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaypointSighting {
    pub frame_id: i64,
    pub name: String,
    /// Waypoint pose relative to the odometry frame that saw it.
    pub relative: Isometry3<f64>,
}

/// One decoded map upload: odometry in frame order plus the sightings keyed by frame id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationRecord {
    pub frames: Vec<OdometryFrame>,
    pub tags: Vec<TagSighting>,
    pub waypoints: Vec<WaypointSighting>,
    pub camera_intrinsics: Option<CameraIntrinsics>,
}

fn as_id(x: f64) -> i64 {
    x.round() as i64
}

impl ObservationRecord {
    pub fn from_json(text: &str) -> Result<ObservationRecord, MapError> {
        let raw: RawRecord =
            serde_json::from_str(text).map_err(|e| MapError::MalformedRecord(e.to_string()))?;
        ObservationRecord::try_from(raw)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<ObservationRecord, MapError> {
        let raw: RawRecord =
            serde_json::from_slice(bytes).map_err(|e| MapError::MalformedRecord(e.to_string()))?;
        ObservationRecord::try_from(raw)
    }
}

impl TryFrom<RawRecord> for ObservationRecord {
    type Error = MapError;

    fn try_from(raw: RawRecord) -> Result<ObservationRecord, MapError> {
        // odometry matrices are column-major, the frame id is the last field
        let frames = raw
            .pose_data
            .rows(POSE_ROW, "pose_data")?
            .iter()
            .map(|row| OdometryFrame {
                frame_id: as_id(row[17]),
                pose: pose_from_column_major(&row[..16]),
            })
            .collect();

        let mut tag_rows = Vec::new();
        for group in raw.tag_data {
            tag_rows.extend(group.rows(TAG_ROW, "tag_data")?);
        }

        let corners = match raw.tag_corners {
            Some(groups) => {
                let mut rows = Vec::new();
                for group in groups {
                    rows.extend(group.rows(CORNER_ROW, "tag_corners")?);
                }
                if rows.len() != tag_rows.len() {
                    return Err(MapError::MalformedRecord(format!(
                        "{} corner rows for {} tag sightings",
                        rows.len(),
                        tag_rows.len()
                    )));
                }
                rows.into_iter()
                    .map(|r| Some(CornerPixels::from_column_slice(&r)))
                    .collect()
            }
            None => vec![None; tag_rows.len()],
        };

        let tags = tag_rows
            .iter()
            .zip(corners)
            .map(|(row, corners)| TagSighting {
                frame_id: as_id(row[18]),
                tag_id: as_id(row[0]),
                camera_from_tag: pose_from_row_major(&row[1..17]),
                corners,
            })
            .collect();

        let waypoints = raw
            .location_data
            .iter()
            .map(|row| parse_location(row))
            .collect::<Result<Vec<_>, MapError>>()?;

        Ok(ObservationRecord {
            frames,
            tags,
            waypoints,
            camera_intrinsics: raw
                .camera_intrinsics
                .map(|[fx, fy, cx, cy]| CameraIntrinsics::new(fx, fy, cx, cy)),
        })
    }
}

fn parse_location(row: &[Value]) -> Result<WaypointSighting, MapError> {
    let malformed = |why: &str| MapError::MalformedRecord(format!("location_data: {why}"));
    let (name, numbers) = row.split_last().ok_or_else(|| malformed("empty row"))?;
    let name = name.as_str().ok_or_else(|| malformed("last field is not a name"))?;
    if numbers.len() != LOCATION_ROW {
        return Err(malformed(&format!("expected {LOCATION_ROW} numbers, got {}", numbers.len())));
    }
    let numbers = numbers
        .iter()
        .map(|v| v.as_f64().filter(|x| x.is_finite()))
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| malformed("non-numeric pose field"))?;
    Ok(WaypointSighting {
        frame_id: as_id(numbers[17]),
        name: name.to_string(),
        relative: pose_from_row_major(&numbers[..16]),
    })
}
