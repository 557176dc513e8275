pub mod record;

pub use record::{ObservationRecord, OdometryFrame, TagSighting, WaypointSighting};
