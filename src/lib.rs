pub mod config;
pub mod data;
pub mod error;
pub mod ingest;
pub mod mapping;

pub use error::MapError;
