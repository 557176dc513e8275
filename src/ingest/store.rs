use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::data::record::ObservationRecord;
use crate::ingest::listener::ArrivalHandler;

/// A pushed notice that one or more maps were uploaded, keyed by map name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MapNotification {
    Single { name: String, path: String },
    Bulk(BTreeMap<String, String>),
}

impl MapNotification {
    /// `(map name, blob path)` pairs.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        match self {
            MapNotification::Single { name, path } => vec![(name.as_str(), path.as_str())],
            MapNotification::Bulk(maps) => maps
                .iter()
                .map(|(name, path)| (name.as_str(), path.as_str()))
                .collect(),
        }
    }
}

/// Remote storage of raw observation records.
pub trait BlobStore {
    /// `None` when nothing is stored under `path`.
    fn fetch(&self, path: &str) -> Option<Vec<u8>>;
}

/// Local cache of fetched records and the map names they belong to.
pub trait MapCache {
    fn put(&mut self, file_name: &str, map_name: &str, bytes: Vec<u8>);
    fn get(&self, file_name: &str) -> Option<&[u8]>;
    fn map_name(&self, file_name: &str) -> Option<&str>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: FxHashMap<String, Vec<u8>>,
}

impl InMemoryBlobStore {
    pub fn insert(&mut self, path: &str, bytes: Vec<u8>) {
        self.blobs.insert(path.to_string(), bytes);
    }
}

impl BlobStore for InMemoryBlobStore {
    fn fetch(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.get(path).cloned()
    }
}

/// Blobs stored as files below a root directory.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> FileBlobStore {
        FileBlobStore { root: root.into() }
    }
}

impl BlobStore for FileBlobStore {
    fn fetch(&self, path: &str) -> Option<Vec<u8>> {
        match std::fs::read(self.root.join(path)) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("{path}: {e}");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryMapCache {
    files: FxHashMap<String, Vec<u8>>,
    names: FxHashMap<String, String>,
}

impl InMemoryMapCache {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// `(map name, record bytes)` of every cached file, ordered by file name.
    pub fn maps(&self) -> Vec<(&str, &[u8])> {
        let mut files: Vec<&String> = self.files.keys().collect();
        files.sort();
        files
            .into_iter()
            .filter_map(|f| Some((self.map_name(f)?, self.get(f)?)))
            .collect()
    }
}

impl MapCache for InMemoryMapCache {
    fn put(&mut self, file_name: &str, map_name: &str, bytes: Vec<u8>) {
        self.files.insert(file_name.to_string(), bytes);
        self.names.insert(file_name.to_string(), map_name.to_string());
    }

    fn get(&self, file_name: &str) -> Option<&[u8]> {
        self.files.get(file_name).map(Vec::as_slice)
    }

    fn map_name(&self, file_name: &str) -> Option<&str> {
        self.names.get(file_name).map(String::as_str)
    }
}

/// Non-fatal outcomes of one ingestion batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub cached: usize,
    /// Paths that were announced but not found in the blob store.
    pub fetch_misses: Vec<String>,
    /// Paths whose content is not an observation record.
    pub malformed: Vec<String>,
}

impl IngestSummary {
    pub fn log(&self) {
        info!("cached {} maps", self.cached);
        if !self.fetch_misses.is_empty() {
            warn!("{} maps could not be fetched: {:?}", self.fetch_misses.len(), self.fetch_misses);
        }
        if !self.malformed.is_empty() {
            warn!("{} maps are malformed: {:?}", self.malformed.len(), self.malformed);
        }
    }
}

/// Cache file name of a blob path: its last path segment.
pub fn cache_file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Fetches every announced record and caches the ones that decode.
pub struct CachingHandler<B: BlobStore, C: MapCache> {
    pub store: B,
    pub cache: C,
    pub summary: IngestSummary,
}

impl<B: BlobStore, C: MapCache> CachingHandler<B, C> {
    pub fn new(store: B, cache: C) -> CachingHandler<B, C> {
        CachingHandler {
            store,
            cache,
            summary: IngestSummary::default(),
        }
    }

    fn cache_one(&mut self, name: &str, path: &str) {
        let Some(bytes) = self.store.fetch(path) else {
            debug!("{path} not found");
            self.summary.fetch_misses.push(path.to_string());
            return;
        };
        if let Err(e) = ObservationRecord::from_slice(&bytes) {
            debug!("{path}: {e}");
            self.summary.malformed.push(path.to_string());
            return;
        }
        self.cache.put(cache_file_name(path), name, bytes);
        self.summary.cached += 1;
    }
}

impl<B: BlobStore, C: MapCache> ArrivalHandler for CachingHandler<B, C> {
    fn handle(&mut self, notification: MapNotification) {
        for (name, path) in notification.entries() {
            self.cache_one(name, path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    const RECORD: &str = r#"{"pose_data": [], "tag_data": []}"#;

    #[test]
    fn notifications_decode_both_shapes() -> Result<(), Box<dyn Error>> {
        let single: MapNotification = serde_json::from_str(r#"{"name": "lab", "path": "raw/lab.json"}"#)?;
        assert_eq!(vec![("lab", "raw/lab.json")], single.entries());
        let bulk: MapNotification = serde_json::from_str(r#"{"b": "raw/b.json", "a": "raw/a.json"}"#)?;
        assert_eq!(vec![("a", "raw/a.json"), ("b", "raw/b.json")], bulk.entries());
        Ok(())
    }

    #[test]
    fn misses_and_bad_records_are_skipped() {
        let mut store = InMemoryBlobStore::default();
        store.insert("raw/lab.json", RECORD.as_bytes().to_vec());
        store.insert("raw/bad.json", b"not json".to_vec());
        let mut handler = CachingHandler::new(store, InMemoryMapCache::default());

        let mut maps = BTreeMap::new();
        maps.insert("lab".to_string(), "raw/lab.json".to_string());
        maps.insert("bad".to_string(), "raw/bad.json".to_string());
        maps.insert("gone".to_string(), "raw/gone.json".to_string());
        handler.handle(MapNotification::Bulk(maps));

        assert_eq!(1, handler.summary.cached);
        assert_eq!(vec!["raw/gone.json".to_string()], handler.summary.fetch_misses);
        assert_eq!(vec!["raw/bad.json".to_string()], handler.summary.malformed);
        assert_eq!(1, handler.cache.len());
        assert_eq!(Some("lab"), handler.cache.map_name("lab.json"));
        assert_eq!(Some(RECORD.as_bytes()), handler.cache.get("lab.json"));
    }

    #[test]
    fn file_name_is_last_segment() {
        assert_eq!("a.json", cache_file_name("x/y/a.json"));
        assert_eq!("a.json", cache_file_name("a.json"));
    }

    #[test]
    fn file_store_reads_below_its_root() -> Result<(), Box<dyn Error>> {
        let root = std::env::temp_dir().join(format!("tagmap-store-{}", std::process::id()));
        std::fs::create_dir_all(root.join("raw"))?;
        std::fs::write(root.join("raw/lab.json"), RECORD)?;

        let mut handler = CachingHandler::new(FileBlobStore::new(&root), InMemoryMapCache::default());
        handler.handle(MapNotification::Single {
            name: "lab".to_string(),
            path: "raw/lab.json".to_string(),
        });
        handler.handle(MapNotification::Single {
            name: "gone".to_string(),
            path: "raw/gone.json".to_string(),
        });
        std::fs::remove_dir_all(&root)?;

        assert_eq!(1, handler.summary.cached);
        assert_eq!(vec!["raw/gone.json".to_string()], handler.summary.fetch_misses);
        assert_eq!(vec![("lab", RECORD.as_bytes())], handler.cache.maps());
        Ok(())
    }
}
