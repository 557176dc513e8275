pub mod listener;
pub mod store;
pub mod timer;

pub use listener::{ArrivalHandler, DebouncedListener, ListenerState};
pub use store::{
    BlobStore, CachingHandler, FileBlobStore, InMemoryBlobStore, InMemoryMapCache, IngestSummary,
    MapCache, MapNotification,
};
pub use timer::{ManualTimer, ThreadTimer, TimerHandle, TimerService};
