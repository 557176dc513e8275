use std::collections::BTreeMap;
use std::error::Error;
use std::io::BufRead;
use std::thread;

use crossbeam_channel::unbounded;
use env_logger::{Builder, Env};
use log::{info, warn};
use tagmap::config::Settings;
use tagmap::data::ObservationRecord;
use tagmap::ingest::{
    CachingHandler, DebouncedListener, FileBlobStore, InMemoryMapCache, MapNotification, ThreadTimer,
};
use tagmap::mapping::{build_graph, optimize, ProcessedMap, WeightPresets};

const USAGE: &str = "usage: tagmap <record.json> [settings.json]\n       tagmap --listen <blob root> [settings.json]";

fn process(record: &ObservationRecord, settings: &Settings) -> Result<ProcessedMap, Box<dyn Error>> {
    let mut graph = build_graph(record, &settings.build_options())?;
    let config = settings.optimization_config(&WeightPresets::standard())?;
    let outcome = optimize(&mut graph, &config, &mut settings.solver())?;

    for (kind, summary) in &outcome.chi2_by_kind {
        info!(
            "{:>14}: {} edges, chi2 sum {:.4}, mean {:.4}, max {:.4}",
            kind.name(),
            summary.count,
            summary.sum,
            summary.mean(),
            summary.max
        );
    }
    Ok(outcome.result.to_processed_map(true))
}

/// Reads map notifications as JSON lines from stdin until they stop for `max_wait`,
/// then processes every cached record.
fn listen(root: &str, settings: &Settings) -> Result<(), Box<dyn Error>> {
    let (tx, rx) = unbounded::<MapNotification>();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines().map_while(Result::ok) {
            match serde_json::from_str(&line) {
                Ok(notification) => {
                    if tx.send(notification).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("ignoring notification `{line}`: {e}"),
            }
        }
    });

    let listener = DebouncedListener::new(ThreadTimer, settings.max_wait());
    let handler = listener.listen(
        rx,
        CachingHandler::new(FileBlobStore::new(root), InMemoryMapCache::default()),
    );
    handler.summary.log();

    let mut maps = BTreeMap::new();
    for (name, bytes) in handler.cache.maps() {
        let record = ObservationRecord::from_slice(bytes)?;
        maps.insert(name.to_string(), process(&record, settings)?);
    }
    println!("{}", serde_json::to_string(&maps)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    Builder::from_env(Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let settings = |path: Option<&String>| match path {
        Some(path) => Settings::from_file(path),
        None => Ok(Settings::default()),
    };

    match args.as_slice() {
        [flag, root, rest @ ..] if flag == "--listen" && rest.len() <= 1 => {
            listen(root, &settings(rest.first())?)
        }
        [record_path, rest @ ..] if !record_path.starts_with("--") && rest.len() <= 1 => {
            let settings = settings(rest.first())?;
            let record = ObservationRecord::from_slice(&std::fs::read(record_path)?)?;
            let map = process(&record, &settings)?;
            println!("{}", serde_json::to_string(&map)?);
            Ok(())
        }
        _ => Err(USAGE.into()),
    }
}
