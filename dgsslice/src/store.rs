use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bincode::{Decode, Encode};
use rustc_hash::FxHashMap;
use tracing::debug;

use dgscore::data::events::EventSet;
use dgscore::data::histogram::Histogram;
use dgscore::error::{Result, SliceError};

const EXTENSION: &str = "bin";

/// Anything the slicing steps hand to each other by name.
#[derive(Clone, Debug, Encode, Decode)]
pub enum Artifact {
    Events(Arc<EventSet>),
    Histogram(Histogram),
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Events(_) => "event set",
            Artifact::Histogram(_) => "histogram",
        }
    }
}

/// Named artifacts owned by one [`crate::slice::slicer::Slicer`].
///
/// Lookups go to memory first and then, if a directory is configured, to
/// `<directory>/<name>.bin`. Nothing is ever regenerated here.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    artifacts: FxHashMap<String, Artifact>,
    directory: Option<PathBuf>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        ArtifactStore::default()
    }

    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        ArtifactStore { artifacts: FxHashMap::default(), directory: Some(directory.into()) }
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn insert(&mut self, name: &str, artifact: Artifact) -> Option<Artifact> {
        self.artifacts.insert(name.to_string(), artifact)
    }

    pub fn insert_events(&mut self, events: EventSet) -> Arc<EventSet> {
        let events = Arc::new(events);
        self.insert(&events.name.clone(), Artifact::Events(events.clone()));
        events
    }

    pub fn get(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.get(name)
    }

    pub fn histogram(&self, name: &str) -> Option<&Histogram> {
        match self.artifacts.get(name) {
            Some(Artifact::Histogram(h)) => Some(h),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Artifact> {
        self.artifacts.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.artifacts.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.directory.as_ref().map(|d| d.join(format!("{}.{}", name, EXTENSION)))
    }

    /// Event set `name`, from memory or from disk. A set read from disk is
    /// kept in memory for later lookups.
    pub fn load_event_set(&mut self, name: &str) -> Result<Arc<EventSet>> {
        if !self.artifacts.contains_key(name) {
            match self.read_from_disk(name)? {
                Some(artifact) => {
                    self.artifacts.insert(name.to_string(), artifact);
                }
                None => {
                    let location = match &self.directory {
                        Some(d) => format!("in memory or in {}", d.display()),
                        None => "in memory".to_string(),
                    };
                    return Err(SliceError::NotFound(format!(
                        "event set '{}' is not available {}; re-run the reduction that produces it",
                        name, location
                    )));
                }
            }
        }
        match self.artifacts.get(name) {
            Some(Artifact::Events(events)) => Ok(events.clone()),
            Some(other) => Err(SliceError::config(format!(
                "artifact '{}' is a {}, not an event set",
                name,
                other.kind()
            ))),
            None => Err(SliceError::NotFound(name.to_string())),
        }
    }

    fn read_from_disk(&self, name: &str) -> Result<Option<Artifact>> {
        let path = match self.path_of(name) {
            Some(p) if p.is_file() => p,
            _ => return Ok(None),
        };
        debug!(name, path = %path.display(), "reading artifact from disk");
        let mut reader = BufReader::new(File::open(&path)?);
        let artifact: Artifact = bincode::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| SliceError::Decode(format!("{}: {}", path.display(), e)))?;
        Ok(Some(artifact))
    }

    /// Writes artifact `name` to the store directory and returns the path.
    pub fn persist(&self, name: &str) -> Result<PathBuf> {
        let artifact = self
            .artifacts
            .get(name)
            .ok_or_else(|| SliceError::NotFound(format!("artifact '{}' is not in memory", name)))?;
        let path = self
            .path_of(name)
            .ok_or_else(|| SliceError::config("the artifact store has no directory to persist to"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(&path)?);
        bincode::encode_into_std_write(artifact, &mut writer, bincode::config::standard())
            .map_err(|e| SliceError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        debug!(name, path = %path.display(), "persisted artifact");
        Ok(path)
    }

    /// Names of the artifacts available in the store directory.
    pub fn names_on_disk(&self) -> Result<Vec<String>> {
        let directory = match &self.directory {
            Some(d) if d.is_dir() => d,
            _ => return Ok(Vec::new()),
        };
        let mut names = Vec::new();
        for entry in std::fs::read_dir(directory)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dgscore::data::events::{Dimension, Frame, RunInfo};
    use dgscore::data::histogram::Axis;

    fn events(name: &str) -> EventSet {
        let mut events = EventSet::new(
            name,
            Frame::Lab,
            vec![
                Dimension::momentum("H", -1.0, 1.0),
                Dimension::momentum("K", -1.0, 1.0),
                Dimension::momentum("L", -1.0, 1.0),
            ],
        );
        let run = events.add_run(RunInfo::default().with_log("temperature", 4.0));
        events.push_event(&[0.1, 0.2, 0.3], 2.0, 2.0, run, 7);
        events
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dgsslice-store-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_missing_event_set_is_not_found() {
        let mut store = ArtifactStore::new();
        let err = store.load_event_set("background").unwrap_err();
        assert!(matches!(err, SliceError::NotFound(_)));
        assert!(err.to_string().contains("re-run"));
    }

    #[test]
    fn test_wrong_kind() {
        let mut store = ArtifactStore::new();
        store.insert("h", Artifact::Histogram(Histogram::zeros(vec![Axis::new("x", vec![0.0, 1.0])])));
        assert!(matches!(store.load_event_set("h").unwrap_err(), SliceError::Configuration(_)));
        assert!(store.histogram("h").is_some());
        assert!(store.histogram("missing").is_none());
    }

    #[test]
    fn test_persist_and_reload_from_disk() {
        let dir = scratch_dir("reload");
        let mut store = ArtifactStore::with_directory(&dir);
        store.insert_events(events("vanadium"));
        let path = store.persist("vanadium").unwrap();
        assert!(path.is_file());
        assert_eq!(store.names_on_disk().unwrap(), vec!["vanadium".to_string()]);

        let mut fresh = ArtifactStore::with_directory(&dir);
        assert!(!fresh.contains("vanadium"));
        let loaded = fresh.load_event_set("vanadium").unwrap();
        assert_eq!(*loaded, events("vanadium"));
        assert!(fresh.contains("vanadium"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_names_and_remove() {
        let mut store = ArtifactStore::new();
        store.insert_events(events("b"));
        store.insert_events(events("a"));
        assert_eq!(store.names(), vec!["a".to_string(), "b".to_string()]);
        assert!(store.remove("a").is_some());
        assert_eq!(store.len(), 1);
        assert!(store.persist("b").is_err());
    }
}
