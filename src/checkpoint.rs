use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::EnrichmentSource;
use crate::error::EnrichError;

pub const DEFAULT_CHECKPOINT_PATH: &str = ".import_checkpoint.json";

/// Default checkpoint for a sweep of one source over stored taxa.
pub fn backfill_checkpoint_path(source: EnrichmentSource) -> Utf8PathBuf {
    Utf8PathBuf::from(format!(".enrich_{source}_checkpoint.json"))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    done: BTreeMap<String, bool>,
}

/// Record of completed batch keys, persisted after every mark.
///
/// The map and the file write sit behind one lock, so concurrent workers
/// never interleave partial writes. A missing file is an empty checkpoint.
#[derive(Debug)]
pub struct Checkpoint {
    path: Utf8PathBuf,
    state: Mutex<CheckpointFile>,
}

impl Checkpoint {
    pub fn load(path: impl Into<Utf8PathBuf>) -> Result<Self, EnrichError> {
        let path = path.into();
        let state = if path.as_std_path().exists() {
            let content = fs::read_to_string(path.as_std_path())
                .map_err(|err| EnrichError::Checkpoint(format!("read {path}: {err}")))?;
            if content.trim().is_empty() {
                CheckpointFile::default()
            } else {
                serde_json::from_str(&content)
                    .map_err(|err| EnrichError::Checkpoint(format!("parse {path}: {err}")))?
            }
        } else {
            CheckpointFile::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn is_done(&self, key: &str) -> bool {
        self.lock()
            .map(|state| state.done.get(key).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock()
            .map(|state| state.done.values().filter(|done| **done).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_done(&self, key: &str) -> Result<(), EnrichError> {
        let mut state = self.lock()?;
        state.done.insert(key.to_string(), true);
        write_atomic(&self.path, &state)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CheckpointFile>, EnrichError> {
        self.state
            .lock()
            .map_err(|_| EnrichError::Checkpoint("checkpoint lock poisoned".to_string()))
    }
}

fn write_atomic(path: &Utf8Path, state: &CheckpointFile) -> Result<(), EnrichError> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|err| EnrichError::Checkpoint(err.to_string()))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| EnrichError::Checkpoint(format!("create {parent}: {err}")))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".checkpoint")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| EnrichError::Checkpoint(err.to_string()))?;
    temp.write_all(json.as_bytes())
        .and_then(|_| temp.write_all(b"\n"))
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| EnrichError::Checkpoint(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| EnrichError::Checkpoint(format!("persist {path}: {}", err.error)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_file_has_done_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("cp.json")).unwrap();
        let checkpoint = Checkpoint::load(path.clone()).unwrap();
        checkpoint.mark_done("Panthera pardus").unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path.as_std_path()).unwrap()).unwrap();
        assert_eq!(raw["done"]["Panthera pardus"], serde_json::Value::Bool(true));
    }

    #[test]
    fn backfill_checkpoints_are_per_source() {
        assert_eq!(
            backfill_checkpoint_path(EnrichmentSource::Media),
            Utf8PathBuf::from(".enrich_media_checkpoint.json")
        );
        assert_ne!(
            backfill_checkpoint_path(EnrichmentSource::Status),
            backfill_checkpoint_path(EnrichmentSource::Occurrence)
        );
    }
}
