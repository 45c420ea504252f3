//! Persistent run state using rkyv.
//!
//! One snapshot per job lives at `<outputdir>/texrun_state.bin`. It holds the
//! digests, produced files, macros, dependency stamps and exit status of
//! every run key and typeset key, so that the next invocation can decide
//! what to reuse.
//!
//! A snapshot is only reused when its schema version and its vital settings
//! match the current run. Anything else invalidates it as a whole and every
//! file it recorded is deleted.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::error::{Error, Result};
use crate::hash::HashTriple;
use crate::settings::{Settings, VitalSettings};

/// Current snapshot format version.
///
/// Increment this when the snapshot layout changes in an incompatible way.
pub const SCHEMA_VERSION: u32 = 1;

/// Modification time and optional content digest of one dependency.
///
/// Both are `None` when the file could not be found or changed during the
/// run; such an entry never matches and forces a re-run next time.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DepStamp {
    pub mtime: Option<f64>,
    /// Empty when dependencies are compared by modification time.
    pub hash: Option<String>,
}

impl DepStamp {
    pub fn unresolved() -> Self {
        Self { mtime: None, hash: None }
    }
}

/// Error and warning counts of the last execution of a run key.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitStatus {
    pub errors: u32,
    pub warnings: u32,
}

impl ExitStatus {
    pub fn new(errors: u32, warnings: u32) -> Self {
        Self { errors, warnings }
    }

    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.warnings == 0
    }
}

/// Settings tuple stored with the snapshot; a mismatch discards it.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredVitals {
    pub version: String,
    pub encoding: String,
    pub gobble: String,
    pub fvextfile: u64,
    pub pyfuture: String,
}

impl From<&VitalSettings> for StoredVitals {
    fn from(v: &VitalSettings) -> Self {
        Self {
            version: v.version.clone(),
            encoding: v.encoding.clone(),
            gobble: v.gobble.as_str().to_string(),
            fvextfile: v.fvextfile,
            pyfuture: v.pyfuture.as_str().to_string(),
        }
    }
}

/// Settings whose change re-runs every code session.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeVitals {
    pub workingdir: String,
    pub keeptemps: String,
    pub makestderr: bool,
    pub stderrfilename: String,
}

impl From<&Settings> for CodeVitals {
    fn from(s: &Settings) -> Self {
        Self {
            workingdir: s.workingdir.clone(),
            keeptemps: s.keeptemps.as_str().to_string(),
            makestderr: s.makestderr,
            stderrfilename: s.stderrfilename.as_str().to_string(),
        }
    }
}

pub type DependencyMap = HashMap<String, DepStamp>;

/// Everything persisted between runs.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RunState {
    pub schema_version: u32,
    pub vitals: StoredVitals,
    pub code_vitals: CodeVitals,
    /// Working directory used by console sessions.
    pub cons_vitals: String,

    pub code_hashes: HashMap<String, HashTriple>,
    pub cons_hashes: HashMap<String, HashTriple>,
    pub typeset_hashes: HashMap<String, String>,

    /// Macro fragments per run key.
    pub macros: HashMap<String, Vec<String>>,
    /// Files produced per run key.
    pub files: HashMap<String, Vec<String>>,
    pub pygments_macros: HashMap<String, Vec<String>>,
    pub pygments_files: HashMap<String, Vec<String>>,
    /// Console transcript per run key and instance.
    pub typeset_cache: HashMap<String, HashMap<String, String>>,
    /// Dependencies per run key or typeset key, keyed by the path as given.
    pub dependencies: HashMap<String, DependencyMap>,
    pub exit_status: HashMap<String, ExitStatus>,
    /// Highlighting fingerprint per family.
    pub highlight_settings: HashMap<String, String>,
    /// Unix seconds of the last run that created files.
    pub last_new_file_time: f64,
}

impl RunState {
    pub fn new(vitals: &VitalSettings) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            vitals: StoredVitals::from(vitals),
            ..Self::default()
        }
    }

    /// Every file recorded for run keys and typeset keys.
    pub fn all_files(&self) -> impl Iterator<Item = &String> {
        self.files
            .values()
            .chain(self.pygments_files.values())
            .flatten()
    }
}

/// Outcome of loading the previous snapshot.
#[derive(Debug)]
pub enum LoadedState {
    /// No snapshot on disk.
    Missing,
    /// Snapshot is usable for incremental decisions.
    Compatible(RunState),
    /// Snapshot exists but its vital settings differ; its files are stale.
    Invalidated(RunState),
    /// Snapshot exists but could not be decoded or has another schema.
    Unreadable,
}

/// Snapshot persistence operations.
pub struct StateStore;

impl StateStore {
    /// Save a snapshot.
    ///
    /// Writes to a temporary file first, then renames it into place.
    pub fn save(path: &Path, state: &RunState) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = rkyv::to_bytes::<rancor::Error>(state).map_err(|e| Error::Snapshot(e.to_string()))?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;

        tracing::debug!(
            "saved run state: {} code keys, {} console keys, {} bytes",
            state.code_hashes.len(),
            state.cons_hashes.len(),
            bytes.len()
        );
        Ok(())
    }

    /// Load the snapshot at `path` and check it against the current vitals.
    pub fn load(path: &Path, vitals: &VitalSettings) -> Result<LoadedState> {
        if !path.exists() {
            tracing::debug!("no run state at {:?}", path);
            return Ok(LoadedState::Missing);
        }

        let bytes = fs::read(path)?;
        let archived = match rkyv::access::<ArchivedRunState, rancor::Error>(&bytes) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("discarding unreadable run state {:?}: {}", path, e);
                return Ok(LoadedState::Unreadable);
            }
        };

        let found_version: u32 = archived.schema_version.into();
        if found_version != SCHEMA_VERSION {
            tracing::debug!("run state schema {} != {}; discarding", found_version, SCHEMA_VERSION);
            return Ok(LoadedState::Unreadable);
        }
        let state: RunState = rkyv::deserialize::<RunState, rancor::Error>(archived)
            .map_err(|e| Error::Snapshot(e.to_string()))?;

        if state.vitals != StoredVitals::from(vitals) {
            tracing::debug!("vital settings changed; invalidating run state");
            return Ok(LoadedState::Invalidated(state));
        }

        tracing::debug!(
            "loaded run state: {} code keys, {} console keys",
            state.code_hashes.len(),
            state.cons_hashes.len()
        );
        Ok(LoadedState::Compatible(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Gobble, PyFuture};
    use tempfile::TempDir;

    fn vitals(encoding: &str) -> VitalSettings {
        VitalSettings {
            version: "0.18".to_string(),
            encoding: encoding.to_string(),
            gobble: Gobble::None,
            fvextfile: u64::MAX,
            pyfuture: PyFuture::Default,
        }
    }

    fn sample_state() -> RunState {
        let mut state = RunState::new(&vitals("UTF-8"));
        state.code_hashes.insert(
            "py#default#default".to_string(),
            HashTriple {
                code: "a".into(),
                custom: "b".into(),
                engine: "c".into(),
            },
        );
        state
            .files
            .insert("py#default#default".to_string(), vec!["out/py_default_default_0.stdout".into()]);
        state.dependencies.insert(
            "py#default#default".to_string(),
            HashMap::from([("data.csv".to_string(), DepStamp { mtime: Some(12.5), hash: Some(String::new()) })]),
        );
        state
            .exit_status
            .insert("py#default#default".to_string(), ExitStatus::new(1, 0));
        state.last_new_file_time = 1700000000.25;
        state
    }

    #[test]
    fn test_save_and_load_compatible() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let path = temp.path().join("out").join("texrun_state.bin");
        let state = sample_state();

        StateStore::save(&path, &state).expect("Failed to save state");
        assert!(!path.with_extension("tmp").exists());

        match StateStore::load(&path, &vitals("UTF-8")).expect("Failed to load state") {
            LoadedState::Compatible(loaded) => assert_eq!(loaded, state),
            other => panic!("expected compatible state, got {:?}", other),
        }
    }

    #[test]
    fn test_vitals_mismatch_invalidates() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let path = temp.path().join("texrun_state.bin");
        StateStore::save(&path, &sample_state()).expect("Failed to save state");

        match StateStore::load(&path, &vitals("latin-1")).expect("Failed to load state") {
            LoadedState::Invalidated(old) => {
                assert_eq!(old.all_files().count(), 1);
            }
            other => panic!("expected invalidated state, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_and_garbage() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let path = temp.path().join("texrun_state.bin");
        assert!(matches!(
            StateStore::load(&path, &vitals("UTF-8")).expect("Failed to load"),
            LoadedState::Missing
        ));

        fs::write(&path, b"not an archive").expect("Failed to write garbage");
        assert!(matches!(
            StateStore::load(&path, &vitals("UTF-8")).expect("Failed to load"),
            LoadedState::Unreadable
        ));
    }
}
