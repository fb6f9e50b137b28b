//! Work state threaded through the steps, and its on-disk record.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::{BuildConfig, ImageType};
use crate::error::{BuildError, BuildResult};
use crate::layout::Volume;

pub const STATE_FILE: &str = "imgforge-state.json";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkState {
    /// Ordinal of the next step to run.
    pub step_ordinal: usize,
    pub completed_steps: Vec<String>,
    /// Artifacts produced so far, keyed by the name their step declares.
    pub artifacts: BTreeMap<String, PathBuf>,
    pub volume: Option<Volume>,
    pub config: BuildConfig,
}

impl WorkState {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            step_ordinal: 0,
            completed_steps: Vec::new(),
            artifacts: BTreeMap::new(),
            volume: None,
            config,
        }
    }

    pub fn register_artifact(&mut self, name: &str, path: impl Into<PathBuf>) {
        self.artifacts.insert(name.to_string(), path.into());
    }

    pub fn artifact(&self, name: &str) -> Option<&Path> {
        self.artifacts.get(name).map(PathBuf::as_path)
    }

    pub fn volume(&self) -> anyhow::Result<&Volume> {
        self.volume
            .as_ref()
            .ok_or_else(|| anyhow!("volume layout has not been loaded yet"))
    }

    pub fn to_record(&self) -> PersistedStateRecord {
        PersistedStateRecord {
            schema_version: SCHEMA_VERSION,
            build_mode: self.config.image_type(),
            current_step_ordinal: self.step_ordinal,
            completed_step_names: self.completed_steps.clone(),
            configuration_snapshot: self.config.clone(),
            workspace_artifact_paths: self.artifacts.clone(),
            volume: self.volume.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedStateRecord {
    pub schema_version: u32,
    pub build_mode: ImageType,
    pub current_step_ordinal: usize,
    pub completed_step_names: Vec<String>,
    pub configuration_snapshot: BuildConfig,
    pub workspace_artifact_paths: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub volume: Option<Volume>,
}

impl PersistedStateRecord {
    /// Rebuild the work state, carrying over the current invocation's
    /// run-control flags.
    pub fn into_work_state(self, current: &BuildConfig) -> WorkState {
        let mut config = self.configuration_snapshot;
        config.run = current.run.clone();
        config.compression = current.compression;
        WorkState {
            step_ordinal: self.current_step_ordinal,
            completed_steps: self.completed_step_names,
            artifacts: self.workspace_artifact_paths,
            volume: self.volume,
            config,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionProbe {
    schema_version: Option<u32>,
}

/// The state record file inside a workspace.
#[derive(Debug, Clone)]
pub struct StateFile {
    dir: PathBuf,
    path: PathBuf,
}

impl StateFile {
    pub fn in_workspace(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            path: dir.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Write the record to a temp file next to the target, then rename it
    /// over the target. A crash leaves either the old or the new record.
    pub fn save(&self, record: &PersistedStateRecord) -> BuildResult<()> {
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| {
            BuildError::io("failed to serialize state", std::io::Error::other(e))
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".imgforge-state-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| BuildError::io("failed to create temporary state file", e))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| BuildError::io("failed to write temporary state file", e))?;
        tmp.persist(&self.path).map_err(|e| {
            BuildError::io(format!("failed to replace {}", self.path.display()), e.error)
        })?;

        // the rename is only durable once the directory entry is on disk
        if let Err(e) = File::open(&self.dir).and_then(|dir| dir.sync_all()) {
            warn!("failed to sync {}: {e}", self.dir.display());
        }
        Ok(())
    }

    pub fn load(&self) -> BuildResult<PersistedStateRecord> {
        let bytes = fs::read(&self.path)
            .map_err(|e| BuildError::io(format!("failed to read {}", self.path.display()), e))?;

        let probe: VersionProbe = serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e))?;
        match probe.schema_version {
            None => return Err(self.corrupt("schemaVersion is missing")),
            Some(found) if found != SCHEMA_VERSION => {
                return Err(BuildError::StateVersion {
                    found,
                    expected: SCHEMA_VERSION,
                });
            }
            Some(_) => {}
        }

        let record: PersistedStateRecord =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e))?;
        if record.current_step_ordinal != record.completed_step_names.len() {
            return Err(self.corrupt(format!(
                "step ordinal {} does not match {} completed steps",
                record.current_step_ordinal,
                record.completed_step_names.len()
            )));
        }
        if record.build_mode != record.configuration_snapshot.image_type() {
            return Err(self.corrupt("build mode does not match the configuration snapshot"));
        }
        Ok(record)
    }

    /// Configuration to continue the saved run with, taken from the record
    /// alone.
    pub fn resume_config(&self) -> BuildResult<BuildConfig> {
        if !self.exists() {
            return Err(BuildError::config(format!(
                "nothing to resume: {} does not exist",
                self.path.display()
            )));
        }
        let mut config = self.load()?.configuration_snapshot;
        config.workdir = Some(self.dir.clone());
        config.run.resume = true;
        Ok(config)
    }

    pub fn remove(&self) -> std::io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn corrupt(&self, reason: impl std::fmt::Display) -> BuildError {
        BuildError::CorruptState {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}
