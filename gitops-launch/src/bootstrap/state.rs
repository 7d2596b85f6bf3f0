//! Checkpoint state store
//!
//! Every checkpoint read and write goes through [`StateStore`]. The file
//! adapter persists to TOML and is flushed by the orchestrator after each
//! completed phase; the memory adapter backs tests and dry runs.

use crate::error::{Result, StateEncodeSnafu, StateFlushSnafu, StateParseSnafu, StateReadSnafu};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Well-known checkpoint keys.
pub mod keys {
    pub const CLUSTER_INSTALL_COMPLETE: &str = "cluster.install-complete";
    pub const LAUNCH_DEPLOYED: &str = "launch.deployed";
    pub const CONTROLLER_OIDC_PATCHED: &str = "controller.oidc-patched";

    pub fn credentials(provider: &str) -> String {
        format!("{provider}.credentials")
    }

    pub fn oidc_created(scm: &str) -> String {
        format!("{scm}.oidc-created")
    }

    pub fn gitops_pushed(scm: &str) -> String {
        format!("{scm}.gitops-pushed")
    }

    pub fn registered(scm: &str) -> String {
        format!("{scm}.registered")
    }
}

/// Persisted key -> boolean checkpoint map.
pub trait StateStore: Send {
    /// Missing keys read as false.
    fn get_bool(&self, key: &str) -> bool;

    fn set_bool(&mut self, key: &str, value: bool);

    /// Write current state to stable storage.
    fn flush(&mut self) -> Result<()>;

    fn snapshot(&self) -> BTreeMap<String, bool>;

    /// Drop every checkpoint. Only the explicit reset command calls this.
    fn clear(&mut self);
}

/// Flags resolved once per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub dry_run: bool,
    pub skip_vault: bool,
    pub skip_scm: bool,
    pub silent: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    checks: BTreeMap<String, bool>,
}

/// TOML-backed store. Flush writes a sibling temp file, syncs it, then
/// renames it over the original so a crash never leaves a torn file.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    checks: BTreeMap<String, bool>,
}

impl FileStateStore {
    /// Load from `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let checks = if path.exists() {
            let content = fs::read_to_string(&path).context(StateReadSnafu { path: &path })?;
            let file: StateFile = toml::from_str(&content).context(StateParseSnafu { path: &path })?;
            file.checks
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, checks })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn get_bool(&self, key: &str) -> bool {
        self.checks.get(key).copied().unwrap_or(false)
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.checks.insert(key.to_string(), value);
    }

    fn flush(&mut self) -> Result<()> {
        let file = StateFile {
            checks: self.checks.clone(),
        };
        let content = toml::to_string_pretty(&file).context(StateEncodeSnafu)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context(StateFlushSnafu { path: &self.path })?;
            }
        }

        let tmp = self.path.with_extension("toml.tmp");
        let mut out = fs::File::create(&tmp).context(StateFlushSnafu { path: &tmp })?;
        out.write_all(content.as_bytes())
            .and_then(|()| out.sync_all())
            .context(StateFlushSnafu { path: &tmp })?;
        fs::rename(&tmp, &self.path).context(StateFlushSnafu { path: &self.path })?;
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, bool> {
        self.checks.clone()
    }

    fn clear(&mut self) {
        self.checks.clear();
    }
}

/// In-memory store. Records every write and flush so tests can assert on
/// ordering, and serves as the overlay a dry run works against.
#[derive(Debug, Default, Clone)]
pub struct MemoryStateStore {
    checks: BTreeMap<String, bool>,
    writes: Vec<(String, bool)>,
    flushes: usize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(checks: BTreeMap<String, bool>) -> Self {
        Self {
            checks,
            ..Self::default()
        }
    }

    pub fn with(mut self, key: &str, value: bool) -> Self {
        self.checks.insert(key.to_string(), value);
        self
    }

    /// Every `set_bool` call, in order.
    pub fn writes(&self) -> &[(String, bool)] {
        &self.writes
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl StateStore for MemoryStateStore {
    fn get_bool(&self, key: &str) -> bool {
        self.checks.get(key).copied().unwrap_or(false)
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.writes.push((key.to_string(), value));
        self.checks.insert(key.to_string(), value);
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, bool> {
        self.checks.clone()
    }

    fn clear(&mut self) {
        self.checks.clear();
    }
}
