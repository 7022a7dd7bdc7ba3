//! Run state: the phase machine and its persisted checkpoint

use crate::error::{AffinityError, Result};
use crate::profile::ProfileName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pipeline phases in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preflight,
    DependencyInstall,
    PrefixSetup,
    Download,
    Install,
    Verify,
    Integrate,
    Done,
    Failed,
}

impl Phase {
    /// Phases that do work, in order. `Done` and `Failed` are terminal markers.
    pub const PIPELINE: [Phase; 7] = [
        Phase::Preflight,
        Phase::DependencyInstall,
        Phase::PrefixSetup,
        Phase::Download,
        Phase::Install,
        Phase::Verify,
        Phase::Integrate,
    ];

    /// Every pipeline phase strictly before this one
    pub fn predecessors(self) -> &'static [Phase] {
        match PIPELINE_ORDER.iter().position(|p| *p == self) {
            Some(index) => &PIPELINE_ORDER[..index],
            None => &PIPELINE_ORDER,
        }
    }

    /// How often the engine may enter this phase in one run
    pub fn attempt_ceiling(self) -> u32 {
        match self {
            Phase::PrefixSetup | Phase::Download => 2,
            _ => 1,
        }
    }

    /// Process exit code when a run fails in this phase
    pub fn exit_code(self) -> i32 {
        match self {
            Phase::Download => 2,
            Phase::PrefixSetup => 3,
            Phase::Install | Phase::Integrate => 4,
            Phase::Verify => 5,
            _ => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Preflight => "preflight",
            Phase::DependencyInstall => "dependency-install",
            Phase::PrefixSetup => "prefix-setup",
            Phase::Download => "download",
            Phase::Install => "install",
            Phase::Verify => "verify",
            Phase::Integrate => "integrate",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }
}

static PIPELINE_ORDER: [Phase; 7] = Phase::PIPELINE;

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Status of one phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    InProgress,
    Satisfied,
    Failed(String),
}

impl PhaseStatus {
    /// Short label for status output
    pub fn label(&self) -> &str {
        match self {
            PhaseStatus::NotStarted => "not started",
            PhaseStatus::InProgress => "in progress",
            PhaseStatus::Satisfied => "done",
            PhaseStatus::Failed(reason) => reason.as_str(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    /// Entries into this phase across runs; never decreases
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// State of one provisioning run, saved at every phase boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub profile: ProfileName,
    pub prefix_path: PathBuf,
    pub artifact_url: Option<String>,
    pub cache_path: PathBuf,
    pub current: Phase,
    pub phases: BTreeMap<Phase, PhaseRecord>,
}

impl RunState {
    pub fn new(profile: ProfileName, prefix_path: PathBuf, cache_path: PathBuf) -> Self {
        let phases = Phase::PIPELINE
            .iter()
            .map(|p| (*p, PhaseRecord::default()))
            .collect();
        Self {
            profile,
            prefix_path,
            artifact_url: None,
            cache_path,
            current: Phase::Preflight,
            phases,
        }
    }

    pub fn record(&self, phase: Phase) -> PhaseRecord {
        self.phases.get(&phase).cloned().unwrap_or_default()
    }

    pub fn status(&self, phase: Phase) -> PhaseStatus {
        self.record(phase).status
    }

    pub fn is_satisfied(&self, phase: Phase) -> bool {
        self.status(phase) == PhaseStatus::Satisfied
    }

    /// Enter `phase`. Refused unless every predecessor is satisfied.
    pub fn begin(&mut self, phase: Phase) -> Result<()> {
        if let Some(blocker) = phase
            .predecessors()
            .iter()
            .find(|p| !self.is_satisfied(**p))
        {
            return Err(AffinityError::ConfigInvalid(format!(
                "cannot enter {}: {} is not satisfied",
                phase, blocker
            )));
        }
        let record = self.phases.entry(phase).or_default();
        record.status = PhaseStatus::InProgress;
        record.attempts += 1;
        self.current = phase;
        debug!("Entering {} (attempt {})", phase, record.attempts);
        Ok(())
    }

    pub fn satisfy(&mut self, phase: Phase, note: Option<String>) {
        let record = self.phases.entry(phase).or_default();
        record.status = PhaseStatus::Satisfied;
        if note.is_some() {
            record.note = note;
        }
        self.current = if phase == Phase::Integrate {
            Phase::Done
        } else {
            phase
        };
    }

    pub fn fail(&mut self, phase: Phase, reason: impl Into<String>) {
        let record = self.phases.entry(phase).or_default();
        record.status = PhaseStatus::Failed(reason.into());
        self.current = Phase::Failed;
    }

    /// Return `from` and every later phase to `NotStarted`, keeping attempt counts
    pub fn reset_from(&mut self, from: Phase) {
        for (phase, record) in self.phases.iter_mut() {
            if *phase >= from {
                record.status = PhaseStatus::NotStarted;
            }
        }
        if self.current >= from {
            self.current = from;
        }
    }

    pub fn is_done(&self) -> bool {
        self.current == Phase::Done
    }

    /// The first phase that failed, with its reason
    pub fn failure(&self) -> Option<(Phase, String)> {
        self.phases.iter().find_map(|(phase, record)| match &record.status {
            PhaseStatus::Failed(reason) => Some((*phase, reason.clone())),
            _ => None,
        })
    }

    /// Write the checkpoint atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(path, content.as_bytes())?;
        debug!("Checkpoint saved to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// `None` when no checkpoint has been written yet
    pub fn load_optional(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }
}

/// Write to a sibling temp file then rename over `path`
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}
