//! Preflight guardrail checks
//!
//! Read-only inspection of the host before anything destructive happens.
//! Checks run concurrently on blocking threads and are reported in the order
//! they are declared.

use crate::config::Config;
use crate::error::AffinityError;
use crate::wine::{COMPONENT_TOOL, RUNTIME_CANDIDATES};
use serde::Serialize;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSeverity {
    /// A failure stops the run
    Blocking,
    /// A failure is only reported
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub severity: CheckSeverity,
    pub reason: String,
}

impl CheckResult {
    fn pass(name: impl Into<String>, severity: CheckSeverity, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            severity,
            reason: reason.into(),
        }
    }

    fn fail(name: impl Into<String>, severity: CheckSeverity, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            severity,
            reason: reason.into(),
        }
    }
}

/// Ordered outcome of every check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardrailReport {
    pub checks: Vec<CheckResult>,
}

impl GuardrailReport {
    /// Any blocking check failed
    pub fn is_blocking(&self) -> bool {
        self.checks
            .iter()
            .any(|c| !c.passed && c.severity == CheckSeverity::Blocking)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// Error naming every failed blocking check, if any
    pub fn to_error(&self) -> Option<AffinityError> {
        if !self.is_blocking() {
            return None;
        }
        let reasons: Vec<String> = self
            .failures()
            .filter(|c| c.severity == CheckSeverity::Blocking)
            .map(|c| format!("{}: {}", c.name, c.reason))
            .collect();
        Some(AffinityError::GuardrailBlocking(reasons.join("; ")))
    }
}

/// Everything the checks need to know
#[derive(Debug, Clone)]
pub struct GuardrailContext {
    /// Explicit runtime binary; otherwise any of [`RUNTIME_CANDIDATES`]
    pub runtime_override: Option<PathBuf>,
    pub required_binaries: Vec<String>,
    pub prefix_path: PathBuf,
    pub cache_dir: PathBuf,
    pub min_free_bytes: u64,
    /// Replaces `PATH` for binary lookups
    pub search_path: Option<OsString>,
}

impl GuardrailContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            runtime_override: config.wine_binary.clone(),
            required_binaries: vec![COMPONENT_TOOL.to_string()],
            prefix_path: config.prefix_path.clone(),
            cache_dir: config.cache_dir.clone(),
            min_free_bytes: config.min_free_bytes,
            search_path: None,
        }
    }

    fn resolve(&self, name: &Path) -> Option<PathBuf> {
        if name.is_absolute() {
            return is_executable(name).then(|| name.to_path_buf());
        }
        match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
                which::which_in(name, Some(paths), cwd).ok()
            }
            None => which::which(name).ok(),
        }
    }
}

/// One declared check
#[derive(Debug, Clone)]
enum Check {
    Runtime,
    Binary(String),
    FreeSpace { label: &'static str, path: PathBuf },
    CachePermissions,
    PrefixWritable,
    Gpu,
}

impl Check {
    fn declared(ctx: &GuardrailContext) -> Vec<Check> {
        let mut checks = vec![Check::Runtime];
        checks.extend(ctx.required_binaries.iter().cloned().map(Check::Binary));
        checks.push(Check::FreeSpace {
            label: "prefix",
            path: ctx.prefix_path.clone(),
        });
        checks.push(Check::FreeSpace {
            label: "cache",
            path: ctx.cache_dir.clone(),
        });
        checks.push(Check::CachePermissions);
        checks.push(Check::PrefixWritable);
        checks.push(Check::Gpu);
        checks
    }

    fn evaluate(&self, ctx: &GuardrailContext) -> CheckResult {
        use CheckSeverity::*;

        match self {
            Check::Runtime => {
                let candidates: Vec<PathBuf> = match &ctx.runtime_override {
                    Some(path) => vec![path.clone()],
                    None => RUNTIME_CANDIDATES.iter().map(PathBuf::from).collect(),
                };
                let name = format!(
                    "runtime:{}",
                    candidates
                        .iter()
                        .map(|c| c.display().to_string())
                        .collect::<Vec<_>>()
                        .join("|")
                );
                match candidates.iter().find_map(|c| ctx.resolve(c)) {
                    Some(found) => CheckResult::pass(name, Blocking, found.display().to_string()),
                    None => CheckResult::fail(name, Blocking, "Wine runtime not found on PATH"),
                }
            }
            Check::Binary(binary) => {
                let name = format!("binary:{}", binary);
                match ctx.resolve(Path::new(binary)) {
                    Some(found) => CheckResult::pass(name, Blocking, found.display().to_string()),
                    None => CheckResult::fail(name, Blocking, format!("{} not found on PATH", binary)),
                }
            }
            Check::FreeSpace { label, path } => {
                let name = format!("disk:{}", label);
                let Some(existing) = nearest_existing(path) else {
                    return CheckResult::fail(name, Blocking, "no existing ancestor directory");
                };
                match fs2::available_space(&existing) {
                    Ok(free) if free >= ctx.min_free_bytes => CheckResult::pass(
                        name,
                        Blocking,
                        format!("{} free at {}", format_gib(free), existing.display()),
                    ),
                    Ok(free) => CheckResult::fail(
                        name,
                        Blocking,
                        format!(
                            "{} free at {}, need {}",
                            format_gib(free),
                            existing.display(),
                            format_gib(ctx.min_free_bytes)
                        ),
                    ),
                    Err(e) => CheckResult::fail(
                        name,
                        Blocking,
                        format!("cannot stat {}: {}", existing.display(), e),
                    ),
                }
            }
            Check::CachePermissions => {
                let name = "cache-permissions";
                match std::fs::metadata(&ctx.cache_dir) {
                    Ok(meta) => {
                        let mode = meta.permissions().mode() & 0o777;
                        if !meta.is_dir() {
                            CheckResult::fail(name, Blocking, "cache path is not a directory")
                        } else if mode == 0o700 {
                            CheckResult::pass(name, Blocking, "mode 0700")
                        } else {
                            CheckResult::fail(
                                name,
                                Blocking,
                                format!(
                                    "{} has mode {:04o}, expected 0700 (chmod 700 it)",
                                    ctx.cache_dir.display(),
                                    mode
                                ),
                            )
                        }
                    }
                    Err(_) => match nearest_existing(&ctx.cache_dir) {
                        Some(parent) if is_writable(&parent) => CheckResult::pass(
                            name,
                            Blocking,
                            format!("will be created with mode 0700 under {}", parent.display()),
                        ),
                        _ => CheckResult::fail(
                            name,
                            Blocking,
                            format!("cannot create {}", ctx.cache_dir.display()),
                        ),
                    },
                }
            }
            Check::PrefixWritable => {
                let name = "prefix-writable";
                match nearest_existing(&ctx.prefix_path) {
                    Some(target) if is_writable(&target) => {
                        CheckResult::pass(name, Blocking, target.display().to_string())
                    }
                    Some(target) => CheckResult::fail(
                        name,
                        Blocking,
                        format!("no write access to {}", target.display()),
                    ),
                    None => CheckResult::fail(name, Blocking, "no existing ancestor directory"),
                }
            }
            Check::Gpu => {
                if ctx.resolve(Path::new("vulkaninfo")).is_some() || Path::new("/dev/dri").exists() {
                    CheckResult::pass("gpu", Advisory, "Vulkan-capable GPU stack detected")
                } else {
                    CheckResult::fail(
                        "gpu",
                        Advisory,
                        "no vulkaninfo or /dev/dri; rendering may fall back to software",
                    )
                }
            }
        }
    }
}

/// Run every check and collect the results in declared order
pub async fn run_checks(ctx: &GuardrailContext) -> GuardrailReport {
    let shared = Arc::new(ctx.clone());
    let mut set = JoinSet::new();

    for (index, check) in Check::declared(ctx).into_iter().enumerate() {
        let ctx = Arc::clone(&shared);
        set.spawn_blocking(move || (index, check.evaluate(&ctx)));
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => results.push((
                usize::MAX,
                CheckResult::fail("internal", CheckSeverity::Blocking, e.to_string()),
            )),
        }
    }
    results.sort_by_key(|(index, _)| *index);

    let report = GuardrailReport {
        checks: results.into_iter().map(|(_, result)| result).collect(),
    };
    for check in &report.checks {
        if check.passed {
            debug!("check {} passed: {}", check.name, check.reason);
        } else {
            warn!("check {} failed: {}", check.name, check.reason);
        }
    }
    report
}

fn nearest_existing(path: &Path) -> Option<PathBuf> {
    path.ancestors().find(|p| p.exists()).map(Path::to_path_buf)
}

fn is_writable(path: &Path) -> bool {
    rustix::fs::access(path, rustix::fs::Access::WRITE_OK).is_ok()
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn format_gib(bytes: u64) -> String {
    format!("{:.1} GiB", bytes as f64 / GIB as f64)
}
