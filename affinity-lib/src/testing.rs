//! In-memory stand-ins for external tools used across unit tests

use crate::deps::{DependencyInstaller, DependencyPlan, PlatformFamily};
use crate::error::Result;
use crate::runner::{ToolCommand, ToolOutput, ToolRunner};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct FailRule {
    needle: String,
    exit_code: i32,
    remaining: Option<usize>,
}

struct CreateRule {
    needle: String,
    relative: PathBuf,
}

/// Records every invocation and mimics the on-disk effects of Wine.
///
/// `wineboot --init` creates `drive_c` under `WINEPREFIX`; installer rules
/// drop files into the prefix so verification can observe them.
#[derive(Default)]
pub(crate) struct FakeRunner {
    calls: Mutex<Vec<ToolCommand>>,
    fail_rules: Mutex<Vec<FailRule>>,
    create_rules: Mutex<Vec<CreateRule>>,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every invocation whose arguments contain `needle` exits with `exit_code`
    pub(crate) fn fail_always(&self, needle: &str, exit_code: i32) {
        self.fail_rules.lock().unwrap().push(FailRule {
            needle: needle.to_string(),
            exit_code,
            remaining: None,
        });
    }

    /// The next `times` invocations matching `needle` fail, later ones succeed
    pub(crate) fn fail_times(&self, needle: &str, exit_code: i32, times: usize) {
        self.fail_rules.lock().unwrap().push(FailRule {
            needle: needle.to_string(),
            exit_code,
            remaining: Some(times),
        });
    }

    /// A successful invocation matching `needle` creates `relative` inside the prefix
    pub(crate) fn creates_in_prefix(&self, needle: &str, relative: impl Into<PathBuf>) {
        self.create_rules.lock().unwrap().push(CreateRule {
            needle: needle.to_string(),
            relative: relative.into(),
        });
    }

    pub(crate) fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Component names passed to `winetricks -q <name>` or `winecfg /v <ver>`, in call order
    pub(crate) fn applied_components(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| match c.args.first().map(String::as_str) {
                Some("-q") => c.args.get(1).cloned(),
                Some("winecfg") => c.args.get(2).cloned(),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count_matching(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| matches(c, needle)).count()
    }
}

fn matches(command: &ToolCommand, needle: &str) -> bool {
    command.args.iter().any(|a| a.contains(needle))
        || command.program.to_string_lossy().contains(needle)
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(command.clone());

        {
            let mut rules = self.fail_rules.lock().unwrap();
            if let Some(rule) = rules
                .iter_mut()
                .find(|r| r.remaining != Some(0) && matches(command, &r.needle))
            {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Ok(ToolOutput {
                    exit_code: Some(rule.exit_code),
                    stderr: format!("simulated failure for {}", rule.needle),
                    ..Default::default()
                });
            }
        }

        if let Some(prefix) = command.env_value("WINEPREFIX").map(PathBuf::from) {
            if command.args.iter().any(|a| a == "wineboot") {
                std::fs::create_dir_all(prefix.join("drive_c").join("windows"))?;
            }
            let rules = self.create_rules.lock().unwrap();
            for rule in rules.iter().filter(|r| matches(command, &r.needle)) {
                write_non_empty(&prefix.join(&rule.relative))?;
            }
        }

        Ok(ToolOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

fn write_non_empty(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, b"MZ")
}

/// Package installer that records requests and reports a fixed exit code
pub(crate) struct FakeDependencies {
    exit_code: i32,
    installs: Mutex<Vec<Vec<String>>>,
}

impl FakeDependencies {
    pub(crate) fn new(exit_code: i32) -> Self {
        Self {
            exit_code,
            installs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn install_count(&self) -> usize {
        self.installs.lock().unwrap().len()
    }
}

#[async_trait]
impl DependencyInstaller for FakeDependencies {
    fn plan(&self) -> Result<DependencyPlan> {
        Ok(DependencyPlan {
            platform: PlatformFamily::Debian,
            packages: vec!["wine".to_string(), "winetricks".to_string()],
        })
    }

    async fn install_packages(&self, _platform: PlatformFamily, names: &[String]) -> Result<i32> {
        self.installs.lock().unwrap().push(names.to_vec());
        Ok(self.exit_code)
    }
}
