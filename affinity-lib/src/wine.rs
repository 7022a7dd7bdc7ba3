//! Wine interface for detecting the runtime and building prefix-scoped commands

use crate::error::{AffinityError, Result};
use crate::runner::ToolCommand;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use which::which;

/// Runtime binaries tried in order when no override is configured
pub const RUNTIME_CANDIDATES: &[&str] = &["wine64", "wine"];

/// Component-apply tool
pub const COMPONENT_TOOL: &str = "winetricks";

/// Prefix architecture; the Affinity installers are 64-bit only
pub const PREFIX_ARCH: &str = "win64";

/// Wine installation used to configure and install into a prefix
#[derive(Debug, Clone)]
pub struct Wine {
    /// Path to wine binary
    pub wine_bin: PathBuf,

    /// Path to winetricks, when installed
    pub winetricks_bin: Option<PathBuf>,
}

impl Wine {
    /// Detect Wine installation, honoring an explicit binary override
    pub fn detect(override_bin: Option<&Path>) -> Result<Self> {
        let wine_bin = match override_bin {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(name) => which(name).map_err(|_| {
                AffinityError::ConfigInvalid(format!(
                    "configured wine binary {} not found in PATH",
                    name.display()
                ))
            })?,
            None => RUNTIME_CANDIDATES
                .iter()
                .find_map(|candidate| which(candidate).ok())
                .ok_or_else(|| {
                    AffinityError::ConfigInvalid(
                        "wine binary not found in PATH (install wine64 or set wine_binary)".into(),
                    )
                })?,
        };

        Ok(Self {
            wine_bin,
            winetricks_bin: which(COMPONENT_TOOL).ok(),
        })
    }

    /// Build from known paths without probing PATH
    pub fn with_binaries(wine_bin: impl Into<PathBuf>, winetricks_bin: Option<PathBuf>) -> Self {
        Self {
            wine_bin: wine_bin.into(),
            winetricks_bin,
        }
    }

    /// Get wine version string, e.g. "wine-9.0"
    pub fn version(&self) -> Result<String> {
        let output = Command::new(&self.wine_bin)
            .arg("--version")
            .output()
            .map_err(|e| AffinityError::CommandExecution {
                command: format!("{} --version", self.wine_bin.display()),
                error: e.to_string(),
            })?;

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            return Err(AffinityError::CommandExecution {
                command: format!("{} --version", self.wine_bin.display()),
                error: "returned empty output".into(),
            });
        }

        Ok(strip_version(&version))
    }

    /// Environment selecting the prefix for every invocation
    pub fn prefix_env(prefix: &Path) -> Vec<(String, String)> {
        vec![
            ("WINEPREFIX".to_string(), prefix.display().to_string()),
            ("WINEARCH".to_string(), PREFIX_ARCH.to_string()),
            ("WINEDEBUG".to_string(), "-all".to_string()),
        ]
    }

    /// `wine` scoped to `prefix`
    pub fn command(&self, prefix: &Path, timeout: Duration) -> ToolCommand {
        scoped(ToolCommand::new(&self.wine_bin, timeout), prefix)
    }

    /// `winetricks` scoped to `prefix`, running non-interactively
    pub fn winetricks(&self, prefix: &Path, timeout: Duration) -> Result<ToolCommand> {
        let bin = self.winetricks_bin.as_ref().ok_or_else(|| {
            AffinityError::ConfigInvalid(
                "winetricks is required to prepare the prefix but was not found in PATH".into(),
            )
        })?;
        Ok(scoped(ToolCommand::new(bin, timeout), prefix)
            .env("WINE", self.wine_bin.display().to_string())
            .env("W_OPT_UNATTENDED", "1"))
    }

    /// First-time prefix initialization
    pub fn wineboot_init(&self, prefix: &Path, timeout: Duration) -> ToolCommand {
        self.command(prefix, timeout).args(["wineboot", "--init"])
    }

    /// `<wine> <installer> [/quiet /norestart]`
    pub fn installer(
        &self,
        prefix: &Path,
        installer: &Path,
        silent: bool,
        timeout: Duration,
    ) -> ToolCommand {
        let cmd = self
            .command(prefix, timeout)
            .arg(installer.display().to_string());
        if silent {
            cmd.args(["/quiet", "/norestart"])
        } else {
            cmd
        }
    }
}

fn scoped(mut cmd: ToolCommand, prefix: &Path) -> ToolCommand {
    cmd.env.extend(Wine::prefix_env(prefix));
    cmd
}

/// Strip version string to just the number
/// e.g., "wine-8.0-rc2 (Staging)" -> "8.0"
fn strip_version(version: &str) -> String {
    let trimmed = version.trim_start_matches("wine-");
    let first = trimmed.split_whitespace().next().unwrap_or(trimmed);
    first.split("-rc").next().unwrap_or(first).to_string()
}
