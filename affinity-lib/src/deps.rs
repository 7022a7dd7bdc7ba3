//! Host dependency installation through the distribution's package manager

use crate::error::{AffinityError, Result};
use crate::runner::{ToolCommand, ToolRunner};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const OS_RELEASE: &str = "/etc/os-release";

/// Package-manager families with a known dependency table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFamily {
    Debian,
    Fedora,
    Arch,
    Suse,
}

impl PlatformFamily {
    /// Family from `/etc/os-release`, trying `ID` before each `ID_LIKE` entry
    pub fn from_os_release(content: &str) -> Option<Self> {
        let mut id = None;
        let mut id_like = Vec::new();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'').to_lowercase();
            match key.trim() {
                "ID" => id = Some(value),
                "ID_LIKE" => id_like = value.split_whitespace().map(str::to_string).collect(),
                _ => {}
            }
        }
        id.into_iter()
            .chain(id_like)
            .find_map(|candidate| Self::from_id(&candidate))
    }

    fn from_id(id: &str) -> Option<Self> {
        match id {
            "debian" | "ubuntu" | "linuxmint" | "elementary" | "pop" | "popos" | "deepin" => {
                Some(Self::Debian)
            }
            "fedora" | "rhel" | "centos" | "rocky" | "almalinux" => Some(Self::Fedora),
            "arch" | "manjaro" | "garuda" | "endeavouros" | "cachyos" | "artix" => Some(Self::Arch),
            "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "suse" => Some(Self::Suse),
            _ => None,
        }
    }

    /// Packages needed for a 64-bit Wine prefix
    pub fn packages(self) -> &'static [&'static str] {
        match self {
            Self::Debian => &[
                "wine",
                "wine64",
                "winetricks",
                "libvulkan1",
                "fontconfig",
                "fonts-dejavu",
                "fonts-liberation",
                "cabextract",
                "curl",
            ],
            Self::Fedora => &[
                "wine",
                "winetricks",
                "vulkan-loader",
                "mesa-libGL",
                "fontconfig",
                "dejavu-fonts",
                "liberation-fonts",
                "cabextract",
                "curl",
            ],
            Self::Arch => &[
                "wine",
                "winetricks",
                "vulkan-icd-loader",
                "mesa",
                "fontconfig",
                "ttf-dejavu",
                "ttf-liberation",
                "cabextract",
                "curl",
            ],
            Self::Suse => &[
                "wine",
                "winetricks",
                "Mesa",
                "fontconfig",
                "dejavu-fonts",
                "liberation-fonts",
                "cabextract",
                "curl",
            ],
        }
    }

    /// Non-interactive install command: program plus arguments before the package names
    fn install_command(self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::Debian => ("apt-get", &["install", "-y", "--no-install-recommends"]),
            Self::Fedora => ("dnf", &["install", "-y"]),
            Self::Arch => ("pacman", &["-S", "--needed", "--noconfirm"]),
            Self::Suse => ("zypper", &["--non-interactive", "install"]),
        }
    }
}

impl fmt::Display for PlatformFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debian => "debian",
            Self::Fedora => "fedora",
            Self::Arch => "arch",
            Self::Suse => "suse",
        };
        write!(f, "{}", name)
    }
}

/// Packages to install on the detected platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyPlan {
    pub platform: PlatformFamily,
    pub packages: Vec<String>,
}

/// Installs host packages before the prefix is touched
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    /// Detect the platform and decide what to install. Read-only.
    fn plan(&self) -> Result<DependencyPlan>;

    /// Install `names`; returns the package manager's exit code
    async fn install_packages(&self, platform: PlatformFamily, names: &[String]) -> Result<i32>;
}

/// Default installer: `/etc/os-release` lookup and the family's package manager
pub struct SystemPackages {
    runner: Arc<dyn ToolRunner>,
    os_release: PathBuf,
    timeout: Duration,
}

impl SystemPackages {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            os_release: PathBuf::from(OS_RELEASE),
            timeout: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_os_release(mut self, path: impl Into<PathBuf>) -> Self {
        self.os_release = path.into();
        self
    }

    fn command(&self, platform: PlatformFamily, names: &[String], as_root: bool) -> ToolCommand {
        let (program, args) = platform.install_command();
        let command = if as_root {
            ToolCommand::new(program, self.timeout).args(args.iter().copied())
        } else {
            ToolCommand::new("sudo", self.timeout)
                .args(["-n", program])
                .args(args.iter().copied())
        };
        let command = command.args(names.iter().cloned());
        match platform {
            PlatformFamily::Debian => command.env("DEBIAN_FRONTEND", "noninteractive"),
            _ => command,
        }
    }
}

#[async_trait]
impl DependencyInstaller for SystemPackages {
    fn plan(&self) -> Result<DependencyPlan> {
        let content = std::fs::read_to_string(&self.os_release).map_err(|e| {
            AffinityError::DependencyInstall(format!(
                "cannot read {}: {}",
                self.os_release.display(),
                e
            ))
        })?;
        let platform = PlatformFamily::from_os_release(&content).ok_or_else(|| {
            AffinityError::DependencyInstall(
                "unsupported distribution; install wine and winetricks manually and pass --skip-dependencies"
                    .into(),
            )
        })?;

        Ok(DependencyPlan {
            platform,
            packages: platform.packages().iter().map(|p| p.to_string()).collect(),
        })
    }

    async fn install_packages(&self, platform: PlatformFamily, names: &[String]) -> Result<i32> {
        if names.is_empty() {
            return Ok(0);
        }
        let as_root = rustix::process::geteuid().is_root();
        let command = self.command(platform, names, as_root);
        info!("Installing {} packages: {}", platform, command.display());

        let output = self.runner.run(&command).await?;
        if output.timed_out {
            return Err(AffinityError::DependencyInstall(output.failure_reason()));
        }
        Ok(output.exit_code.unwrap_or(-1))
    }
}
