//! Configuration management for affinity-cli
//!
//! Layers, lowest precedence first: built-in defaults, a config file under
//! `~/.config/affinity-cli/` (or `--config`), `AFFINITY_*` environment
//! variables, command-line overrides. The result is an immutable [`Config`]
//! handed to the orchestrator.

use crate::error::{AffinityError, Result};
use crate::profile::ProfileName;
use config::{Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const APP_DIR: &str = "affinity-cli";
const CONFIG_FILES: &[&str] = &["config.toml", "config.yaml", "config.yml", "config.json"];
const PERSISTED_URL_FILE: &str = "download_url.txt";

/// Installer file name inside the cache directory
pub const CACHED_INSTALLER_NAME: &str = "Affinity_Universal.exe";

/// Default minimum free space at prefix and cache paths (5 GiB)
/// Public page that redirects to, or links, the current universal installer
pub const DEFAULT_UPDATE_PAGE: &str = "https://store.serif.com/update/windows/universal/";

pub const DEFAULT_MIN_FREE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Default installed artifacts, relative to the prefix
pub const DEFAULT_EXPECTED_ARTIFACTS: &[&str] = &["drive_c/Program Files/Affinity/*/*.exe"];

const ENV_KEYS: &[&str] = &[
    "installers_path",
    "wine_prefix",
    "cache_dir",
    "state_dir",
    "profile",
    "windows_version",
    "silent",
    "download_url",
    "update_page",
    "sha256",
    "expected_size",
    "proxy",
    "wine_binary",
    "catalog",
    "expected_artifacts",
    "skip_dependencies",
    "skip_integration",
    "min_free_gb",
    "max_attempts",
    "connect_timeout_secs",
    "read_timeout_secs",
    "component_timeout_secs",
    "installer_timeout_secs",
];

const SUPPORTED_WINDOWS_VERSIONS: &[&str] = &["win10", "win11"];

/// Download behavior
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Attempts per fetch, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
    /// Longest stall between two received chunks
    pub read_timeout: Duration,
    /// Proxy URL applied to every attempt
    pub proxy: Option<String>,
    pub user_agent: String,
    /// Draw a progress bar
    pub progress: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1200),
            max_backoff: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            proxy: None,
            user_agent: format!("affinity-cli/{}", env!("CARGO_PKG_VERSION")),
            progress: false,
        }
    }
}

/// Resolved, immutable configuration for one invocation
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory searched for local Affinity installers
    pub installers_path: PathBuf,

    /// Wine prefix to configure and install into
    pub prefix_path: PathBuf,

    /// Download cache (owner-only permissions)
    pub cache_dir: PathBuf,

    /// Run-state checkpoints
    pub state_dir: PathBuf,

    /// User configuration directory
    pub config_dir: PathBuf,

    pub profile: ProfileName,

    /// Windows version applied to the prefix (win10 or win11)
    pub windows_version: String,

    /// Pass quiet switches to the installer
    pub silent: bool,

    /// Plan every phase without mutating anything
    pub dry_run: bool,

    /// Stop after preflight checks
    pub preflight_only: bool,

    pub download_url: Option<String>,

    /// Vendor page scraped for the installer link when nothing else is
    /// available; `None` disables the lookup
    pub update_page: Option<String>,

    /// Lowercase hex SHA-256 of the installer
    pub expected_sha256: Option<String>,

    pub expected_size: Option<u64>,

    /// Explicit wine binary (name or absolute path)
    pub wine_binary: Option<PathBuf>,

    /// Custom component catalog (JSON)
    pub catalog_path: Option<PathBuf>,

    /// Glob patterns, relative to the prefix, that must exist after install
    pub expected_artifacts: Vec<String>,

    pub skip_dependencies: bool,

    pub skip_integration: bool,

    pub min_free_bytes: u64,

    /// Timeout for each component apply
    pub component_timeout: Duration,

    /// Timeout for the installer run
    pub installer_timeout: Duration,

    pub network: NetworkSettings,
}

impl Config {
    /// Path the installer is downloaded to
    pub fn cached_installer_path(&self) -> PathBuf {
        self.cache_dir.join(CACHED_INSTALLER_NAME)
    }

    /// Run-state checkpoint file for this prefix
    pub fn checkpoint_path(&self) -> PathBuf {
        let name: String = self
            .prefix_path
            .to_string_lossy()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.state_dir.join(format!("run{}.json", name))
    }

    /// Remember an explicitly provided URL so later runs reuse it
    pub fn persist_download_url(&self, url: &str) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::write(self.config_dir.join(PERSISTED_URL_FILE), url.trim())?;
        info!("Stored download URL for future installs: {}", url);
        Ok(())
    }

    /// Read-only view used by `status`
    pub fn display_rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Installers path", self.installers_path.display().to_string()),
            ("Wine prefix", self.prefix_path.display().to_string()),
            ("Cache directory", self.cache_dir.display().to_string()),
            ("Profile", self.profile.to_string()),
            ("Windows version", self.windows_version.clone()),
            (
                "Download URL",
                self.download_url.clone().unwrap_or_else(|| "(local installer)".into()),
            ),
            (
                "Update page",
                self.update_page.clone().unwrap_or_else(|| "(disabled)".into()),
            ),
        ]
    }
}

/// Base directories before any user configuration is applied
#[derive(Debug, Clone)]
pub struct Defaults {
    pub installers_path: PathBuf,
    pub prefix_path: PathBuf,
    pub cache_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl Defaults {
    /// Standard XDG locations
    pub fn from_dirs() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| AffinityError::ConfigInvalid("Could not determine home directory".into()))?;
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| AffinityError::ConfigInvalid("Could not determine cache directory".into()))?
            .join(APP_DIR);
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join(APP_DIR);
        let state_dir = dirs::state_dir()
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| home.join(".local").join("state"))
            .join(APP_DIR);
        let installers_path = std::env::current_dir()
            .unwrap_or_else(|_| home.clone())
            .join("affinity-installers");

        Ok(Self {
            installers_path,
            prefix_path: home.join(".wine-affinity"),
            cache_dir,
            state_dir,
            config_dir,
        })
    }

    /// Every location under one root
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            installers_path: root.join("installers"),
            prefix_path: root.join("prefix"),
            cache_dir: root.join("cache"),
            state_dir: root.join("state"),
            config_dir: root.join("config"),
        }
    }
}

/// Values read from the config file and environment
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub installers_path: Option<PathBuf>,
    pub wine_prefix: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub profile: Option<String>,
    pub windows_version: Option<String>,
    pub silent: Option<bool>,
    pub download_url: Option<String>,
    /// Empty disables the update page lookup
    pub update_page: Option<String>,
    pub sha256: Option<String>,
    pub expected_size: Option<u64>,
    pub proxy: Option<String>,
    pub wine_binary: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub expected_artifacts: Option<Vec<String>>,
    pub skip_dependencies: Option<bool>,
    pub skip_integration: Option<bool>,
    pub min_free_gb: Option<u64>,
    pub max_attempts: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub component_timeout_secs: Option<u64>,
    pub installer_timeout_secs: Option<u64>,
}

/// Command-line values, highest precedence
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub installers_path: Option<PathBuf>,
    pub wine_prefix: Option<PathBuf>,
    pub profile: Option<ProfileName>,
    pub download_url: Option<String>,
    pub sha256: Option<String>,
    pub silent: Option<bool>,
    pub dry_run: bool,
    pub preflight_only: bool,
    pub skip_dependencies: Option<bool>,
    pub progress: bool,
}

/// Loads configuration from disk and environment
pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolve the full configuration for this invocation
    pub fn load(overrides: &ConfigOverrides) -> Result<Config> {
        let defaults = Defaults::from_dirs()?;
        let file = Self::read_layers(overrides.config_file.as_deref(), &defaults.config_dir)?;
        resolve(defaults, file, overrides, &ProxyEnv::from_process())
    }

    fn read_layers(explicit: Option<&Path>, config_dir: &Path) -> Result<FileConfig> {
        let mut builder = config::Config::builder();

        match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(AffinityError::ConfigInvalid(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                debug!("Loading configuration from {}", path.display());
                builder = builder.add_source(File::from(path));
            }
            None => {
                for name in CONFIG_FILES {
                    builder = builder.add_source(File::from(config_dir.join(name)).required(false));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("AFFINITY")
                .source(Some(affinity_env_vars()))
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("expected_artifacts"),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}

/// `AFFINITY_*` variables that name a known key; others (e.g. `AFFINITY_LOG`)
/// must not trip unknown-key rejection.
fn affinity_env_vars() -> config::Map<String, String> {
    std::env::vars()
        .filter(|(key, _)| {
            key.strip_prefix("AFFINITY_")
                .map(|rest| ENV_KEYS.contains(&rest.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect()
}

/// Proxy variables visible to this process
#[derive(Debug, Default, Clone)]
pub struct ProxyEnv {
    pub https_proxy: Option<String>,
    pub all_proxy: Option<String>,
}

impl ProxyEnv {
    pub fn from_process() -> Self {
        let var = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| std::env::var(n).ok())
                .filter(|v| !v.trim().is_empty())
        };
        Self {
            https_proxy: var(&["HTTPS_PROXY", "https_proxy"]),
            all_proxy: var(&["ALL_PROXY", "all_proxy"]),
        }
    }
}

/// Merge layers and validate into a [`Config`]
pub fn resolve(
    defaults: Defaults,
    file: FileConfig,
    overrides: &ConfigOverrides,
    proxy_env: &ProxyEnv,
) -> Result<Config> {
    let profile = match (overrides.profile, file.profile.as_deref()) {
        (Some(profile), _) => profile,
        (None, Some(raw)) => raw.parse()?,
        (None, None) => ProfileName::Standard,
    };

    let windows_version = file
        .windows_version
        .unwrap_or_else(|| "win11".to_string())
        .to_lowercase();
    if !SUPPORTED_WINDOWS_VERSIONS.contains(&windows_version.as_str()) {
        return Err(AffinityError::ConfigInvalid(format!(
            "windows_version must be one of {}",
            SUPPORTED_WINDOWS_VERSIONS.join(", ")
        )));
    }

    let download_url = overrides
        .download_url
        .clone()
        .or(file.download_url)
        .or_else(|| read_persisted_url(&defaults.config_dir));
    if let Some(url) = &download_url {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(AffinityError::ConfigInvalid(format!(
                "download URL must be http(s): {}",
                url
            )));
        }
    }

    let update_page = match file.update_page {
        Some(page) if page.trim().is_empty() => None,
        Some(page) => Some(page),
        None => Some(DEFAULT_UPDATE_PAGE.to_string()),
    };
    if let Some(page) = &update_page {
        if !(page.starts_with("https://") || page.starts_with("http://")) {
            return Err(AffinityError::ConfigInvalid(format!(
                "update page must be http(s): {}",
                page
            )));
        }
    }

    let expected_sha256 = overrides
        .sha256
        .clone()
        .or(file.sha256)
        .map(|s| normalize_sha256(&s))
        .transpose()?;

    let mut network = NetworkSettings {
        proxy: file
            .proxy
            .filter(|p| !p.trim().is_empty())
            .or_else(|| proxy_env.https_proxy.clone())
            .or_else(|| proxy_env.all_proxy.clone()),
        progress: overrides.progress,
        ..NetworkSettings::default()
    };
    if let Some(attempts) = file.max_attempts {
        if attempts == 0 {
            return Err(AffinityError::ConfigInvalid("max_attempts must be at least 1".into()));
        }
        network.max_attempts = attempts;
    }
    if let Some(secs) = file.connect_timeout_secs {
        network.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = file.read_timeout_secs {
        network.read_timeout = Duration::from_secs(secs);
    }

    let min_free_bytes = match file.min_free_gb {
        Some(gb) => gb.checked_mul(1024 * 1024 * 1024).ok_or_else(|| {
            AffinityError::ConfigInvalid(format!("min_free_gb {} is out of range", gb))
        })?,
        None => DEFAULT_MIN_FREE_BYTES,
    };

    Ok(Config {
        installers_path: overrides
            .installers_path
            .clone()
            .or(file.installers_path)
            .unwrap_or(defaults.installers_path),
        prefix_path: overrides
            .wine_prefix
            .clone()
            .or(file.wine_prefix)
            .unwrap_or(defaults.prefix_path),
        cache_dir: file.cache_dir.unwrap_or(defaults.cache_dir),
        state_dir: file.state_dir.unwrap_or(defaults.state_dir),
        config_dir: defaults.config_dir,
        profile,
        windows_version,
        silent: overrides.silent.or(file.silent).unwrap_or(true),
        dry_run: overrides.dry_run,
        preflight_only: overrides.preflight_only,
        download_url,
        update_page,
        expected_sha256,
        expected_size: file.expected_size,
        wine_binary: file.wine_binary,
        catalog_path: file.catalog,
        expected_artifacts: file.expected_artifacts.unwrap_or_else(|| {
            DEFAULT_EXPECTED_ARTIFACTS.iter().map(|s| s.to_string()).collect()
        }),
        skip_dependencies: overrides
            .skip_dependencies
            .or(file.skip_dependencies)
            .unwrap_or(false),
        skip_integration: file.skip_integration.unwrap_or(false),
        min_free_bytes,
        component_timeout: Duration::from_secs(file.component_timeout_secs.unwrap_or(30 * 60)),
        installer_timeout: Duration::from_secs(file.installer_timeout_secs.unwrap_or(30 * 60)),
        network,
    })
}

fn read_persisted_url(config_dir: &Path) -> Option<String> {
    std::fs::read_to_string(config_dir.join(PERSISTED_URL_FILE))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn normalize_sha256(raw: &str) -> Result<String> {
    let normalized = raw.trim().to_lowercase();
    if normalized.len() != 64 || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AffinityError::ConfigInvalid(format!(
            "sha256 must be 64 hex characters, got '{}'",
            raw
        )));
    }
    Ok(normalized)
}
