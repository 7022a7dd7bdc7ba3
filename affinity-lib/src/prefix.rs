//! Idempotent Wine prefix configuration
//!
//! A prefix carries a marker file listing the components already applied to
//! it. Configuring a profile only applies what the marker does not list yet,
//! in profile order, and rewrites the marker after every component so an
//! interrupted run resumes where it stopped.

use crate::error::{AffinityError, Result};
use crate::profile::{ComponentCatalog, ProfileName};
use crate::runner::ToolRunner;
use crate::state::write_atomic;
use crate::wine::{Wine, PREFIX_ARCH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Marker file name inside the prefix
pub const MARKER_FILE: &str = ".affinity_cli_prepared.json";

/// Component that applies the Windows version
const WINDOWS_VERSION_COMPONENT: &str = "winver";

/// What has been done to a prefix so far
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixMarker {
    pub windows_version: String,
    pub arch: String,
    /// Applied component ids, in the order they were applied
    #[serde(default)]
    pub applied: Vec<String>,
    /// Highest profile fully applied
    #[serde(default)]
    pub profile: Option<ProfileName>,
    /// Component whose apply started but never finished
    #[serde(default)]
    pub in_flight: Option<String>,
}

impl PrefixMarker {
    pub fn new(windows_version: &str) -> Self {
        Self {
            windows_version: windows_version.to_string(),
            arch: PREFIX_ARCH.to_string(),
            applied: Vec::new(),
            profile: None,
            in_flight: None,
        }
    }

    pub fn path(prefix: &Path) -> PathBuf {
        prefix.join(MARKER_FILE)
    }

    pub fn load(prefix: &Path) -> Result<Option<Self>> {
        let path = Self::path(prefix);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, prefix: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(&Self::path(prefix), content.as_bytes())?;
        Ok(())
    }

    pub fn is_applied(&self, id: &str) -> bool {
        self.applied.iter().any(|a| a == id)
    }

    /// Forget applies that cannot be trusted: an interrupted component, or
    /// the Windows version when a different one is requested
    fn reconcile(&mut self, windows_version: &str) {
        if let Some(interrupted) = self.in_flight.take() {
            warn!("Component {} was interrupted; it will be applied again", interrupted);
            self.applied.retain(|id| *id != interrupted);
        }
        if self.windows_version != windows_version {
            info!(
                "Windows version changes from {} to {}",
                self.windows_version, windows_version
            );
            self.applied.retain(|id| id != WINDOWS_VERSION_COMPONENT);
            self.windows_version = windows_version.to_string();
        }
    }
}

/// Outcome of [`PrefixConfigurator::ensure_profile`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedComponents {
    /// `wineboot --init` ran during this call
    pub initialized: bool,
    /// Components applied during this call
    pub applied: Vec<String>,
    /// Components of the profile that were already present
    pub already_present: Vec<String>,
}

/// Read-only preview of what `ensure_profile` would do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixPlan {
    pub initialize: bool,
    pub pending: Vec<String>,
    /// The prefix already reached a richer profile
    pub downgrade_from: Option<ProfileName>,
}

/// Applies component profiles to a prefix through the runtime and
/// component tool
pub struct PrefixConfigurator<'a> {
    runner: &'a dyn ToolRunner,
    wine: &'a Wine,
    catalog: &'a ComponentCatalog,
    windows_version: String,
    component_timeout: Duration,
    boot_timeout: Duration,
}

impl<'a> PrefixConfigurator<'a> {
    pub fn new(
        runner: &'a dyn ToolRunner,
        wine: &'a Wine,
        catalog: &'a ComponentCatalog,
        windows_version: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            wine,
            catalog,
            windows_version: windows_version.into(),
            component_timeout: Duration::from_secs(30 * 60),
            boot_timeout: Duration::from_secs(5 * 60),
        }
    }

    pub fn with_timeouts(mut self, component: Duration, boot: Duration) -> Self {
        self.component_timeout = component;
        self.boot_timeout = boot;
        self
    }

    /// Bring `prefix` up to `profile`. Safe to call repeatedly; only missing
    /// components are applied. Cancellation is observed between components.
    pub async fn ensure_profile(
        &self,
        prefix: &Path,
        profile: ProfileName,
        cancel: &CancellationToken,
    ) -> Result<AppliedComponents> {
        if cancel.is_cancelled() {
            return Err(AffinityError::Cancelled);
        }

        let mut outcome = AppliedComponents::default();
        let mut marker = if has_drive_c(prefix) {
            PrefixMarker::load(prefix)?.unwrap_or_else(|| PrefixMarker::new(&self.windows_version))
        } else {
            self.initialize(prefix).await?;
            outcome.initialized = true;
            PrefixMarker::new(&self.windows_version)
        };
        marker.reconcile(&self.windows_version);
        marker.save(prefix)?;

        if let Some(reached) = marker.profile.filter(|reached| *reached > profile) {
            warn!(
                "Prefix already has profile {}; downgrading to {} is not supported, nothing is removed",
                reached, profile
            );
        }

        let wanted = self.catalog.profile(profile);
        let pending = pending_components(wanted, &marker);
        outcome.already_present = wanted
            .iter()
            .filter(|id| marker.is_applied(id))
            .cloned()
            .collect();

        if pending.is_empty() {
            debug!("Prefix {} already satisfies profile {}", prefix.display(), profile);
        }

        for (index, id) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Stopping before {}: cancelled", id);
                return Err(AffinityError::Cancelled);
            }

            let component = self.catalog.component(id).ok_or_else(|| {
                AffinityError::ConfigInvalid(format!("unknown component '{}'", id))
            })?;
            let command = component.command(
                self.wine,
                prefix,
                &self.windows_version,
                self.component_timeout,
            )?;

            marker.in_flight = Some(id.clone());
            marker.save(prefix)?;

            info!("Applying {} ({}/{})", id, index + 1, pending.len());
            let result = self.runner.run(&command).await;

            marker.in_flight = None;
            let failure = match result {
                Ok(output) if output.success() => None,
                Ok(output) => Some(output.failure_reason()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                marker.save(prefix)?;
                return Err(AffinityError::ComponentApplyFailed {
                    component: id.clone(),
                    remaining: pending.len() - index,
                    reason,
                });
            }

            marker.applied.push(id.clone());
            marker.save(prefix)?;
            outcome.applied.push(id.clone());
        }

        if marker.profile.map_or(true, |reached| reached < profile) {
            marker.profile = Some(profile);
            marker.save(prefix)?;
        }

        Ok(outcome)
    }

    /// Same decisions as [`ensure_profile`](Self::ensure_profile) without
    /// touching the prefix or running anything
    pub fn plan(&self, prefix: &Path, profile: ProfileName) -> Result<PrefixPlan> {
        let wanted = self.catalog.profile(profile);
        if !has_drive_c(prefix) {
            return Ok(PrefixPlan {
                initialize: true,
                pending: wanted.to_vec(),
                downgrade_from: None,
            });
        }

        let mut marker =
            PrefixMarker::load(prefix)?.unwrap_or_else(|| PrefixMarker::new(&self.windows_version));
        marker.reconcile(&self.windows_version);
        Ok(PrefixPlan {
            initialize: false,
            pending: pending_components(wanted, &marker),
            downgrade_from: marker.profile.filter(|reached| *reached > profile),
        })
    }

    async fn initialize(&self, prefix: &Path) -> Result<()> {
        std::fs::create_dir_all(prefix)?;
        let command = self.wine.wineboot_init(prefix, self.boot_timeout);
        info!("Initializing Wine prefix at {}", prefix.display());

        let output = self.runner.run(&command).await?;
        if !output.success() || !has_drive_c(prefix) {
            return Err(AffinityError::CommandExecution {
                command: command.display(),
                error: if output.success() {
                    "prefix has no drive_c after wineboot".to_string()
                } else {
                    output.failure_reason()
                },
            });
        }
        Ok(())
    }
}

fn has_drive_c(prefix: &Path) -> bool {
    prefix.join("drive_c").is_dir()
}

fn pending_components(wanted: &[String], marker: &PrefixMarker) -> Vec<String> {
    wanted
        .iter()
        .filter(|id| !marker.is_applied(id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;

    fn wine() -> Wine {
        Wine::with_binaries("/usr/bin/wine64", Some("/usr/bin/winetricks".into()))
    }

    fn ids(catalog: &ComponentCatalog, profile: ProfileName) -> Vec<String> {
        catalog.profile(profile).to_vec()
    }

    #[tokio::test]
    async fn fresh_prefix_is_initialized_and_configured() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let runner = FakeRunner::new();
        let wine = wine();
        let catalog = ComponentCatalog::builtin();
        let configurator = PrefixConfigurator::new(&runner, &wine, &catalog, "win11");

        let outcome = configurator
            .ensure_profile(&prefix, ProfileName::Standard, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.initialized);
        assert_eq!(outcome.applied, ids(&catalog, ProfileName::Standard));
        assert_eq!(runner.count_matching("wineboot"), 1);
        assert_eq!(
            runner.applied_components(),
            vec!["win11", "corefonts", "tahoma", "crypt32", "d3dcompiler_47", "vcrun2022"]
        );

        let marker = PrefixMarker::load(&prefix).unwrap().unwrap();
        assert_eq!(marker.applied, ids(&catalog, ProfileName::Standard));
        assert_eq!(marker.profile, Some(ProfileName::Standard));
        assert_eq!(marker.arch, "win64");
        assert_eq!(marker.in_flight, None);
    }

    #[tokio::test]
    async fn second_run_applies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let runner = FakeRunner::new();
        let wine = wine();
        let catalog = ComponentCatalog::builtin();
        let configurator = PrefixConfigurator::new(&runner, &wine, &catalog, "win11");
        let cancel = CancellationToken::new();

        configurator
            .ensure_profile(&prefix, ProfileName::Standard, &cancel)
            .await
            .unwrap();
        let calls = runner.calls().len();
        let before = PrefixMarker::load(&prefix).unwrap();

        let outcome = configurator
            .ensure_profile(&prefix, ProfileName::Standard, &cancel)
            .await
            .unwrap();

        assert!(outcome.applied.is_empty());
        assert!(!outcome.initialized);
        assert_eq!(runner.calls().len(), calls);
        assert_eq!(PrefixMarker::load(&prefix).unwrap(), before);
    }

    #[tokio::test]
    async fn upgrade_applies_only_the_difference_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let runner = FakeRunner::new();
        let wine = wine();
        let catalog = ComponentCatalog::builtin();
        let configurator = PrefixConfigurator::new(&runner, &wine, &catalog, "win11");
        let cancel = CancellationToken::new();

        configurator
            .ensure_profile(&prefix, ProfileName::Minimal, &cancel)
            .await
            .unwrap();
        let outcome = configurator
            .ensure_profile(&prefix, ProfileName::Full, &cancel)
            .await
            .unwrap();

        assert_eq!(
            outcome.applied,
            vec!["vcrun2022", "dotnet48", "dxvk", "vkd3d", "remove_mono"]
        );
        assert_eq!(outcome.already_present, ids(&catalog, ProfileName::Minimal));
        let marker = PrefixMarker::load(&prefix).unwrap().unwrap();
        assert_eq!(marker.applied, ids(&catalog, ProfileName::Full));
        assert_eq!(marker.profile, Some(ProfileName::Full));
    }

    #[tokio::test]
    async fn failure_halts_and_keeps_earlier_components() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let wine = wine();
        let catalog = ComponentCatalog::builtin();
        let cancel = CancellationToken::new();

        let failing = FakeRunner::new();
        failing.fail_always("tahoma", 1);
        let err = PrefixConfigurator::new(&failing, &wine, &catalog, "win11")
            .ensure_profile(&prefix, ProfileName::Standard, &cancel)
            .await
            .unwrap_err();

        match err {
            AffinityError::ComponentApplyFailed {
                component,
                remaining,
                reason,
            } => {
                assert_eq!(component, "tahoma");
                assert_eq!(remaining, 4);
                assert!(reason.starts_with("exit code 1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(failing.applied_components(), vec!["win11", "corefonts", "tahoma"]);
        let marker = PrefixMarker::load(&prefix).unwrap().unwrap();
        assert_eq!(marker.applied, vec!["winver", "corefonts"]);
        assert_eq!(marker.profile, None);

        let healthy = FakeRunner::new();
        let outcome = PrefixConfigurator::new(&healthy, &wine, &catalog, "win11")
            .ensure_profile(&prefix, ProfileName::Standard, &cancel)
            .await
            .unwrap();
        assert_eq!(
            outcome.applied,
            vec!["tahoma", "crypt32", "d3dcompiler_47", "vcrun2022"]
        );
        assert_eq!(healthy.count_matching("wineboot"), 0);
    }

    #[tokio::test]
    async fn interrupted_component_is_applied_again() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        std::fs::create_dir_all(prefix.join("drive_c")).unwrap();
        let mut marker = PrefixMarker::new("win11");
        marker.applied = vec!["winver".into(), "corefonts".into(), "tahoma".into()];
        marker.in_flight = Some("tahoma".into());
        marker.save(&prefix).unwrap();

        let runner = FakeRunner::new();
        let wine = wine();
        let catalog = ComponentCatalog::builtin();
        let outcome = PrefixConfigurator::new(&runner, &wine, &catalog, "win11")
            .ensure_profile(&prefix, ProfileName::Minimal, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.applied, vec!["tahoma", "crypt32", "d3dcompiler_47"]);
    }

    #[tokio::test]
    async fn downgrade_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let runner = FakeRunner::new();
        let wine = wine();
        let catalog = ComponentCatalog::builtin();
        let configurator = PrefixConfigurator::new(&runner, &wine, &catalog, "win11");
        let cancel = CancellationToken::new();

        configurator
            .ensure_profile(&prefix, ProfileName::Full, &cancel)
            .await
            .unwrap();
        let calls = runner.calls().len();

        let plan = configurator.plan(&prefix, ProfileName::Minimal).unwrap();
        assert_eq!(plan.downgrade_from, Some(ProfileName::Full));
        assert!(plan.pending.is_empty());

        configurator
            .ensure_profile(&prefix, ProfileName::Minimal, &cancel)
            .await
            .unwrap();
        assert_eq!(runner.calls().len(), calls);
        let marker = PrefixMarker::load(&prefix).unwrap().unwrap();
        assert_eq!(marker.profile, Some(ProfileName::Full));
        assert_eq!(marker.applied, ids(&catalog, ProfileName::Full));
    }

    #[tokio::test]
    async fn windows_version_change_reapplies_winver() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let runner = FakeRunner::new();
        let wine = wine();
        let catalog = ComponentCatalog::builtin();
        let cancel = CancellationToken::new();

        PrefixConfigurator::new(&runner, &wine, &catalog, "win11")
            .ensure_profile(&prefix, ProfileName::Minimal, &cancel)
            .await
            .unwrap();
        let outcome = PrefixConfigurator::new(&runner, &wine, &catalog, "win10")
            .ensure_profile(&prefix, ProfileName::Minimal, &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.applied, vec!["winver"]);
        assert_eq!(runner.applied_components().last().unwrap(), "win10");
        let marker = PrefixMarker::load(&prefix).unwrap().unwrap();
        assert_eq!(marker.windows_version, "win10");
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let runner = FakeRunner::new();
        let wine = wine();
        let catalog = ComponentCatalog::builtin();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = PrefixConfigurator::new(&runner, &wine, &catalog, "win11")
            .ensure_profile(&prefix, ProfileName::Minimal, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(runner.calls().is_empty());
        assert!(!prefix.exists());
    }

    #[test]
    fn plan_on_missing_prefix_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        let runner = FakeRunner::new();
        let wine = wine();
        let catalog = ComponentCatalog::builtin();

        let plan = PrefixConfigurator::new(&runner, &wine, &catalog, "win11")
            .plan(&prefix, ProfileName::Standard)
            .unwrap();

        assert!(plan.initialize);
        assert_eq!(plan.pending, ids(&catalog, ProfileName::Standard));
        assert!(!prefix.exists());
        assert!(runner.calls().is_empty());
    }
}
