//! Installation orchestration
//!
//! Drives a run through Preflight, DependencyInstall, PrefixSetup, Download,
//! Install, Verify and Integrate. Each phase is entered only once all earlier
//! phases are satisfied; transient failures are retried up to the phase's
//! attempt ceiling and the run state is checkpointed at every boundary.

use crate::config::Config;
use crate::deps::{DependencyInstaller, SystemPackages};
use crate::download::{sha256_file, DownloadManager, DownloadTask};
use crate::error::{AffinityError, Result};
use crate::guardrail::{run_checks, GuardrailContext, GuardrailReport};
use crate::installer;
use crate::integrate::{DesktopEntries, DesktopIntegrator};
use crate::lock::ExclusiveLock;
use crate::prefix::{PrefixConfigurator, PrefixMarker};
use crate::profile::{ComponentCatalog, ProfileName};
use crate::runner::{SystemRunner, ToolRunner};
use crate::state::{Phase, RunState};
use crate::verify;
use crate::wine::Wine;
use std::ffi::OsString;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout for `wineboot --init`
const BOOT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// External collaborators, swappable for tests
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn ToolRunner>,
    pub dependencies: Arc<dyn DependencyInstaller>,
    pub integrator: Arc<dyn DesktopIntegrator>,
    /// Resolved lazily from `Config::wine_binary` when absent
    pub wine: Option<Wine>,
    /// Replaces `PATH` for preflight binary lookups
    pub search_path: Option<OsString>,
}

impl Collaborators {
    /// Real processes, the host package manager and `~/.local/share/applications`
    pub fn system() -> Result<Self> {
        let runner: Arc<dyn ToolRunner> = Arc::new(SystemRunner);
        let integrator = DesktopEntries::user_default().ok_or_else(|| {
            AffinityError::ConfigInvalid("Could not determine data directory".into())
        })?;
        Ok(Self {
            dependencies: Arc::new(SystemPackages::new(runner.clone())),
            integrator: Arc::new(integrator),
            runner,
            wine: None,
            search_path: None,
        })
    }
}

/// An action a dry run would take
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub phase: Phase,
    pub action: String,
}

/// Why a run stopped
#[derive(Debug)]
pub struct RunFailure {
    pub phase: Phase,
    pub error: AffinityError,
}

impl RunFailure {
    /// Suggestion printed after the failure
    pub fn hint(&self) -> Option<&'static str> {
        match (&self.error, self.phase) {
            (AffinityError::Cancelled, _) => Some("Re-run the same command to resume."),
            (AffinityError::Busy(_), _) => Some("Wait for the other run to finish."),
            (_, Phase::Download) => Some("Re-run to resume the download from where it stopped."),
            (_, Phase::PrefixSetup) => {
                Some("Re-run to resume; components already applied are kept.")
            }
            (_, Phase::Install) | (_, Phase::Verify) => {
                Some("Run `affinity-cli repair` to re-check the prefix without downloading again.")
            }
            _ => None,
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.error)
    }
}

/// Result of [`Orchestrator::run`] or [`Orchestrator::repair`]
#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    pub report: Option<GuardrailReport>,
    /// Planned actions (dry run only)
    pub plan: Vec<PlannedStep>,
    /// Verified artifacts
    pub artifacts: Vec<PathBuf>,
    pub failure: Option<RunFailure>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        match &self.failure {
            None => 0,
            Some(failure) => match failure.error {
                AffinityError::Cancelled => 130,
                AffinityError::Busy(_) => 1,
                _ => failure.phase.exit_code(),
            },
        }
    }
}

/// Read-only snapshot for `status`
#[derive(Debug)]
pub struct StatusReport {
    pub settings: Vec<(&'static str, String)>,
    pub marker: Option<PrefixMarker>,
    pub checkpoint: Option<RunState>,
    pub installer_cached: bool,
}

/// Inspect configuration, prefix marker and last checkpoint
pub fn inspect(config: &Config) -> Result<StatusReport> {
    Ok(StatusReport {
        settings: config.display_rows(),
        marker: PrefixMarker::load(&config.prefix_path)?,
        checkpoint: RunState::load_optional(&config.checkpoint_path())?,
        installer_cached: config.cached_installer_path().is_file(),
    })
}

/// Runs installations and repairs for one configuration
pub struct Orchestrator {
    config: Config,
    catalog: ComponentCatalog,
    tools: Collaborators,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config, tools: Collaborators, cancel: CancellationToken) -> Result<Self> {
        let catalog = match &config.catalog_path {
            Some(path) => ComponentCatalog::load_from_file(path)?,
            None => ComponentCatalog::builtin(),
        };
        Ok(Self {
            config,
            catalog,
            tools,
            cancel,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Full installation
    pub async fn run(&self) -> RunOutcome {
        let mut state = RunState::new(
            self.config.profile,
            self.config.prefix_path.clone(),
            self.config.cached_installer_path(),
        );
        // Carry attempt counters over from the previous run on this prefix
        if let Ok(Some(previous)) = RunState::load_optional(&self.config.checkpoint_path()) {
            if previous.prefix_path == state.prefix_path {
                for (phase, record) in previous.phases {
                    state.phases.entry(phase).or_default().attempts = record.attempts;
                }
            }
        }
        state.artifact_url = self.config.download_url.clone();

        Run::new(self, state, false).execute().await
    }

    /// Re-check a previously installed prefix without downloading again
    pub async fn repair(&self) -> RunOutcome {
        let loaded = RunState::load_optional(&self.config.checkpoint_path());
        let state = match loaded {
            Ok(Some(state)) => state,
            Ok(None) => {
                let state = RunState::new(
                    self.config.profile,
                    self.config.prefix_path.clone(),
                    self.config.cached_installer_path(),
                );
                let error = AffinityError::ConfigInvalid(format!(
                    "no previous install recorded for {}; run install first",
                    self.config.prefix_path.display()
                ));
                return Run::new(self, state, true).finish(Some(RunFailure {
                    phase: Phase::Preflight,
                    error,
                }));
            }
            Err(error) => {
                let state = RunState::new(
                    self.config.profile,
                    self.config.prefix_path.clone(),
                    self.config.cached_installer_path(),
                );
                return Run::new(self, state, true).finish(Some(RunFailure {
                    phase: Phase::Preflight,
                    error,
                }));
            }
        };

        if !state.is_satisfied(Phase::Download) || !state.cache_path.is_file() {
            let error = AffinityError::ConfigInvalid(format!(
                "installer {} is not cached; run install to download it",
                state.cache_path.display()
            ));
            return Run::new(self, state, true).finish(Some(RunFailure {
                phase: Phase::Download,
                error,
            }));
        }

        Run::new(self, state, true).execute().await
    }
}

/// Mutable state of one `run`/`repair` call
struct Run<'a> {
    orch: &'a Orchestrator,
    state: RunState,
    repair: bool,
    report: Option<GuardrailReport>,
    plan: Vec<PlannedStep>,
    artifacts: Vec<PathBuf>,
    wine: Option<Wine>,
    locks: Vec<ExclusiveLock>,
}

impl<'a> Run<'a> {
    fn new(orch: &'a Orchestrator, state: RunState, repair: bool) -> Self {
        Self {
            orch,
            state,
            repair,
            report: None,
            plan: Vec::new(),
            artifacts: Vec::new(),
            wine: None,
            locks: Vec::new(),
        }
    }

    fn config(&self) -> &'a Config {
        &self.orch.config
    }

    fn profile(&self) -> ProfileName {
        // Repair restores what the recorded run installed
        if self.repair {
            self.state.profile
        } else {
            self.config().profile
        }
    }

    async fn execute(mut self) -> RunOutcome {
        if let Err(failure) = self.step(Phase::Preflight).await {
            return self.finish(Some(failure));
        }

        if self.config().preflight_only {
            info!("Preflight passed; stopping as requested");
            return self.finish(None);
        }

        if self.config().dry_run {
            self.plan_remaining();
            return self.finish(None);
        }

        if let Err(error) = self.acquire_locks() {
            return self.finish(Some(RunFailure {
                phase: Phase::Preflight,
                error,
            }));
        }
        self.checkpoint();

        let phases: Vec<Phase> = if self.repair {
            self.state.reset_from(Phase::PrefixSetup);
            Phase::PIPELINE
                .into_iter()
                .filter(|p| *p >= Phase::PrefixSetup)
                .collect()
        } else {
            Phase::PIPELINE[1..].to_vec()
        };

        for phase in phases {
            if let Err(failure) = self.step(phase).await {
                return self.finish(Some(failure));
            }
        }

        info!("Affinity is installed in {}", self.config().prefix_path.display());
        self.finish(None)
    }

    /// Enter `phase` and retry it while its error is transient and the
    /// ceiling allows
    async fn step(&mut self, phase: Phase) -> std::result::Result<(), RunFailure> {
        let mut tries = 0;
        loop {
            if self.orch.cancel.is_cancelled() {
                self.state.fail(phase, "cancelled");
                self.checkpoint();
                return Err(RunFailure {
                    phase,
                    error: AffinityError::Cancelled,
                });
            }

            tries += 1;
            if let Err(error) = self.state.begin(phase) {
                return Err(RunFailure { phase, error });
            }
            self.checkpoint();
            info!("Phase {}", phase);

            match self.execute_phase(phase).await {
                Ok(note) => {
                    if let Some(note) = &note {
                        info!("{}: {}", phase, note);
                    }
                    self.state.satisfy(phase, note);
                    self.checkpoint();
                    return Ok(());
                }
                Err(error) => {
                    self.state.fail(phase, error.to_string());
                    let retry = error.is_retryable()
                        && tries < phase.attempt_ceiling()
                        && !self.orch.cancel.is_cancelled();
                    if retry {
                        warn!(
                            "{} failed (attempt {}/{}): {}; retrying",
                            phase,
                            tries,
                            phase.attempt_ceiling(),
                            error
                        );
                        continue;
                    }
                    self.checkpoint();
                    return Err(RunFailure { phase, error });
                }
            }
        }
    }

    async fn execute_phase(&mut self, phase: Phase) -> Result<Option<String>> {
        match phase {
            Phase::Preflight => self.preflight().await,
            Phase::DependencyInstall => self.install_dependencies().await,
            Phase::PrefixSetup => self.setup_prefix().await,
            Phase::Download => self.obtain_installer().await,
            Phase::Install => self.run_installer().await,
            Phase::Verify => self.verify(),
            Phase::Integrate => self.integrate(),
            Phase::Done | Phase::Failed => Ok(None),
        }
    }

    async fn preflight(&mut self) -> Result<Option<String>> {
        let mut ctx = GuardrailContext::from_config(self.config());
        ctx.search_path = self.orch.tools.search_path.clone();

        let report = run_checks(&ctx).await;
        let passed = report.checks.iter().filter(|c| c.passed).count();
        let advisories = report.failures().count();
        let blocking = report.to_error();
        self.report = Some(report);

        match blocking {
            Some(error) => Err(error),
            None => Ok(Some(format!(
                "{} checks passed, {} warning(s)",
                passed, advisories
            ))),
        }
    }

    async fn install_dependencies(&mut self) -> Result<Option<String>> {
        if self.config().skip_dependencies {
            return Ok(Some("skipped".into()));
        }
        let deps = &self.orch.tools.dependencies;
        let plan = deps.plan()?;
        let code = deps.install_packages(plan.platform, &plan.packages).await?;
        if code != 0 {
            return Err(AffinityError::DependencyInstall(format!(
                "package manager exited with code {}",
                code
            )));
        }
        Ok(Some(format!(
            "{} packages ensured on {}",
            plan.packages.len(),
            plan.platform
        )))
    }

    async fn setup_prefix(&mut self) -> Result<Option<String>> {
        let wine = self.wine()?;
        let config = self.config();
        let configurator = PrefixConfigurator::new(
            self.orch.tools.runner.as_ref(),
            &wine,
            &self.orch.catalog,
            config.windows_version.as_str(),
        )
        .with_timeouts(config.component_timeout, BOOT_TIMEOUT);

        let outcome = configurator
            .ensure_profile(&config.prefix_path, self.profile(), &self.orch.cancel)
            .await?;
        Ok(Some(format!(
            "{} component(s) applied, {} already present",
            outcome.applied.len(),
            outcome.already_present.len()
        )))
    }

    async fn obtain_installer(&mut self) -> Result<Option<String>> {
        let config = self.config();

        if self.repair {
            let cached = self.state.cache_path.clone();
            if !cached.is_file() {
                return Err(AffinityError::ConfigInvalid(format!(
                    "installer {} disappeared; run install to download it again",
                    cached.display()
                )));
            }
            return Ok(Some(format!("reusing {}", cached.display())));
        }

        if let Some(url) = &config.download_url {
            prepare_cache_dir(&config.cache_dir)?;
            let task = DownloadTask::new(url.as_str(), config.cached_installer_path())
                .with_sha256(config.expected_sha256.clone())
                .with_size(config.expected_size);
            let path = DownloadManager::new(config.network.clone())
                .fetch(&task, &self.orch.cancel)
                .await?;
            if let Err(e) = config.persist_download_url(url) {
                warn!("Could not remember download URL: {}", e);
            }
            self.state.cache_path = path.clone();
            return Ok(Some(format!("downloaded to {}", path.display())));
        }

        let Some(candidate) = installer::discover(&config.installers_path)? else {
            return self.download_from_update_page().await;
        };
        if let Some(expected) = &config.expected_sha256 {
            let got = sha256_file(&candidate.path).await?;
            if &got != expected {
                return Err(AffinityError::ChecksumMismatch {
                    expected: expected.clone(),
                    got,
                });
            }
        }
        self.state.cache_path = candidate.path.clone();
        Ok(Some(format!(
            "using local installer {} ({})",
            candidate.path.display(),
            candidate.version_string()
        )))
    }

    /// Last resort when neither a URL nor a local installer is available
    async fn download_from_update_page(&mut self) -> Result<Option<String>> {
        let config = self.config();
        let Some(page) = &config.update_page else {
            return Err(AffinityError::ConfigInvalid(format!(
                "no Affinity installer found in {} and no download URL configured",
                config.installers_path.display()
            )));
        };

        let manager = DownloadManager::new(config.network.clone());
        let url = manager
            .resolve_update_page(page, &self.orch.cancel)
            .await?
            .ok_or_else(|| {
                AffinityError::ConfigInvalid(format!(
                    "no Affinity installer found in {} and no download link on {}; pass --url",
                    config.installers_path.display(),
                    page
                ))
            })?;
        info!("Found installer {} on {}", url, page);

        prepare_cache_dir(&config.cache_dir)?;
        let task = DownloadTask::new(url.as_str(), config.cached_installer_path())
            .with_sha256(config.expected_sha256.clone())
            .with_size(config.expected_size);
        let path = manager.fetch(&task, &self.orch.cancel).await?;
        self.state.cache_path = path.clone();
        self.state.artifact_url = Some(url.clone());
        Ok(Some(format!(
            "downloaded {} (from update page) to {}",
            url,
            path.display()
        )))
    }

    async fn run_installer(&mut self) -> Result<Option<String>> {
        let config = self.config();
        if self.repair && verify::verify(&config.prefix_path, &config.expected_artifacts).is_ok() {
            return Ok(Some("artifacts present; installer not re-run".into()));
        }

        let installer = self.state.cache_path.clone();
        if !installer.is_file() {
            return Err(AffinityError::InstallFailed(format!(
                "installer {} is missing",
                installer.display()
            )));
        }

        let wine = self.wine()?;
        let command = wine.installer(
            &config.prefix_path,
            &installer,
            config.silent,
            config.installer_timeout,
        );
        info!("Running installer {}", installer.display());
        let output = self
            .orch
            .tools
            .runner
            .run(&command)
            .await
            .map_err(|e| AffinityError::InstallFailed(e.to_string()))?;
        if !output.success() {
            return Err(AffinityError::InstallFailed(output.failure_reason()));
        }
        debug!("Installer finished: {}", output.stdout.trim());
        Ok(Some("installer exited successfully".into()))
    }

    fn verify(&mut self) -> Result<Option<String>> {
        let config = self.config();
        self.artifacts = verify::verify(&config.prefix_path, &config.expected_artifacts)?;
        Ok(Some(format!("{} artifact(s) present", self.artifacts.len())))
    }

    fn integrate(&mut self) -> Result<Option<String>> {
        let config = self.config();
        if config.skip_integration {
            return Ok(Some("skipped".into()));
        }
        let wine = self.wine()?;
        let executables = verify::matching(&config.prefix_path, &config.expected_artifacts);
        let written = self.orch.tools.integrator.integrate(
            &config.prefix_path,
            &wine.wine_bin,
            &executables,
        )?;
        Ok(Some(format!("{} desktop entr(y/ies) written", written.len())))
    }

    /// Dry run: describe every phase after Preflight without doing it
    fn plan_remaining(&mut self) {
        let config = self.config();
        let mut steps = Vec::new();

        let deps = if config.skip_dependencies {
            "would skip dependency installation".to_string()
        } else {
            match self.orch.tools.dependencies.plan() {
                Ok(plan) => format!(
                    "would install {} packages on {}: {}",
                    plan.packages.len(),
                    plan.platform,
                    plan.packages.join(" ")
                ),
                Err(e) => format!("cannot plan dependency installation: {}", e),
            }
        };
        steps.push((Phase::DependencyInstall, deps));

        let wine = self.wine();
        let prefix = match &wine {
            Ok(wine) => {
                let configurator = PrefixConfigurator::new(
                    self.orch.tools.runner.as_ref(),
                    wine,
                    &self.orch.catalog,
                    config.windows_version.as_str(),
                );
                match configurator.plan(&config.prefix_path, self.profile()) {
                    Ok(plan) => {
                        let mut action = String::new();
                        if plan.initialize {
                            action.push_str(&format!(
                                "would initialize {} with wineboot; ",
                                config.prefix_path.display()
                            ));
                        }
                        if let Some(reached) = plan.downgrade_from {
                            action.push_str(&format!(
                                "prefix already has profile {}, nothing removed; ",
                                reached
                            ));
                        }
                        if plan.pending.is_empty() {
                            action.push_str("no components to apply");
                        } else {
                            action.push_str(&format!(
                                "would apply {}",
                                plan.pending.join(", ")
                            ));
                        }
                        action
                    }
                    Err(e) => format!("cannot read prefix state: {}", e),
                }
            }
            Err(e) => format!("cannot plan prefix setup: {}", e),
        };
        steps.push((Phase::PrefixSetup, prefix));

        let cached = config.cached_installer_path();
        let (download, installer_path) = match &config.download_url {
            _ if self.repair => (
                format!("would reuse {}", self.state.cache_path.display()),
                self.state.cache_path.clone(),
            ),
            Some(url) if cached.is_file() => (
                format!("would verify cached {} (source {})", cached.display(), url),
                cached,
            ),
            Some(url) => (
                format!("would download {} to {}", url, cached.display()),
                cached,
            ),
            None => match installer::discover(&config.installers_path) {
                Ok(Some(candidate)) => (
                    format!("would use local installer {}", candidate.path.display()),
                    candidate.path,
                ),
                Ok(None) => match &config.update_page {
                    Some(page) => (
                        format!(
                            "no installer in {}; would look up the download link on {} and save it to {}",
                            config.installers_path.display(),
                            page,
                            cached.display()
                        ),
                        cached,
                    ),
                    None => (
                        format!(
                            "no installer in {} and no download URL configured",
                            config.installers_path.display()
                        ),
                        cached,
                    ),
                },
                Err(e) => (format!("cannot search for installers: {}", e), cached),
            },
        };
        steps.push((Phase::Download, download));

        let install = match &wine {
            Ok(wine) => format!(
                "would run {}",
                wine.installer(
                    &config.prefix_path,
                    &installer_path,
                    config.silent,
                    config.installer_timeout
                )
                .display()
            ),
            Err(e) => format!("cannot plan installer run: {}", e),
        };
        steps.push((Phase::Install, install));

        steps.push((
            Phase::Verify,
            format!("would check {}", config.expected_artifacts.join(", ")),
        ));
        let integrate = if config.skip_integration {
            "would skip desktop integration".to_string()
        } else {
            let installed = verify::matching(&config.prefix_path, &config.expected_artifacts);
            let entries = self.orch.tools.integrator.plan(&installed);
            if entries.is_empty() {
                "would create desktop entries for installed products".to_string()
            } else {
                let names: Vec<String> = entries.iter().map(|p| p.display().to_string()).collect();
                format!("would write {}", names.join(", "))
            }
        };
        steps.push((Phase::Integrate, integrate));

        for (phase, action) in steps {
            info!("[dry-run] {}: {}", phase, action);
            self.plan.push(PlannedStep { phase, action });
        }
    }

    fn wine(&mut self) -> Result<Wine> {
        if let Some(wine) = &self.wine {
            return Ok(wine.clone());
        }
        let wine = match &self.orch.tools.wine {
            Some(wine) => wine.clone(),
            None => Wine::detect(self.config().wine_binary.as_deref())?,
        };
        self.wine = Some(wine.clone());
        Ok(wine)
    }

    fn acquire_locks(&mut self) -> Result<()> {
        let config = self.config();
        prepare_cache_dir(&config.cache_dir)?;
        self.locks
            .push(ExclusiveLock::acquire(&ExclusiveLock::prefix_lock_path(&config.prefix_path))?);
        self.locks
            .push(ExclusiveLock::acquire(&ExclusiveLock::cache_lock_path(&config.cache_dir))?);
        Ok(())
    }

    /// Persist state; only while this run holds the locks
    fn checkpoint(&self) {
        if self.locks.is_empty() || self.config().dry_run {
            return;
        }
        if let Err(e) = self.state.save(&self.config().checkpoint_path()) {
            warn!("Could not save checkpoint: {}", e);
        }
    }

    fn finish(self, failure: Option<RunFailure>) -> RunOutcome {
        if let Some(failure) = &failure {
            warn!("{}", failure);
        }
        RunOutcome {
            state: self.state,
            report: self.report,
            plan: self.plan,
            artifacts: self.artifacts,
            failure,
        }
    }
}

/// Create the cache directory owner-only, or tighten an existing one we own
fn prepare_cache_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
