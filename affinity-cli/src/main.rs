//! Affinity CLI

use affinity_lib::integrate::DesktopEntries;
use affinity_lib::{
    discover_all, inspect, uninstall, CheckSeverity, Collaborators, Config, ConfigLoader,
    ConfigOverrides, GuardrailReport, Orchestrator, Phase, ProfileName, RunOutcome, Wine,
};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "affinity-cli")]
#[command(about = "Unattended Affinity installation into a dedicated Wine prefix")]
#[command(version)]
#[command(long_about = r#"Affinity CLI - provisions a Wine prefix and installs Affinity

Runs host checks, installs missing packages, prepares the prefix with the
components of the chosen profile, downloads (or finds) the Affinity Universal
installer, runs it unattended, verifies the result and adds menu entries.
Interrupted runs resume where they stopped.

EXAMPLES:
    affinity-cli preflight                        # Check the host only
    affinity-cli install --dry-run                # Show what would happen
    affinity-cli install --profile full           # Install with every component
    affinity-cli install --url https://.../Affinity_Universal.exe --sha256 <hex>
    affinity-cli repair                           # Re-check an existing install
    affinity-cli status                           # Show configuration and last run
    affinity-cli list-installers --installers ~/Downloads
    affinity-cli uninstall --purge                # Remove launchers, prefix and cache"#)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Provision the prefix and install Affinity
    Install(InstallArgs),
    /// Re-check and top up a previous install without downloading again
    Repair(PrefixArgs),
    /// Run the host checks and stop
    Preflight(PrefixArgs),
    /// Show configuration, prefix state and the last run
    Status(PrefixArgs),
    /// List the Affinity installers found locally
    ListInstallers(ListArgs),
    /// Remove the desktop entries, and with --purge the prefix and cache
    Uninstall(UninstallArgs),
}

#[derive(Args)]
struct ListArgs {
    /// Directory searched for Affinity_Universal*.exe
    #[arg(long, value_name = "DIR")]
    installers: Option<PathBuf>,
}

#[derive(Args)]
struct UninstallArgs {
    #[command(flatten)]
    prefix: PrefixArgs,

    /// Also delete the Wine prefix, the installer cache and the last run state
    #[arg(long)]
    purge: bool,
}

#[derive(Args, Default)]
struct PrefixArgs {
    /// Wine prefix to use
    #[arg(long, value_name = "DIR")]
    prefix: Option<PathBuf>,
}

#[derive(Args)]
struct InstallArgs {
    #[command(flatten)]
    prefix: PrefixArgs,

    /// Directory searched for Affinity_Universal*.exe
    #[arg(long, value_name = "DIR")]
    installers: Option<PathBuf>,

    /// Component profile: minimal, standard or full
    #[arg(long)]
    profile: Option<ProfileName>,

    /// Download the installer from this URL
    #[arg(long)]
    url: Option<String>,

    /// Expected SHA-256 of the installer (hex)
    #[arg(long)]
    sha256: Option<String>,

    /// Show the installer's own dialogs instead of passing quiet switches
    #[arg(long)]
    interactive: bool,

    /// Plan every phase without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Do not install host packages
    #[arg(long)]
    skip_dependencies: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides {
            config_file: self.config.clone(),
            progress: std::io::stderr().is_terminal() && !self.log_json,
            ..Default::default()
        };

        match &self.command {
            Command::Install(args) => {
                overrides.wine_prefix = args.prefix.prefix.clone();
                overrides.installers_path = args.installers.clone();
                overrides.profile = args.profile;
                overrides.download_url = args.url.clone();
                overrides.sha256 = args.sha256.clone();
                overrides.dry_run = args.dry_run;
                if args.interactive {
                    overrides.silent = Some(false);
                }
                if args.skip_dependencies {
                    overrides.skip_dependencies = Some(true);
                }
            }
            Command::Preflight(args) => {
                overrides.wine_prefix = args.prefix.clone();
                overrides.preflight_only = true;
            }
            Command::Repair(args) | Command::Status(args) => {
                overrides.wine_prefix = args.prefix.clone();
            }
            Command::ListInstallers(args) => {
                overrides.installers_path = args.installers.clone();
            }
            Command::Uninstall(args) => {
                overrides.wine_prefix = args.prefix.prefix.clone();
            }
        }
        overrides
    }
}

fn init_logging(verbose: u8, json: bool) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("affinity={}", level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_report(report: &GuardrailReport) {
    println!("Preflight checks:");
    for check in &report.checks {
        let mark = match (check.passed, check.severity) {
            (true, _) => "ok",
            (false, CheckSeverity::Advisory) => "warn",
            (false, CheckSeverity::Blocking) => "FAIL",
        };
        println!("  [{:>4}] {:<18} {}", mark, check.name, check.reason);
    }
}

fn print_outcome(outcome: &RunOutcome) {
    if let Some(report) = &outcome.report {
        print_report(report);
    }

    if !outcome.plan.is_empty() {
        println!();
        println!("Dry run, nothing was changed:");
        for step in &outcome.plan {
            println!("  {:<18} {}", step.phase, step.action);
        }
    }

    for phase in Phase::PIPELINE {
        if let Some(note) = outcome.state.record(phase).note {
            debug!("{}: {}", phase, note);
        }
    }

    match &outcome.failure {
        Some(failure) => {
            eprintln!();
            eprintln!("Error: {}", failure);
            if let Some(hint) = failure.hint() {
                eprintln!("{}", hint);
            }
        }
        None if outcome.state.is_done() => {
            println!();
            println!("Affinity is installed in {}", outcome.state.prefix_path.display());
            for artifact in &outcome.artifacts {
                println!("  {}", artifact.display());
            }
        }
        None => {}
    }
}

fn print_status(config: &Config) -> anyhow::Result<()> {
    let status = inspect(config).context("Failed to read prefix state")?;

    println!("Configuration:");
    for (key, value) in &status.settings {
        println!("  {:<18} {}", key, value);
    }
    let runtime = Wine::detect(config.wine_binary.as_deref())
        .and_then(|wine| Ok(format!("{} ({})", wine.version()?, wine.wine_bin.display())))
        .unwrap_or_else(|e| format!("unavailable: {}", e));
    println!("  {:<18} {}", "Wine runtime", runtime);
    println!(
        "  {:<18} {}",
        "Installer cached",
        if status.installer_cached { "yes" } else { "no" }
    );

    println!();
    match &status.marker {
        Some(marker) => {
            println!("Prefix:");
            println!("  {:<18} {}", "Windows version", marker.windows_version);
            println!("  {:<18} {}", "Architecture", marker.arch);
            println!(
                "  {:<18} {}",
                "Profile",
                marker
                    .profile
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "(incomplete)".into())
            );
            println!("  {:<18} {}", "Components", marker.applied.join(", "));
            if let Some(component) = &marker.in_flight {
                println!("  {:<18} {}", "Interrupted", component);
            }
        }
        None => println!("Prefix: not prepared"),
    }

    println!();
    match &status.checkpoint {
        Some(state) => {
            println!("Last run ({}):", state.profile);
            for phase in Phase::PIPELINE {
                let record = state.record(phase);
                println!(
                    "  {:<18} {} (attempts: {})",
                    phase,
                    record.status.label(),
                    record.attempts
                );
            }
            if let Some((phase, reason)) = state.failure() {
                println!("  Last failure in {}: {}", phase, reason);
            }
        }
        None => println!("Last run: none"),
    }
    Ok(())
}

fn print_installers(config: &Config) -> anyhow::Result<()> {
    let found = discover_all(&config.installers_path).context("Failed to search for installers")?;
    if found.is_empty() {
        println!("No installers detected in {}", config.installers_path.display());
        return Ok(());
    }

    println!("Installers in {}:", config.installers_path.display());
    println!("  {:<12} File", "Version");
    for candidate in &found {
        let file = candidate
            .path
            .strip_prefix(&config.installers_path)
            .unwrap_or(&candidate.path);
        println!("  {:<12} {}", candidate.version_string(), file.display());
    }
    Ok(())
}

fn run_uninstall(config: &Config, purge: bool) -> anyhow::Result<()> {
    let entries = DesktopEntries::user_default().context("Could not determine data directory")?;
    let report = uninstall(config, &entries, purge)
        .with_context(|| format!("Failed to uninstall from {}", config.prefix_path.display()))?;

    println!("Removed {} desktop entries", report.entries_removed.len());
    for path in report.entries_removed.iter().chain(&report.purged) {
        println!("  {}", path.display());
    }
    if !purge {
        println!(
            "Prefix {} was kept; pass --purge to delete it and the installer cache",
            config.prefix_path.display()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config = ConfigLoader::load(&cli.overrides()).context("Failed to load configuration")?;

    match &cli.command {
        Command::Status(_) => return print_status(&config),
        Command::ListInstallers(_) => return print_installers(&config),
        Command::Uninstall(args) => return run_uninstall(&config, args.purge),
        _ => {}
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; stopping after the current step");
                cancel.cancel();
            }
        }
    });

    let tools = Collaborators::system()?;
    let orchestrator = Orchestrator::new(config, tools, cancel)?;
    let outcome = match cli.command {
        Command::Repair(_) => orchestrator.repair().await,
        _ => orchestrator.run().await,
    };

    print_outcome(&outcome);
    process::exit(outcome.exit_code());
}
