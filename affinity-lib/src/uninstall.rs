//! Removing an installation
//!
//! Launchers are always removed. With `purge` the prefix, the installer cache
//! and the run checkpoint go too. Both locks are held throughout so a running
//! install is never pulled out from under itself.

use crate::config::Config;
use crate::error::{AffinityError, Result};
use crate::integrate::DesktopIntegrator;
use crate::lock::ExclusiveLock;
use crate::prefix::PrefixMarker;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What an uninstall removed
#[derive(Debug, Default)]
pub struct UninstallReport {
    pub entries_removed: Vec<PathBuf>,
    /// Directories and files deleted by a purge
    pub purged: Vec<PathBuf>,
}

pub fn uninstall(
    config: &Config,
    integrator: &dyn DesktopIntegrator,
    purge: bool,
) -> Result<UninstallReport> {
    let prefix = &config.prefix_path;
    if purge && prefix.exists() && !looks_like_prefix(prefix) {
        return Err(AffinityError::ConfigInvalid(format!(
            "{} does not look like a Wine prefix; refusing to delete it",
            prefix.display()
        )));
    }

    let prefix_lock_path = ExclusiveLock::prefix_lock_path(prefix);
    let _prefix_lock = ExclusiveLock::acquire(&prefix_lock_path)?;
    let _cache_lock = if config.cache_dir.is_dir() {
        Some(ExclusiveLock::acquire(&ExclusiveLock::cache_lock_path(
            &config.cache_dir,
        ))?)
    } else {
        None
    };

    let mut report = UninstallReport {
        entries_removed: integrator.remove(prefix)?,
        ..Default::default()
    };

    if purge {
        for path in [
            prefix.clone(),
            config.cache_dir.clone(),
            config.checkpoint_path(),
        ] {
            if remove_path(&path)? {
                info!("Removed {}", path.display());
                report.purged.push(path);
            }
        }
        // Unlinking a held lock is fine; waiters see the lock released on drop
        if let Err(e) = remove_path(&prefix_lock_path) {
            warn!("Could not remove {}: {}", prefix_lock_path.display(), e);
        }
    }

    info!(
        "Uninstall removed {} desktop entries and {} paths",
        report.entries_removed.len(),
        report.purged.len()
    );
    Ok(report)
}

fn looks_like_prefix(path: &Path) -> bool {
    PrefixMarker::path(path).is_file()
        || path.join("system.reg").is_file()
        || path.join("drive_c").is_dir()
}

/// Returns whether anything was there
fn remove_path(path: &Path) -> Result<bool> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if metadata.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, ConfigOverrides, Defaults, FileConfig, ProxyEnv};
    use crate::integrate::DesktopEntries;
    use tempfile::TempDir;

    struct Setup {
        root: TempDir,
        config: Config,
        entries: DesktopEntries,
    }

    fn setup() -> Setup {
        let root = tempfile::tempdir().unwrap();
        let config = resolve(
            Defaults::rooted_at(root.path()),
            FileConfig::default(),
            &ConfigOverrides::default(),
            &ProxyEnv::default(),
        )
        .unwrap();
        let entries = DesktopEntries::new(root.path().join("applications"));

        let exe = config.prefix_path.join("drive_c/Affinity/Photo 2/Photo.exe");
        std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
        std::fs::write(&exe, b"MZ").unwrap();
        entries
            .integrate(&config.prefix_path, Path::new("/usr/bin/wine64"), &[exe])
            .unwrap();
        std::fs::create_dir_all(&config.cache_dir).unwrap();
        std::fs::write(config.cached_installer_path(), b"MZ").unwrap();
        std::fs::create_dir_all(config.checkpoint_path().parent().unwrap()).unwrap();
        std::fs::write(config.checkpoint_path(), b"{}").unwrap();

        Setup {
            root,
            config,
            entries,
        }
    }

    #[test]
    fn keeps_prefix_and_cache_without_purge() {
        let s = setup();
        let report = uninstall(&s.config, &s.entries, false).unwrap();

        assert_eq!(report.entries_removed.len(), 1);
        assert!(!report.entries_removed[0].exists());
        assert!(report.purged.is_empty());
        assert!(s.config.prefix_path.join("drive_c").is_dir());
        assert!(s.config.cached_installer_path().is_file());
        assert!(s.config.checkpoint_path().is_file());
    }

    #[test]
    fn purge_removes_prefix_cache_and_checkpoint() {
        let s = setup();
        let report = uninstall(&s.config, &s.entries, true).unwrap();

        assert_eq!(report.entries_removed.len(), 1);
        assert_eq!(
            report.purged,
            vec![
                s.config.prefix_path.clone(),
                s.config.cache_dir.clone(),
                s.config.checkpoint_path(),
            ]
        );
        assert!(!s.config.prefix_path.exists());
        assert!(!s.config.cache_dir.exists());
        assert!(!s.config.checkpoint_path().exists());
        assert!(!ExclusiveLock::prefix_lock_path(&s.config.prefix_path).exists());
        assert!(s.root.path().join("applications").is_dir());
    }

    #[test]
    fn purge_refuses_a_directory_that_is_not_a_prefix() {
        let s = setup();
        std::fs::remove_dir_all(s.config.prefix_path.join("drive_c")).unwrap();
        std::fs::write(s.config.prefix_path.join("thesis.odt"), b"keep").unwrap();

        let err = uninstall(&s.config, &s.entries, true).unwrap_err();
        assert!(matches!(err, AffinityError::ConfigInvalid(_)));
        assert!(s.config.prefix_path.join("thesis.odt").is_file());
    }

    #[test]
    fn a_run_holding_the_prefix_blocks_uninstall() {
        let s = setup();
        let _held =
            ExclusiveLock::acquire(&ExclusiveLock::prefix_lock_path(&s.config.prefix_path))
                .unwrap();

        let err = uninstall(&s.config, &s.entries, true).unwrap_err();
        assert!(matches!(err, AffinityError::Busy(_)));
        assert!(s.config.prefix_path.exists());
    }
}
