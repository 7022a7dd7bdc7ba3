//! Local installer discovery
//!
//! When no download URL is configured the installers directory is searched
//! for `Affinity_Universal[-<x.y.z>].exe`; the highest version wins.

use crate::error::{AffinityError, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const INSTALLER_PATTERN: &str = r"(?i)^affinity[_-]?universal[_-]?(\d+\.\d+\.\d+)?\.exe$";

/// How deep below the installers directory to look
const SEARCH_DEPTH: usize = 2;

/// A local installer file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerCandidate {
    pub path: PathBuf,
    /// Version parsed from the file name, if it carries one
    pub version: Option<(u32, u32, u32)>,
}

impl InstallerCandidate {
    pub fn version_string(&self) -> String {
        match self.version {
            Some((major, minor, patch)) => format!("{}.{}.{}", major, minor, patch),
            None => "unversioned".to_string(),
        }
    }
}

/// Find the newest installer under `dir`. A missing directory yields `None`.
pub fn discover(dir: &Path) -> Result<Option<InstallerCandidate>> {
    let newest = discover_all(dir)?.into_iter().next();
    if let Some(found) = &newest {
        debug!(
            "Discovered installer {} ({})",
            found.path.display(),
            found.version_string()
        );
    }
    Ok(newest)
}

/// Every installer under `dir`, newest first
pub fn discover_all(dir: &Path) -> Result<Vec<InstallerCandidate>> {
    if !dir.is_dir() {
        debug!("Installers directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let pattern = Regex::new(INSTALLER_PATTERN)
        .map_err(|e| AffinityError::ConfigInvalid(format!("installer pattern: {}", e)))?;

    let mut candidates: Vec<InstallerCandidate> = WalkDir::new(dir)
        .max_depth(SEARCH_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?;
            let captures = pattern.captures(name)?;
            Some(InstallerCandidate {
                path: entry.path().to_path_buf(),
                version: captures.get(1).and_then(|m| parse_version(m.as_str())),
            })
        })
        .collect();

    // Stable sort keeps file-name order among equal versions
    candidates.sort_by(|a, b| compare_versions(b.version, a.version));
    Ok(candidates)
}

fn parse_version(raw: &str) -> Option<(u32, u32, u32)> {
    let mut parts = raw.split('.').map(|p| p.parse::<u32>().ok());
    Some((parts.next()??, parts.next()??, parts.next()??))
}

fn compare_versions(a: Option<(u32, u32, u32)>, b: Option<(u32, u32, u32)>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, b"MZ").unwrap();
        path
    }

    #[test]
    fn newest_version_wins() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "Affinity_Universal.exe");
        touch(dir.path(), "affinity-universal-2.5.7.exe");
        let newest = touch(dir.path(), "nested/Affinity_Universal_2.10.0.exe");
        touch(dir.path(), "Affinity Photo 2.exe");

        let found = discover(dir.path()).unwrap().unwrap();
        assert_eq!(found.path, newest);
        assert_eq!(found.version, Some((2, 10, 0)));
        assert_eq!(found.version_string(), "2.10.0");
    }

    #[test]
    fn unversioned_installer_is_used_when_alone() {
        let dir = tempfile::tempdir().unwrap();
        let only = touch(dir.path(), "AffinityUniversal.exe");
        touch(dir.path(), "readme.txt");

        let found = discover(dir.path()).unwrap().unwrap();
        assert_eq!(found.path, only);
        assert_eq!(found.version, None);
    }

    #[test]
    fn missing_or_empty_directory_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(&dir.path().join("absent")).unwrap().is_none());
        assert!(discover(dir.path()).unwrap().is_none());
    }

    #[test]
    fn lists_every_installer_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let unversioned = touch(dir.path(), "Affinity_Universal.exe");
        let old = touch(dir.path(), "Affinity_Universal-2.4.1.exe");
        let new = touch(dir.path(), "sub/Affinity_Universal-2.6.0.exe");
        touch(dir.path(), "sub/deeper/still/Affinity_Universal-9.9.9.exe");

        let all = discover_all(dir.path()).unwrap();
        let paths: Vec<_> = all.iter().map(|c| c.path.clone()).collect();
        assert_eq!(paths, vec![new, old, unversioned]);
        assert_eq!(all[2].version_string(), "unversioned");
        assert!(discover_all(&dir.path().join("absent")).unwrap().is_empty());
    }
}
