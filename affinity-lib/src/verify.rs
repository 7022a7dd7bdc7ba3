//! Post-install artifact verification

use crate::error::{AffinityError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Check that every expected artifact exists in the prefix.
///
/// Each pattern is a glob relative to `prefix` and needs at least one match
/// that is a non-empty regular file. Returns the first match per pattern;
/// the first unmatched pattern is reported as `VerifyMissingArtifact`.
pub fn verify(prefix: &Path, expected: &[String]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::with_capacity(expected.len());

    for pattern in expected {
        let paths = glob::glob(&prefixed_pattern(prefix, pattern)).map_err(|e| {
            AffinityError::ConfigInvalid(format!("invalid artifact pattern '{}': {}", pattern, e))
        })?;

        let hit = paths
            .filter_map(|entry| entry.ok())
            .find(|path| is_non_empty_file(path));

        match hit {
            Some(path) => {
                debug!("Artifact {} -> {}", pattern, path.display());
                found.push(path);
            }
            None => return Err(AffinityError::VerifyMissingArtifact(pattern.clone())),
        }
    }

    Ok(found)
}

/// Every non-empty file matching any of the patterns, deduplicated, in
/// pattern order
pub fn matching(prefix: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        let Ok(paths) = glob::glob(&prefixed_pattern(prefix, pattern)) else {
            continue;
        };
        for path in paths.filter_map(|entry| entry.ok()) {
            if is_non_empty_file(&path) && !found.contains(&path) {
                found.push(path);
            }
        }
    }
    found
}

/// `pattern` anchored under `prefix`; the prefix itself is matched literally
fn prefixed_pattern(prefix: &Path, pattern: &str) -> String {
    let escaped = glob::Pattern::escape(&prefix.to_string_lossy());
    format!("{}/{}", escaped.trim_end_matches('/'), pattern.trim_start_matches('/'))
}

fn is_non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
