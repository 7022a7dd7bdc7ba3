//! Desktop menu integration for installed products

use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Executables shipped next to a product that must never get a launcher
const HELPER_MARKERS: &[&str] = &["crash", "handler", "helper", "unins", "update", "setup"];

/// Creates launchers for installed executables
pub trait DesktopIntegrator: Send + Sync {
    /// Returns the files written
    fn integrate(&self, prefix: &Path, wine: &Path, executables: &[PathBuf]) -> Result<Vec<PathBuf>>;

    /// Files `integrate` would write, without writing them
    fn plan(&self, executables: &[PathBuf]) -> Vec<PathBuf>;

    /// Delete launchers pointing into `prefix`; returns the files removed
    fn remove(&self, prefix: &Path) -> Result<Vec<PathBuf>>;
}

/// Writes freedesktop `.desktop` files into an applications directory
#[derive(Debug, Clone)]
pub struct DesktopEntries {
    applications_dir: PathBuf,
}

impl DesktopEntries {
    pub fn new(applications_dir: impl Into<PathBuf>) -> Self {
        Self {
            applications_dir: applications_dir.into(),
        }
    }

    /// `~/.local/share/applications`
    pub fn user_default() -> Option<Self> {
        dirs::data_dir().map(|dir| Self::new(dir.join("applications")))
    }

    fn entry_path(&self, exe: &Path) -> PathBuf {
        let slug: String = product_name(exe)
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.applications_dir.join(format!("{}.desktop", slug))
    }
}

impl DesktopIntegrator for DesktopEntries {
    fn integrate(&self, prefix: &Path, wine: &Path, executables: &[PathBuf]) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.applications_dir)?;

        let mut written = Vec::new();
        for exe in &main_executables(executables) {
            let path = self.entry_path(exe);
            std::fs::write(&path, render_entry(prefix, wine, exe))?;
            debug!("Wrote {}", path.display());
            written.push(path);
        }
        info!("Created {} desktop entries", written.len());
        Ok(written)
    }

    fn plan(&self, executables: &[PathBuf]) -> Vec<PathBuf> {
        main_executables(executables)
            .iter()
            .map(|exe| self.entry_path(exe))
            .collect()
    }

    fn remove(&self, prefix: &Path) -> Result<Vec<PathBuf>> {
        let dir = match std::fs::read_dir(&self.applications_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let needle = prefix_assignment(prefix);
        let mut removed = Vec::new();
        for entry in dir {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "desktop") {
                continue;
            }
            // Unreadable or non-UTF-8 files are not ours
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            if content.lines().any(|line| line.starts_with("Exec=") && line.contains(&needle)) {
                std::fs::remove_file(&path)?;
                debug!("Removed {}", path.display());
                removed.push(path);
            }
        }
        removed.sort();
        info!("Removed {} desktop entries", removed.len());
        Ok(removed)
    }
}

fn prefix_assignment(prefix: &Path) -> String {
    format!("WINEPREFIX=\"{}\"", prefix.display())
}

/// One launcher target per product folder: the executable named after the
/// folder ("Photo 2" -> `Photo.exe`), otherwise the first non-helper
fn main_executables(executables: &[PathBuf]) -> Vec<PathBuf> {
    let mut by_folder: BTreeMap<PathBuf, Vec<&PathBuf>> = BTreeMap::new();
    for exe in executables {
        let folder = exe.parent().map(Path::to_path_buf).unwrap_or_default();
        by_folder.entry(folder).or_default().push(exe);
    }

    by_folder
        .into_iter()
        .filter_map(|(folder, candidates)| {
            let folder_name = folder
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            let named_after_folder = candidates.iter().find(|exe| {
                let stem = stem_lower(exe);
                !stem.is_empty()
                    && (folder_name == stem
                        || folder_name.split_whitespace().next() == Some(stem.as_str()))
            });
            named_after_folder
                .or_else(|| candidates.iter().find(|exe| !is_helper(exe)))
                .map(|exe| (*exe).clone())
        })
        .collect()
}

fn stem_lower(exe: &Path) -> String {
    exe.file_stem()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn is_helper(exe: &Path) -> bool {
    let stem = stem_lower(exe);
    HELPER_MARKERS.iter().any(|marker| stem.contains(marker))
}

/// "Affinity Photo 2" for `.../Affinity/Photo 2/Photo.exe`
fn product_name(exe: &Path) -> String {
    let folder = exe
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned());
    let stem = exe
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Application".to_string());
    let base = folder.unwrap_or(stem);
    if base.to_lowercase().starts_with("affinity") {
        base
    } else {
        format!("Affinity {}", base)
    }
}

fn categories(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    if lower.contains("photo") {
        "Graphics;Photography;RasterGraphics;"
    } else if lower.contains("designer") {
        "Graphics;VectorGraphics;Design;"
    } else if lower.contains("publisher") {
        "Graphics;Publishing;Office;"
    } else {
        "Graphics;"
    }
}

fn render_entry(prefix: &Path, wine: &Path, exe: &Path) -> String {
    let name = product_name(exe);
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name={name}\n\
         Comment={name} (Wine)\n\
         Icon=applications-graphics\n\
         Exec=env {prefix} \"{wine}\" \"{exe}\" %U\n\
         Categories={categories}\n\
         Terminal=false\n\
         StartupNotify=true\n",
        name = name,
        prefix = prefix_assignment(prefix),
        wine = wine.display(),
        exe = exe.display(),
        categories = categories(&name),
    )
}
