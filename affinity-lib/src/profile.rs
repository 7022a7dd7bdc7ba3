//! Profiles and the component catalog used to configure a prefix

use crate::error::{AffinityError, Result};
use crate::runner::ToolCommand;
use crate::wine::Wine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// How completely a prefix is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileName {
    Minimal,
    Standard,
    Full,
}

impl ProfileName {
    /// All profiles, poorest first
    pub const ALL: [ProfileName; 3] = [ProfileName::Minimal, ProfileName::Standard, ProfileName::Full];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileName::Minimal => "minimal",
            ProfileName::Standard => "standard",
            ProfileName::Full => "full",
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileName {
    type Err = AffinityError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "minimal" => Ok(ProfileName::Minimal),
            "standard" => Ok(ProfileName::Standard),
            "full" => Ok(ProfileName::Full),
            other => Err(AffinityError::ConfigInvalid(format!(
                "unknown profile '{}' (valid: minimal, standard, full)",
                other
            ))),
        }
    }
}

/// Which executable applies a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// The wine binary itself (winecfg, regedit, ...)
    Runtime,
    /// winetricks
    Winetricks,
}

/// One argument of an invocation, placeholders resolved at load time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgTemplate {
    Literal(String),
    Component,
    WindowsVersion,
    Prefix,
}

impl ArgTemplate {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "{component}" => Ok(ArgTemplate::Component),
            "{winver}" => Ok(ArgTemplate::WindowsVersion),
            "{prefix}" => Ok(ArgTemplate::Prefix),
            other if other.contains('{') || other.contains('}') => Err(
                AffinityError::ConfigInvalid(format!("unknown placeholder in argument '{}'", other)),
            ),
            literal => Ok(ArgTemplate::Literal(literal.to_string())),
        }
    }

    fn render(&self, component: &str, windows_version: &str, prefix: &Path) -> String {
        match self {
            ArgTemplate::Literal(s) => s.clone(),
            ArgTemplate::Component => component.to_string(),
            ArgTemplate::WindowsVersion => windows_version.to_string(),
            ArgTemplate::Prefix => prefix.display().to_string(),
        }
    }
}

/// Executable plus argument template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: ToolKind,
    pub args: Vec<ArgTemplate>,
}

impl Invocation {
    fn winetricks_verb() -> Self {
        Self {
            tool: ToolKind::Winetricks,
            args: vec![ArgTemplate::Literal("-q".into()), ArgTemplate::Component],
        }
    }
}

/// One discrete configuration unit applied to a prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub id: String,
    pub invocation: Invocation,
}

impl Component {
    /// Resolve into a concrete command against `prefix`
    pub fn command(
        &self,
        wine: &Wine,
        prefix: &Path,
        windows_version: &str,
        timeout: Duration,
    ) -> Result<ToolCommand> {
        let base = match self.invocation.tool {
            ToolKind::Runtime => wine.command(prefix, timeout),
            ToolKind::Winetricks => wine.winetricks(prefix, timeout)?,
        };
        Ok(base.args(
            self.invocation
                .args
                .iter()
                .map(|a| a.render(&self.id, windows_version, prefix)),
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    components: BTreeMap<String, InvocationSpec>,
    profiles: BTreeMap<ProfileName, Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InvocationSpec {
    tool: ToolKind,
    args: Vec<String>,
}

/// Typed mapping from component id to invocation, plus the profile tables
#[derive(Debug, Clone)]
pub struct ComponentCatalog {
    components: HashMap<String, Component>,
    profiles: BTreeMap<ProfileName, Vec<String>>,
}

impl ComponentCatalog {
    /// Profiles matching the AffinityOnLinux Wine guide
    pub fn builtin() -> Self {
        let minimal = ["winver", "corefonts", "tahoma", "crypt32", "d3dcompiler_47"];
        let standard_extra = ["vcrun2022"];
        let full_extra = ["dotnet48", "dxvk", "vkd3d", "remove_mono"];

        let mut components = HashMap::new();
        components.insert(
            "winver".to_string(),
            Component {
                id: "winver".to_string(),
                invocation: Invocation {
                    tool: ToolKind::Runtime,
                    args: vec![
                        ArgTemplate::Literal("winecfg".into()),
                        ArgTemplate::Literal("/v".into()),
                        ArgTemplate::WindowsVersion,
                    ],
                },
            },
        );
        for id in minimal
            .iter()
            .chain(&standard_extra)
            .chain(&full_extra)
            .filter(|id| **id != "winver")
        {
            components.insert(
                id.to_string(),
                Component {
                    id: id.to_string(),
                    invocation: Invocation::winetricks_verb(),
                },
            );
        }

        let minimal: Vec<String> = minimal.iter().map(|s| s.to_string()).collect();
        let mut standard = minimal.clone();
        standard.extend(standard_extra.iter().map(|s| s.to_string()));
        let mut full = standard.clone();
        full.extend(full_extra.iter().map(|s| s.to_string()));

        let mut profiles = BTreeMap::new();
        profiles.insert(ProfileName::Minimal, minimal);
        profiles.insert(ProfileName::Standard, standard);
        profiles.insert(ProfileName::Full, full);

        Self {
            components,
            profiles,
        }
    }

    /// Load a catalog from a JSON file and validate it
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(content)
            .map_err(|e| AffinityError::ConfigInvalid(format!("component catalog: {}", e)))?;

        let mut components = HashMap::new();
        for (id, spec) in file.components {
            let args = spec
                .args
                .iter()
                .map(|a| ArgTemplate::parse(a))
                .collect::<Result<Vec<_>>>()?;
            components.insert(
                id.clone(),
                Component {
                    id,
                    invocation: Invocation {
                        tool: spec.tool,
                        args,
                    },
                },
            );
        }

        let catalog = Self {
            components,
            profiles: file.profiles,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Every profile is defined, references known components without
    /// duplicates, and each richer profile is a superset of the poorer one.
    pub fn validate(&self) -> Result<()> {
        let mut previous: Option<(ProfileName, HashSet<&str>)> = None;
        for name in ProfileName::ALL {
            let ids = self.profiles.get(&name).ok_or_else(|| {
                AffinityError::ConfigInvalid(format!("profile '{}' is not defined", name))
            })?;

            let mut seen = HashSet::new();
            for id in ids {
                if !self.components.contains_key(id) {
                    return Err(AffinityError::ConfigInvalid(format!(
                        "profile '{}' references unknown component '{}'",
                        name, id
                    )));
                }
                if !seen.insert(id.as_str()) {
                    return Err(AffinityError::ConfigInvalid(format!(
                        "profile '{}' lists component '{}' twice",
                        name, id
                    )));
                }
            }

            if let Some((poorer, poorer_ids)) = &previous {
                if let Some(missing) = poorer_ids.iter().find(|id| !seen.contains(*id)) {
                    return Err(AffinityError::ConfigInvalid(format!(
                        "profile '{}' must include every component of '{}' (missing '{}')",
                        name, poorer, missing
                    )));
                }
            }
            previous = Some((name, seen));
        }
        Ok(())
    }

    /// Ordered component ids of a profile
    pub fn profile(&self, name: ProfileName) -> &[String] {
        self.profiles
            .get(&name)
            .map(|ids| ids.as_slice())
            .unwrap_or_default()
    }

    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.get(id)
    }
}

impl Default for ComponentCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_are_increasing_supersets() {
        let catalog = ComponentCatalog::builtin();
        catalog.validate().unwrap();

        let standard = catalog.profile(ProfileName::Standard);
        assert_eq!(standard.last().map(String::as_str), Some("vcrun2022"));
        assert_eq!(&standard[..5], catalog.profile(ProfileName::Minimal));
        assert_eq!(catalog.profile(ProfileName::Full).len(), 10);
    }

    #[test]
    fn profile_names_parse_case_insensitively() {
        assert_eq!("Full".parse::<ProfileName>().unwrap(), ProfileName::Full);
        assert!("maximal".parse::<ProfileName>().is_err());
        assert!(ProfileName::Minimal < ProfileName::Full);
    }

    #[test]
    fn components_render_typed_invocations() {
        let catalog = ComponentCatalog::builtin();
        let wine = Wine::with_binaries("/usr/bin/wine", Some("/usr/bin/winetricks".into()));
        let prefix = Path::new("/p");

        let winver = catalog
            .component("winver")
            .unwrap()
            .command(&wine, prefix, "win11", Duration::from_secs(1))
            .unwrap();
        assert_eq!(winver.program, Path::new("/usr/bin/wine"));
        assert_eq!(winver.args, vec!["winecfg", "/v", "win11"]);

        let fonts = catalog
            .component("corefonts")
            .unwrap()
            .command(&wine, prefix, "win11", Duration::from_secs(1))
            .unwrap();
        assert_eq!(fonts.program, Path::new("/usr/bin/winetricks"));
        assert_eq!(fonts.args, vec!["-q", "corefonts"]);
    }

    #[test]
    fn loading_rejects_unknown_placeholders() {
        let json = r#"{
            "components": { "fonts": { "tool": "winetricks", "args": ["-q", "{verb}"] } },
            "profiles": { "minimal": ["fonts"], "standard": ["fonts"], "full": ["fonts"] }
        }"#;
        let err = ComponentCatalog::from_json(json).unwrap_err();
        assert!(err.to_string().contains("{verb}"));
    }

    #[test]
    fn loading_rejects_non_superset_profiles() {
        let json = r#"{
            "components": {
                "a": { "tool": "winetricks", "args": ["-q", "{component}"] },
                "b": { "tool": "winetricks", "args": ["-q", "{component}"] }
            },
            "profiles": { "minimal": ["a"], "standard": ["b"], "full": ["a", "b"] }
        }"#;
        let err = ComponentCatalog::from_json(json).unwrap_err();
        assert!(err.to_string().contains("must include every component"));
    }

    #[test]
    fn loading_accepts_valid_catalog() {
        let json = r#"{
            "components": {
                "winver": { "tool": "runtime", "args": ["winecfg", "/v", "{winver}"] },
                "corefonts": { "tool": "winetricks", "args": ["-q", "{component}"] }
            },
            "profiles": {
                "minimal": ["winver"],
                "standard": ["winver", "corefonts"],
                "full": ["winver", "corefonts"]
            }
        }"#;
        let catalog = ComponentCatalog::from_json(json).unwrap();
        assert_eq!(catalog.profile(ProfileName::Standard), ["winver", "corefonts"]);
    }
}
