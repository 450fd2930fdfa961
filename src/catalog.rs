//! Distribution catalog: `/config/distros.yaml`.

use std::collections::BTreeMap;
use std::path::Path;

use facet::Facet;

use crate::arch::{normalize_arch, supported_arch_names};
use crate::error::BoxvmError;

pub const DEFAULT_CATALOG_PATH: &str = "/config/distros.yaml";

#[derive(Debug, Clone, Facet)]
pub struct Catalog {
    pub distributions: BTreeMap<String, DistroEntry>,
}

/// One catalog descriptor, immutable after load.
#[derive(Debug, Clone, Facet)]
pub struct DistroEntry {
    pub name: String,
    pub url: String,
    pub user: String,
    #[facet(default)]
    pub arch: Option<String>,
    #[facet(default)]
    pub format: Option<String>,
}

impl DistroEntry {
    pub fn format(&self) -> &str {
        self.format.as_deref().unwrap_or("qcow2")
    }

    /// Declared arch with aliases resolved; `None` when the entry is silent.
    pub fn normalized_arch(&self) -> Result<Option<String>, BoxvmError> {
        let Some(raw) = self.arch.as_deref() else {
            return Ok(None);
        };
        let arch = normalize_arch(raw);
        if crate::arch::profile_for(&arch).is_none() {
            return Err(BoxvmError::config(format!(
                "distribution declares unsupported arch '{raw}'. Supported: {}",
                supported_arch_names().join(", ")
            )));
        }
        Ok(Some(arch))
    }
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, BoxvmError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BoxvmError::io(format!("distribution catalog missing: {}", path.display()), e))?;
        facet_yaml::from_str(&contents).map_err(|e| {
            BoxvmError::config(format!("failed to parse catalog {}: {e}", path.display()))
        })
    }

    /// Look up a catalog key, failing with the list of valid keys.
    pub fn get(&self, distro: &str) -> Result<&DistroEntry, BoxvmError> {
        self.distributions.get(distro).ok_or_else(|| {
            let available: Vec<&str> = self.distributions.keys().map(String::as_str).collect();
            BoxvmError::config(format!(
                "unknown distro '{distro}'. Available distributions:\n    {}\n  Use --list-distros to see details.",
                available.join("\n    ")
            ))
        })
    }

    /// Entries matching an arch filter (alias-normalized); entries without a
    /// declared arch count as x86_64.
    pub fn filtered(&self, arch_filter: &str) -> Vec<(&String, &DistroEntry)> {
        let wanted = normalize_arch(arch_filter);
        self.distributions
            .iter()
            .filter(|(_, entry)| {
                let declared = entry.arch.as_deref().unwrap_or("x86_64");
                normalize_arch(declared) == wanted
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_catalog(dir: &tempfile::TempDir, yaml: &str) -> std::path::PathBuf {
        let path = dir.path().join("distros.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{yaml}").unwrap();
        path
    }

    const SAMPLE: &str = r#"
distributions:
  ubuntu-2404:
    name: Ubuntu 24.04
    url: https://example.com/ubuntu.qcow2
    user: ubuntu
    arch: x86_64
  alma-arm:
    name: AlmaLinux 9
    url: https://example.com/alma.qcow2
    user: alma
    arch: arm64
  minimal:
    name: Minimal
    url: https://example.com/min.raw
    user: root
    format: raw
"#;

    #[test]
    fn lookup_known_key() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::load(&write_catalog(&dir, SAMPLE)).unwrap();
        let entry = catalog.get("ubuntu-2404").unwrap();
        assert_eq!(entry.user, "ubuntu");
        assert_eq!(entry.format(), "qcow2");
    }

    #[test]
    fn unknown_key_lists_alternatives() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::load(&write_catalog(&dir, SAMPLE)).unwrap();
        let err = catalog.get("debian-13").unwrap_err().to_string();
        assert!(err.contains("unknown distro 'debian-13'"));
        assert!(err.contains("ubuntu-2404"));
        assert!(err.contains("alma-arm"));
    }

    #[test]
    fn arch_alias_resolved_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::load(&write_catalog(&dir, SAMPLE)).unwrap();
        let entry = catalog.get("alma-arm").unwrap();
        assert_eq!(entry.normalized_arch().unwrap().as_deref(), Some("aarch64"));
    }

    #[test]
    fn unsupported_arch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::load(&write_catalog(
            &dir,
            "distributions:\n  weird:\n    name: W\n    url: https://x/y\n    user: u\n    arch: sparc\n",
        ))
        .unwrap();
        assert!(catalog.get("weird").unwrap().normalized_arch().is_err());
    }

    #[test]
    fn format_defaults_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::load(&write_catalog(&dir, SAMPLE)).unwrap();
        assert_eq!(catalog.get("minimal").unwrap().format(), "raw");
    }

    #[test]
    fn arch_filter_uses_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::load(&write_catalog(&dir, SAMPLE)).unwrap();
        let arm = catalog.filtered("arm64");
        assert_eq!(arm.len(), 1);
        assert_eq!(arm[0].0, "alma-arm");
        // Entries without a declared arch default to x86_64
        let x86 = catalog.filtered("amd64");
        assert_eq!(x86.len(), 2);
    }
}
