//! On-disk layout, rooted at the images directory.
//!
//! Everything boxvm writes lives under one root: `$DATA_DIR` when set, the
//! `/data` bind mount when one is present, `/images` otherwise. The root is
//! resolved once at startup into a [`Paths`] value that is passed explicitly —
//! no module re-reads the environment for path decisions.

use std::path::{Path, PathBuf};

/// Resolved filesystem layout for one process lifetime.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
    data_volume: bool,
}

impl Paths {
    /// Resolve the images root from `DATA_DIR`, an auto-detected `/data`
    /// mount point, or the `/images` default.
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var("DATA_DIR")
            && !dir.trim().is_empty()
        {
            return Self { root: PathBuf::from(dir.trim()), data_volume: true };
        }
        if is_mount_point(Path::new("/data")) {
            tracing::info!("data volume detected at /data; using it for persistent storage");
            return Self { root: PathBuf::from("/data"), data_volume: true };
        }
        Self { root: PathBuf::from("/images"), data_volume: false }
    }

    /// Construct a layout rooted at an arbitrary directory (tests).
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), data_volume: false }
    }

    /// Whether the root came from a dedicated data volume; drives the
    /// `PERSIST` default.
    pub fn data_volume(&self) -> bool {
        self.data_volume
    }

    pub fn images_dir(&self) -> &Path {
        &self.root
    }

    /// Cached base images: `base/{distro}.{format}`.
    pub fn base_dir(&self) -> PathBuf {
        self.root.join("base")
    }

    pub fn base_image(&self, distro: &str, format: &str) -> PathBuf {
        self.base_dir().join(format!("{distro}.{format}"))
    }

    /// Per-VM working directory: `vms/{vm_name}/`.
    pub fn vm_dir(&self, vm_name: &str) -> PathBuf {
        self.root.join("vms").join(vm_name)
    }

    pub fn work_image(&self, vm_name: &str, format: &str) -> PathBuf {
        self.vm_dir(vm_name).join(format!("disk.{format}"))
    }

    pub fn extra_disk(&self, vm_name: &str, index: u8, format: &str) -> PathBuf {
        self.vm_dir(vm_name).join(format!("disk{index}.{format}"))
    }

    pub fn seed_iso(&self, vm_name: &str) -> PathBuf {
        self.vm_dir(vm_name).join("seed.iso")
    }

    /// Marker written after the first clean power cycle with persistence on.
    pub fn install_marker(&self, vm_name: &str) -> PathBuf {
        self.vm_dir(vm_name).join(".installed")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn firmware_vars(&self, vm_name: &str) -> PathBuf {
        self.state_dir().join("firmware").join(format!("{vm_name}-vars.fd"))
    }

    pub fn tpm_dir(&self, vm_name: &str) -> PathBuf {
        self.state_dir().join("tpm").join(vm_name)
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.state_dir().join("certs")
    }

    pub fn sushy_dir(&self) -> PathBuf {
        self.state_dir().join("sushy")
    }

    pub fn boot_iso_cache(&self) -> PathBuf {
        self.state_dir().join("boot-isos")
    }

    pub fn oci_disk_cache(&self) -> PathBuf {
        self.state_dir().join("oci-disks")
    }
}

/// A path is a mount point when it sits on a different device than its parent.
fn is_mount_point(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return false;
    };
    match std::fs::metadata(parent) {
        Ok(parent_meta) => meta.dev() != parent_meta.dev(),
        Err(_) => false,
    }
}

pub fn ensure_directory(path: &Path) -> Result<(), crate::error::BoxvmError> {
    std::fs::create_dir_all(path)
        .map_err(|e| crate::error::BoxvmError::io(format!("creating directory {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_root() {
        let p = Paths::rooted_at("/data");
        assert_eq!(p.base_image("ubuntu-2404", "qcow2"), PathBuf::from("/data/base/ubuntu-2404.qcow2"));
        assert_eq!(p.work_image("myvm", "qcow2"), PathBuf::from("/data/vms/myvm/disk.qcow2"));
        assert_eq!(p.extra_disk("myvm", 3, "qcow2"), PathBuf::from("/data/vms/myvm/disk3.qcow2"));
        assert_eq!(p.seed_iso("myvm"), PathBuf::from("/data/vms/myvm/seed.iso"));
        assert_eq!(p.install_marker("myvm"), PathBuf::from("/data/vms/myvm/.installed"));
        assert_eq!(p.firmware_vars("myvm"), PathBuf::from("/data/state/firmware/myvm-vars.fd"));
        assert_eq!(p.tpm_dir("myvm"), PathBuf::from("/data/state/tpm/myvm"));
    }

    #[test]
    fn state_tree_under_root() {
        let p = Paths::rooted_at("/custom");
        assert_eq!(p.state_dir(), PathBuf::from("/custom/state"));
        assert_eq!(p.boot_iso_cache(), PathBuf::from("/custom/state/boot-isos"));
        assert_eq!(p.oci_disk_cache(), PathBuf::from("/custom/state/oci-disks"));
    }
}
