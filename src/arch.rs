//! Architecture profiles and static device capability tables.

use std::path::Path;

/// Firmware file pair for one boot mode.
#[derive(Debug, Clone, Copy)]
pub struct FirmwarePair {
    pub loader: &'static str,
    pub vars_template: &'static str,
}

/// Per-architecture machine defaults.
#[derive(Debug, Clone, Copy)]
pub struct ArchProfile {
    pub name: &'static str,
    pub machine: &'static str,
    pub features: &'static [&'static str],
    /// CPU model substituted for `host` when KVM is unavailable.
    pub tcg_fallback: &'static str,
    /// UEFI firmware (x86_64 splits by boot mode; see [`ArchProfile::firmware_for`]).
    pub uefi: Option<FirmwarePair>,
    pub secure: Option<FirmwarePair>,
}

pub const ARCH_PROFILES: &[ArchProfile] = &[
    ArchProfile {
        name: "x86_64",
        machine: "q35",
        features: &["acpi", "apic", "pae"],
        tcg_fallback: "qemu64",
        uefi: Some(FirmwarePair {
            loader: "/usr/share/OVMF/OVMF_CODE_4M.fd",
            vars_template: "/usr/share/OVMF/OVMF_VARS_4M.fd",
        }),
        secure: Some(FirmwarePair {
            loader: "/usr/share/OVMF/OVMF_CODE_4M.ms.fd",
            vars_template: "/usr/share/OVMF/OVMF_VARS_4M.ms.fd",
        }),
    },
    ArchProfile {
        name: "aarch64",
        machine: "virt",
        features: &["acpi"],
        tcg_fallback: "cortex-a72",
        uefi: Some(FirmwarePair {
            loader: "/usr/share/AAVMF/AAVMF_CODE.fd",
            vars_template: "/usr/share/AAVMF/AAVMF_VARS.fd",
        }),
        secure: None,
    },
    ArchProfile {
        name: "ppc64",
        machine: "pseries",
        features: &[],
        tcg_fallback: "power8",
        uefi: None,
        secure: None,
    },
    ArchProfile {
        name: "s390x",
        machine: "s390-ccw-virtio",
        features: &[],
        tcg_fallback: "qemu",
        uefi: None,
        secure: None,
    },
    ArchProfile {
        name: "riscv64",
        machine: "virt",
        features: &[],
        tcg_fallback: "rv64",
        uefi: None,
        secure: None,
    },
];

const ARCH_ALIASES: &[(&str, &str)] = &[
    ("amd64", "x86_64"),
    ("arm64", "aarch64"),
    ("ppc64le", "ppc64"),
    ("ppc64el", "ppc64"),
    ("powerpc64", "ppc64"),
    ("riscv", "riscv64"),
];

/// Normalize an architecture name through the alias table (lowercased input).
pub fn normalize_arch(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    ARCH_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, canon)| (*canon).to_string())
        .unwrap_or(lower)
}

pub fn profile_for(arch: &str) -> Option<&'static ArchProfile> {
    ARCH_PROFILES.iter().find(|p| p.name == arch)
}

pub fn supported_arch_names() -> Vec<&'static str> {
    let mut names: Vec<&str> = ARCH_PROFILES.iter().map(|p| p.name).collect();
    names.sort_unstable();
    names
}

impl ArchProfile {
    /// Firmware pair for the requested boot mode, if the arch declares one.
    /// Non-x86 arches that carry firmware use it regardless of boot mode.
    pub fn firmware_for(&self, boot_mode: &str) -> Option<FirmwarePair> {
        if self.name == "x86_64" {
            match boot_mode {
                "uefi" => self.uefi,
                "secure" => self.secure,
                _ => None,
            }
        } else {
            self.uefi
        }
    }

    pub fn emulator(&self) -> String {
        format!("qemu-system-{}", self.name)
    }
}

// ── Disk controllers ───────────────────────────────────────

/// Target bus and device-name prefix implied by a disk controller.
#[derive(Debug, Clone, Copy)]
pub struct DiskController {
    pub name: &'static str,
    pub bus: &'static str,
    pub dev_prefix: &'static str,
}

pub const DISK_CONTROLLERS: &[DiskController] = &[
    DiskController { name: "virtio", bus: "virtio", dev_prefix: "vd" },
    DiskController { name: "scsi", bus: "scsi", dev_prefix: "sd" },
    DiskController { name: "nvme", bus: "nvme", dev_prefix: "nvme" },
    DiskController { name: "ide", bus: "ide", dev_prefix: "hd" },
    DiskController { name: "usb", bus: "usb", dev_prefix: "sd" },
];

pub fn disk_controller(name: &str) -> Option<&'static DiskController> {
    DISK_CONTROLLERS.iter().find(|c| c.name == name)
}

pub const DISK_IO_MODES: &[&str] = &["native", "threads", "io_uring"];
pub const DISK_CACHE_MODES: &[&str] = &["none", "writeback", "writethrough", "directsync", "unsafe"];

pub const SUPPORTED_NETWORK_MODELS: &[&str] =
    &["virtio", "e1000", "e1000e", "rtl8139", "ne2k_pci", "pcnet", "vmxnet3"];

// ── Image pipeline format tables ───────────────────────────

/// Foreign disk formats converted to qcow2 during post-processing.
pub const CONVERTIBLE_FORMATS: &[&str] = &["vhd", "vhdx", "vmdk", "vdi", "raw"];

/// Extensions stripped by the extraction loop, innermost last.
pub const COMPRESSED_EXTENSIONS: &[&str] =
    &[".gz", ".xz", ".bz2", ".zip", ".7z", ".rar", ".tar", ".ova"];

pub fn has_compressed_extension(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    COMPRESSED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

// ── iPXE ROMs ──────────────────────────────────────────────

/// Default iPXE option ROMs shipped with QEMU, keyed by (arch, NIC model).
pub fn default_ipxe_rom(arch: &str, model: &str) -> Option<&'static Path> {
    let prefix = match arch {
        "x86_64" => "pxe",
        "aarch64" => "efi",
        _ => return None,
    };
    let path: &'static str = match (prefix, model) {
        ("pxe", "virtio") => "/usr/share/qemu/pxe-virtio.rom",
        ("pxe", "e1000") => "/usr/share/qemu/pxe-e1000.rom",
        ("pxe", "e1000e") => "/usr/share/qemu/pxe-e1000e.rom",
        ("pxe", "rtl8139") => "/usr/share/qemu/pxe-rtl8139.rom",
        ("pxe", "ne2k_pci") => "/usr/share/qemu/pxe-ne2k_pci.rom",
        ("pxe", "pcnet") => "/usr/share/qemu/pxe-pcnet.rom",
        ("pxe", "vmxnet3") => "/usr/share/qemu/pxe-vmxnet3.rom",
        ("efi", "virtio") => "/usr/share/qemu/efi-virtio.rom",
        ("efi", "e1000") => "/usr/share/qemu/efi-e1000.rom",
        ("efi", "e1000e") => "/usr/share/qemu/efi-e1000e.rom",
        ("efi", "rtl8139") => "/usr/share/qemu/efi-rtl8139.rom",
        ("efi", "ne2k_pci") => "/usr/share/qemu/efi-ne2k_pci.rom",
        ("efi", "pcnet") => "/usr/share/qemu/efi-pcnet.rom",
        ("efi", "vmxnet3") => "/usr/share/qemu/efi-vmxnet3.rom",
        _ => return None,
    };
    Some(Path::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_normalize() {
        assert_eq!(normalize_arch("amd64"), "x86_64");
        assert_eq!(normalize_arch("ARM64"), "aarch64");
        assert_eq!(normalize_arch("ppc64le"), "ppc64");
        assert_eq!(normalize_arch("riscv"), "riscv64");
        assert_eq!(normalize_arch("x86_64"), "x86_64");
        assert_eq!(normalize_arch("sparc"), "sparc");
    }

    #[test]
    fn profiles_cover_supported_set() {
        for arch in ["x86_64", "aarch64", "ppc64", "s390x", "riscv64"] {
            assert!(profile_for(arch).is_some(), "missing profile for {arch}");
        }
        assert!(profile_for("sparc").is_none());
    }

    #[test]
    fn x86_firmware_split_by_boot_mode() {
        let p = profile_for("x86_64").unwrap();
        assert!(p.firmware_for("legacy").is_none());
        assert!(p.firmware_for("uefi").unwrap().loader.contains("OVMF_CODE_4M.fd"));
        assert!(p.firmware_for("secure").unwrap().loader.contains(".ms.fd"));
    }

    #[test]
    fn aarch64_firmware_ignores_boot_mode() {
        let p = profile_for("aarch64").unwrap();
        assert!(p.firmware_for("legacy").unwrap().loader.contains("AAVMF"));
    }

    #[test]
    fn controller_matrix() {
        assert_eq!(disk_controller("virtio").unwrap().dev_prefix, "vd");
        assert_eq!(disk_controller("scsi").unwrap().bus, "scsi");
        assert_eq!(disk_controller("ide").unwrap().dev_prefix, "hd");
        assert!(disk_controller("floppy").is_none());
    }

    #[test]
    fn compressed_extension_detection() {
        assert!(has_compressed_extension("disk.qcow2.GZ"));
        assert!(has_compressed_extension("appliance.ova"));
        assert!(!has_compressed_extension("disk.qcow2"));
    }

    #[test]
    fn ipxe_rom_lookup() {
        assert!(default_ipxe_rom("x86_64", "virtio").unwrap().ends_with("pxe-virtio.rom"));
        assert!(default_ipxe_rom("aarch64", "e1000").unwrap().ends_with("efi-e1000.rom"));
        assert!(default_ipxe_rom("ppc64", "virtio").is_none());
        assert!(default_ipxe_rom("x86_64", "unknown-model").is_none());
    }
}
