//! Environment-variable resolution into an immutable [`VmConfig`].
//!
//! `parse_env` is fail-fast: the first violation aborts with a
//! [`BoxvmError::Config`] naming the offending variable and value, and no
//! partial config is ever returned. Everything downstream may assume the
//! invariants established here (port uniqueness, NIC completeness, arch
//! support, boot-order sanity).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::arch::{self, normalize_arch, supported_arch_names};
use crate::catalog::Catalog;
use crate::error::BoxvmError;
use crate::host;
use crate::paths::Paths;

const TRUTHY: &[&str] = &["1", "true", "yes", "on"];

pub fn is_truthy(raw: &str) -> bool {
    TRUTHY.contains(&raw.trim().to_ascii_lowercase().as_str())
}

// ── Environment source ─────────────────────────────────────

/// Snapshot of the environment variables the resolver reads.
///
/// Captured once so tests can construct configs from plain maps instead of
/// mutating process state.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    vars: BTreeMap<String, String>,
}

impl EnvSource {
    pub fn from_process() -> Self {
        Self { vars: std::env::vars().collect() }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// `NETWORK_MODE` for index 1, `NETWORK2_MODE` for index 2, and so on.
    fn get_indexed(&self, name: &str, index: usize) -> Option<&str> {
        if index == 1 {
            return self.get(name);
        }
        let (prefix, rest) = name.split_once('_').unwrap_or((name, ""));
        self.get(&format!("{prefix}{index}_{rest}"))
    }

    fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(raw) => is_truthy(raw),
            None => default,
        }
    }

    fn get_u16(&self, name: &str, default: u16) -> Result<u16, BoxvmError> {
        let raw = self.get(name).unwrap_or("").trim();
        if raw.is_empty() {
            return Ok(default);
        }
        let value: u32 = raw
            .parse()
            .map_err(|_| BoxvmError::config(format!("{name} must be an integer (got '{raw}')")))?;
        if !(1..=65535).contains(&value) {
            return Err(BoxvmError::config(format!("{name} must be between 1 and 65535 (got {value})")));
        }
        Ok(value as u16)
    }
}

// ── Component records ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicMode {
    User,
    Bridge,
    Direct,
}

impl NicMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicMode::User => "user",
            NicMode::Bridge => "bridge",
            NicMode::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Nic {
    pub mode: NicMode,
    pub bridge_name: Option<String>,
    pub direct_device: Option<String>,
    pub mac_address: String,
    pub model: String,
    pub boot: bool,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FilesystemShare {
    pub source: PathBuf,
    pub target: String,
    pub driver: String,
    pub accessmode: String,
    pub readonly: bool,
}

#[derive(Debug, Clone)]
pub struct ExtraDisk {
    pub index: u8,
    pub size: String,
}

#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub index: u8,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    Hd,
    Cdrom,
    Network,
}

impl BootDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootDevice::Hd => "hd",
            BootDevice::Cdrom => "cdrom",
            BootDevice::Network => "network",
        }
    }

    fn parse(raw: &str) -> Result<Self, BoxvmError> {
        match raw {
            "hd" => Ok(BootDevice::Hd),
            "cdrom" => Ok(BootDevice::Cdrom),
            "network" => Ok(BootDevice::Network),
            other => Err(BoxvmError::config(format!(
                "unknown BOOT_ORDER device '{other}'. Supported: hd, cdrom, network"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsType {
    None,
    Vnc,
    Spice,
}

impl GraphicsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphicsType::None => "none",
            GraphicsType::Vnc => "vnc",
            GraphicsType::Spice => "spice",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Legacy,
    Uefi,
    Secure,
}

impl BootMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootMode::Legacy => "legacy",
            BootMode::Uefi => "uefi",
            BootMode::Secure => "secure",
        }
    }
}

// ── The immutable result ───────────────────────────────────

/// Fully-resolved VM configuration. Built once by [`parse_env`]; frozen after.
#[derive(Debug, Clone)]
pub struct VmConfig {
    // identity
    pub vm_name: String,
    pub distro: String,
    pub distro_name: String,
    pub image_url: String,
    pub login_user: String,
    pub image_format: String,
    // resources
    pub memory_mb: u64,
    pub cpus: u32,
    pub disk_size: String,
    // architecture / firmware
    pub arch: String,
    pub machine_type: String,
    pub boot_mode: BootMode,
    pub cpu_model: String,
    // boot source
    pub boot_from: Option<String>,
    pub base_image_path: Option<String>,
    pub blank_work_disk: bool,
    pub boot_order: Vec<BootDevice>,
    pub force_iso: bool,
    // cloud-init
    pub cloud_init_enabled: bool,
    pub cloud_init_user_data_path: Option<PathBuf>,
    pub password: String,
    pub ssh_pubkey: Option<String>,
    // devices
    pub nics: Vec<Nic>,
    pub filesystems: Vec<FilesystemShare>,
    pub extra_disks: Vec<ExtraDisk>,
    pub block_devices: Vec<BlockDevice>,
    pub port_forwards: Vec<PortForward>,
    // graphics
    pub graphics_type: GraphicsType,
    pub novnc_enabled: bool,
    pub vnc_port: u16,
    pub novnc_port: u16,
    pub vnc_keymap: String,
    // redfish
    pub redfish_enabled: bool,
    pub redfish_user: String,
    pub redfish_password: String,
    pub redfish_port: u16,
    pub redfish_system_id: String,
    // feature flags
    pub tpm_enabled: bool,
    pub hyperv_enabled: bool,
    pub io_thread: bool,
    pub balloon_enabled: bool,
    pub rng_enabled: bool,
    pub usb_controller: bool,
    pub gpu_passthrough: String,
    // disk tuning
    pub disk_controller: String,
    pub disk_io: String,
    pub disk_cache: String,
    pub disk_preallocate: bool,
    // iPXE
    pub ipxe_enabled: bool,
    pub ipxe_rom_path: Option<PathBuf>,
    // runtime
    pub persist: bool,
    pub ssh_port: u16,
    pub no_console: bool,
    pub require_kvm: bool,
    pub libvirt_uri: String,
    pub download_retries: u32,
    pub extra_args: String,
}

// ── Derivation helpers ─────────────────────────────────────

/// SHA-256-seeded MAC with the QEMU OUI, locally-administered bit set and
/// multicast bit cleared. Stable across runs for the same seed.
pub fn deterministic_mac(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let octet3 = (digest[0] | 0x02) & 0xfe;
    format!("52:54:00:{octet3:02x}:{:02x}:{:02x}", digest[1], digest[2])
}

pub fn generate_password() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..12).map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char).collect()
}

fn looks_like_container_id(candidate: &str) -> bool {
    (12..=64).contains(&candidate.len())
        && candidate.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn derive_vm_name(env: &EnvSource, distro: &str, iso_mode: bool) -> String {
    if let Some(explicit) = env.get("GUEST_NAME") {
        let explicit = explicit.trim();
        if !explicit.is_empty() {
            return explicit.to_string();
        }
    }
    if let Some(hostname) = env.get("HOSTNAME") {
        let candidate = hostname.trim();
        if !candidate.is_empty() {
            if looks_like_container_id(candidate) {
                tracing::info!(hostname = candidate, "container hostname looks like a container id; not using it as VM name");
            } else {
                return candidate.to_string();
            }
        }
    }
    if iso_mode {
        return "custom-vm".to_string();
    }
    distro.to_string()
}

fn valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts.iter().all(|p| {
            p.len() == 2 && p.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        })
}

fn valid_disk_size(raw: &str) -> bool {
    let raw = raw.as_bytes();
    if raw.is_empty() {
        return false;
    }
    let (digits, suffix) = match raw.last() {
        Some(last) if last.is_ascii_alphabetic() => (&raw[..raw.len() - 1], Some(*last)),
        _ => (&raw[..], None),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return false;
    }
    match suffix {
        None => true,
        Some(s) => b"KMGTkmgt".contains(&s),
    }
}

/// Parse a size string (`20G`, `512M`, plain bytes) into bytes, binary units.
pub fn parse_size_to_bytes(s: &str) -> Result<u64, BoxvmError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(BoxvmError::config("size cannot be empty"));
    }
    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };
    let num: u64 = num_str
        .parse()
        .map_err(|_| BoxvmError::config(format!("invalid size number: '{num_str}'")))?;
    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(BoxvmError::config(format!(
                "unknown size suffix: '{suffix}' (use K, M, G, or T)"
            )));
        }
    };
    num.checked_mul(multiplier)
        .ok_or_else(|| BoxvmError::config(format!("size overflows: '{s}'")))
}

/// `http(s)://` URLs aside, a reference is OCI when its first path component
/// carries a dot or a port and a second component follows.
pub fn is_oci_reference(reference: &str) -> bool {
    if reference.is_empty() || reference.starts_with('/') || reference.contains("://") {
        return false;
    }
    let Some((first, rest)) = reference.split_once('/') else {
        return false;
    };
    !rest.is_empty() && (first.contains('.') || first.contains(':'))
}

fn boot_from_is_iso(boot_from: &str) -> bool {
    if is_oci_reference(boot_from) {
        return false;
    }
    let name = boot_from.split(['?', '#']).next().unwrap_or(boot_from);
    name.to_ascii_lowercase().ends_with(".iso")
}

/// Expand `max`/`half` resource tokens against host probes.
fn resolve_memory_mb(env: &EnvSource) -> Result<u64, BoxvmError> {
    let raw = env.get("MEMORY").unwrap_or("4096").trim().to_ascii_lowercase();
    match raw.as_str() {
        "max" | "half" => {
            let available = host::available_memory() / (1024 * 1024);
            let resolved = if raw == "max" { available } else { available / 2 };
            Ok(resolved.max(512))
        }
        _ => {
            let value: u64 = raw
                .parse()
                .map_err(|_| BoxvmError::config(format!("MEMORY must be an integer, 'max' or 'half' (got '{raw}')")))?;
            if value < 128 {
                return Err(BoxvmError::config(format!("MEMORY must be >= 128 MiB (got {value})")));
            }
            Ok(value)
        }
    }
}

fn resolve_cpus(env: &EnvSource) -> Result<u32, BoxvmError> {
    let raw = env.get("CPUS").unwrap_or("2").trim().to_ascii_lowercase();
    match raw.as_str() {
        "max" => Ok(host::cpu_count().max(1)),
        "half" => Ok((host::cpu_count() / 2).max(1)),
        _ => {
            let value: u32 = raw
                .parse()
                .map_err(|_| BoxvmError::config(format!("CPUS must be an integer, 'max' or 'half' (got '{raw}')")))?;
            if value < 1 {
                return Err(BoxvmError::config(format!("CPUS must be >= 1 (got {value})")));
            }
            Ok(value)
        }
    }
}

fn resolve_disk_size(env: &EnvSource, paths: &Paths) -> Result<String, BoxvmError> {
    let raw = env.get("DISK_SIZE").unwrap_or("20G").trim().to_string();
    let lower = raw.to_ascii_lowercase();
    if lower == "max" || lower == "half" {
        let available = host::available_disk_space(paths.images_dir());
        let bytes = if lower == "max" { available } else { available / 2 };
        if bytes == 0 {
            return Err(BoxvmError::config(format!(
                "DISK_SIZE={raw} but free space at {} could not be determined",
                paths.images_dir().display()
            )));
        }
        return Ok(bytes.to_string());
    }
    if !valid_disk_size(&raw) {
        return Err(BoxvmError::config(format!(
            "invalid DISK_SIZE '{raw}'. Use a number with optional suffix: K, M, G, T (e.g. '20G')"
        )));
    }
    Ok(raw)
}

// ── NIC / filesystem / disk sub-parsers ────────────────────

fn build_nic(env: &EnvSource, index: usize, vm_name: &str, host_mtu: Option<u32>) -> Result<Option<Nic>, BoxvmError> {
    let suffix = if index == 1 { String::new() } else { index.to_string() };

    let mode_raw = env.get_indexed("NETWORK_MODE", index).map(str::trim).filter(|s| !s.is_empty());
    let mode_raw = match mode_raw {
        Some(m) => m.to_string(),
        None if index == 1 => "nat".to_string(),
        None => return Ok(None),
    };

    let mode = match mode_raw.to_ascii_lowercase().as_str() {
        "nat" => NicMode::User,
        "bridge" => NicMode::Bridge,
        "direct" => NicMode::Direct,
        other => {
            return Err(BoxvmError::config(format!(
                "unsupported NETWORK{suffix}_MODE '{other}'. Expected one of nat, bridge, direct."
            )));
        }
    };

    let bridge_name = match mode {
        NicMode::Bridge => {
            let name = env
                .get_indexed("NETWORK_BRIDGE", index)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    BoxvmError::config(format!(
                        "NETWORK{suffix}_BRIDGE is required when NETWORK{suffix}_MODE=bridge"
                    ))
                })?;
            Some(name.to_string())
        }
        _ => None,
    };

    let direct_device = match mode {
        NicMode::Direct => {
            let dev = env
                .get_indexed("NETWORK_DIRECT_DEV", index)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    BoxvmError::config(format!(
                        "NETWORK{suffix}_DIRECT_DEV is required when NETWORK{suffix}_MODE=direct"
                    ))
                })?;
            Some(dev.to_string())
        }
        _ => None,
    };

    let mac_address = match env.get_indexed("NETWORK_MAC", index).map(|m| m.trim().to_ascii_lowercase()) {
        Some(mac) if !mac.is_empty() => {
            if !valid_mac(&mac) {
                return Err(BoxvmError::config(format!(
                    "invalid NETWORK{suffix}_MAC '{mac}'. Use format aa:bb:cc:dd:ee:ff"
                )));
            }
            mac
        }
        _ => deterministic_mac(&format!("{vm_name}:{index}")),
    };

    let model = env
        .get_indexed("NETWORK_MODEL", index)
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "virtio".to_string());
    if !arch::SUPPORTED_NETWORK_MODELS.contains(&model.as_str()) {
        return Err(BoxvmError::config(format!(
            "unsupported NETWORK{suffix}_MODEL '{model}'. Supported: {}",
            arch::SUPPORTED_NETWORK_MODELS.join(", ")
        )));
    }

    let boot = env
        .get_indexed("NETWORK_BOOT", index)
        .map(is_truthy)
        .unwrap_or(false);

    // MTU only matters for the passt-backed user NIC
    let mtu = if index == 1 && mode == NicMode::User {
        match env.get("NETWORK_MTU") {
            Some(raw) => Some(raw.trim().parse().map_err(|_| {
                BoxvmError::config(format!("NETWORK_MTU must be an integer (got '{raw}')"))
            })?),
            None => host_mtu,
        }
    } else {
        None
    };

    Ok(Some(Nic {
        mode,
        bridge_name,
        direct_device,
        mac_address,
        model,
        boot,
        mtu,
    }))
}

fn build_filesystem(env: &EnvSource, index: usize) -> Result<Option<FilesystemShare>, BoxvmError> {
    let suffix = if index == 1 { String::new() } else { index.to_string() };

    let source_raw = env.get_indexed("FILESYSTEM_SOURCE", index);
    let target_raw = env.get_indexed("FILESYSTEM_TARGET", index);
    let driver_raw = env.get_indexed("FILESYSTEM_DRIVER", index);
    let accessmode_raw = env.get_indexed("FILESYSTEM_ACCESSMODE", index);
    let readonly_raw = env.get_indexed("FILESYSTEM_READONLY", index);

    let triggered = [source_raw, target_raw, driver_raw, accessmode_raw]
        .iter()
        .any(|v| v.is_some_and(|s| !s.trim().is_empty()))
        || readonly_raw.is_some_and(is_truthy);
    if !triggered {
        return Ok(None);
    }

    let source_raw = source_raw.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(|| {
        BoxvmError::config(format!(
            "FILESYSTEM{suffix}_SOURCE is required when configuring a filesystem share"
        ))
    })?;
    let source = PathBuf::from(source_raw);

    let target = match target_raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(t) => t.to_string(),
        None => {
            let derived = source
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .filter(|n| !n.is_empty() && n != "." && n != "/");
            match derived {
                Some(d) => {
                    tracing::info!(tag = %d, "FILESYSTEM{suffix}_TARGET auto-derived from source path");
                    d
                }
                None => {
                    return Err(BoxvmError::config(format!(
                        "FILESYSTEM{suffix}_TARGET is required (could not auto-derive from source '{source_raw}')"
                    )));
                }
            }
        }
    };
    if target.contains('/') {
        return Err(BoxvmError::config(format!(
            "FILESYSTEM{suffix}_TARGET '{target}' must be a simple tag without '/' characters"
        )));
    }

    let readonly = readonly_raw.is_some_and(is_truthy);

    if source.exists() {
        if !source.is_dir() {
            return Err(BoxvmError::config(format!(
                "FILESYSTEM{suffix}_SOURCE {} must point to a directory",
                source.display()
            )));
        }
    } else if readonly {
        return Err(BoxvmError::config(format!(
            "FILESYSTEM{suffix}_SOURCE {} does not exist and cannot be created while readonly",
            source.display()
        )));
    } else {
        crate::paths::ensure_directory(&source)?;
    }

    let driver = driver_raw
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "virtiofs".to_string());
    if driver != "virtiofs" && driver != "9p" {
        return Err(BoxvmError::config(format!(
            "unsupported FILESYSTEM{suffix}_DRIVER '{driver}'. Supported: virtiofs, 9p"
        )));
    }

    let accessmode = accessmode_raw
        .map(|a| a.trim().to_ascii_lowercase())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| "passthrough".to_string());
    if !["passthrough", "mapped", "squash"].contains(&accessmode.as_str()) {
        return Err(BoxvmError::config(format!(
            "unsupported FILESYSTEM{suffix}_ACCESSMODE '{accessmode}'. Supported: passthrough, mapped, squash."
        )));
    }
    if driver == "virtiofs" && accessmode != "passthrough" {
        return Err(BoxvmError::config(format!(
            "FILESYSTEM{suffix}_ACCESSMODE='{accessmode}' is not supported with virtiofs. \
             virtiofs only supports 'passthrough'; use FILESYSTEM_DRIVER=9p for 'mapped' or 'squash'."
        )));
    }

    Ok(Some(FilesystemShare { source, target, driver, accessmode, readonly }))
}

fn build_extra_disks(env: &EnvSource) -> Result<Vec<ExtraDisk>, BoxvmError> {
    let mut disks = Vec::new();
    for index in 2u8..=6 {
        let Some(raw) = env.get(&format!("DISK{index}_SIZE")) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        if !valid_disk_size(raw) {
            return Err(BoxvmError::config(format!(
                "invalid DISK{index}_SIZE '{raw}'. Use a number with optional suffix: K, M, G, T"
            )));
        }
        disks.push(ExtraDisk { index, size: raw.to_string() });
    }
    Ok(disks)
}

fn build_block_devices(env: &EnvSource) -> Result<Vec<BlockDevice>, BoxvmError> {
    use std::os::unix::fs::FileTypeExt;

    let mut devices = Vec::new();
    for index in 1u8..=6 {
        let name = if index == 1 { "DEVICE".to_string() } else { format!("DEVICE{index}") };
        let Some(raw) = env.get(&name) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let meta = std::fs::metadata(raw)
            .map_err(|_| BoxvmError::config(format!("{name} '{raw}' not found")))?;
        if !meta.file_type().is_block_device() {
            return Err(BoxvmError::config(format!("{name} '{raw}' is not a block device")));
        }
        devices.push(BlockDevice { index, path: raw.to_string() });
    }
    Ok(devices)
}

// ── Cloud-init user-data validation ────────────────────────

const CLOUD_INIT_HEADERS: &[&str] =
    &["#cloud-config", "#!", "#cloud-boothook", "#include", "#part-handler"];

fn validate_user_data_file(path: &Path) -> Result<(), BoxvmError> {
    if !path.exists() {
        return Err(BoxvmError::config(format!(
            "CLOUD_INIT_USER_DATA file not found: {}\n  Ensure the file is bind-mounted into the container (e.g. -v /host/path:/container/path:ro)",
            path.display()
        )));
    }
    if !path.is_file() {
        return Err(BoxvmError::config(format!(
            "CLOUD_INIT_USER_DATA must point to a regular file: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| BoxvmError::io(format!("cannot read CLOUD_INIT_USER_DATA {}", path.display()), e))?;
    let first_line = content.lines().next().unwrap_or("").trim();
    if !CLOUD_INIT_HEADERS.iter().any(|h| first_line.starts_with(h)) {
        let preview: String = first_line.chars().take(60).collect();
        tracing::warn!(
            first_line = %preview,
            "CLOUD_INIT_USER_DATA does not start with a recognized cloud-init header \
             (expected #cloud-config, #!/bin/bash, #cloud-boothook, #include, or #part-handler)"
        );
    }
    if first_line == "#cloud-config" {
        match facet_yaml::from_str::<facet_value::Value>(&content) {
            Ok(value) => {
                if value.as_object().is_none() {
                    tracing::warn!("CLOUD_INIT_USER_DATA: #cloud-config should contain a YAML mapping");
                }
            }
            Err(e) => {
                return Err(BoxvmError::config(format!(
                    "CLOUD_INIT_USER_DATA contains invalid YAML: {e}"
                )));
            }
        }
    }
    Ok(())
}

// ── parse_env ──────────────────────────────────────────────

pub fn parse_env(env: &EnvSource, catalog: &Catalog, paths: &Paths) -> Result<VmConfig, BoxvmError> {
    let distro = env.get("DISTRO").map(str::trim).filter(|s| !s.is_empty()).unwrap_or("ubuntu-2404");
    let entry = catalog.get(distro)?;

    let memory_mb = resolve_memory_mb(env)?;
    let cpus = resolve_cpus(env)?;
    let disk_size = resolve_disk_size(env, paths)?;

    // graphics: novnc is vnc plus the websockify proxy
    let display = env.get("GRAPHICS").map(|g| g.trim().to_ascii_lowercase()).filter(|g| !g.is_empty()).unwrap_or_else(|| "none".to_string());
    let novnc_enabled = display == "novnc";
    let graphics_type = match display.as_str() {
        "none" => GraphicsType::None,
        "vnc" | "novnc" => GraphicsType::Vnc,
        "spice" => GraphicsType::Spice,
        other => {
            return Err(BoxvmError::config(format!(
                "unsupported GRAPHICS '{other}'. Expected one of none, vnc, spice, novnc."
            )));
        }
    };
    let vnc_port = env.get_u16("VNC_PORT", 5900)?;
    let novnc_port = env.get_u16("NOVNC_PORT", 6080)?;
    let vnc_keymap = env.get("VNC_KEYMAP").map(str::trim).unwrap_or("").to_string();

    // no-console inference: a GUI console rarely wants the serial one too
    let no_console = match env.get("NO_CONSOLE") {
        Some(raw) => is_truthy(raw),
        None => {
            if novnc_enabled {
                tracing::info!("GRAPHICS=novnc detected; auto-disabling serial console (set NO_CONSOLE=0 to override)");
                true
            } else {
                false
            }
        }
    };

    // boot source
    let mut base_image_path = env.get("BASE_IMAGE").map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let blank_disk_explicit = env.get("BLANK_DISK").is_some();
    let mut blank_work_disk = env.get_bool("BLANK_DISK", false);
    if base_image_path.as_deref().is_some_and(|b| b.eq_ignore_ascii_case("blank")) {
        blank_work_disk = true;
        base_image_path = None;
    }

    let boot_from = env.get("BOOT_FROM").map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let iso_requested = boot_from.as_deref().is_some_and(boot_from_is_iso);

    let boot_order_raw = env.get("BOOT_ORDER").map(str::trim).filter(|s| !s.is_empty()).unwrap_or("hd");
    let mut boot_order = Vec::new();
    for item in boot_order_raw.split(',') {
        let item = item.trim().to_ascii_lowercase();
        if item.is_empty() {
            continue;
        }
        boot_order.push(BootDevice::parse(&item)?);
    }
    if boot_order.is_empty() {
        boot_order.push(BootDevice::Hd);
    }
    if iso_requested && !boot_order.contains(&BootDevice::Cdrom) {
        boot_order.insert(0, BootDevice::Cdrom);
    }
    if iso_requested && base_image_path.is_none() && !blank_disk_explicit {
        // Installing from ISO without an explicit base image: blank target disk.
        blank_work_disk = true;
    }

    let cloud_init_enabled = match env.get("CLOUD_INIT") {
        Some(raw) => is_truthy(raw),
        None if iso_requested => {
            tracing::info!("installer ISO detected; auto-disabling cloud-init (set CLOUD_INIT=1 to override)");
            false
        }
        None => true,
    };

    let cloud_init_user_data_path = match env.get("CLOUD_INIT_USER_DATA").map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => {
            let path = PathBuf::from(raw);
            validate_user_data_file(&path)?;
            Some(path)
        }
        None => None,
    };

    // architecture
    let distro_arch = entry.normalized_arch()?;
    let arch_env = env.get("ARCH").map(str::trim).filter(|s| !s.is_empty());
    let arch = match (arch_env, distro_arch.as_deref()) {
        (Some(requested), declared) => {
            let requested_norm = normalize_arch(requested);
            if arch::profile_for(&requested_norm).is_none() {
                return Err(BoxvmError::config(format!(
                    "unsupported ARCH '{requested}'. Supported: {}",
                    supported_arch_names().join(", ")
                )));
            }
            if let Some(declared) = declared
                && declared != requested_norm
            {
                return Err(BoxvmError::config(format!(
                    "ARCH='{requested}' does not match distribution '{distro}' arch '{declared}'."
                )));
            }
            requested_norm
        }
        (None, Some(declared)) => declared.to_string(),
        (None, None) => "x86_64".to_string(),
    };
    let profile = arch::profile_for(&arch).expect("arch validated above");

    let machine_type = if arch == "x86_64" {
        env.get("MACHINE_TYPE").map(str::trim).filter(|s| !s.is_empty()).unwrap_or("q35").to_string()
    } else {
        profile.machine.to_string()
    };

    let boot_mode = match env.get("BOOT_MODE").map(|m| m.trim().to_ascii_lowercase()).filter(|m| !m.is_empty()).as_deref() {
        None | Some("legacy") => BootMode::Legacy,
        Some("uefi") => BootMode::Uefi,
        Some("secure") => BootMode::Secure,
        Some(other) => {
            return Err(BoxvmError::config(format!(
                "unsupported BOOT_MODE '{other}'. Expected one of legacy, uefi, secure."
            )));
        }
    };
    let firmware_missing = match boot_mode {
        BootMode::Legacy => false,
        BootMode::Uefi => profile.uefi.is_none(),
        BootMode::Secure => profile.secure.is_none(),
    };
    if firmware_missing {
        return Err(BoxvmError::config(format!(
            "BOOT_MODE={} is not available for ARCH={arch}",
            boot_mode.as_str()
        )));
    }

    let cpu_model = env.get("CPU_MODEL").map(str::trim).filter(|s| !s.is_empty()).unwrap_or("host").to_string();
    let extra_args = env.get("EXTRA_ARGS").unwrap_or("").to_string();

    let password = match env.get("GUEST_PASSWORD") {
        Some(p) => p.to_string(),
        None => {
            let generated = generate_password();
            tracing::info!(password = %generated, "no GUEST_PASSWORD set; generated random password");
            generated
        }
    };
    let ssh_port = env.get_u16("SSH_PORT", 2222)?;
    let ssh_pubkey = env.get("SSH_PUBKEY").map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

    let vm_name = derive_vm_name(env, distro, iso_requested);

    // NICs: the first missing index terminates the sequence
    let host_mtu = host::default_interface_mtu();
    let mut nics = Vec::new();
    let primary = build_nic(env, 1, &vm_name, host_mtu)?
        .ok_or_else(|| BoxvmError::config("failed to configure primary network interface"))?;
    nics.push(primary);
    let mut nic_index = 2;
    while let Some(nic) = build_nic(env, nic_index, &vm_name, host_mtu)? {
        nics.push(nic);
        nic_index += 1;
    }

    let mut filesystems = Vec::new();
    let mut fs_index = 1;
    while let Some(fs) = build_filesystem(env, fs_index)? {
        filesystems.push(fs);
        fs_index += 1;
    }

    let extra_disks = build_extra_disks(env)?;
    let block_devices = build_block_devices(env)?;

    // disk tuning
    let disk_controller = env
        .get("DISK_CONTROLLER")
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "virtio".to_string());
    if arch::disk_controller(&disk_controller).is_none() {
        let names: Vec<&str> = arch::DISK_CONTROLLERS.iter().map(|c| c.name).collect();
        return Err(BoxvmError::config(format!(
            "unsupported DISK_CONTROLLER '{disk_controller}'. Supported: {}",
            names.join(", ")
        )));
    }
    let disk_io = env
        .get("DISK_IO")
        .map(|i| i.trim().to_ascii_lowercase())
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| "native".to_string());
    if !arch::DISK_IO_MODES.contains(&disk_io.as_str()) {
        return Err(BoxvmError::config(format!(
            "unsupported DISK_IO '{disk_io}'. Supported: {}",
            arch::DISK_IO_MODES.join(", ")
        )));
    }
    let disk_cache = env
        .get("DISK_CACHE")
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "none".to_string());
    if !arch::DISK_CACHE_MODES.contains(&disk_cache.as_str()) {
        return Err(BoxvmError::config(format!(
            "unsupported DISK_CACHE '{disk_cache}'. Supported: {}",
            arch::DISK_CACHE_MODES.join(", ")
        )));
    }
    let disk_preallocate = env.get_bool("DISK_PREALLOCATE", false);

    // feature flags
    let tpm_enabled = env.get_bool("TPM", false);
    let hyperv_enabled = env.get_bool("HYPERV", false);
    let io_thread = env.get_bool("IO_THREAD", false);
    let balloon_enabled = env.get_bool("BALLOON", true);
    let rng_enabled = env.get_bool("RNG", true);
    let usb_controller = env.get_bool("USB", true);
    let gpu_passthrough = env
        .get("GPU")
        .map(|g| g.trim().to_ascii_lowercase())
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| "off".to_string());
    if gpu_passthrough != "off" && gpu_passthrough != "intel" {
        return Err(BoxvmError::config(format!(
            "unsupported GPU '{gpu_passthrough}'. Supported: off, intel"
        )));
    }

    // iPXE
    let ipxe_enabled = env.get_bool("IPXE_ENABLE", false);
    let mut ipxe_rom_path = None;
    if ipxe_enabled {
        boot_order.retain(|d| *d != BootDevice::Network);
        boot_order.insert(0, BootDevice::Network);
        nics[0].boot = true;

        let rom = match env.get("IPXE_ROM_PATH").map(str::trim).filter(|s| !s.is_empty()) {
            Some(path) => PathBuf::from(path),
            None => arch::default_ipxe_rom(&arch, &nics[0].model)
                .map(Path::to_path_buf)
                .ok_or_else(|| {
                    BoxvmError::config(format!(
                        "IPXE_ENABLE=1 requires IPXE_ROM_PATH when a default ROM is not available for \
                         ARCH='{arch}' with NETWORK_MODEL='{}'.",
                        nics[0].model
                    ))
                })?,
        };
        if !rom.exists() {
            return Err(BoxvmError::resource_with_hint(
                format!("iPXE ROM not found at {}", rom.display()),
                "override with IPXE_ROM_PATH or ensure QEMU packages include the ROMs",
            ));
        }
        if nics[0].mode == NicMode::User {
            tracing::warn!(
                "IPXE_ENABLE=1 with NETWORK_MODE=nat relies on the built-in user-mode DHCP/TFTP; \
                 prefer bridge or direct networking for real PXE environments"
            );
        }
        ipxe_rom_path = Some(rom);
    }

    // persistence defaults on when a data volume is mounted
    let persist = match env.get("PERSIST") {
        Some(raw) => is_truthy(raw),
        None => {
            if paths.data_volume() {
                tracing::info!("data volume detected; defaulting PERSIST=1 (override with PERSIST=0)");
                true
            } else {
                false
            }
        }
    };
    let force_iso = env.get_bool("FORCE_ISO", false);
    let require_kvm = env.get_bool("REQUIRE_KVM", false);

    // redfish
    let redfish_enabled = env.get_bool("REDFISH_ENABLE", false);
    let redfish_user = env.get("REDFISH_USERNAME").map(str::trim).filter(|s| !s.is_empty()).unwrap_or("admin").to_string();
    let redfish_password = match env.get("REDFISH_PASSWORD") {
        Some(p) => p.to_string(),
        None => generate_password(),
    };
    let redfish_port = env.get_u16("REDFISH_PORT", 8443)?;
    let redfish_system_id = env
        .get("REDFISH_SYSTEM_ID")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&vm_name)
        .to_string();

    // port forwards
    let mut port_forwards = Vec::new();
    if let Some(raw) = env.get("PORT_FWD") {
        for piece in raw.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let Some((host_raw, guest_raw)) = piece.split_once(':') else {
                return Err(BoxvmError::config(format!(
                    "invalid PORT_FWD entry '{piece}': expected format host_port:guest_port"
                )));
            };
            let parse_port = |raw: &str, which: &str| -> Result<u16, BoxvmError> {
                let value: u32 = raw.trim().parse().map_err(|_| {
                    BoxvmError::config(format!("invalid PORT_FWD entry '{piece}': ports must be integers"))
                })?;
                if !(1..=65535).contains(&value) {
                    return Err(BoxvmError::config(format!(
                        "invalid PORT_FWD entry '{piece}': {which} port {value} out of range (1-65535)"
                    )));
                }
                Ok(value as u16)
            };
            port_forwards.push(PortForward {
                host_port: parse_port(host_raw, "host")?,
                guest_port: parse_port(guest_raw, "guest")?,
            });
        }
    }

    // every active port must be unique
    let mut active_ports: Vec<(String, u16)> = vec![("SSH_PORT".to_string(), ssh_port)];
    if graphics_type == GraphicsType::Vnc {
        active_ports.push(("VNC_PORT".to_string(), vnc_port));
    }
    if novnc_enabled {
        active_ports.push(("NOVNC_PORT".to_string(), novnc_port));
    }
    if redfish_enabled {
        active_ports.push(("REDFISH_PORT".to_string(), redfish_port));
    }
    for pf in &port_forwards {
        active_ports.push((format!("PORT_FWD({}:{})", pf.host_port, pf.guest_port), pf.host_port));
    }
    let mut seen: BTreeMap<u16, &str> = BTreeMap::new();
    for (label, port) in &active_ports {
        if let Some(existing) = seen.get(port) {
            return Err(BoxvmError::config(format!(
                "port conflict: {label}={port} collides with {existing}={port}. Each service needs a unique port."
            )));
        }
        seen.insert(*port, label.as_str());
    }

    let download_retries = match env.get("DOWNLOAD_RETRIES") {
        Some(raw) => raw.trim().parse().map_err(|_| {
            BoxvmError::config(format!("DOWNLOAD_RETRIES must be an integer (got '{raw}')"))
        })?,
        None => 3,
    };

    let libvirt_uri = env
        .get("LIBVIRT_URI")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("qemu:///system")
        .to_string();

    Ok(VmConfig {
        vm_name,
        distro: distro.to_string(),
        distro_name: if iso_requested { "Custom ISO".to_string() } else { entry.name.clone() },
        image_url: entry.url.clone(),
        login_user: entry.user.clone(),
        image_format: entry.format().to_string(),
        memory_mb,
        cpus,
        disk_size,
        arch,
        machine_type,
        boot_mode,
        cpu_model,
        boot_from,
        base_image_path,
        blank_work_disk,
        boot_order,
        force_iso,
        cloud_init_enabled,
        cloud_init_user_data_path,
        password,
        ssh_pubkey,
        nics,
        filesystems,
        extra_disks,
        block_devices,
        port_forwards,
        graphics_type,
        novnc_enabled,
        vnc_port,
        novnc_port,
        vnc_keymap,
        redfish_enabled,
        redfish_user,
        redfish_password,
        redfish_port,
        redfish_system_id,
        tpm_enabled,
        hyperv_enabled,
        io_thread,
        balloon_enabled,
        rng_enabled,
        usb_controller,
        gpu_passthrough,
        disk_controller,
        disk_io,
        disk_cache,
        disk_preallocate,
        ipxe_enabled,
        ipxe_rom_path,
        persist,
        ssh_port,
        no_console,
        require_kvm,
        libvirt_uri,
        download_retries,
        extra_args,
    })
}

/// Filesystem-safe mount tag for use under `/mnt/` in the guest.
pub fn sanitize_mount_target(tag: &str) -> String {
    let safe: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || ".-_".contains(c) { c } else { '-' })
        .collect();
    let trimmed = safe.trim_matches('-');
    if trimmed.is_empty() { "share".to_string() } else { trimmed.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, DistroEntry};

    fn test_catalog() -> Catalog {
        let mut distributions = BTreeMap::new();
        distributions.insert(
            "ubuntu-2404".to_string(),
            DistroEntry {
                name: "Ubuntu 24.04".to_string(),
                url: "https://example.com/ubuntu.qcow2".to_string(),
                user: "ubuntu".to_string(),
                arch: Some("x86_64".to_string()),
                format: None,
            },
        );
        distributions.insert(
            "alma-arm".to_string(),
            DistroEntry {
                name: "AlmaLinux 9".to_string(),
                url: "https://example.com/alma.qcow2".to_string(),
                user: "alma".to_string(),
                arch: Some("arm64".to_string()),
                format: None,
            },
        );
        Catalog { distributions }
    }

    fn resolve(pairs: &[(&str, &str)]) -> Result<VmConfig, BoxvmError> {
        let env = EnvSource::from_pairs(pairs.iter().copied());
        parse_env(&env, &test_catalog(), &Paths::rooted_at("/images"))
    }

    #[test]
    fn defaults_for_plain_run() {
        let cfg = resolve(&[("DISTRO", "ubuntu-2404")]).unwrap();
        assert_eq!(cfg.vm_name, "ubuntu-2404");
        assert_eq!(cfg.memory_mb, 4096);
        assert_eq!(cfg.cpus, 2);
        assert_eq!(cfg.disk_size, "20G");
        assert_eq!(cfg.ssh_port, 2222);
        assert_eq!(cfg.boot_order, vec![BootDevice::Hd]);
        assert!(cfg.cloud_init_enabled);
        assert!(!cfg.persist);
        assert_eq!(cfg.nics.len(), 1);
        assert_eq!(cfg.nics[0].mode, NicMode::User);
        assert_eq!(cfg.graphics_type, GraphicsType::None);
        assert_eq!(cfg.login_user, "ubuntu");
    }

    #[test]
    fn deterministic_mac_is_stable_and_local() {
        let a = deterministic_mac("ubuntu-2404:1");
        let b = deterministic_mac("ubuntu-2404:1");
        assert_eq!(a, b);
        assert!(a.starts_with("52:54:00:"));
        let octet3 = u8::from_str_radix(&a[9..11], 16).unwrap();
        assert_eq!(octet3 & 0x03, 0x02);
        assert_ne!(deterministic_mac("ubuntu-2404:2"), a);
    }

    #[test]
    fn nic_mac_matches_seed_formula() {
        let cfg = resolve(&[]).unwrap();
        assert_eq!(cfg.nics[0].mac_address, deterministic_mac("ubuntu-2404:1"));
    }

    #[test]
    fn guest_name_wins_over_hostname() {
        let cfg = resolve(&[("GUEST_NAME", "myvm"), ("HOSTNAME", "somehost")]).unwrap();
        assert_eq!(cfg.vm_name, "myvm");
    }

    #[test]
    fn container_id_hostname_is_discarded() {
        let cfg = resolve(&[("HOSTNAME", "0123456789abcdef")]).unwrap();
        assert_eq!(cfg.vm_name, "ubuntu-2404");
    }

    #[test]
    fn readable_hostname_is_used() {
        let cfg = resolve(&[("HOSTNAME", "build-box")]).unwrap();
        assert_eq!(cfg.vm_name, "build-box");
    }

    #[test]
    fn iso_boot_applies_install_policy() {
        let cfg = resolve(&[("BOOT_FROM", "https://example.test/installer.iso")]).unwrap();
        assert!(!cfg.cloud_init_enabled);
        assert!(cfg.blank_work_disk);
        assert_eq!(cfg.boot_order[0], BootDevice::Cdrom);
        assert_eq!(cfg.distro_name, "Custom ISO");
        assert_eq!(cfg.vm_name, "custom-vm");
    }

    #[test]
    fn iso_boot_cloud_init_override() {
        let cfg = resolve(&[
            ("BOOT_FROM", "https://example.test/installer.iso"),
            ("CLOUD_INIT", "1"),
        ])
        .unwrap();
        assert!(cfg.cloud_init_enabled);
    }

    #[test]
    fn oci_reference_is_not_iso() {
        let cfg = resolve(&[("BOOT_FROM", "docker.io/kubevirt/demo:latest")]).unwrap();
        assert!(cfg.cloud_init_enabled);
        assert!(!cfg.blank_work_disk);
    }

    #[test]
    fn oci_reference_detection() {
        assert!(is_oci_reference("docker.io/kubevirt/fedora:latest"));
        assert!(is_oci_reference("localhost:5000/myimage:latest"));
        assert!(is_oci_reference("registry.local/image"));
        assert!(!is_oci_reference("https://example.com/image.qcow2"));
        assert!(!is_oci_reference("/local/path/image.qcow2"));
        assert!(!is_oci_reference("library/ubuntu"));
        assert!(!is_oci_reference("ubuntu"));
        assert!(!is_oci_reference(""));
    }

    #[test]
    fn blank_base_image_alias() {
        let cfg = resolve(&[("BASE_IMAGE", "blank")]).unwrap();
        assert!(cfg.blank_work_disk);
        assert!(cfg.base_image_path.is_none());
    }

    #[test]
    fn port_conflict_names_both_labels() {
        let err = resolve(&[("SSH_PORT", "8080"), ("PORT_FWD", "8080:80")]).unwrap_err().to_string();
        assert!(err.contains("port conflict"), "{err}");
        assert!(err.contains("SSH_PORT"), "{err}");
        assert!(err.contains("PORT_FWD(8080:80)"), "{err}");
    }

    #[test]
    fn novnc_implies_vnc_and_no_console() {
        let cfg = resolve(&[("GRAPHICS", "novnc")]).unwrap();
        assert!(cfg.novnc_enabled);
        assert_eq!(cfg.graphics_type, GraphicsType::Vnc);
        assert!(cfg.no_console);
    }

    #[test]
    fn novnc_no_console_user_override() {
        let cfg = resolve(&[("GRAPHICS", "novnc"), ("NO_CONSOLE", "0")]).unwrap();
        assert!(!cfg.no_console);
    }

    #[test]
    fn secondary_bridged_nic_with_mac() {
        let cfg = resolve(&[
            ("NETWORK2_MODE", "bridge"),
            ("NETWORK2_BRIDGE", "br0"),
            ("NETWORK2_MAC", "aa:bb:cc:dd:ee:ff"),
        ])
        .unwrap();
        assert_eq!(cfg.nics.len(), 2);
        assert_eq!(cfg.nics[1].mode, NicMode::Bridge);
        assert_eq!(cfg.nics[1].bridge_name.as_deref(), Some("br0"));
        assert_eq!(cfg.nics[1].mac_address, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn nic_sequence_stops_at_first_gap() {
        let cfg = resolve(&[
            ("NETWORK2_MODE", "bridge"),
            ("NETWORK2_BRIDGE", "br0"),
            ("NETWORK4_MODE", "bridge"),
            ("NETWORK4_BRIDGE", "br1"),
        ])
        .unwrap();
        assert_eq!(cfg.nics.len(), 2);
    }

    #[test]
    fn bridge_mode_requires_bridge_name() {
        let err = resolve(&[("NETWORK_MODE", "bridge")]).unwrap_err().to_string();
        assert!(err.contains("NETWORK_BRIDGE is required"));
    }

    #[test]
    fn direct_mode_requires_device() {
        let err = resolve(&[("NETWORK2_MODE", "direct")]).unwrap_err().to_string();
        assert!(err.contains("NETWORK2_DIRECT_DEV is required"));
    }

    #[test]
    fn invalid_mac_rejected() {
        let err = resolve(&[("NETWORK_MAC", "not-a-mac")]).unwrap_err().to_string();
        assert!(err.contains("NETWORK_MAC"));
    }

    #[test]
    fn arch_mismatch_with_catalog() {
        let err = resolve(&[("DISTRO", "alma-arm"), ("ARCH", "x86_64")]).unwrap_err().to_string();
        assert!(err.contains("does not match distribution"));
    }

    #[test]
    fn catalog_arch_is_adopted() {
        let cfg = resolve(&[("DISTRO", "alma-arm")]).unwrap();
        assert_eq!(cfg.arch, "aarch64");
        assert_eq!(cfg.machine_type, "virt");
    }

    #[test]
    fn extra_disks_within_range() {
        let cfg = resolve(&[("DISK2_SIZE", "10G"), ("DISK5_SIZE", "1T")]).unwrap();
        assert_eq!(cfg.extra_disks.len(), 2);
        assert_eq!(cfg.extra_disks[0].index, 2);
        assert_eq!(cfg.extra_disks[1].index, 5);
    }

    #[test]
    fn invalid_disk_size_rejected() {
        assert!(resolve(&[("DISK_SIZE", "lots")]).is_err());
        assert!(resolve(&[("DISK2_SIZE", "10X")]).is_err());
        assert!(valid_disk_size("20G"));
        assert!(valid_disk_size("512m"));
        assert!(valid_disk_size("1073741824"));
        assert!(!valid_disk_size("G20"));
        assert!(!valid_disk_size(""));
    }

    #[test]
    fn disk_controller_matrix_validated() {
        let cfg = resolve(&[("DISK_CONTROLLER", "scsi")]).unwrap();
        assert_eq!(cfg.disk_controller, "scsi");
        assert!(resolve(&[("DISK_CONTROLLER", "floppy")]).is_err());
        assert!(resolve(&[("DISK_IO", "bogus")]).is_err());
        assert!(resolve(&[("DISK_CACHE", "bogus")]).is_err());
    }

    #[test]
    fn feature_flags_parse() {
        let cfg = resolve(&[("TPM", "1"), ("HYPERV", "yes"), ("USB", "0"), ("GPU", "intel")]).unwrap();
        assert!(cfg.tpm_enabled);
        assert!(cfg.hyperv_enabled);
        assert!(!cfg.usb_controller);
        assert_eq!(cfg.gpu_passthrough, "intel");
        assert!(resolve(&[("GPU", "nvidia")]).is_err());
    }

    #[test]
    fn filesystem_target_auto_derived() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("shared-data");
        let cfg = resolve(&[("FILESYSTEM_SOURCE", source.to_str().unwrap())]).unwrap();
        assert_eq!(cfg.filesystems.len(), 1);
        assert_eq!(cfg.filesystems[0].target, "shared-data");
        assert!(source.exists());
    }

    #[test]
    fn readonly_filesystem_missing_source_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("missing");
        let err = resolve(&[
            ("FILESYSTEM_SOURCE", source.to_str().unwrap()),
            ("FILESYSTEM_READONLY", "1"),
        ])
        .unwrap_err()
        .to_string();
        assert!(err.contains("cannot be created while readonly"));
    }

    #[test]
    fn filesystem_target_must_be_single_segment() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("share");
        std::fs::create_dir_all(&source).unwrap();
        let err = resolve(&[
            ("FILESYSTEM_SOURCE", source.to_str().unwrap()),
            ("FILESYSTEM_TARGET", "a/b"),
        ])
        .unwrap_err()
        .to_string();
        assert!(err.contains("without '/'"));
    }

    #[test]
    fn virtiofs_accessmode_restricted() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("share");
        std::fs::create_dir_all(&source).unwrap();
        let err = resolve(&[
            ("FILESYSTEM_SOURCE", source.to_str().unwrap()),
            ("FILESYSTEM_ACCESSMODE", "mapped"),
        ])
        .unwrap_err()
        .to_string();
        assert!(err.contains("virtiofs only supports 'passthrough'"));
    }

    #[test]
    fn port_fwd_parses_and_validates() {
        let cfg = resolve(&[("PORT_FWD", "8080:80, 9090:90")]).unwrap();
        assert_eq!(
            cfg.port_forwards,
            vec![
                PortForward { host_port: 8080, guest_port: 80 },
                PortForward { host_port: 9090, guest_port: 90 },
            ]
        );
        assert!(resolve(&[("PORT_FWD", "8080")]).is_err());
        assert!(resolve(&[("PORT_FWD", "8080:abc")]).is_err());
        assert!(resolve(&[("PORT_FWD", "0:80")]).is_err());
    }

    #[test]
    fn ipxe_reorders_boot_and_flags_nic() {
        let dir = tempfile::tempdir().unwrap();
        let rom = dir.path().join("ipxe.rom");
        std::fs::write(&rom, b"rom").unwrap();
        let cfg = resolve(&[
            ("IPXE_ENABLE", "1"),
            ("IPXE_ROM_PATH", rom.to_str().unwrap()),
        ])
        .unwrap();
        assert_eq!(cfg.boot_order[0], BootDevice::Network);
        assert!(cfg.nics[0].boot);
        assert_eq!(cfg.ipxe_rom_path.as_deref(), Some(rom.as_path()));
    }

    #[test]
    fn ipxe_missing_rom_is_resource_error() {
        let err = resolve(&[
            ("IPXE_ENABLE", "1"),
            ("IPXE_ROM_PATH", "/nonexistent/ipxe.rom"),
        ])
        .unwrap_err();
        assert!(matches!(err, BoxvmError::Resource { .. }));
    }

    #[test]
    fn parse_size_units() {
        assert_eq!(parse_size_to_bytes("20G").unwrap(), 20 * 1024 * 1024 * 1024);
        assert_eq!(parse_size_to_bytes("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size_to_bytes("100K").unwrap(), 100 * 1024);
        assert_eq!(parse_size_to_bytes("1073741824").unwrap(), 1073741824);
        assert!(parse_size_to_bytes("").is_err());
        assert!(parse_size_to_bytes("10X").is_err());
    }

    #[test]
    fn sanitize_mount_targets() {
        assert_eq!(sanitize_mount_target("my share"), "my-share");
        assert_eq!(sanitize_mount_target("data_1"), "data_1");
        assert_eq!(sanitize_mount_target("///"), "share");
    }

    #[test]
    fn boot_mode_arch_gate() {
        assert!(resolve(&[("BOOT_MODE", "uefi")]).is_ok());
        assert!(resolve(&[("BOOT_MODE", "secure")]).is_ok());
        assert!(resolve(&[("DISTRO", "alma-arm"), ("BOOT_MODE", "secure")]).is_err());
        assert!(resolve(&[("BOOT_MODE", "bios")]).is_err());
    }

    #[test]
    fn redfish_defaults() {
        let cfg = resolve(&[("REDFISH_ENABLE", "1"), ("GUEST_NAME", "node1")]).unwrap();
        assert!(cfg.redfish_enabled);
        assert_eq!(cfg.redfish_user, "admin");
        assert_eq!(cfg.redfish_port, 8443);
        assert_eq!(cfg.redfish_system_id, "node1");
        assert!(!cfg.redfish_password.is_empty());
    }
}
