//! Host capability probes.
//!
//! Every function here is a read-only probe of the container environment.
//! The resolver uses them to expand `max`/`half` resource tokens and the XML
//! builder uses them for vendor-specific tuning and storage fallbacks.

use std::io::IsTerminal;
use std::path::Path;
use std::process::Command;

/// True when `/dev/kvm` exists and can actually be opened.
pub fn kvm_available() -> bool {
    if !Path::new("/dev/kvm").exists() {
        return false;
    }
    std::fs::OpenOptions::new().read(true).open("/dev/kvm").is_ok()
}

/// True when both stdin and stdout are attached to a TTY.
pub fn has_controlling_tty() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Unknown,
}

pub fn cpu_vendor() -> CpuVendor {
    let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") else {
        return CpuVendor::Unknown;
    };
    vendor_from_cpuinfo(&cpuinfo)
}

fn vendor_from_cpuinfo(cpuinfo: &str) -> CpuVendor {
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("vendor_id") {
            let value = rest.trim_start_matches([':', '\t', ' ']).trim();
            return match value {
                "GenuineIntel" => CpuVendor::Intel,
                "AuthenticAMD" => CpuVendor::Amd,
                _ => CpuVendor::Unknown,
            };
        }
    }
    CpuVendor::Unknown
}

/// CPU feature flags of the first processor entry.
pub fn cpu_flags() -> Vec<String> {
    let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") else {
        return Vec::new();
    };
    flags_from_cpuinfo(&cpuinfo)
}

fn flags_from_cpuinfo(cpuinfo: &str) -> Vec<String> {
    for line in cpuinfo.lines() {
        if line.starts_with("flags") {
            if let Some((_, rest)) = line.split_once(':') {
                return rest.split_whitespace().map(str::to_string).collect();
            }
        }
    }
    Vec::new()
}

/// `MemAvailable` from /proc/meminfo, in bytes.
pub fn available_memory() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|m| meminfo_field(&m, "MemAvailable"))
        .unwrap_or(0)
}

pub fn total_memory() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|m| meminfo_field(&m, "MemTotal"))
        .unwrap_or(0)
}

fn meminfo_field(meminfo: &str, field: &str) -> Option<u64> {
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix(field)
            && let Some(rest) = rest.strip_prefix(':')
        {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

pub fn cpu_count() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}

/// MTU of the interface carrying the default route, if one exists.
pub fn default_interface_mtu() -> Option<u32> {
    let output = Command::new("ip").args(["route", "show", "default"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let dev = parse_default_route_dev(&stdout)?;
    let mtu = std::fs::read_to_string(format!("/sys/class/net/{dev}/mtu")).ok()?;
    mtu.trim().parse().ok()
}

fn parse_default_route_dev(route_output: &str) -> Option<String> {
    let line = route_output.lines().next()?;
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word == "dev" {
            return words.next().map(str::to_string);
        }
    }
    None
}

pub fn ipv6_supported() -> bool {
    Path::new("/proc/net/if_inet6").exists()
}

/// Filesystem type name at a path (`stat -f -c %T`), lowercased.
pub fn filesystem_type_at(path: &Path) -> String {
    let output = Command::new("stat").args(["-f", "-c", "%T"]).arg(path).output();
    match output {
        Ok(out) if out.status.success() => {
            String::from_utf8_lossy(&out.stdout).trim().to_ascii_lowercase()
        }
        _ => "unknown".to_string(),
    }
}

/// Free bytes at a path.
pub fn available_disk_space(path: &Path) -> u64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => stat.blocks_available() as u64 * stat.fragment_size() as u64,
        Err(_) => 0,
    }
}

// ── Container runtime ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Docker,
    Podman,
    Kubernetes,
    Unknown,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Docker => "docker",
            Engine::Podman => "podman",
            Engine::Kubernetes => "kubernetes",
            Engine::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeInfo {
    pub engine: Engine,
    pub rootless: bool,
    pub privileged: bool,
}

pub fn detect_runtime() -> RuntimeInfo {
    let engine = if Path::new("/var/run/secrets/kubernetes.io").exists() {
        Engine::Kubernetes
    } else if Path::new("/run/.containerenv").exists() {
        Engine::Podman
    } else if Path::new("/.dockerenv").exists() {
        Engine::Docker
    } else {
        Engine::Unknown
    };

    let rootless = std::fs::read_to_string("/proc/self/uid_map")
        .map(|m| is_rootless_uid_map(&m))
        .unwrap_or(false);

    let privileged = std::fs::read_to_string("/proc/self/status")
        .map(|s| is_privileged_status(&s))
        .unwrap_or(false);

    if rootless {
        tracing::warn!(engine = engine.as_str(), "rootless container detected; some operations may require workarounds");
    }
    if !privileged {
        tracing::debug!("container is running without full privileges");
    }

    RuntimeInfo { engine, rootless, privileged }
}

/// UID 0 inside mapping to a non-zero UID outside means rootless.
fn is_rootless_uid_map(uid_map: &str) -> bool {
    for line in uid_map.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 3 && parts[0] == "0" && parts[1] != "0" {
            return true;
        }
    }
    false
}

/// Full bounding capability set (>= 38 bits) indicates --privileged.
fn is_privileged_status(status: &str) -> bool {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("CapBnd:") {
            if let Ok(caps) = u64::from_str_radix(rest.trim(), 16) {
                return caps >= 0x3F_FFFF_FFFF;
            }
            return false;
        }
    }
    false
}

// ── Host summary ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostInfo {
    pub cpu_model: String,
    pub cpu_count: u32,
    pub mem_total: u64,
    pub mem_available: u64,
    pub kernel: String,
}

pub fn host_info() -> HostInfo {
    let cpu_model = std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|c| {
            c.lines()
                .find(|l| l.starts_with("model name"))
                .and_then(|l| l.split_once(':').map(|(_, v)| v.trim().to_string()))
        })
        .unwrap_or_else(|| "unknown".to_string());
    let kernel = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    HostInfo {
        cpu_model,
        cpu_count: cpu_count(),
        mem_total: total_memory(),
        mem_available: available_memory(),
        kernel,
    }
}
