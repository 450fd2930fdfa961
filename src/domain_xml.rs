//! Libvirt domain XML generation using facet-xml struct serialization.
//!
//! Each struct maps to a libvirt XML element: attributes use
//! `#[facet(xml::attribute)]`, text content uses `#[facet(xml::text)]`, child
//! elements are nested structs, and field order fixes the emitted element
//! order. Output is compact (single line) and fully deterministic for a given
//! input set — two renders of the same resolved config are byte-identical,
//! and every emitted document parses back into the same model (see
//! [`reserialize`]).
//!
//! The builder is pure: every host-derived fact (KVM availability, CPU
//! vendor/flags, filesystem type, block sector sizes) arrives through
//! [`DomainInputs`], so unit tests can exercise the whole matrix.

use std::path::{Path, PathBuf};

use facet::Facet;
use facet_xml as xml;

use crate::arch;
use crate::config::{BootDevice, GraphicsType, Nic, NicMode, VmConfig};
use crate::error::BoxvmError;
use crate::host::CpuVendor;

const QEMU_NS: &str = "http://libvirt.org/schemas/domain/qemu/1.0";

// ── XML model structs ──────────────────────────────────────

#[derive(Debug, Facet)]
#[facet(rename = "domain")]
struct Domain {
    #[facet(xml::attribute, rename = "type")]
    domain_type: String,
    #[facet(xml::attribute, rename = "xmlns:qemu")]
    xmlns_qemu: String,
    name: String,
    memory: Memory,
    vcpu: Vcpu,
    #[facet(default)]
    iothreads: Option<u32>,
    os: Os,
    #[facet(default)]
    features: Option<Features>,
    #[facet(default)]
    clock: Option<Clock>,
    #[facet(default, rename = "memoryBacking")]
    memory_backing: Option<MemoryBacking>,
    cpu: Cpu,
    devices: Devices,
    #[facet(default, rename = "qemu:commandline")]
    qemu_commandline: Option<QemuCommandline>,
}

#[derive(Debug, Facet)]
struct Memory {
    #[facet(xml::attribute)]
    unit: String,
    #[facet(xml::text)]
    value: u64,
}

#[derive(Debug, Facet)]
struct Vcpu {
    #[facet(xml::attribute)]
    placement: String,
    #[facet(xml::text)]
    value: u32,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Empty {}

// ── OS / firmware ──────────────────────────────────────────

#[derive(Debug, Facet)]
struct Os {
    #[facet(rename = "type")]
    os_type: OsType,
    #[facet(default)]
    loader: Option<Loader>,
    #[facet(default)]
    nvram: Option<String>,
}

#[derive(Debug, Facet)]
struct OsType {
    #[facet(xml::attribute)]
    arch: String,
    #[facet(xml::attribute)]
    machine: String,
    #[facet(xml::text)]
    value: String,
}

#[derive(Debug, Facet)]
struct Loader {
    #[facet(xml::attribute)]
    readonly: String,
    #[facet(xml::attribute)]
    secure: String,
    #[facet(xml::attribute, rename = "type")]
    loader_type: String,
    #[facet(xml::text)]
    path: String,
}

// ── Features ───────────────────────────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Features {
    #[facet(default)]
    acpi: Option<Empty>,
    #[facet(default)]
    apic: Option<Empty>,
    #[facet(default)]
    pae: Option<Empty>,
    #[facet(default)]
    hyperv: Option<Hyperv>,
}

#[derive(Debug, Facet)]
struct Hyperv {
    #[facet(xml::attribute)]
    mode: String,
    relaxed: State,
    vapic: State,
    spinlocks: Spinlocks,
    vpindex: State,
    runtime: State,
    synic: State,
    stimer: State,
    frequencies: State,
    #[facet(default)]
    evmcs: Option<State>,
    #[facet(default)]
    avic: Option<State>,
    #[facet(default)]
    apicv: Option<State>,
}

#[derive(Debug, Facet)]
struct State {
    #[facet(xml::attribute)]
    state: String,
}

impl State {
    fn on() -> Self {
        Self { state: "on".into() }
    }

    fn off() -> Self {
        Self { state: "off".into() }
    }
}

#[derive(Debug, Facet)]
struct Spinlocks {
    #[facet(xml::attribute)]
    state: String,
    #[facet(xml::attribute)]
    retries: String,
}

#[derive(Debug, Facet)]
struct Clock {
    #[facet(xml::attribute)]
    offset: String,
    timer: Timer,
}

#[derive(Debug, Facet)]
struct Timer {
    #[facet(xml::attribute)]
    name: String,
    #[facet(xml::attribute)]
    present: String,
}

// ── memoryBacking (required for virtiofs) ──────────────────

#[derive(Debug, Facet)]
struct MemoryBacking {
    source: MemoryBackingSource,
    access: MemoryBackingAccess,
}

#[derive(Debug, Facet)]
struct MemoryBackingSource {
    #[facet(xml::attribute, rename = "type")]
    source_type: String,
}

#[derive(Debug, Facet)]
struct MemoryBackingAccess {
    #[facet(xml::attribute)]
    mode: String,
}

// ── CPU ────────────────────────────────────────────────────

#[derive(Debug, Facet)]
struct Cpu {
    #[facet(xml::attribute)]
    mode: String,
    #[facet(xml::attribute, default)]
    r#match: Option<String>,
    #[facet(default)]
    model: Option<CpuModel>,
}

#[derive(Debug, Facet)]
struct CpuModel {
    #[facet(xml::attribute)]
    fallback: String,
    #[facet(xml::text)]
    value: String,
}

// ── Devices ────────────────────────────────────────────────

#[derive(Debug, Facet)]
struct Devices {
    controller: Vec<Controller>,
    disk: Vec<Disk>,
    interface: Vec<Interface>,
    filesystem: Vec<Filesystem>,
    #[facet(default)]
    input: Option<Input>,
    #[facet(default)]
    tpm: Option<Tpm>,
    #[facet(default)]
    memballoon: Option<Memballoon>,
    #[facet(default)]
    rng: Option<Rng>,
    channel: Vec<Channel>,
    serial: Serial,
    console: Console,
    #[facet(default)]
    graphics: Option<Graphics>,
    #[facet(default)]
    video: Option<Video>,
}

#[derive(Debug, Facet)]
struct Controller {
    #[facet(xml::attribute, rename = "type")]
    controller_type: String,
    #[facet(xml::attribute)]
    model: String,
}

#[derive(Debug, Facet)]
struct Disk {
    #[facet(xml::attribute, rename = "type")]
    disk_type: String,
    #[facet(xml::attribute)]
    device: String,
    driver: DiskDriver,
    source: DiskSource,
    target: DiskTarget,
    #[facet(default)]
    blockio: Option<Blockio>,
    #[facet(default)]
    readonly: Option<Empty>,
    #[facet(default)]
    boot: Option<BootOrder>,
}

#[derive(Debug, Facet)]
struct DiskDriver {
    #[facet(xml::attribute)]
    name: String,
    #[facet(xml::attribute, rename = "type")]
    driver_type: String,
    #[facet(xml::attribute, default)]
    cache: Option<String>,
    #[facet(xml::attribute, default)]
    io: Option<String>,
    #[facet(xml::attribute, default)]
    iothread: Option<String>,
}

#[derive(Debug, Facet)]
struct DiskSource {
    #[facet(xml::attribute, default)]
    file: Option<String>,
    #[facet(xml::attribute, default)]
    dev: Option<String>,
}

#[derive(Debug, Facet)]
struct DiskTarget {
    #[facet(xml::attribute)]
    dev: String,
    #[facet(xml::attribute)]
    bus: String,
}

#[derive(Debug, Facet)]
struct Blockio {
    #[facet(xml::attribute)]
    logical_block_size: String,
    #[facet(xml::attribute)]
    physical_block_size: String,
}

#[derive(Debug, Facet)]
struct BootOrder {
    #[facet(xml::attribute)]
    order: String,
}

// ── Network interfaces ─────────────────────────────────────

#[derive(Debug, Facet)]
struct Interface {
    #[facet(xml::attribute, rename = "type")]
    iface_type: String,
    #[facet(default)]
    boot: Option<BootOrder>,
    mac: Mac,
    #[facet(default)]
    backend: Option<Backend>,
    #[facet(default)]
    ip: Option<Ip>,
    #[facet(default)]
    driver: Option<InterfaceDriver>,
    model: InterfaceModel,
    #[facet(default)]
    mtu: Option<Mtu>,
    #[facet(default)]
    rom: Option<Rom>,
    #[facet(default)]
    source: Option<InterfaceSource>,
    #[facet(rename = "portForward")]
    port_forward: Vec<PortForwardEl>,
}

#[derive(Debug, Facet)]
struct Mac {
    #[facet(xml::attribute)]
    address: String,
}

#[derive(Debug, Facet)]
struct Backend {
    #[facet(xml::attribute, rename = "type")]
    backend_type: String,
}

#[derive(Debug, Facet)]
struct Ip {
    #[facet(xml::attribute)]
    family: String,
    #[facet(xml::attribute)]
    address: String,
    #[facet(xml::attribute)]
    prefix: String,
}

#[derive(Debug, Facet)]
struct InterfaceDriver {
    #[facet(xml::attribute)]
    name: String,
}

#[derive(Debug, Facet)]
struct InterfaceModel {
    #[facet(xml::attribute, rename = "type")]
    model_type: String,
}

#[derive(Debug, Facet)]
struct Mtu {
    #[facet(xml::attribute)]
    size: String,
}

#[derive(Debug, Facet)]
struct Rom {
    #[facet(xml::attribute)]
    file: String,
}

#[derive(Debug, Facet)]
struct InterfaceSource {
    #[facet(xml::attribute, default)]
    bridge: Option<String>,
    #[facet(xml::attribute, default)]
    dev: Option<String>,
    #[facet(xml::attribute, default)]
    mode: Option<String>,
}

#[derive(Debug, Facet)]
struct PortForwardEl {
    #[facet(xml::attribute)]
    proto: String,
    range: PortRange,
}

#[derive(Debug, Facet)]
struct PortRange {
    #[facet(xml::attribute)]
    start: String,
    #[facet(xml::attribute)]
    to: String,
}

// ── Filesystem shares ──────────────────────────────────────

#[derive(Debug, Facet)]
struct Filesystem {
    #[facet(xml::attribute, rename = "type")]
    fs_type: String,
    #[facet(xml::attribute)]
    accessmode: String,
    driver: FsDriver,
    #[facet(default)]
    binary: Option<FsBinary>,
    source: FsSource,
    target: FsTarget,
    #[facet(default)]
    readonly: Option<Empty>,
}

#[derive(Debug, Facet)]
struct FsDriver {
    #[facet(xml::attribute, rename = "type")]
    driver_type: String,
}

#[derive(Debug, Facet)]
struct FsBinary {
    #[facet(xml::attribute)]
    path: String,
}

#[derive(Debug, Facet)]
struct FsSource {
    #[facet(xml::attribute)]
    dir: String,
}

#[derive(Debug, Facet)]
struct FsTarget {
    #[facet(xml::attribute)]
    dir: String,
}

// ── Misc devices ───────────────────────────────────────────

#[derive(Debug, Facet)]
struct Input {
    #[facet(xml::attribute, rename = "type")]
    input_type: String,
    #[facet(xml::attribute)]
    bus: String,
}

#[derive(Debug, Facet)]
struct Tpm {
    #[facet(xml::attribute)]
    model: String,
    backend: TpmBackend,
}

#[derive(Debug, Facet)]
struct TpmBackend {
    #[facet(xml::attribute, rename = "type")]
    backend_type: String,
    #[facet(xml::attribute)]
    version: String,
}

#[derive(Debug, Facet)]
struct Memballoon {
    #[facet(xml::attribute)]
    model: String,
}

#[derive(Debug, Facet)]
struct Rng {
    #[facet(xml::attribute)]
    model: String,
    backend: RngBackend,
}

#[derive(Debug, Facet)]
struct RngBackend {
    #[facet(xml::attribute)]
    model: String,
    #[facet(xml::text)]
    device: String,
}

/// Guest-agent and vdagent channels share the element shape; only the
/// vdagent one carries a `<source>` block.
#[derive(Debug, Facet)]
struct Channel {
    #[facet(xml::attribute, rename = "type")]
    channel_type: String,
    #[facet(default)]
    source: Option<ChannelSource>,
    target: ChannelTarget,
}

#[derive(Debug, Facet)]
struct ChannelSource {
    clipboard: Clipboard,
    mouse: Mouse,
}

#[derive(Debug, Facet)]
struct Clipboard {
    #[facet(xml::attribute)]
    copypaste: String,
}

#[derive(Debug, Facet)]
struct Mouse {
    #[facet(xml::attribute)]
    mode: String,
}

#[derive(Debug, Facet)]
struct ChannelTarget {
    #[facet(xml::attribute, rename = "type")]
    target_type: String,
    #[facet(xml::attribute)]
    name: String,
}

#[derive(Debug, Facet)]
struct Serial {
    #[facet(xml::attribute, rename = "type")]
    serial_type: String,
    target: SerialTarget,
}

#[derive(Debug, Facet)]
struct SerialTarget {
    #[facet(xml::attribute)]
    port: String,
}

#[derive(Debug, Facet)]
struct Console {
    #[facet(xml::attribute, rename = "type")]
    console_type: String,
    target: ConsoleTarget,
}

#[derive(Debug, Facet)]
struct ConsoleTarget {
    #[facet(xml::attribute, rename = "type")]
    target_type: String,
    #[facet(xml::attribute)]
    port: String,
}

#[derive(Debug, Facet)]
struct Graphics {
    #[facet(xml::attribute, rename = "type")]
    graphics_type: String,
    #[facet(xml::attribute)]
    listen: String,
    #[facet(xml::attribute, default)]
    port: Option<String>,
    #[facet(xml::attribute)]
    autoport: String,
    #[facet(xml::attribute, default)]
    keymap: Option<String>,
}

#[derive(Debug, Facet)]
struct Video {
    model: VideoModel,
}

#[derive(Debug, Facet)]
struct VideoModel {
    #[facet(xml::attribute, rename = "type")]
    model_type: String,
    #[facet(xml::attribute)]
    heads: String,
    #[facet(xml::attribute)]
    primary: String,
    #[facet(default)]
    resolution: Option<Resolution>,
}

#[derive(Debug, Facet)]
struct Resolution {
    #[facet(xml::attribute)]
    x: String,
    #[facet(xml::attribute)]
    y: String,
}

#[derive(Debug, Facet)]
#[facet(rename = "qemu:commandline")]
struct QemuCommandline {
    #[facet(rename = "qemu:arg")]
    arg: Vec<QemuArg>,
}

#[derive(Debug, Facet)]
struct QemuArg {
    #[facet(xml::attribute)]
    value: String,
}

// ── Builder inputs ─────────────────────────────────────────

/// Host- and pipeline-derived facts the builder needs besides the config.
#[derive(Debug, Clone)]
pub struct DomainInputs {
    pub work_image: PathBuf,
    pub format: String,
    pub seed_iso: Option<PathBuf>,
    pub boot_iso: Option<PathBuf>,
    pub extra_disk_paths: Vec<PathBuf>,
    /// Sector sizes aligned with `cfg.block_devices`; `None` means 512.
    pub block_sector_sizes: Vec<Option<u32>>,
    pub firmware_loader: Option<PathBuf>,
    pub firmware_nvram: Option<PathBuf>,
    pub kvm_available: bool,
    pub effective_cpu_model: String,
    pub cpu_vendor: CpuVendor,
    pub cpu_flags: Vec<String>,
    /// Filesystem type under the work image (drives io/cache downshift).
    pub vm_dir_fs_type: String,
    /// Effective boot order (the install-skip pass may have edited it).
    pub boot_order: Vec<BootDevice>,
}

fn boot_rank(order: &[BootDevice], device: BootDevice) -> Option<u32> {
    order.iter().position(|d| *d == device).map(|i| i as u32 + 1)
}

fn build_interface(
    nic: &Nic,
    is_primary: bool,
    cfg: &VmConfig,
    network_rank: Option<u32>,
    ipxe_rom: Option<&Path>,
) -> Interface {
    let boot = if nic.boot {
        network_rank.map(|r| BootOrder { order: r.to_string() })
    } else {
        None
    };
    let rom = if cfg.ipxe_enabled && nic.boot {
        ipxe_rom.map(|p| Rom { file: p.display().to_string() })
    } else {
        None
    };

    match nic.mode {
        NicMode::User => {
            let mut forwards = Vec::new();
            if is_primary {
                forwards.push(PortForwardEl {
                    proto: "tcp".into(),
                    range: PortRange { start: cfg.ssh_port.to_string(), to: "22".into() },
                });
                for pf in &cfg.port_forwards {
                    forwards.push(PortForwardEl {
                        proto: "tcp".into(),
                        range: PortRange {
                            start: pf.host_port.to_string(),
                            to: pf.guest_port.to_string(),
                        },
                    });
                }
            }
            Interface {
                iface_type: "user".into(),
                boot,
                mac: Mac { address: nic.mac_address.clone() },
                backend: Some(Backend { backend_type: "passt".into() }),
                ip: Some(Ip {
                    family: "ipv4".into(),
                    address: "10.0.2.15".into(),
                    prefix: "24".into(),
                }),
                driver: None,
                model: InterfaceModel { model_type: nic.model.clone() },
                mtu: nic.mtu.map(|m| Mtu { size: m.to_string() }),
                rom,
                source: None,
                port_forward: forwards,
            }
        }
        NicMode::Bridge => Interface {
            iface_type: "bridge".into(),
            boot,
            mac: Mac { address: nic.mac_address.clone() },
            backend: None,
            ip: None,
            driver: (nic.model == "virtio").then(|| InterfaceDriver { name: "vhost".into() }),
            model: InterfaceModel { model_type: nic.model.clone() },
            mtu: None,
            rom,
            source: Some(InterfaceSource {
                bridge: nic.bridge_name.clone(),
                dev: None,
                mode: None,
            }),
            port_forward: Vec::new(),
        },
        NicMode::Direct => Interface {
            iface_type: "direct".into(),
            boot,
            mac: Mac { address: nic.mac_address.clone() },
            backend: None,
            ip: None,
            driver: (nic.model == "virtio").then(|| InterfaceDriver { name: "vhost".into() }),
            model: InterfaceModel { model_type: nic.model.clone() },
            mtu: None,
            rom,
            source: Some(InterfaceSource {
                bridge: None,
                dev: nic.direct_device.clone(),
                mode: Some("bridge".into()),
            }),
            port_forward: Vec::new(),
        },
    }
}

/// Render the complete domain document. Deterministic for identical inputs.
pub fn render_domain_xml(cfg: &VmConfig, inputs: &DomainInputs) -> String {
    let profile = arch::profile_for(&cfg.arch).expect("resolver validated arch");
    let ctrl = arch::disk_controller(&cfg.disk_controller).expect("resolver validated controller");

    let domain_type = if inputs.kvm_available { "kvm" } else { "qemu" };
    let host_cpu = inputs.kvm_available
        && matches!(inputs.effective_cpu_model.to_ascii_lowercase().as_str(), "host" | "host-passthrough");

    // Storage stacked on encrypted or memory-backed filesystems breaks
    // io=native with cache=none.
    let (disk_io, disk_cache) = if cfg.disk_io != "threads"
        && ["ecryptfs", "tmpfs"].iter().any(|bad| inputs.vm_dir_fs_type.contains(bad))
    {
        tracing::warn!(fs = %inputs.vm_dir_fs_type, "storage filesystem needs io=threads, cache=writeback");
        ("threads".to_string(), "writeback".to_string())
    } else {
        (cfg.disk_io.clone(), cfg.disk_cache.clone())
    };

    let hd_rank = boot_rank(&inputs.boot_order, BootDevice::Hd);
    let cdrom_rank = boot_rank(&inputs.boot_order, BootDevice::Cdrom);
    let network_rank = boot_rank(&inputs.boot_order, BootDevice::Network);

    let iothread_attr = (cfg.io_thread && ctrl.bus == "virtio").then(|| "1".to_string());

    let mut disks = Vec::new();
    disks.push(Disk {
        disk_type: "file".into(),
        device: "disk".into(),
        driver: DiskDriver {
            name: "qemu".into(),
            driver_type: inputs.format.clone(),
            cache: Some(disk_cache.clone()),
            io: Some(disk_io.clone()),
            iothread: iothread_attr.clone(),
        },
        source: DiskSource { file: Some(inputs.work_image.display().to_string()), dev: None },
        target: DiskTarget { dev: format!("{}a", ctrl.dev_prefix), bus: ctrl.bus.into() },
        blockio: None,
        readonly: None,
        boot: hd_rank.map(|r| BootOrder { order: r.to_string() }),
    });

    // Extra disks take target letters b..f
    for (disk, path) in cfg.extra_disks.iter().zip(&inputs.extra_disk_paths) {
        let letter = (b'a' + disk.index - 1) as char;
        disks.push(Disk {
            disk_type: "file".into(),
            device: "disk".into(),
            driver: DiskDriver {
                name: "qemu".into(),
                driver_type: inputs.format.clone(),
                cache: Some(disk_cache.clone()),
                io: Some(disk_io.clone()),
                iothread: iothread_attr.clone(),
            },
            source: DiskSource { file: Some(path.display().to_string()), dev: None },
            target: DiskTarget { dev: format!("{}{letter}", ctrl.dev_prefix), bus: ctrl.bus.into() },
            blockio: None,
            readonly: None,
            boot: None,
        });
    }

    // Raw block devices follow the extra disks in the letter sequence
    for (blk, sector) in cfg.block_devices.iter().zip(&inputs.block_sector_sizes) {
        let offset = cfg.extra_disks.len() as u8 + blk.index;
        let letter = (b'a' + offset) as char;
        disks.push(Disk {
            disk_type: "block".into(),
            device: "disk".into(),
            driver: DiskDriver {
                name: "qemu".into(),
                driver_type: "raw".into(),
                cache: Some("none".into()),
                io: None,
                iothread: None,
            },
            source: DiskSource { file: None, dev: Some(blk.path.clone()) },
            target: DiskTarget { dev: format!("{}{letter}", ctrl.dev_prefix), bus: ctrl.bus.into() },
            blockio: sector.filter(|s| *s != 512).map(|s| Blockio {
                logical_block_size: s.to_string(),
                physical_block_size: s.to_string(),
            }),
            readonly: None,
            boot: None,
        });
    }

    if let Some(seed) = &inputs.seed_iso {
        disks.push(Disk {
            disk_type: "file".into(),
            device: "cdrom".into(),
            driver: DiskDriver {
                name: "qemu".into(),
                driver_type: "raw".into(),
                cache: None,
                io: None,
                iothread: None,
            },
            source: DiskSource { file: Some(seed.display().to_string()), dev: None },
            target: DiskTarget { dev: "sda".into(), bus: "sata".into() },
            blockio: None,
            readonly: Some(Empty {}),
            boot: None,
        });
    }

    if let Some(iso) = &inputs.boot_iso {
        disks.push(Disk {
            disk_type: "file".into(),
            device: "cdrom".into(),
            driver: DiskDriver {
                name: "qemu".into(),
                driver_type: "raw".into(),
                cache: None,
                io: None,
                iothread: None,
            },
            source: DiskSource { file: Some(iso.display().to_string()), dev: None },
            target: DiskTarget { dev: "sdb".into(), bus: "sata".into() },
            blockio: None,
            readonly: Some(Empty {}),
            boot: cdrom_rank.map(|r| BootOrder { order: r.to_string() }),
        });
    }

    let interfaces: Vec<Interface> = cfg
        .nics
        .iter()
        .enumerate()
        .map(|(i, nic)| build_interface(nic, i == 0, cfg, network_rank, cfg.ipxe_rom_path.as_deref()))
        .collect();

    let filesystems: Vec<Filesystem> = cfg
        .filesystems
        .iter()
        .map(|fs| Filesystem {
            fs_type: "mount".into(),
            accessmode: fs.accessmode.clone(),
            driver: FsDriver {
                driver_type: if fs.driver == "virtiofs" { "virtiofs".into() } else { "path".into() },
            },
            binary: (fs.driver == "virtiofs")
                .then(|| FsBinary { path: "/usr/lib/qemu/virtiofsd".into() }),
            source: FsSource { dir: fs.source.display().to_string() },
            target: FsTarget { dir: fs.target.clone() },
            readonly: fs.readonly.then_some(Empty {}),
        })
        .collect();

    // Features + HyperV enlightenments
    let has_arch_features = !profile.features.is_empty();
    let features = (has_arch_features || cfg.hyperv_enabled).then(|| {
        let mut features = Features {
            acpi: profile.features.contains(&"acpi").then_some(Empty {}),
            apic: profile.features.contains(&"apic").then_some(Empty {}),
            pae: profile.features.contains(&"pae").then_some(Empty {}),
            hyperv: None,
        };
        if cfg.hyperv_enabled {
            let mut hyperv = Hyperv {
                mode: "passthrough".into(),
                relaxed: State::on(),
                vapic: State::on(),
                spinlocks: Spinlocks { state: "on".into(), retries: "8191".into() },
                vpindex: State::on(),
                runtime: State::on(),
                synic: State::on(),
                stimer: State::on(),
                frequencies: State::on(),
                evmcs: None,
                avic: None,
                apicv: None,
            };
            match inputs.cpu_vendor {
                CpuVendor::Amd => {
                    hyperv.evmcs = Some(State::off());
                    if !inputs.cpu_flags.iter().any(|f| f == "avic") {
                        hyperv.avic = Some(State::off());
                    }
                }
                CpuVendor::Intel => {
                    if !inputs.cpu_flags.iter().any(|f| f == "apicv") {
                        hyperv.apicv = Some(State::off());
                    }
                    hyperv.evmcs = Some(State::off());
                }
                CpuVendor::Unknown => {}
            }
            features.hyperv = Some(hyperv);
        }
        features
    });

    let clock = cfg.hyperv_enabled.then(|| Clock {
        offset: "localtime".into(),
        timer: Timer { name: "hypervclock".into(), present: "yes".into() },
    });

    let memory_backing = cfg
        .filesystems
        .iter()
        .any(|fs| fs.driver == "virtiofs")
        .then(|| MemoryBacking {
            source: MemoryBackingSource { source_type: "memfd".into() },
            access: MemoryBackingAccess { mode: "shared".into() },
        });

    let cpu = if host_cpu {
        Cpu { mode: "host-passthrough".into(), r#match: None, model: None }
    } else {
        Cpu {
            mode: "custom".into(),
            r#match: Some("exact".into()),
            model: Some(CpuModel {
                fallback: "allow".into(),
                value: inputs.effective_cpu_model.clone(),
            }),
        }
    };

    let mut controllers = Vec::new();
    if cfg.disk_controller == "scsi" {
        controllers.push(Controller { controller_type: "scsi".into(), model: "virtio-scsi-pci".into() });
    }
    if cfg.usb_controller {
        controllers.push(Controller { controller_type: "usb".into(), model: "qemu-xhci".into() });
    }

    let mut channels = vec![Channel {
        channel_type: "unix".into(),
        source: None,
        target: ChannelTarget {
            target_type: "virtio".into(),
            name: "org.qemu.guest_agent.0".into(),
        },
    }];

    // Graphics / video / vdagent
    let (graphics, video) = if cfg.graphics_type != GraphicsType::None {
        let graphics = Graphics {
            graphics_type: cfg.graphics_type.as_str().into(),
            listen: "0.0.0.0".into(),
            port: (cfg.graphics_type == GraphicsType::Vnc).then(|| cfg.vnc_port.to_string()),
            autoport: if cfg.graphics_type == GraphicsType::Vnc { "no".into() } else { "yes".into() },
            keymap: (!cfg.vnc_keymap.is_empty()).then(|| cfg.vnc_keymap.clone()),
        };
        let video = Video {
            model: VideoModel {
                model_type: "virtio".into(),
                heads: "1".into(),
                primary: "yes".into(),
                resolution: (cfg.gpu_passthrough != "intel")
                    .then(|| Resolution { x: "1920".into(), y: "1080".into() }),
            },
        };
        channels.push(Channel {
            channel_type: "qemu-vdagent".into(),
            source: Some(ChannelSource {
                clipboard: Clipboard { copypaste: "yes".into() },
                mouse: Mouse { mode: "client".into() },
            }),
            target: ChannelTarget { target_type: "virtio".into(), name: "com.redhat.spice.0".into() },
        });
        (Some(graphics), Some(video))
    } else {
        (None, None)
    };

    // qemu:commandline extras
    let mut qemu_args: Vec<String> = Vec::new();
    if !cfg.extra_args.is_empty() {
        qemu_args.extend(cfg.extra_args.split_whitespace().map(str::to_string));
    }
    if cfg.gpu_passthrough == "intel" {
        let render_node = Path::new("/dev/dri/renderD128");
        if render_node.exists() {
            qemu_args.extend(["-display".into(), "egl-headless".into()]);
            qemu_args.extend(["-device".into(), format!("virtio-vga-gl,rendernode={}", render_node.display())]);
        }
    }
    if cfg.hyperv_enabled {
        qemu_args.extend(["-global".into(), "ICH9-LPC.disable_s3=1".into()]);
        qemu_args.extend(["-global".into(), "ICH9-LPC.disable_s4=1".into()]);
    }
    let qemu_commandline = (!qemu_args.is_empty()).then(|| QemuCommandline {
        arg: qemu_args.into_iter().map(|value| QemuArg { value }).collect(),
    });

    let domain = Domain {
        domain_type: domain_type.into(),
        xmlns_qemu: QEMU_NS.into(),
        name: cfg.vm_name.clone(),
        memory: Memory { unit: "MiB".into(), value: cfg.memory_mb },
        vcpu: Vcpu { placement: "static".into(), value: cfg.cpus },
        iothreads: cfg.io_thread.then_some(1),
        os: Os {
            os_type: OsType {
                arch: cfg.arch.clone(),
                machine: cfg.machine_type.clone(),
                value: "hvm".into(),
            },
            loader: inputs.firmware_loader.as_ref().map(|loader| Loader {
                readonly: "yes".into(),
                secure: if cfg.boot_mode == crate::config::BootMode::Secure { "yes".into() } else { "no".into() },
                loader_type: "pflash".into(),
                path: loader.display().to_string(),
            }),
            nvram: inputs.firmware_nvram.as_ref().map(|n| n.display().to_string()),
        },
        features,
        clock,
        memory_backing,
        cpu,
        devices: Devices {
            controller: controllers,
            disk: disks,
            interface: interfaces,
            filesystem: filesystems,
            input: cfg.usb_controller.then(|| Input { input_type: "tablet".into(), bus: "usb".into() }),
            tpm: cfg.tpm_enabled.then(|| Tpm {
                model: "tpm-crb".into(),
                backend: TpmBackend { backend_type: "emulator".into(), version: "2.0".into() },
            }),
            memballoon: cfg.balloon_enabled.then(|| Memballoon { model: "virtio".into() }),
            rng: cfg.rng_enabled.then(|| Rng {
                model: "virtio".into(),
                backend: RngBackend { model: "random".into(), device: "/dev/urandom".into() },
            }),
            channel: channels,
            serial: Serial { serial_type: "pty".into(), target: SerialTarget { port: "0".into() } },
            console: Console {
                console_type: "pty".into(),
                target: ConsoleTarget { target_type: "virtio".into(), port: "0".into() },
            },
            graphics,
            video,
        },
        qemu_commandline,
    };

    facet_xml::to_string(&domain).expect("domain XML serialization should not fail")
}

/// Parse a rendered document back into the element model and serialize it
/// again. For every document this builder emits, the output equals the
/// input — the struct model is the element tree, so a parse→re-render pass
/// is the structural identity.
pub fn reserialize(xml: &str) -> Result<String, BoxvmError> {
    let domain: Domain = facet_xml::from_str(xml)
        .map_err(|e| BoxvmError::other(format!("domain XML does not parse back into the element model: {e}")))?;
    Ok(facet_xml::to_string(&domain).expect("domain XML serialization should not fail"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvSource, parse_env};
    use crate::host::CpuVendor;
    use crate::paths::Paths;

    fn test_cfg(pairs: &[(&str, &str)]) -> VmConfig {
        let mut distributions = std::collections::BTreeMap::new();
        distributions.insert(
            "ubuntu-2404".to_string(),
            crate::catalog::DistroEntry {
                name: "Ubuntu 24.04".to_string(),
                url: "https://example.com/u.qcow2".to_string(),
                user: "ubuntu".to_string(),
                arch: Some("x86_64".to_string()),
                format: None,
            },
        );
        let catalog = crate::catalog::Catalog { distributions };
        let env = EnvSource::from_pairs(pairs.iter().copied());
        parse_env(&env, &catalog, &Paths::rooted_at("/images")).unwrap()
    }

    fn test_inputs(cfg: &VmConfig) -> DomainInputs {
        DomainInputs {
            work_image: "/images/vms/ubuntu-2404/disk.qcow2".into(),
            format: "qcow2".into(),
            seed_iso: cfg.cloud_init_enabled.then(|| "/images/vms/ubuntu-2404/seed.iso".into()),
            boot_iso: None,
            extra_disk_paths: cfg
                .extra_disks
                .iter()
                .map(|d| format!("/images/vms/ubuntu-2404/disk{}.qcow2", d.index).into())
                .collect(),
            block_sector_sizes: cfg.block_devices.iter().map(|_| None).collect(),
            firmware_loader: None,
            firmware_nvram: None,
            kvm_available: true,
            effective_cpu_model: cfg.cpu_model.clone(),
            cpu_vendor: CpuVendor::Intel,
            cpu_flags: vec!["apicv".into()],
            vm_dir_fs_type: "ext4".into(),
            boot_order: cfg.boot_order.clone(),
        }
    }

    #[test]
    fn render_is_deterministic() {
        let cfg = test_cfg(&[]);
        let inputs = test_inputs(&cfg);
        assert_eq!(render_domain_xml(&cfg, &inputs), render_domain_xml(&cfg, &inputs));
    }

    #[test]
    fn default_document_round_trips_through_parse() {
        let cfg = test_cfg(&[]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert_eq!(reserialize(&xml).unwrap(), xml);
    }

    #[test]
    fn full_matrix_document_round_trips_through_parse() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("share");
        std::fs::create_dir_all(&source).unwrap();
        let cfg = test_cfg(&[
            ("GRAPHICS", "vnc"),
            ("VNC_KEYMAP", "de"),
            ("HYPERV", "1"),
            ("TPM", "1"),
            ("IO_THREAD", "1"),
            ("DISK_CONTROLLER", "scsi"),
            ("DISK2_SIZE", "10G"),
            ("BOOT_ORDER", "network,cdrom,hd"),
            ("NETWORK_BOOT", "1"),
            ("NETWORK2_MODE", "bridge"),
            ("NETWORK2_BRIDGE", "br0"),
            ("PORT_FWD", "8080:80"),
            ("FILESYSTEM_SOURCE", source.to_str().unwrap()),
            ("EXTRA_ARGS", "-no-reboot"),
            ("BOOT_MODE", "uefi"),
        ]);
        let mut inputs = test_inputs(&cfg);
        inputs.cpu_vendor = CpuVendor::Amd;
        inputs.cpu_flags = vec!["svm".into()];
        inputs.boot_iso = Some("/images/state/boot-isos/abc-installer.iso".into());
        inputs.firmware_loader = Some("/usr/share/OVMF/OVMF_CODE_4M.fd".into());
        inputs.firmware_nvram = Some("/images/state/firmware/ubuntu-2404-vars.fd".into());
        let xml = render_domain_xml(&cfg, &inputs);
        assert_eq!(reserialize(&xml).unwrap(), xml);
    }

    #[test]
    fn tcg_document_round_trips_through_parse() {
        let cfg = test_cfg(&[]);
        let mut inputs = test_inputs(&cfg);
        inputs.kvm_available = false;
        inputs.effective_cpu_model = "qemu64".into();
        let xml = render_domain_xml(&cfg, &inputs);
        assert_eq!(reserialize(&xml).unwrap(), xml);
    }

    #[test]
    fn reserialize_rejects_garbage() {
        assert!(reserialize("<not-a-domain/>").is_err());
    }

    #[test]
    fn default_domain_shape() {
        let cfg = test_cfg(&[]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains(r#"type="kvm""#));
        assert!(xml.contains("<name>ubuntu-2404</name>"));
        assert!(xml.contains(r#"unit="MiB""#));
        assert!(xml.contains(">4096<"));
        assert!(xml.contains(r#"placement="static""#));
        assert!(xml.contains(r#"mode="host-passthrough""#));
        assert!(xml.contains(r#"machine="q35""#));
        assert!(xml.contains("org.qemu.guest_agent.0"));
        assert!(xml.contains(QEMU_NS));
        // no firmware in legacy mode
        assert!(!xml.contains("pflash"));
    }

    #[test]
    fn tcg_uses_custom_cpu() {
        let cfg = test_cfg(&[]);
        let mut inputs = test_inputs(&cfg);
        inputs.kvm_available = false;
        inputs.effective_cpu_model = "qemu64".into();
        let xml = render_domain_xml(&cfg, &inputs);
        assert!(xml.contains(r#"type="qemu""#));
        assert!(xml.contains(r#"mode="custom""#));
        assert!(xml.contains(r#"fallback="allow""#));
        assert!(xml.contains(">qemu64<"));
    }

    #[test]
    fn primary_disk_uses_controller_matrix() {
        for (controller, dev, bus) in [("virtio", "vda", "virtio"), ("scsi", "sda", "scsi"), ("ide", "hda", "ide")] {
            let cfg = test_cfg(&[("DISK_CONTROLLER", controller), ("CLOUD_INIT", "0")]);
            let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
            assert!(xml.contains(&format!(r#"dev="{dev}""#)), "{controller}: {xml}");
            assert!(xml.contains(&format!(r#"bus="{bus}""#)), "{controller}");
        }
        let cfg = test_cfg(&[("DISK_CONTROLLER", "scsi")]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains("virtio-scsi-pci"));
    }

    #[test]
    fn boot_ranks_cover_order() {
        let cfg = test_cfg(&[("BOOT_FROM", "https://example.test/installer.iso"), ("PERSIST", "1")]);
        let mut inputs = test_inputs(&cfg);
        inputs.boot_iso = Some("/images/state/boot-isos/abc-installer.iso".into());
        let xml = render_domain_xml(&cfg, &inputs);
        // cdrom first, hd second
        assert!(xml.contains(r#"<boot order="1">"#) || xml.contains(r#"<boot order="1"/>"#));
        assert!(xml.contains(r#"<boot order="2">"#) || xml.contains(r#"<boot order="2"/>"#));
        assert!(xml.contains(r#"dev="sdb""#));
    }

    #[test]
    fn seed_iso_is_sata_readonly() {
        let cfg = test_cfg(&[]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains("seed.iso"));
        assert!(xml.contains(r#"dev="sda""#));
        assert!(xml.contains(r#"bus="sata""#));
        assert!(xml.contains("<readonly>") || xml.contains("<readonly/>"));
    }

    #[test]
    fn user_nic_has_passt_and_forwards() {
        let cfg = test_cfg(&[("PORT_FWD", "8080:80")]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains(r#"type="user""#));
        assert!(xml.contains(r#"type="passt""#));
        assert!(xml.contains(r#"address="10.0.2.15""#));
        assert!(xml.contains(r#"start="2222""#));
        assert!(xml.contains(r#"to="22""#));
        assert!(xml.contains(r#"start="8080""#));
        assert!(xml.contains(r#"to="80""#));
    }

    #[test]
    fn second_bridge_nic_keeps_forwards_on_first() {
        let cfg = test_cfg(&[
            ("NETWORK2_MODE", "bridge"),
            ("NETWORK2_BRIDGE", "br0"),
            ("NETWORK2_MAC", "aa:bb:cc:dd:ee:ff"),
        ]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert_eq!(xml.matches("<interface").count(), 2);
        assert!(xml.contains(r#"bridge="br0""#));
        assert!(xml.contains(r#"address="aa:bb:cc:dd:ee:ff""#));
        assert!(xml.contains(r#"name="vhost""#));
        // exactly one portForward block (ssh on NIC #1)
        assert_eq!(xml.matches("<portForward").count(), 1);
    }

    #[test]
    fn direct_nic_renders_source_dev() {
        let cfg = test_cfg(&[("NETWORK_MODE", "direct"), ("NETWORK_DIRECT_DEV", "eth1")]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains(r#"type="direct""#));
        assert!(xml.contains(r#"dev="eth1""#));
        assert!(xml.contains(r#"mode="bridge""#));
        // no user-mode forwards on a direct NIC
        assert!(!xml.contains("<portForward"));
    }

    #[test]
    fn hyperv_on_amd_without_avic() {
        let cfg = test_cfg(&[("HYPERV", "1")]);
        let mut inputs = test_inputs(&cfg);
        inputs.cpu_vendor = CpuVendor::Amd;
        inputs.cpu_flags = vec!["svm".into()];
        let xml = render_domain_xml(&cfg, &inputs);
        assert!(xml.contains("<hyperv"));
        assert!(xml.contains("evmcs"));
        assert!(xml.contains("avic"));
        assert!(xml.contains(r#"offset="localtime""#));
        assert!(xml.contains("hypervclock"));
        assert!(xml.contains("ICH9-LPC.disable_s3=1"));
        assert!(xml.contains("ICH9-LPC.disable_s4=1"));
        assert!(xml.contains(r#"retries="8191""#));
    }

    #[test]
    fn hyperv_on_intel_with_apicv_flag() {
        let cfg = test_cfg(&[("HYPERV", "1")]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains("evmcs"));
        assert!(!xml.contains("apicv")); // flag present, no override needed
        assert!(!xml.contains("avic"));
    }

    #[test]
    fn virtiofs_share_brings_memory_backing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("share");
        std::fs::create_dir_all(&source).unwrap();
        let cfg = test_cfg(&[("FILESYSTEM_SOURCE", source.to_str().unwrap())]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains("<memoryBacking>"));
        assert!(xml.contains(r#"type="memfd""#));
        assert!(xml.contains(r#"mode="shared""#));
        assert!(xml.contains(r#"type="virtiofs""#));
        assert!(xml.contains("/usr/lib/qemu/virtiofsd"));
        assert!(xml.contains(&format!(r#"dir="{}""#, source.display())));
    }

    #[test]
    fn ninep_share_has_no_memory_backing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("share");
        std::fs::create_dir_all(&source).unwrap();
        let cfg = test_cfg(&[
            ("FILESYSTEM_SOURCE", source.to_str().unwrap()),
            ("FILESYSTEM_DRIVER", "9p"),
        ]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(!xml.contains("memoryBacking"));
        assert!(xml.contains(r#"type="path""#));
        assert!(!xml.contains("virtiofsd"));
    }

    #[test]
    fn feature_devices_toggle() {
        let cfg = test_cfg(&[("TPM", "1"), ("IO_THREAD", "1")]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains("<iothreads>1</iothreads>") || xml.contains("<iothreads>"));
        assert!(xml.contains("tpm-crb"));
        assert!(xml.contains(r#"version="2.0""#));
        assert!(xml.contains("qemu-xhci"));
        assert!(xml.contains(r#"type="tablet""#));
        assert!(xml.contains("<memballoon"));
        assert!(xml.contains("/dev/urandom"));
        assert!(xml.contains(r#"iothread="1""#));

        let bare = test_cfg(&[("USB", "0"), ("RNG", "0"), ("BALLOON", "0")]);
        let xml = render_domain_xml(&bare, &test_inputs(&bare));
        assert!(!xml.contains("qemu-xhci"));
        assert!(!xml.contains("<rng"));
        assert!(!xml.contains("memballoon"));
    }

    #[test]
    fn vnc_graphics_pin_port() {
        let cfg = test_cfg(&[("GRAPHICS", "vnc"), ("VNC_PORT", "5901"), ("VNC_KEYMAP", "de")]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains(r#"type="vnc""#));
        assert!(xml.contains(r#"port="5901""#));
        assert!(xml.contains(r#"autoport="no""#));
        assert!(xml.contains(r#"keymap="de""#));
        assert!(xml.contains(r#"x="1920""#));
        assert!(xml.contains("qemu-vdagent"));
        assert!(xml.contains(r#"copypaste="yes""#));
    }

    #[test]
    fn spice_graphics_autoport() {
        let cfg = test_cfg(&[("GRAPHICS", "spice")]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains(r#"type="spice""#));
        assert!(xml.contains(r#"autoport="yes""#));
    }

    #[test]
    fn headless_has_no_graphics() {
        let cfg = test_cfg(&[]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(!xml.contains("<graphics"));
        assert!(!xml.contains("<video"));
        assert!(!xml.contains("qemu-vdagent"));
    }

    #[test]
    fn firmware_loader_and_nvram() {
        let cfg = test_cfg(&[("BOOT_MODE", "uefi")]);
        let mut inputs = test_inputs(&cfg);
        inputs.firmware_loader = Some("/usr/share/OVMF/OVMF_CODE_4M.fd".into());
        inputs.firmware_nvram = Some("/images/state/firmware/ubuntu-2404-vars.fd".into());
        let xml = render_domain_xml(&cfg, &inputs);
        assert!(xml.contains(r#"type="pflash""#));
        assert!(xml.contains(r#"secure="no""#));
        assert!(xml.contains("OVMF_CODE_4M.fd"));
        assert!(xml.contains("ubuntu-2404-vars.fd"));

        let cfg = test_cfg(&[("BOOT_MODE", "secure")]);
        let mut inputs = test_inputs(&cfg);
        inputs.firmware_loader = Some("/usr/share/OVMF/OVMF_CODE_4M.ms.fd".into());
        inputs.firmware_nvram = Some("/images/state/firmware/ubuntu-2404-vars.fd".into());
        let xml = render_domain_xml(&cfg, &inputs);
        assert!(xml.contains(r#"secure="yes""#));
    }

    #[test]
    fn extra_disks_take_letters() {
        let cfg = test_cfg(&[("DISK2_SIZE", "10G"), ("DISK3_SIZE", "20G")]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains(r#"dev="vdb""#));
        assert!(xml.contains(r#"dev="vdc""#));
    }

    #[test]
    fn tmpfs_downshifts_io_and_cache() {
        let cfg = test_cfg(&[]);
        let mut inputs = test_inputs(&cfg);
        inputs.vm_dir_fs_type = "tmpfs".into();
        let xml = render_domain_xml(&cfg, &inputs);
        assert!(xml.contains(r#"io="threads""#));
        assert!(xml.contains(r#"cache="writeback""#));
    }

    #[test]
    fn extra_args_become_qemu_commandline() {
        let cfg = test_cfg(&[("EXTRA_ARGS", "-cpu host,-vmx -no-reboot")]);
        let xml = render_domain_xml(&cfg, &test_inputs(&cfg));
        assert!(xml.contains("<qemu:commandline>"));
        assert!(xml.contains(r#"value="-cpu""#));
        assert!(xml.contains(r#"value="host,-vmx""#));
        assert!(xml.contains(r#"value="-no-reboot""#));
    }

    #[test]
    fn boot_ranks_are_unique_and_complete() {
        let cfg = test_cfg(&[("BOOT_ORDER", "network,cdrom,hd"), ("NETWORK_BOOT", "1")]);
        let mut inputs = test_inputs(&cfg);
        inputs.boot_iso = Some("/images/state/boot-isos/x.iso".into());
        let xml = render_domain_xml(&cfg, &inputs);
        for rank in 1..=3 {
            let needle = format!(r#"<boot order="{rank}""#);
            assert_eq!(xml.matches(&needle).count(), 1, "rank {rank} in {xml}");
        }
    }
}
