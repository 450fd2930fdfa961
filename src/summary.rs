//! Resolved-config, host and access reporting for `--show-config`,
//! `--dry-run` and the startup banner.

use console::style;

use crate::config::{GraphicsType, NicMode, VmConfig};
use crate::host;
use crate::paths::Paths;

fn print_block(title: &str, lines: &[String]) {
    let width = lines
        .iter()
        .map(String::len)
        .chain(std::iter::once(title.len()))
        .max()
        .unwrap_or(0)
        + 4;
    println!("{}", style("─".repeat(width)).dim());
    println!("  {}", style(title).cyan().bold());
    for line in lines {
        println!("    {line}");
    }
    println!("{}", style("─".repeat(width)).dim());
}

pub fn print_host_info(paths: &Paths) {
    let info = host::host_info();
    let gib = 1024f64 * 1024.0 * 1024.0;
    let disk_free = host::available_disk_space(paths.images_dir()) as f64 / gib;
    let kvm = if host::kvm_available() { "available" } else { "NOT available (TCG fallback)" };
    print_block(
        "Host",
        &[
            format!("CPU:     {} ({} cores)", info.cpu_model, info.cpu_count),
            format!(
                "Memory:  {:.1} GiB free / {:.1} GiB total",
                info.mem_available as f64 / gib,
                info.mem_total as f64 / gib
            ),
            format!("Storage: {disk_free:.1} GiB free at {}", paths.images_dir().display()),
            format!("KVM:     {kvm}"),
            format!("Kernel:  {}", info.kernel),
        ],
    );
}

pub fn print_vm_summary(cfg: &VmConfig) {
    let mut lines = vec![
        format!("{} vCPU | {} MiB RAM | {} disk", cfg.cpus, cfg.memory_mb, cfg.disk_size),
        format!(
            "{} boot ({}) | {} bus",
            cfg.boot_mode.as_str().to_uppercase(),
            cfg.machine_type,
            cfg.disk_controller
        ),
    ];

    let mut features = Vec::new();
    if cfg.tpm_enabled {
        features.push("TPM".to_string());
    }
    if cfg.hyperv_enabled {
        features.push("Hyper-V".to_string());
    }
    if cfg.io_thread {
        features.push("IOThread".to_string());
    }
    if cfg.balloon_enabled {
        features.push("Balloon".to_string());
    }
    if cfg.rng_enabled {
        features.push("RNG".to_string());
    }
    if cfg.gpu_passthrough != "off" {
        features.push(format!("GPU:{}", cfg.gpu_passthrough));
    }
    if !features.is_empty() {
        lines.push(features.join(" | "));
    }

    if !cfg.extra_disks.is_empty() {
        let disks: Vec<String> = cfg.extra_disks.iter().map(|d| format!("disk{}={}", d.index, d.size)).collect();
        lines.push(format!("Extra disks: {}", disks.join(", ")));
    }
    if !cfg.block_devices.is_empty() {
        let devs: Vec<&str> = cfg.block_devices.iter().map(|b| b.path.as_str()).collect();
        lines.push(format!("Block devices: {}", devs.join(", ")));
    }

    for (i, nic) in cfg.nics.iter().enumerate() {
        let prefix = if cfg.nics.len() == 1 { "NIC".to_string() } else { format!("NIC{}", i + 1) };
        lines.push(format!("{prefix}: {} ({})", nic.mode.as_str(), nic.model));
    }

    for fs in &cfg.filesystems {
        let mode = if fs.readonly { "ro" } else { "rw" };
        lines.push(format!(
            "Share: {} -> /mnt/{} ({}, {mode})",
            fs.source.display(),
            crate::config::sanitize_mount_target(&fs.target),
            fs.driver
        ));
    }

    let order: Vec<&str> = cfg.boot_order.iter().map(|d| d.as_str()).collect();
    lines.push(format!("Boot: {}", order.join(", ")));

    print_block(&format!("{} ({})", cfg.vm_name, cfg.distro_name), &lines);
}

pub fn print_access_banner(cfg: &VmConfig) {
    let has_user_nic = cfg.nics.iter().any(|n| n.mode == NicMode::User);
    let mut lines = Vec::new();
    let mut publish = Vec::new();

    if has_user_nic {
        if cfg.cloud_init_enabled {
            lines.push(format!("SSH:     ssh -p {} {}@localhost", cfg.ssh_port, cfg.login_user));
        } else {
            lines.push(format!("SSH:     port {} -> guest:22", cfg.ssh_port));
        }
        publish.push(format!("-p {0}:{0}", cfg.ssh_port));
    }
    if cfg.cloud_init_enabled {
        lines.push(format!("Login:   {} / {}", cfg.login_user, cfg.password));
    }
    if cfg.novnc_enabled {
        lines.push(format!("Console: https://localhost:{}/vnc.html", cfg.novnc_port));
        publish.push(format!("-p {0}:{0}", cfg.novnc_port));
    } else if cfg.graphics_type == GraphicsType::Vnc {
        lines.push(format!("VNC:     localhost:{}", cfg.vnc_port));
        publish.push(format!("-p {0}:{0}", cfg.vnc_port));
    }
    if cfg.redfish_enabled {
        lines.push(format!("Redfish: https://localhost:{}/", cfg.redfish_port));
        publish.push(format!("-p {0}:{0}", cfg.redfish_port));
    }
    if has_user_nic && !cfg.port_forwards.is_empty() {
        let fwds: Vec<String> = cfg
            .port_forwards
            .iter()
            .map(|pf| format!("{}->{}", pf.host_port, pf.guest_port))
            .collect();
        lines.push(format!("Ports:   {}", fwds.join(", ")));
        for pf in &cfg.port_forwards {
            publish.push(format!("-p {0}:{0}", pf.host_port));
        }
    }

    if !publish.is_empty() {
        lines.push(String::new());
        lines.push(format!("Publish: {}", publish.join(" ")));
    }

    print_block("Access", &lines);
}

/// Every field of the resolved config; secrets are masked.
pub fn print_config(cfg: &VmConfig) {
    let field = |name: &str, value: &dyn std::fmt::Display| println!("  {name}: {value}");
    field("vm_name", &cfg.vm_name);
    field("distro", &cfg.distro);
    field("distro_name", &cfg.distro_name);
    field("image_url", &cfg.image_url);
    field("login_user", &cfg.login_user);
    field("image_format", &cfg.image_format);
    field("memory_mb", &cfg.memory_mb);
    field("cpus", &cfg.cpus);
    field("disk_size", &cfg.disk_size);
    field("arch", &cfg.arch);
    field("machine_type", &cfg.machine_type);
    field("boot_mode", &cfg.boot_mode.as_str());
    field("cpu_model", &cfg.cpu_model);
    field("boot_from", &cfg.boot_from.as_deref().unwrap_or("-"));
    field("base_image_path", &cfg.base_image_path.as_deref().unwrap_or("-"));
    field("blank_work_disk", &cfg.blank_work_disk);
    let order: Vec<&str> = cfg.boot_order.iter().map(|d| d.as_str()).collect();
    field("boot_order", &order.join(","));
    field("force_iso", &cfg.force_iso);
    field("cloud_init_enabled", &cfg.cloud_init_enabled);
    field(
        "cloud_init_user_data_path",
        &cfg.cloud_init_user_data_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".into()),
    );
    field("password", &"********");
    field("ssh_pubkey", &cfg.ssh_pubkey.as_deref().unwrap_or("-"));
    for (i, nic) in cfg.nics.iter().enumerate() {
        println!("  nic[{i}]:");
        println!("      mode: {}", nic.mode.as_str());
        println!("      model: {}", nic.model);
        println!("      mac: {}", nic.mac_address);
        if let Some(bridge) = &nic.bridge_name {
            println!("      bridge: {bridge}");
        }
        if let Some(dev) = &nic.direct_device {
            println!("      direct_dev: {dev}");
        }
        println!("      boot: {}", nic.boot);
    }
    for (i, fs) in cfg.filesystems.iter().enumerate() {
        println!("  filesystem[{i}]:");
        println!("      source: {}", fs.source.display());
        println!("      target: {}", fs.target);
        println!("      driver: {}", fs.driver);
        println!("      accessmode: {}", fs.accessmode);
        println!("      readonly: {}", fs.readonly);
    }
    for disk in &cfg.extra_disks {
        println!("  disk{}: {}", disk.index, disk.size);
    }
    for blk in &cfg.block_devices {
        println!("  device{}: {}", blk.index, blk.path);
    }
    let fwds: Vec<String> = cfg
        .port_forwards
        .iter()
        .map(|pf| format!("{}:{}", pf.host_port, pf.guest_port))
        .collect();
    field("port_forwards", &if fwds.is_empty() { "-".to_string() } else { fwds.join(",") });
    field("graphics_type", &cfg.graphics_type.as_str());
    field("novnc_enabled", &cfg.novnc_enabled);
    field("vnc_port", &cfg.vnc_port);
    field("novnc_port", &cfg.novnc_port);
    field("vnc_keymap", &if cfg.vnc_keymap.is_empty() { "-" } else { cfg.vnc_keymap.as_str() });
    field("redfish_enabled", &cfg.redfish_enabled);
    field("redfish_user", &cfg.redfish_user);
    field("redfish_password", &"********");
    field("redfish_port", &cfg.redfish_port);
    field("redfish_system_id", &cfg.redfish_system_id);
    field("tpm_enabled", &cfg.tpm_enabled);
    field("hyperv_enabled", &cfg.hyperv_enabled);
    field("io_thread", &cfg.io_thread);
    field("balloon_enabled", &cfg.balloon_enabled);
    field("rng_enabled", &cfg.rng_enabled);
    field("usb_controller", &cfg.usb_controller);
    field("gpu_passthrough", &cfg.gpu_passthrough);
    field("disk_controller", &cfg.disk_controller);
    field("disk_io", &cfg.disk_io);
    field("disk_cache", &cfg.disk_cache);
    field("disk_preallocate", &cfg.disk_preallocate);
    field("ipxe_enabled", &cfg.ipxe_enabled);
    field(
        "ipxe_rom_path",
        &cfg.ipxe_rom_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".into()),
    );
    field("persist", &cfg.persist);
    field("ssh_port", &cfg.ssh_port);
    field("no_console", &cfg.no_console);
    field("require_kvm", &cfg.require_kvm);
    field("libvirt_uri", &cfg.libvirt_uri);
    field("download_retries", &cfg.download_retries);
    field("extra_args", &if cfg.extra_args.is_empty() { "-" } else { cfg.extra_args.as_str() });
}

pub fn print_dry_run(cfg: &VmConfig, paths: &Paths) {
    println!("=== Configuration ===");
    print_config(cfg);
    println!("=== Environment Checks ===");
    if host::kvm_available() {
        println!("KVM:         available (/dev/kvm)");
    } else if cfg.require_kvm {
        println!("KVM:         NOT available (REQUIRE_KVM=1 is set — will fail)");
    } else {
        println!("KVM:         NOT available (will use TCG — 10-50x slower)");
    }
    let order: Vec<&str> = cfg.boot_order.iter().map(|d| d.as_str()).collect();
    println!("Boot order:  {}", order.join(", "));
    if cfg.persist {
        println!("Persistence: enabled (data dir: {})", paths.images_dir().display());
    } else {
        println!("Persistence: disabled (ephemeral)");
    }
    if cfg.cloud_init_enabled {
        println!("Cloud-init:  enabled (user={})", cfg.login_user);
    } else {
        println!("Cloud-init:  disabled");
    }
    if let Some(boot_from) = cfg.boot_from.as_deref() {
        println!("Boot source: {boot_from}");
    }
    println!("IPv6:        {}", if host::ipv6_supported() { "supported" } else { "not supported" });
    for (i, nic) in cfg.nics.iter().enumerate() {
        println!(
            "NIC #{}:      mode={}, model={}, mac={}",
            i + 1,
            nic.mode.as_str(),
            nic.model,
            nic.mac_address
        );
    }
    println!("=== Dry-run complete (no VM started) ===");
    print_access_banner(cfg);
}
