use std::path::Path;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use boxvm::catalog::{Catalog, DEFAULT_CATALOG_PATH};
use boxvm::cli::Cli;
use boxvm::config::{self, EnvSource, NicMode, VmConfig};
use boxvm::error::BoxvmError;
use boxvm::paths::{Paths, ensure_directory};
use boxvm::services::ServiceManager;
use boxvm::vm::VmManager;
use boxvm::{console, domain_xml, host, image, summary};

/// Unexpected failures (panics) still exit 1, with the backtrace and a
/// pointer to the issue tracker instead of a bare abort.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        eprintln!("{}", ::console::style(format!("[ERROR] unexpected error: {info}")).red());
        eprintln!("{}", std::backtrace::Backtrace::force_capture());
        eprintln!(
            "This is likely a bug. Please report it at {}",
            boxvm::error::ISSUE_TRACKER
        );
        std::process::exit(1);
    }));
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    install_panic_hook();

    let verbose = cli.verbose || std::env::var("LOG_VERBOSE").map(|v| config::is_truthy(&v)).unwrap_or(false);
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive("boxvm=info".parse().expect("valid log directive"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let catalog = Catalog::load(Path::new(DEFAULT_CATALOG_PATH))?;

    if let Some(arch_filter) = cli.list_distros.as_deref() {
        list_distros(&catalog, arch_filter);
        return Ok(());
    }

    let paths = Paths::from_env();
    let env = EnvSource::from_process();
    let cfg = config::parse_env(&env, &catalog, &paths)?;

    if cli.show_config {
        summary::print_config(&cfg);
        return Ok(());
    }

    if cli.show_xml {
        println!("{}", render_offline_xml(&cfg, &paths));
        return Ok(());
    }

    if cli.dry_run {
        summary::print_dry_run(&cfg, &paths);
        return Ok(());
    }

    summary::print_host_info(&paths);
    summary::print_vm_summary(&cfg);

    let has_user_nic = cfg.nics.iter().any(|n| n.mode == NicMode::User);
    if !has_user_nic {
        tracing::warn!(
            "SSH_PORT={} is set but no user-mode NIC; SSH port forwarding not active",
            cfg.ssh_port
        );
        if !cfg.port_forwards.is_empty() {
            tracing::warn!("PORT_FWD is set but no user-mode NIC; port forwarding not active");
        }
    }

    let console_requested = resolve_console_mode(&cfg, cli.no_console);

    ensure_directory(&paths.state_dir())?;

    let mut services = ServiceManager::new(&cfg, &paths);
    if let Err(e) = services.start().await {
        services.stop().await;
        return Err(e.into());
    }

    let mut vm = match VmManager::new(&cfg, &paths) {
        Ok(vm) => vm,
        Err(e) => {
            services.stop().await;
            return Err(e.into());
        }
    };

    let mut vm_started = false;
    let outcome = run_lifecycle(&mut vm, &mut services, &cfg, console_requested, &mut vm_started).await;

    // Teardown always runs; libvirt failures inside it are non-fatal.
    if vm_started && cfg.persist {
        vm.mark_installed();
    }
    vm.cleanup().await;
    vm.close();
    services.stop().await;

    match outcome {
        Ok(0) => Ok(()),
        Ok(code) => {
            tracing::warn!(code, "console exited with non-zero status");
            std::process::exit(code);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_lifecycle(
    vm: &mut VmManager,
    services: &mut ServiceManager,
    cfg: &VmConfig,
    console_requested: bool,
    vm_started: &mut bool,
) -> Result<i32, BoxvmError> {
    vm.connect()?;
    vm.prepare().await?;
    vm.start(services).await?;
    *vm_started = true;
    summary::print_access_banner(cfg);

    if console_requested {
        console::run_console(&cfg.libvirt_uri, &cfg.vm_name).await
    } else {
        vm.wait_for_guest_ready(Duration::from_secs(120)).await;
        vm.wait_until_stopped().await?;
        Ok(0)
    }
}

fn resolve_console_mode(cfg: &VmConfig, no_console_flag: bool) -> bool {
    if no_console_flag || cfg.no_console {
        return false;
    }
    if !host::has_controlling_tty() {
        tracing::info!("no TTY detected; running headless, the serial console will not be attached");
        return false;
    }
    true
}

/// Domain XML from the resolved config alone: paths as they would be used,
/// no libvirt connection, no filesystem writes.
fn render_offline_xml(cfg: &VmConfig, paths: &Paths) -> String {
    let state = image::ImageState::new(cfg, paths);
    let profile = boxvm::arch::profile_for(&cfg.arch).expect("resolver validated arch");
    let firmware = profile.firmware_for(cfg.boot_mode.as_str());
    let kvm = host::kvm_available();
    let effective_cpu_model = if kvm {
        cfg.cpu_model.clone()
    } else {
        match cfg.cpu_model.to_ascii_lowercase().as_str() {
            "host" | "host-passthrough" => profile.tcg_fallback.to_string(),
            other => other.to_string(),
        }
    };
    let inputs = domain_xml::DomainInputs {
        work_image: state.work_image.clone(),
        format: state.format.clone(),
        seed_iso: cfg.cloud_init_enabled.then(|| paths.seed_iso(&cfg.vm_name)),
        boot_iso: cfg
            .boot_from
            .as_deref()
            .filter(|b| b.to_ascii_lowercase().ends_with(".iso"))
            .map(|b| {
                if b.starts_with("http://") || b.starts_with("https://") {
                    paths.boot_iso_cache().join(image::url_cache_name(b))
                } else {
                    b.into()
                }
            }),
        extra_disk_paths: cfg
            .extra_disks
            .iter()
            .map(|d| paths.extra_disk(&cfg.vm_name, d.index, &state.format))
            .collect(),
        block_sector_sizes: cfg.block_devices.iter().map(|_| None).collect(),
        firmware_loader: firmware.map(|f| f.loader.into()),
        firmware_nvram: firmware.map(|_| paths.firmware_vars(&cfg.vm_name)),
        kvm_available: kvm,
        effective_cpu_model,
        cpu_vendor: host::cpu_vendor(),
        cpu_flags: host::cpu_flags(),
        vm_dir_fs_type: host::filesystem_type_at(paths.images_dir()),
        boot_order: cfg.boot_order.clone(),
    };
    domain_xml::render_domain_xml(cfg, &inputs)
}

fn list_distros(catalog: &Catalog, arch_filter: &str) {
    let entries: Vec<(&String, &boxvm::catalog::DistroEntry)> = if arch_filter.is_empty() {
        catalog.distributions.iter().collect()
    } else {
        catalog.filtered(arch_filter)
    };
    if entries.is_empty() {
        tracing::warn!("no distributions found{}", if arch_filter.is_empty() { String::new() } else { format!(" for arch '{arch_filter}'") });
        return;
    }
    let max_key = entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, entry) in entries {
        let arch = entry.arch.as_deref().unwrap_or("x86_64");
        println!("  {key:<max_key$}  {}  (arch={arch}, user={})", entry.name, entry.user);
    }
}
