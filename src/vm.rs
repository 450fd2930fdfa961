//! VM lifecycle controller.
//!
//! Owns the libvirt connection, the domain handle and the swtpm child, and
//! drives prepare → define → start → wait → cleanup. Cleanup is best-effort:
//! libvirt failures during teardown are logged at debug and ignored, but the
//! orphan-QEMU sweep always runs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use base64::Engine as _;
use facet::Facet;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use virt::connect::Connect;
use virt::domain::Domain;

use crate::config::{BootDevice, VmConfig};
use crate::domain_xml::{self, DomainInputs};
use crate::error::BoxvmError;
use crate::image::{self, ImageState};
use crate::paths::{Paths, ensure_directory};
use crate::host;
use crate::services::ServiceManager;

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

pub struct VmManager {
    cfg: VmConfig,
    paths: Paths,
    conn: Option<ConnGuard>,
    domain: Option<Domain>,
    pub state: ImageState,
    /// Working copy of the boot order; the install-skip pass may edit it.
    boot_order: Vec<BootDevice>,
    kvm_available: bool,
    effective_cpu_model: String,
    firmware_loader: Option<PathBuf>,
    firmware_nvram: Option<PathBuf>,
    tpm_child: Option<tokio::process::Child>,
}

impl VmManager {
    pub fn new(cfg: &VmConfig, paths: &Paths) -> Result<Self, BoxvmError> {
        ensure_directory(paths.images_dir())?;
        ensure_directory(&paths.base_dir())?;
        let vm_dir = paths.vm_dir(&cfg.vm_name);
        if !cfg.persist && vm_dir.exists() {
            let _ = std::fs::remove_dir_all(&vm_dir);
        }
        ensure_directory(&vm_dir)?;

        Ok(Self {
            cfg: cfg.clone(),
            paths: paths.clone(),
            conn: None,
            domain: None,
            state: ImageState::new(cfg, paths),
            boot_order: cfg.boot_order.clone(),
            kvm_available: host::kvm_available(),
            effective_cpu_model: cfg.cpu_model.clone(),
            firmware_loader: None,
            firmware_nvram: None,
            tpm_child: None,
        })
    }

    pub fn connect(&mut self) -> Result<(), BoxvmError> {
        // Route libvirt errors through Results instead of the C library's
        // stderr handler.
        virt::error::clear_error_callback();
        let conn = Connect::open(Some(self.cfg.libvirt_uri.as_str())).map_err(|e| BoxvmError::Libvirt {
            message: format!("failed to connect to {}: {e}", self.cfg.libvirt_uri),
            hint: "ensure libvirtd started inside the container (check earlier log lines)".into(),
        })?;
        self.conn = Some(ConnGuard(conn));
        Ok(())
    }

    pub fn close(&mut self) {
        self.domain = None;
        self.conn = None;
    }

    fn conn(&self) -> Result<&Connect, BoxvmError> {
        self.conn.as_deref().ok_or_else(|| BoxvmError::Libvirt {
            message: "libvirt connection not established".into(),
            hint: "connect() must run before prepare()".into(),
        })
    }

    // ── Prepare ────────────────────────────────────────────

    pub async fn prepare(&mut self) -> Result<(), BoxvmError> {
        self.gate_on_kvm()?;
        image::resolve_boot_from(&self.cfg, &self.paths, &mut self.state).await?;

        if !self.cfg.blank_work_disk {
            image::ensure_base_image(&self.cfg, &self.paths, &mut self.state).await?;
        }
        image::ensure_work_image(&self.cfg, &self.paths, &mut self.state).await?;

        self.apply_install_skip();

        if let Some(iso) = &self.state.boot_iso
            && !iso.exists()
        {
            return Err(BoxvmError::resource(format!("boot ISO not found: {}", iso.display())));
        }

        self.extract_qemu_binary().await?;
        self.prepare_firmware().await?;
        self.start_tpm().await?;

        if self.cfg.cloud_init_enabled {
            crate::cloudinit::generate_seed_iso(&self.cfg, &self.paths.seed_iso(&self.cfg.vm_name)).await?;
        }

        self.define_domain().await?;
        Ok(())
    }

    fn gate_on_kvm(&mut self) -> Result<(), BoxvmError> {
        if self.kvm_available {
            return Ok(());
        }
        tracing::warn!("/dev/kvm not found; running in software emulation (TCG), 10-50x slower");
        if self.cfg.require_kvm {
            return Err(BoxvmError::resource_with_hint(
                "REQUIRE_KVM=1 is set but /dev/kvm is not available",
                "add --device /dev/kvm:/dev/kvm or unset REQUIRE_KVM",
            ));
        }
        let model = self.cfg.cpu_model.to_ascii_lowercase();
        if model == "host" || model == "host-passthrough" {
            let profile = crate::arch::profile_for(&self.cfg.arch).expect("resolver validated arch");
            self.effective_cpu_model = profile.tcg_fallback.to_string();
            tracing::warn!(
                fallback = profile.tcg_fallback,
                "CPU_MODEL=host is not compatible with TCG on {}; substituting",
                self.cfg.arch
            );
        }
        Ok(())
    }

    /// Smart install skip: a persisted disk that already completed an install
    /// boots from it instead of re-running the installer ISO.
    fn apply_install_skip(&mut self) {
        if self.state.boot_iso.is_some()
            && self.state.disk_reused
            && self.is_installed()
            && !self.cfg.force_iso
        {
            tracing::info!(
                "persistent disk with prior install found; skipping ISO boot (set FORCE_ISO=1 to override)"
            );
            self.state.boot_iso = None;
            self.boot_order.retain(|d| *d != BootDevice::Cdrom);
            if !self.boot_order.contains(&BootDevice::Hd) {
                self.boot_order.insert(0, BootDevice::Hd);
            }
        }
    }

    pub fn is_installed(&self) -> bool {
        self.paths.install_marker(&self.cfg.vm_name).exists()
    }

    /// Written by the caller after a clean exit with persistence enabled.
    pub fn mark_installed(&self) {
        let marker = self.paths.install_marker(&self.cfg.vm_name);
        if marker.exists() {
            return;
        }
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if std::fs::write(&marker, format!("installed epoch={epoch}\n")).is_ok() {
            tracing::info!(path = %marker.display(), "marked VM as installed");
        }
    }

    async fn extract_qemu_binary(&self) -> Result<(), BoxvmError> {
        let profile = crate::arch::profile_for(&self.cfg.arch).expect("resolver validated arch");
        let deb = PathBuf::from(format!("/opt/qemu-{}.deb", self.cfg.arch));
        if !deb.exists() || Path::new(&format!("/usr/bin/{}", profile.emulator())).exists() {
            return Ok(());
        }
        tracing::info!(arch = %self.cfg.arch, "extracting bundled QEMU binaries");
        run_checked("dpkg-deb", &["-x", &deb.display().to_string(), "/"]).await
    }

    async fn prepare_firmware(&mut self) -> Result<(), BoxvmError> {
        let profile = crate::arch::profile_for(&self.cfg.arch).expect("resolver validated arch");
        let Some(pair) = profile.firmware_for(self.cfg.boot_mode.as_str()) else {
            return Ok(());
        };
        let loader = PathBuf::from(pair.loader);
        let vars_template = PathBuf::from(pair.vars_template);

        if self.cfg.arch == "aarch64" && (!loader.exists() || !vars_template.exists()) {
            // One-shot extraction of the bundled AAVMF package.
            let deb = Path::new("/opt/aavmf.deb");
            if !deb.exists() {
                return Err(BoxvmError::resource_with_hint(
                    "AAVMF firmware .deb not found at /opt/aavmf.deb",
                    "rebuild the container image or install qemu-efi-aarch64 manually",
                ));
            }
            tracing::info!("extracting AAVMF firmware");
            run_checked("dpkg-deb", &["-x", "/opt/aavmf.deb", "/"]).await?;
        }

        if !loader.exists() {
            return Err(BoxvmError::resource_with_hint(
                format!("firmware loader not found at {}", loader.display()),
                "ensure the OVMF/AAVMF packages are installed in the container image",
            ));
        }
        if !vars_template.exists() {
            return Err(BoxvmError::resource_with_hint(
                format!("firmware variable template not found at {}", vars_template.display()),
                "ensure the OVMF/AAVMF packages are installed in the container image",
            ));
        }

        let vars_destination = self.paths.firmware_vars(&self.cfg.vm_name);
        if let Some(parent) = vars_destination.parent() {
            ensure_directory(parent)?;
        }
        if !vars_destination.exists() {
            std::fs::copy(&vars_template, &vars_destination).map_err(|e| {
                BoxvmError::io(
                    format!("copying NVRAM template to {}", vars_destination.display()),
                    e,
                )
            })?;
        }

        self.firmware_loader = Some(loader);
        self.firmware_nvram = Some(vars_destination);
        Ok(())
    }

    async fn start_tpm(&mut self) -> Result<(), BoxvmError> {
        if !self.cfg.tpm_enabled {
            return Ok(());
        }
        let tpm_dir = self.paths.tpm_dir(&self.cfg.vm_name);
        ensure_directory(&tpm_dir)?;
        let sock_path = tpm_dir.join("swtpm-sock");

        tracing::info!("starting software TPM (swtpm)");
        let child = tokio::process::Command::new("swtpm")
            .arg("socket")
            .arg("--tpmstate")
            .arg(format!("dir={}", tpm_dir.display()))
            .arg("--ctrl")
            .arg(format!("type=unixio,path={}", sock_path.display()))
            .arg("--tpm2")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|_| {
                BoxvmError::resource_with_hint(
                    "swtpm not found",
                    "ensure swtpm and swtpm-tools are installed in the container image",
                )
            })?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut child = child;
        if child.try_wait().ok().flatten().is_some() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            return Err(BoxvmError::Operational {
                message: format!("swtpm failed to start: {}", stderr.trim()),
            });
        }
        self.tpm_child = Some(child);
        Ok(())
    }

    // ── Define / start ─────────────────────────────────────

    pub async fn render_domain_xml(&self) -> Result<String, BoxvmError> {
        let inputs = self.domain_inputs().await?;
        let xml = domain_xml::render_domain_xml(&self.cfg, &inputs);
        debug_assert_eq!(
            domain_xml::reserialize(&xml).ok().as_deref(),
            Some(xml.as_str()),
            "rendered domain XML must parse back into the element model unchanged"
        );
        Ok(xml)
    }

    async fn domain_inputs(&self) -> Result<DomainInputs, BoxvmError> {
        let mut block_sector_sizes = Vec::new();
        for blk in &self.cfg.block_devices {
            block_sector_sizes.push(probe_sector_size(&blk.path).await);
        }
        Ok(DomainInputs {
            work_image: self.state.work_image.clone(),
            format: self.state.format.clone(),
            seed_iso: self
                .cfg
                .cloud_init_enabled
                .then(|| self.paths.seed_iso(&self.cfg.vm_name)),
            boot_iso: self.state.boot_iso.clone(),
            extra_disk_paths: self
                .cfg
                .extra_disks
                .iter()
                .map(|d| self.paths.extra_disk(&self.cfg.vm_name, d.index, &self.state.format))
                .collect(),
            block_sector_sizes,
            firmware_loader: self.firmware_loader.clone(),
            firmware_nvram: self.firmware_nvram.clone(),
            kvm_available: self.kvm_available,
            effective_cpu_model: self.effective_cpu_model.clone(),
            cpu_vendor: host::cpu_vendor(),
            cpu_flags: host::cpu_flags(),
            vm_dir_fs_type: host::filesystem_type_at(&self.paths.vm_dir(&self.cfg.vm_name)),
            boot_order: self.boot_order.clone(),
        })
    }

    async fn define_domain(&mut self) -> Result<(), BoxvmError> {
        let conn = self.conn()?;
        // An already-defined domain is adopted verbatim.
        if let Ok(existing) = Domain::lookup_by_name(conn, &self.cfg.vm_name) {
            tracing::info!(name = %self.cfg.vm_name, "domain already defined");
            self.domain = Some(existing);
            return Ok(());
        }
        let xml = self.render_domain_xml().await?;
        let domain = Domain::define_xml(self.conn()?, &xml).map_err(|e| BoxvmError::Libvirt {
            message: format!("failed to define domain: {e}"),
            hint: "inspect the generated XML with --show-xml".into(),
        })?;
        tracing::info!(name = %self.cfg.vm_name, "domain defined");
        self.domain = Some(domain);
        Ok(())
    }

    pub async fn start(&mut self, services: &mut ServiceManager) -> Result<(), BoxvmError> {
        if self.domain.is_none() {
            return Err(BoxvmError::Libvirt {
                message: "domain not defined".into(),
                hint: "prepare() must run before start()".into(),
            });
        }

        let already_running = self
            .domain
            .as_ref()
            .map(|d| d.is_active().unwrap_or(false))
            .unwrap_or(false);
        if already_running {
            tracing::info!(name = %self.cfg.vm_name, "domain already running");
            services.start_novnc().await?;
            return Ok(());
        }

        let create_result = self.domain.as_ref().map(|d| d.create()).expect("checked above");
        if let Err(e) = create_result {
            let message = e.to_string();
            let lower = message.to_ascii_lowercase();
            if lower.contains("cgroup") {
                return Err(BoxvmError::Libvirt {
                    message: format!("libvirt could not access host cgroups: {message}"),
                    hint: "run the container with --cgroupns=host".into(),
                });
            }
            if lower.contains("passt") || lower.contains("backend") {
                tracing::warn!("network backend failed: {message}");
                if services.runtime.rootless {
                    tracing::warn!("rootless container; network backend errors are expected");
                }
                tracing::info!("attempting fallback to slirp network backend");
                if self.try_network_fallback()? {
                    tracing::info!(name = %self.cfg.vm_name, "domain started (with slirp fallback)");
                    services.start_novnc().await?;
                    return Ok(());
                }
            }
            return Err(BoxvmError::Libvirt {
                message: format!("failed to start domain: {message}"),
                hint: "check `virsh -c qemu:///system start` output and container privileges".into(),
            });
        }
        tracing::info!(name = %self.cfg.vm_name, "domain started");

        services.start_novnc().await?;
        Ok(())
    }

    /// Re-define without the passt backend so libvirt falls back to slirp,
    /// then retry once.
    fn try_network_fallback(&mut self) -> Result<bool, BoxvmError> {
        let Some(domain) = self.domain.as_ref() else {
            return Ok(false);
        };
        let Ok(xml) = domain.get_xml_desc(0) else {
            return Ok(false);
        };
        let stripped = xml
            .replace("<backend type=\"passt\"/>", "")
            .replace("<backend type='passt'/>", "");
        if stripped == xml {
            return Ok(false);
        }
        let undefine = if self.firmware_nvram.is_some() {
            domain.undefine_flags(virt::sys::VIR_DOMAIN_UNDEFINE_NVRAM)
        } else {
            domain.undefine()
        };
        if let Err(e) = undefine {
            tracing::debug!("undefine before slirp fallback failed: {e}");
        }
        match Domain::define_xml(self.conn()?, &stripped) {
            Ok(redefined) => match redefined.create() {
                Ok(_) => {
                    self.domain = Some(redefined);
                    Ok(true)
                }
                Err(e) => {
                    tracing::warn!("slirp fallback also failed: {e}");
                    self.domain = Some(redefined);
                    Ok(false)
                }
            },
            Err(e) => {
                tracing::warn!("slirp fallback redefine failed: {e}");
                Ok(false)
            }
        }
    }

    // ── Guest readiness ────────────────────────────────────

    async fn agent_command(&self, payload: &str, timeout: Duration) -> Option<String> {
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("virsh")
                .args(["-c", &self.cfg.libvirt_uri, "qemu-agent-command", &self.cfg.vm_name, payload])
                .output(),
        )
        .await;
        match result {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            _ => None,
        }
    }

    async fn guest_ping(&self) -> bool {
        self.agent_command(r#"{"execute":"guest-ping"}"#, Duration::from_secs(5))
            .await
            .is_some()
    }

    /// Run a command in the guest through the agent; returns (exit code, stdout).
    async fn guest_exec(&self, command: &str, args: &[&str]) -> Option<(i64, String)> {
        let args_json: Vec<String> = args.iter().map(|a| format!("\"{a}\"")).collect();
        let payload = format!(
            r#"{{"execute":"guest-exec","arguments":{{"path":"{command}","arg":[{}],"capture-output":true}}}}"#,
            args_json.join(",")
        );
        let response = self.agent_command(&payload, Duration::from_secs(10)).await?;
        let parsed: GuestExecResponse = facet_json::from_str(&response).ok()?;
        let pid = parsed.ret.pid?;

        let status_payload =
            format!(r#"{{"execute":"guest-exec-status","arguments":{{"pid":{pid}}}}}"#);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while tokio::time::Instant::now() < deadline {
            let response = self.agent_command(&status_payload, Duration::from_secs(10)).await?;
            let status: GuestExecStatusResponse = facet_json::from_str(&response).ok()?;
            if status.ret.exited {
                let stdout = base64::engine::general_purpose::STANDARD
                    .decode(status.ret.out_data.as_bytes())
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default();
                return Some((status.ret.exitcode, stdout));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        None
    }

    pub async fn wait_for_guest_agent(&self, timeout: Duration) -> bool {
        tracing::info!("waiting for guest agent to become ready");
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.guest_ping().await {
                tracing::info!("guest agent is ready");
                return true;
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        tracing::warn!(timeout_s = timeout.as_secs(), "guest agent did not respond (VM may still be booting)");
        false
    }

    /// Phase 1: guest-ping. Phase 2 (cloud-init runs only): poll
    /// `cloud-init status` until done/error/disabled or 300s elapse.
    pub async fn wait_for_guest_ready(&self, timeout: Duration) -> bool {
        if !self.wait_for_guest_agent(timeout).await {
            return false;
        }
        if !self.cfg.cloud_init_enabled {
            return true;
        }

        tracing::info!("waiting for cloud-init to finish");
        let started = tokio::time::Instant::now();
        let deadline = started + Duration::from_secs(300);
        let mut failures = 0u32;
        while tokio::time::Instant::now() < deadline {
            let Some((_, stdout)) = self.guest_exec("cloud-init", &["status"]).await else {
                failures += 1;
                if failures >= 30 {
                    tracing::warn!("could not query cloud-init status; skipping wait");
                    return true;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            };
            failures = 0;
            let lower = stdout.to_ascii_lowercase();
            if lower.contains("done") {
                tracing::info!(elapsed_s = started.elapsed().as_secs(), "cloud-init complete");
                return true;
            }
            if lower.contains("error") {
                tracing::warn!(elapsed_s = started.elapsed().as_secs(), "cloud-init finished with errors");
                return true;
            }
            if lower.contains("disabled") {
                tracing::info!("cloud-init is disabled in the guest");
                return true;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        tracing::warn!("cloud-init did not finish within 300s (may still be running)");
        true
    }

    // ── Wait for shutdown ──────────────────────────────────

    fn request_shutdown(&self, shutdown_requested: &mut bool) {
        if *shutdown_requested {
            return;
        }
        *shutdown_requested = true;
        tracing::info!("shutting down VM");
        let Some(domain) = self.domain.as_ref() else {
            return;
        };
        if domain.shutdown().is_err()
            && domain.destroy().is_err()
        {
            tracing::info!("libvirt connection lost; VM process will terminate with the container");
        }
    }

    /// Block until the domain stops. SIGTERM shuts down immediately; SIGINT
    /// uses a 3-second double-press guard. Signal streams live only inside
    /// this call, so previous dispositions return when it exits.
    pub async fn wait_until_stopped(&self) -> Result<(), BoxvmError> {
        use tokio::signal::unix::{SignalKind, signal};

        let domain = self.domain.as_ref().ok_or_else(|| BoxvmError::Libvirt {
            message: "domain not defined".into(),
            hint: "prepare() must run before waiting".into(),
        })?;

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| BoxvmError::io("installing SIGTERM handler", e))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| BoxvmError::io("installing SIGINT handler", e))?;

        const DOUBLE_PRESS_WINDOW: Duration = Duration::from_secs(3);
        let mut first_sigint: Option<tokio::time::Instant> = None;
        let mut shutdown_requested = false;

        tracing::info!(name = %self.cfg.vm_name, "waiting for domain to stop");
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, shutting down VM");
                    self.request_shutdown(&mut shutdown_requested);
                }
                _ = sigint.recv() => {
                    let now = tokio::time::Instant::now();
                    match first_sigint {
                        Some(first) if now.duration_since(first) < DOUBLE_PRESS_WINDOW => {
                            tracing::info!("second Ctrl+C received, shutting down VM");
                            self.request_shutdown(&mut shutdown_requested);
                        }
                        _ => {
                            first_sigint = Some(now);
                            tracing::warn!("press Ctrl+C again within 3s to shut down the VM");
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    if !domain.is_active().unwrap_or(false) {
                        tracing::info!(name = %self.cfg.vm_name, "domain is no longer active");
                        return Ok(());
                    }
                }
            }
        }
    }

    // ── Cleanup ────────────────────────────────────────────

    pub async fn cleanup(&mut self) {
        if let Some(mut tpm) = self.tpm_child.take() {
            if let Some(pid) = tpm.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            if tokio::time::timeout(Duration::from_secs(5), tpm.wait()).await.is_err() {
                let _ = tpm.kill().await;
            }
        }

        if let Some(domain) = self.domain.take() {
            if domain.is_active().unwrap_or(false) {
                tracing::info!(name = %self.cfg.vm_name, "destroying running domain");
                if let Err(e) = domain.destroy() {
                    tracing::debug!("could not destroy domain: {e}");
                }
            }
            let undefine = if self.firmware_nvram.is_some() {
                domain.undefine_flags(virt::sys::VIR_DOMAIN_UNDEFINE_NVRAM)
            } else {
                domain.undefine()
            };
            if let Err(e) = undefine {
                tracing::debug!("could not undefine domain: {e}");
            }
        }

        self.kill_remaining_qemu().await;

        if !self.cfg.persist {
            let vm_dir = self.paths.vm_dir(&self.cfg.vm_name);
            if vm_dir.exists()
                && let Err(e) = std::fs::remove_dir_all(&vm_dir)
            {
                tracing::warn!(path = %vm_dir.display(), "failed to remove VM directory: {e}");
            }
        }
    }

    /// No QEMU process may outlive the supervisor inside this container.
    async fn kill_remaining_qemu(&self) {
        let output = tokio::process::Command::new("pgrep")
            .args(["-f", "qemu-system"])
            .output()
            .await;
        let Ok(output) = output else {
            return;
        };
        if !output.status.success() {
            return;
        }
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Ok(pid) = line.trim().parse::<i32>() {
                tracing::warn!(pid, "killing orphaned QEMU process");
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }
}

async fn run_checked(command: &str, args: &[&str]) -> Result<(), BoxvmError> {
    let output = tokio::process::Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|e| BoxvmError::io(format!("running {command}"), e))?;
    if !output.status.success() {
        return Err(BoxvmError::ExternalCommand {
            command: command.to_string(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// `blockdev --getss`; `None` when unavailable or the standard 512.
async fn probe_sector_size(device: &str) -> Option<u32> {
    let output = tokio::process::Command::new("blockdev")
        .args(["--getss", device])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

// guest-agent JSON envelopes

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct GuestExecResponse {
    #[facet(default, rename = "return")]
    ret: GuestExecReturn,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct GuestExecReturn {
    #[facet(default)]
    pid: Option<i64>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct GuestExecStatusResponse {
    #[facet(default, rename = "return")]
    ret: GuestExecStatus,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct GuestExecStatus {
    #[facet(default)]
    exited: bool,
    #[facet(default)]
    exitcode: i64,
    #[facet(default, rename = "out-data")]
    out_data: String,
}
