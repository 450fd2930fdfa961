//! Auxiliary service supervision: virtlogd, libvirtd, sushy-emulator and the
//! websockify/noVNC proxy.
//!
//! The supervisor owns these children and their configuration artifacts
//! (certificates, htpasswd, sushy.conf). Shutdown is idempotent: SIGTERM,
//! a bounded wait, then SIGKILL.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use virt::connect::Connect;
use virt::storage_pool::StoragePool;

use crate::config::VmConfig;
use crate::error::BoxvmError;
use crate::host::{RuntimeInfo, detect_runtime};
use crate::paths::{Paths, ensure_directory};

const NOVNC_ROOT: &str = "/usr/share/novnc";

const LIBVIRT_SOCKETS: &[&str] = &[
    "/run/libvirt/libvirt-sock",
    "/var/run/libvirt/libvirt-sock",
    "/run/libvirt/virtlogd-sock",
    "/var/run/libvirt/virtlogd-sock",
];

struct NamedChild {
    name: &'static str,
    child: Child,
}

pub struct ServiceManager {
    cfg: VmConfig,
    paths: Paths,
    children: Vec<NamedChild>,
    novnc_started: bool,
    shutdown: bool,
    storage_pool_name: String,
    storage_pool_path: PathBuf,
    pub runtime: RuntimeInfo,
}

impl ServiceManager {
    pub fn new(cfg: &VmConfig, paths: &Paths) -> Self {
        Self {
            cfg: cfg.clone(),
            paths: paths.clone(),
            children: Vec::new(),
            novnc_started: false,
            shutdown: false,
            storage_pool_name: std::env::var("REDFISH_STORAGE_POOL").unwrap_or_else(|_| "default".into()),
            storage_pool_path: std::env::var("REDFISH_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/libvirt/images")),
            runtime: detect_runtime(),
        }
    }

    pub async fn start(&mut self) -> Result<(), BoxvmError> {
        self.start_libvirt().await?;
        self.wait_for_libvirt().await?;
        if self.cfg.redfish_enabled {
            self.ensure_storage_pool();
            self.start_sushy().await?;
        } else {
            tracing::info!("Redfish disabled (set REDFISH_ENABLE=1 to enable)");
        }
        Ok(())
    }

    // ── libvirt daemons ────────────────────────────────────

    async fn start_libvirt(&mut self) -> Result<(), BoxvmError> {
        ensure_directory(Path::new("/run/libvirt"))?;
        ensure_directory(Path::new("/var/run/libvirt"))?;
        for sock in LIBVIRT_SOCKETS {
            cleanup_socket(Path::new(sock)).await;
        }

        let virtlogd = spawn_daemon("/usr/sbin/virtlogd", Path::new("/etc/libvirt/virtlogd.conf"))?;
        self.children.push(NamedChild { name: "virtlogd", child: virtlogd });
        let libvirtd = spawn_daemon("/usr/sbin/libvirtd", Path::new("/etc/libvirt/libvirtd.conf"))?;
        self.children.push(NamedChild { name: "libvirtd", child: libvirtd });
        tracing::info!("libvirt services spawned");

        tokio::time::sleep(Duration::from_millis(500)).await;
        for entry in &mut self.children {
            assert_running(entry).await?;
        }
        Ok(())
    }

    async fn wait_for_libvirt(&self) -> Result<(), BoxvmError> {
        let libvirtd_ok = wait_for_any(
            &[Path::new("/run/libvirt/libvirt-sock"), Path::new("/var/run/libvirt/libvirt-sock")],
            Duration::from_secs(15),
        )
        .await;
        if !libvirtd_ok {
            let message = "libvirt socket did not appear";
            let hint = "run with --privileged, or add --cgroupns=host --device /dev/kvm:/dev/kvm \
                        and ensure SYS_ADMIN/NET_ADMIN capabilities";
            if self.runtime.rootless {
                tracing::warn!("{message}; {hint}");
                return Ok(());
            }
            return Err(BoxvmError::resource_with_hint(message, hint));
        }
        let virtlogd_ok = wait_for_any(
            &[Path::new("/run/libvirt/virtlogd-sock"), Path::new("/var/run/libvirt/virtlogd-sock")],
            Duration::from_secs(15),
        )
        .await;
        if !virtlogd_ok {
            let message = "virtlogd socket did not appear";
            let hint = "run with --privileged or add --cgroupns=host, and check container logs for virtlogd errors";
            if self.runtime.rootless {
                tracing::warn!("{message}; {hint}");
                return Ok(());
            }
            return Err(BoxvmError::resource_with_hint(message, hint));
        }
        Ok(())
    }

    // ── Redfish / sushy ────────────────────────────────────

    fn ensure_storage_pool(&self) {
        if let Err(e) = ensure_directory(&self.storage_pool_path) {
            tracing::warn!("could not create storage pool path: {e}");
            return;
        }
        let mut conn = match Connect::open(Some(self.cfg.libvirt_uri.as_str())) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    uri = %self.cfg.libvirt_uri,
                    "failed to open libvirt for storage pool setup: {e}; virtual media may be unavailable"
                );
                return;
            }
        };

        let pool = match StoragePool::lookup_by_name(&conn, &self.storage_pool_name) {
            Ok(pool) => Some(pool),
            Err(_) => {
                let pool_xml = format!(
                    "<pool type='dir'>\n  <name>{}</name>\n  <target>\n    <path>{}</path>\n  </target>\n</pool>",
                    self.storage_pool_name,
                    self.storage_pool_path.display()
                );
                match StoragePool::define_xml(&conn, &pool_xml, 0) {
                    Ok(pool) => {
                        if let Err(e) = pool.build(0) {
                            tracing::warn!(pool = %self.storage_pool_name, "storage pool build failed: {e}");
                        } else {
                            tracing::info!(
                                pool = %self.storage_pool_name,
                                path = %self.storage_pool_path.display(),
                                "created libvirt storage pool"
                            );
                        }
                        Some(pool)
                    }
                    Err(e) => {
                        tracing::warn!(pool = %self.storage_pool_name, "unable to define storage pool: {e}");
                        None
                    }
                }
            }
        };

        if let Some(pool) = pool {
            if !pool.is_active().unwrap_or(false)
                && let Err(e) = pool.create(0)
            {
                tracing::warn!(pool = %self.storage_pool_name, "unable to activate storage pool: {e}");
            }
            if !pool.get_autostart().unwrap_or(true)
                && let Err(e) = pool.set_autostart(true)
            {
                tracing::warn!(pool = %self.storage_pool_name, "unable to autostart storage pool: {e}");
            }
        }
        let _ = conn.close();
    }

    fn cert_paths(&self) -> (PathBuf, PathBuf) {
        let dir = self.paths.cert_dir();
        (dir.join("sushy.crt"), dir.join("sushy.key"))
    }

    async fn ensure_certificates(&self) -> Result<(PathBuf, PathBuf), BoxvmError> {
        let (crt, key) = self.cert_paths();
        if crt.exists() && key.exists() {
            return Ok((crt, key));
        }
        ensure_directory(&self.paths.cert_dir())?;
        tracing::info!("generating self-signed RSA-2048 certificate");
        let output = Command::new("openssl")
            .args(["req", "-x509", "-nodes", "-days", "365", "-newkey", "rsa:2048", "-keyout"])
            .arg(&key)
            .arg("-out")
            .arg(&crt)
            .args(["-subj", "/CN=boxvm/O=boxvm"])
            .output()
            .await
            .map_err(|e| BoxvmError::io("running openssl", e))?;
        if !output.status.success() {
            return Err(BoxvmError::ExternalCommand {
                command: "openssl".into(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok((crt, key))
    }

    fn write_auth_file(&self) -> Result<PathBuf, BoxvmError> {
        ensure_directory(&self.paths.sushy_dir())?;
        let auth_path = self.paths.sushy_dir().join("htpasswd");
        let hashed = crate::cloudinit::hash_password(&self.cfg.redfish_password)?;
        std::fs::write(&auth_path, format!("{}:{hashed}\n", self.cfg.redfish_user))
            .map_err(|e| BoxvmError::io(format!("writing {}", auth_path.display()), e))?;
        Ok(auth_path)
    }

    fn write_sushy_config(&self, cert: &Path, key: &Path, auth_file: &Path) -> Result<PathBuf, BoxvmError> {
        let config_path = self.paths.sushy_dir().join("sushy.conf");
        let contents = format!(
            "SUSHY_EMULATOR_LIBVIRT_URI = '{}'\n\
             SUSHY_EMULATOR_LISTEN_IP = \"0.0.0.0\"\n\
             SUSHY_EMULATOR_LISTEN_PORT = {}\n\
             SUSHY_EMULATOR_SSL_CERT = '{}'\n\
             SUSHY_EMULATOR_SSL_KEY = '{}'\n\
             SUSHY_EMULATOR_AUTH_FILE = '{}'\n",
            self.cfg.libvirt_uri,
            self.cfg.redfish_port,
            cert.display(),
            key.display(),
            auth_file.display(),
        );
        std::fs::write(&config_path, contents)
            .map_err(|e| BoxvmError::io(format!("writing {}", config_path.display()), e))?;
        Ok(config_path)
    }

    async fn start_sushy(&mut self) -> Result<(), BoxvmError> {
        let (cert, key) = self.ensure_certificates().await?;
        let auth_file = self.write_auth_file()?;
        let config_file = self.write_sushy_config(&cert, &key, &auth_file)?;

        tracing::info!(port = self.cfg.redfish_port, "starting sushy-emulator");
        let child = Command::new("sushy-emulator")
            .arg("--config")
            .arg(&config_file)
            .args(["--libvirt-uri", &self.cfg.libvirt_uri])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BoxvmError::io("spawning sushy-emulator", e))?;
        self.children.push(NamedChild { name: "sushy-emulator", child });
        Ok(())
    }

    // ── noVNC ──────────────────────────────────────────────

    /// Started by the controller once the domain is running.
    pub async fn start_novnc(&mut self) -> Result<(), BoxvmError> {
        if !self.cfg.novnc_enabled || self.novnc_started {
            return Ok(());
        }
        if !Path::new(NOVNC_ROOT).exists() {
            return Err(BoxvmError::resource(format!("noVNC static assets not found at {NOVNC_ROOT}")));
        }
        let (cert, key) = self.ensure_certificates().await?;

        let listen = format!("0.0.0.0:{}", self.cfg.novnc_port);
        let target = format!("127.0.0.1:{}", self.cfg.vnc_port);
        tracing::info!(web = self.cfg.novnc_port, vnc = self.cfg.vnc_port, "starting noVNC proxy");
        let child = Command::new("websockify")
            .args(["--web", NOVNC_ROOT, "--cert"])
            .arg(&cert)
            .arg("--key")
            .arg(&key)
            .arg(&listen)
            .arg(&target)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BoxvmError::io(
                    "spawning websockify (is it installed in the container image?)",
                    e,
                )
            })?;
        self.children.push(NamedChild { name: "websockify", child });
        self.novnc_started = true;
        tracing::info!(
            "noVNC console at https://localhost:{}/vnc.html?autoconnect=1&resize=scale",
            self.cfg.novnc_port
        );
        Ok(())
    }

    // ── Shutdown ───────────────────────────────────────────

    pub async fn stop(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        // Signal every child first so the 5s grace periods overlap instead
        // of stacking per child.
        for entry in &mut self.children {
            if entry.child.try_wait().ok().flatten().is_none()
                && let Some(pid) = entry.child.id()
            {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        for entry in &mut self.children {
            match tokio::time::timeout(Duration::from_secs(5), entry.child.wait()).await {
                Ok(_) => tracing::debug!(name = entry.name, "service stopped"),
                Err(_) => {
                    tracing::warn!(name = entry.name, "service ignored SIGTERM; killing");
                    let _ = entry.child.kill().await;
                }
            }
        }
        self.children.clear();
    }
}

fn spawn_daemon(binary: &str, config: &Path) -> Result<Child, BoxvmError> {
    let mut command = Command::new(binary);
    if config.exists() {
        command.arg("-f").arg(config);
    } else {
        tracing::warn!(config = %config.display(), "daemon config not found; using built-in defaults");
    }
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BoxvmError::io(format!("spawning {binary}"), e))
}

async fn assert_running(entry: &mut NamedChild) -> Result<(), BoxvmError> {
    let status = entry
        .child
        .try_wait()
        .map_err(|e| BoxvmError::io(format!("polling {}", entry.name), e))?;
    if let Some(status) = status {
        let mut stderr = String::new();
        if let Some(mut pipe) = entry.child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        if !stderr.is_empty() {
            tracing::error!("{} stderr:\n{stderr}", entry.name);
        }
        return Err(BoxvmError::Operational {
            message: format!("{} exited prematurely (code {:?})", entry.name, status.code()),
        });
    }
    Ok(())
}

/// Probe before unlinking: a socket that accepts a connection belongs to a
/// live libvirt (possibly the host's) and must be left alone.
async fn cleanup_socket(path: &Path) {
    use std::os::unix::fs::FileTypeExt;

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return;
    };
    if !meta.file_type().is_socket() {
        return;
    }

    let probe = tokio::time::timeout(Duration::from_millis(200), tokio::net::UnixStream::connect(path)).await;
    let stale = match probe {
        Ok(Ok(_)) => {
            tracing::info!(path = %path.display(), "detected active libvirt socket; leaving in place");
            return;
        }
        Ok(Err(e)) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
        ),
        Err(_) => true, // connect timed out
    };

    if stale {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::info!(path = %path.display(), "removed stale libvirt socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), "failed to remove stale socket: {e}"),
        }
    } else {
        tracing::warn!(path = %path.display(), "skipping removal of socket with unexpected connect error");
    }
}

async fn wait_for_any(paths: &[&Path], timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if paths.iter().any(|p| p.exists()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
