//! Cloud-init NoCloud seed synthesis.
//!
//! The engine always owns `vendor-data` — it survives any user override
//! because NoCloud processes it in a separate slot from `user-data`. The
//! vendor document provisions the login user, installs the guest agent, and
//! neutralizes the distro quirks that keep the agent from answering.

use std::path::Path;

use facet_value::{VArray, Value, value};

use crate::config::{VmConfig, sanitize_mount_target};
use crate::error::BoxvmError;
use crate::paths::ensure_directory;

/// Bcrypt with a fresh salt on every run.
pub fn hash_password(password: &str) -> Result<String, BoxvmError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| BoxvmError::other(format!("bcrypt hashing failed: {e}")))
}

pub fn build_meta_data(vm_name: &str) -> String {
    format!("instance-id: iid-{vm_name}\nlocal-hostname: {vm_name}\n")
}

/// Infer the MIME type cloud-init would assign to a user-data payload.
pub fn detect_content_type(payload: &str) -> &'static str {
    let stripped = payload.trim_start();
    if stripped.is_empty() {
        return "text/cloud-config";
    }
    let first_line = stripped.lines().next().unwrap_or("").trim().to_ascii_lowercase();
    if stripped.starts_with("#!") {
        "text/x-shellscript"
    } else if first_line.starts_with("#cloud-config-archive") {
        "text/cloud-config-archive"
    } else if first_line.starts_with("#cloud-config") {
        "text/cloud-config"
    } else if first_line.starts_with("#cloud-boothook") {
        "text/cloud-boothook"
    } else if first_line.starts_with("#include") {
        "text/x-include-url"
    } else if first_line.starts_with("#part-handler") {
        "text/part-handler"
    } else {
        "text/cloud-config"
    }
}

const QEMU_GA_SYSCONFIG: &str = "# Managed by boxvm\nBLACKLIST_RPC=\n";

const QEMU_GA_OPENRC: &str = "\
# Managed by boxvm
# Auto-detect virtio guest agent port
GA_PATH=\"$(find /dev -name 'vport*p1' 2>/dev/null | head -1)\"
";

pub fn build_vendor_data(cfg: &VmConfig) -> Result<String, BoxvmError> {
    let passwd_hash = hash_password(&cfg.password)?;
    let login_user = cfg.login_user.as_str();
    let passwd = passwd_hash.as_str();

    let mut user = value!({
        "name": (login_user),
        "lock_passwd": false,
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "shell": "/bin/bash",
        "passwd": (passwd),
    });
    if let Some(pubkey) = cfg.ssh_pubkey.as_deref()
        && let Some(obj) = user.as_object_mut()
    {
        let mut keys = VArray::new();
        keys.push(Value::from(pubkey));
        obj.insert("ssh_authorized_keys", Value::from(keys));
    }

    // RHEL-family ships a guest-exec blocklist; Alpine has no udev so the
    // vport symlink the agent expects never appears.
    let write_files = value!([
        {
            "path": "/etc/sysconfig/qemu-ga",
            "content": (QEMU_GA_SYSCONFIG),
        },
        {
            "path": "/etc/conf.d/qemu-guest-agent",
            "content": (QEMU_GA_OPENRC),
        },
    ]);

    let mut runcmd = VArray::new();
    // SELinux: make only the agent's domain permissive, leave enforcement on
    runcmd.push(value!([
        "sh",
        "-c",
        "command -v semanage >/dev/null 2>&1 && semanage permissive -a virt_qemu_ga_t || true",
    ]));
    // systemd distros
    runcmd.push(value!([
        "sh",
        "-c",
        "command -v systemctl >/dev/null 2>&1 && systemctl enable qemu-guest-agent && systemctl restart qemu-guest-agent || true",
    ]));
    // OpenRC distros
    runcmd.push(value!([
        "sh",
        "-c",
        "command -v rc-update >/dev/null 2>&1 && rc-update add qemu-guest-agent default && rc-service qemu-guest-agent restart || true",
    ]));

    let mut mounts = VArray::new();
    for fs in &cfg.filesystems {
        let mount_dir = format!("/mnt/{}", sanitize_mount_target(&fs.target));
        runcmd.push(Value::from(VArray::from_iter([
            Value::from("mkdir"),
            Value::from("-p"),
            Value::from(mount_dir.as_str()),
        ])));

        let (fstype, mut options) = if fs.driver == "virtiofs" {
            ("virtiofs", vec!["defaults", "_netdev"])
        } else {
            ("9p", vec!["trans=virtio,version=9p2000.L", "_netdev"])
        };
        if fs.readonly {
            options.push("ro");
        }
        mounts.push(Value::from(VArray::from_iter([
            Value::from(fs.target.as_str()),
            Value::from(mount_dir.as_str()),
            Value::from(fstype),
            Value::from(options.join(",").as_str()),
            Value::from("0"),
            Value::from("0"),
        ])));
    }

    let mut config = value!({
        "packages": ["qemu-guest-agent"],
        "users": [(user)],
        "chpasswd": { "expire": false },
        "ssh_pwauth": true,
        "write_files": (write_files),
        "runcmd": (Value::from(runcmd)),
    });
    if !cfg.filesystems.is_empty()
        && let Some(obj) = config.as_object_mut()
    {
        obj.insert("mounts", Value::from(mounts));
    }

    let yaml = facet_yaml::to_string(&config)
        .map_err(|e| BoxvmError::other(format!("vendor-data serialization failed: {e}")))?;
    // cloud-init wants #cloud-config as the very first line
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

pub fn build_user_data(cfg: &VmConfig) -> Result<String, BoxvmError> {
    let Some(path) = cfg.cloud_init_user_data_path.as_deref() else {
        return Ok(String::new());
    };
    let content = std::fs::read_to_string(path)
        .map_err(|e| BoxvmError::io(format!("reading CLOUD_INIT_USER_DATA {}", path.display()), e))?;
    if content.trim().is_empty() {
        tracing::warn!(path = %path.display(), "CLOUD_INIT_USER_DATA file is empty; ignored");
        return Ok(String::new());
    }
    tracing::info!(
        path = %path.display(),
        content_type = detect_content_type(&content),
        "using user cloud-init data"
    );
    Ok(content)
}

/// Write the three NoCloud files and wrap them into an ISO labeled `cidata`.
pub async fn generate_seed_iso(cfg: &VmConfig, seed_path: &Path) -> Result<(), BoxvmError> {
    let parent = seed_path
        .parent()
        .ok_or_else(|| BoxvmError::other("seed path has no parent directory"))?;
    ensure_directory(parent)?;

    let staging = parent.join(".cidata");
    let _ = std::fs::remove_dir_all(&staging);
    ensure_directory(&staging)?;

    let result = async {
        let meta_path = staging.join("meta-data");
        let user_path = staging.join("user-data");
        let vendor_path = staging.join("vendor-data");

        tokio::fs::write(&meta_path, build_meta_data(&cfg.vm_name))
            .await
            .map_err(|e| BoxvmError::io("writing meta-data", e))?;
        tokio::fs::write(&user_path, build_user_data(cfg)?)
            .await
            .map_err(|e| BoxvmError::io("writing user-data", e))?;
        tokio::fs::write(&vendor_path, build_vendor_data(cfg)?)
            .await
            .map_err(|e| BoxvmError::io("writing vendor-data", e))?;

        let output = tokio::process::Command::new("genisoimage")
            .arg("-output")
            .arg(seed_path)
            .args(["-volid", "cidata", "-joliet", "-rock"])
            .arg(&meta_path)
            .arg(&user_path)
            .arg(&vendor_path)
            .output()
            .await
            .map_err(|e| BoxvmError::io("running genisoimage", e))?;
        if !output.status.success() {
            return Err(BoxvmError::ExternalCommand {
                command: "genisoimage".into(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
    .await;

    let _ = std::fs::remove_dir_all(&staging);
    result?;
    tracing::info!(path = %seed_path.display(), "generated cloud-init seed ISO");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilesystemShare;

    fn test_config() -> VmConfig {
        let env = crate::config::EnvSource::from_pairs([
            ("GUEST_NAME", "seed-vm"),
            ("GUEST_PASSWORD", "hunter2"),
        ]);
        let mut distributions = std::collections::BTreeMap::new();
        distributions.insert(
            "ubuntu-2404".to_string(),
            crate::catalog::DistroEntry {
                name: "Ubuntu 24.04".to_string(),
                url: "https://example.com/u.qcow2".to_string(),
                user: "ubuntu".to_string(),
                arch: None,
                format: None,
            },
        );
        let catalog = crate::catalog::Catalog { distributions };
        crate::config::parse_env(&env, &catalog, &crate::paths::Paths::rooted_at("/images")).unwrap()
    }

    #[test]
    fn meta_data_names_the_instance() {
        let md = build_meta_data("seed-vm");
        assert_eq!(md, "instance-id: iid-seed-vm\nlocal-hostname: seed-vm\n");
    }

    #[test]
    fn vendor_data_is_cloud_config() {
        let vd = build_vendor_data(&test_config()).unwrap();
        assert!(vd.starts_with("#cloud-config\n"));
        assert!(vd.contains("qemu-guest-agent"));
        assert!(vd.contains("name: ubuntu"));
        assert!(vd.contains("NOPASSWD"));
        assert!(vd.contains("passwd:"));
        // bcrypt hashes, never the plain-text password
        assert!(!vd.contains("hunter2"));
    }

    #[test]
    fn vendor_data_has_agent_workarounds() {
        let vd = build_vendor_data(&test_config()).unwrap();
        assert!(vd.contains("/etc/sysconfig/qemu-ga"));
        assert!(vd.contains("BLACKLIST_RPC"));
        assert!(vd.contains("/etc/conf.d/qemu-guest-agent"));
        assert!(vd.contains("virt_qemu_ga_t"));
        assert!(vd.contains("rc-update"));
        assert!(vd.contains("systemctl"));
    }

    #[test]
    fn vendor_data_ssh_key_is_optional() {
        let mut cfg = test_config();
        assert!(!build_vendor_data(&cfg).unwrap().contains("ssh_authorized_keys"));
        cfg.ssh_pubkey = Some("ssh-ed25519 AAAA test@host".to_string());
        let vd = build_vendor_data(&cfg).unwrap();
        assert!(vd.contains("ssh_authorized_keys"));
        assert!(vd.contains("ssh-ed25519 AAAA"));
    }

    #[test]
    fn vendor_data_mounts_per_share() {
        let mut cfg = test_config();
        cfg.filesystems = vec![
            FilesystemShare {
                source: "/srv/data".into(),
                target: "data".to_string(),
                driver: "virtiofs".to_string(),
                accessmode: "passthrough".to_string(),
                readonly: false,
            },
            FilesystemShare {
                source: "/srv/media".into(),
                target: "media files".to_string(),
                driver: "9p".to_string(),
                accessmode: "mapped".to_string(),
                readonly: true,
            },
        ];
        let vd = build_vendor_data(&cfg).unwrap();
        assert!(vd.contains("mounts:"));
        assert!(vd.contains("/mnt/data"));
        assert!(vd.contains("/mnt/media-files"));
        assert!(vd.contains("virtiofs"));
        assert!(vd.contains("9p2000.L"));
        assert!(vd.contains("ro"));
        assert!(vd.contains("mkdir"));
    }

    #[test]
    fn password_hash_is_salted_bcrypt() {
        let a = hash_password("secret").unwrap();
        let b = hash_password("secret").unwrap();
        assert!(a.starts_with("$2"));
        assert_ne!(a, b);
        assert!(bcrypt::verify("secret", &a).unwrap());
    }

    #[test]
    fn user_data_empty_without_override() {
        assert_eq!(build_user_data(&test_config()).unwrap(), "");
    }

    #[test]
    fn user_data_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user-data");
        std::fs::write(&path, "#!/bin/bash\necho hi\n").unwrap();
        let mut cfg = test_config();
        cfg.cloud_init_user_data_path = Some(path);
        assert_eq!(build_user_data(&cfg).unwrap(), "#!/bin/bash\necho hi\n");
    }

    #[test]
    fn content_type_detection() {
        assert_eq!(detect_content_type("#cloud-config\nusers: []"), "text/cloud-config");
        assert_eq!(detect_content_type("#!/bin/sh\n"), "text/x-shellscript");
        assert_eq!(detect_content_type("#cloud-config-archive\n- x"), "text/cloud-config-archive");
        assert_eq!(detect_content_type("#include\nhttp://x"), "text/x-include-url");
        assert_eq!(detect_content_type("#cloud-boothook\n"), "text/cloud-boothook");
        assert_eq!(detect_content_type("#part-handler\n"), "text/part-handler");
        assert_eq!(detect_content_type(""), "text/cloud-config");
        assert_eq!(detect_content_type("plain text"), "text/cloud-config");
    }
}
