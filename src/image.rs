//! Image acquisition and preparation pipeline.
//!
//! Turns a catalog URL, a user-supplied boot source, or an existing cache
//! entry into a bootable work disk: download with retry, peel compression and
//! archive layers, convert foreign formats to qcow2, then clone/resize into
//! the per-VM directory.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::arch::{self, has_compressed_extension};
use crate::config::{VmConfig, parse_size_to_bytes};
use crate::error::BoxvmError;
use crate::paths::{Paths, ensure_directory};
use crate::{host, oci, qemu_img};

/// Cached files smaller than this are treated as truncated downloads.
pub const MIN_VALID_IMAGE_BYTES: u64 = 100 * 1024 * 1024;

/// Mutable pipeline state owned by the lifecycle controller. The resolved
/// config stays frozen; everything the pipeline discovers lands here.
#[derive(Debug, Clone)]
pub struct ImageState {
    pub base_image: PathBuf,
    pub work_image: PathBuf,
    pub format: String,
    pub boot_iso: Option<PathBuf>,
    pub disk_reused: bool,
}

impl ImageState {
    pub fn new(cfg: &VmConfig, paths: &Paths) -> Self {
        Self {
            base_image: paths.base_image(&cfg.distro, &cfg.image_format),
            work_image: paths.work_image(&cfg.vm_name, &cfg.image_format),
            format: cfg.image_format.clone(),
            boot_iso: None,
            disk_reused: false,
        }
    }
}

// ── Download ───────────────────────────────────────────────

async fn stream_to_file(path: &Path, response: reqwest::Response, pb: &ProgressBar) -> Result<(), BoxvmError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| BoxvmError::io(format!("creating temp file {}", path.display()), e))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BoxvmError::resource(format!("error reading response body: {e}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| BoxvmError::io("writing image data", e))?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await.map_err(|e| BoxvmError::io("flushing image file", e))?;
    Ok(())
}

/// Single-attempt download into a `.part` sibling, atomically renamed on success.
pub async fn download_file(url: &str, destination: &Path, label: &str) -> Result<(), BoxvmError> {
    if let Some(parent) = destination.parent() {
        ensure_directory(parent)?;
    }
    tracing::info!(url, "{label}");

    let response = reqwest::get(url)
        .await
        .map_err(|e| BoxvmError::resource(format!("request to {url} failed: {e}")))?;
    if !response.status().is_success() {
        return Err(BoxvmError::resource(format!("HTTP {} from {url}", response.status())));
    }

    let total_size = response.content_length().unwrap_or(0);
    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("valid progress template")
            .progress_chars("#>-"),
    );

    let tmp_path = destination.with_extension("part");
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = stream_to_file(&tmp_path, response, &pb).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, destination)
        .await
        .map_err(|e| BoxvmError::io(format!("renaming {} to {}", tmp_path.display(), destination.display()), e))?;
    pb.finish_and_clear();
    tracing::info!(path = %destination.display(), "download complete");
    Ok(())
}

/// Download with exponential back-off (5s, 10s, 20s between attempts).
pub async fn download_file_with_retry(
    url: &str,
    destination: &Path,
    label: &str,
    retries: u32,
) -> Result<(), BoxvmError> {
    let attempts = retries.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = 5u64 << (attempt - 1).min(4);
            tracing::warn!(attempt = attempt + 1, delay_s = delay, "retrying download after failure");
            tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
        }
        match download_file(url, destination, label).await {
            Ok(()) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| BoxvmError::resource(format!("download of {url} failed"))))
}

// ── Archive / compression extraction ───────────────────────

fn strip_last_extension(path: &Path) -> PathBuf {
    path.with_extension("")
}

fn largest_regular_file(dir: &Path) -> Option<PathBuf> {
    let mut best: Option<(u64, PathBuf)> = None;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                let size = meta.len();
                if best.as_ref().is_none_or(|(s, _)| size > *s) {
                    best = Some((size, path));
                }
            }
        }
    }
    best.map(|(_, p)| p)
}

async fn run_extractor(command: &str, args: &[&str]) -> Result<(), BoxvmError> {
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

fn extract_gz(path: &Path) -> Result<PathBuf, BoxvmError> {
    let dest = strip_last_extension(path);
    let input = std::fs::File::open(path)
        .map_err(|e| BoxvmError::io(format!("opening {}", path.display()), e))?;
    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut out = std::fs::File::create(&dest)
        .map_err(|e| BoxvmError::io(format!("creating {}", dest.display()), e))?;
    std::io::copy(&mut decoder, &mut out)
        .map_err(|e| BoxvmError::io(format!("decompressing {}", path.display()), e))?;
    Ok(dest)
}

/// Tar (including `.ova`, which is a tar of disk + manifest): unpack and keep
/// the largest member, which is the disk.
fn extract_tar(path: &Path, work_dir: &Path) -> Result<PathBuf, BoxvmError> {
    let extract_dir = work_dir.join(format!(
        ".extract-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("archive")
    ));
    ensure_directory(&extract_dir)?;
    let input = std::fs::File::open(path)
        .map_err(|e| BoxvmError::io(format!("opening {}", path.display()), e))?;
    tar::Archive::new(input)
        .unpack(&extract_dir)
        .map_err(|e| BoxvmError::io(format!("unpacking {}", path.display()), e))?;
    promote_largest(&extract_dir, work_dir, path)
}

fn promote_largest(extract_dir: &Path, work_dir: &Path, archive: &Path) -> Result<PathBuf, BoxvmError> {
    let Some(found) = largest_regular_file(extract_dir) else {
        let _ = std::fs::remove_dir_all(extract_dir);
        return Err(BoxvmError::resource(format!(
            "archive {} contained no files",
            archive.display()
        )));
    };
    let final_path = work_dir.join(found.file_name().expect("regular file has a name"));
    std::fs::rename(&found, &final_path)
        .map_err(|e| BoxvmError::io(format!("moving {} to {}", found.display(), final_path.display()), e))?;
    let _ = std::fs::remove_dir_all(extract_dir);
    Ok(final_path)
}

/// Peel one compression/archive layer off `path`, returning the inner file.
pub async fn extract_compressed(path: &Path, work_dir: &Path) -> Result<PathBuf, BoxvmError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let path_str = path.display().to_string();

    if name.ends_with(".gz") {
        return extract_gz(path);
    }
    if name.ends_with(".tar") || name.ends_with(".ova") {
        return extract_tar(path, work_dir);
    }
    if name.ends_with(".xz") {
        run_extractor("xz", &["-d", "-k", "-f", &path_str]).await?;
        return Ok(strip_last_extension(path));
    }
    if name.ends_with(".bz2") {
        run_extractor("bzip2", &["-d", "-k", "-f", &path_str]).await?;
        return Ok(strip_last_extension(path));
    }

    // Multi-file container formats: extract aside, keep the largest member.
    let extract_dir = work_dir.join(format!(".extract-{name}"));
    ensure_directory(&extract_dir)?;
    let extract_dir_str = extract_dir.display().to_string();
    if name.ends_with(".zip") {
        run_extractor("unzip", &["-o", &path_str, "-d", &extract_dir_str]).await?;
    } else if name.ends_with(".7z") {
        let out_flag = format!("-o{extract_dir_str}");
        run_extractor("7z", &["x", "-y", &out_flag, &path_str]).await?;
    } else if name.ends_with(".rar") {
        run_extractor("unrar", &["x", "-y", &path_str, &extract_dir_str]).await?;
    } else {
        let _ = std::fs::remove_dir_all(&extract_dir);
        return Err(BoxvmError::resource(format!("unsupported compressed format: {}", path.display())));
    }
    promote_largest(&extract_dir, work_dir, path)
}

// ── Post-processing ────────────────────────────────────────

/// Peel compression layers, convert foreign formats to qcow2, and (when
/// `canonical` is given) park the result at the canonical cache path.
/// Returns the final path and detected format.
pub async fn post_process(
    downloaded: PathBuf,
    canonical: Option<&Path>,
) -> Result<(PathBuf, String), BoxvmError> {
    let work_dir = downloaded
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut current = downloaded.clone();
    while current
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(has_compressed_extension)
    {
        tracing::info!(path = %current.display(), "extracting compressed image");
        let extracted = extract_compressed(&current, &work_dir).await?;
        if extracted != current {
            let _ = std::fs::remove_file(&current);
        }
        current = extracted;
    }

    let mut format = qemu_img::detect_format(&current).await;
    if arch::CONVERTIBLE_FORMATS.contains(&format.as_str()) {
        tracing::info!(from = %format, "converting image to qcow2");
        let converted = current.with_extension("converted.qcow2");
        qemu_img::convert_to_qcow2(&current, &converted).await?;
        let _ = std::fs::remove_file(&current);
        current = converted;
        format = "qcow2".to_string();
    }
    if format == "unknown" {
        // qemu-img could not classify it; trust the pipeline and carry on
        format = "qcow2".to_string();
    }

    let final_path = match canonical {
        Some(canonical) => {
            let target = canonical.with_extension(&format);
            if current != target {
                if let Some(parent) = target.parent() {
                    ensure_directory(parent)?;
                }
                std::fs::rename(&current, &target)
                    .map_err(|e| BoxvmError::io(format!("moving {} to {}", current.display(), target.display()), e))?;
            }
            if downloaded != target && downloaded.exists() {
                let _ = std::fs::remove_file(&downloaded);
            }
            target
        }
        None => current,
    };

    Ok((final_path, format))
}

// ── Boot-source resolution ─────────────────────────────────

pub fn url_cache_name(url: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    let filename = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("boot_from");
    let safe: String = filename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
        .collect();
    format!("{}-{safe}", &digest[..12])
}

/// Classify and fetch `BOOT_FROM`: URL download, OCI containerDisk pull, or
/// local path. ISO artifacts become the boot cdrom; anything else becomes the
/// base image (and is post-processed in place).
pub async fn resolve_boot_from(
    cfg: &VmConfig,
    paths: &Paths,
    state: &mut ImageState,
) -> Result<(), BoxvmError> {
    let Some(boot_from) = cfg.boot_from.as_deref() else {
        return Ok(());
    };

    let is_url = boot_from.starts_with("http://") || boot_from.starts_with("https://");
    let resolved = if is_url {
        let cache = paths.boot_iso_cache();
        ensure_directory(&cache)?;
        let destination = cache.join(url_cache_name(boot_from));
        if destination.exists() && destination.metadata().map(|m| m.len() > 0).unwrap_or(false) {
            tracing::info!(path = %destination.display(), "using cached download");
        } else {
            download_file_with_retry(boot_from, &destination, "downloading boot source", cfg.download_retries)
                .await?;
        }
        destination
    } else if crate::config::is_oci_reference(boot_from) {
        let cache = paths.oci_disk_cache();
        ensure_directory(&cache)?;
        oci::pull_oci_disk(boot_from, &cache).await?
    } else {
        let path = PathBuf::from(boot_from);
        if !path.exists() {
            return Err(BoxvmError::resource(format!("BOOT_FROM path not found: {}", path.display())));
        }
        path
    };

    let is_iso = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.to_ascii_lowercase().ends_with(".iso"));

    if is_iso {
        state.boot_iso = Some(resolved);
    } else {
        let (final_path, format) = post_process(resolved, None).await?;
        state.base_image = final_path;
        state.format = format.clone();
        state.work_image = paths.work_image(&cfg.vm_name, &format);
    }
    Ok(())
}

// ── Base image ─────────────────────────────────────────────

pub async fn ensure_base_image(
    cfg: &VmConfig,
    paths: &Paths,
    state: &mut ImageState,
) -> Result<(), BoxvmError> {
    if let Some(override_path) = cfg.base_image_path.as_deref() {
        let path = PathBuf::from(override_path);
        if !path.exists() {
            return Err(BoxvmError::resource_with_hint(
                format!("BASE_IMAGE not found: {}", path.display()),
                "bind-mount the image into the container",
            ));
        }
        let (final_path, format) = post_process(path, None).await?;
        state.base_image = final_path;
        state.format = format.clone();
        state.work_image = paths.work_image(&cfg.vm_name, &format);
        return Ok(());
    }

    // BOOT_FROM may already have produced a base disk
    if state.base_image.exists() && state.base_image != paths.base_image(&cfg.distro, &cfg.image_format) {
        return Ok(());
    }

    // A previous run may have converted the catalog format to qcow2.
    if cfg.image_format != "qcow2" {
        let converted = paths.base_image(&cfg.distro, "qcow2");
        if converted.exists() && converted.metadata().map(|m| m.len()).unwrap_or(0) >= MIN_VALID_IMAGE_BYTES {
            tracing::info!(path = %converted.display(), "using cached converted image");
            state.base_image = converted;
            state.format = "qcow2".to_string();
            state.work_image = paths.work_image(&cfg.vm_name, "qcow2");
            return Ok(());
        }
    }

    if state.base_image.exists() {
        let size = state.base_image.metadata().map(|m| m.len()).unwrap_or(0);
        if size >= MIN_VALID_IMAGE_BYTES {
            tracing::info!(path = %state.base_image.display(), "using cached image");
            return Ok(());
        }
        tracing::warn!(
            path = %state.base_image.display(),
            size_mib = size / (1024 * 1024),
            "cached image below 100 MiB threshold; re-downloading"
        );
        let _ = std::fs::remove_file(&state.base_image);
    }

    // Keep the URL's filename so layered extensions (.tar.xz) survive for the
    // extraction loop.
    let url_path = cfg.image_url.split(['?', '#']).next().unwrap_or(&cfg.image_url);
    let url_filename = url_path
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("image.qcow2");
    let download_path = paths.base_dir().join(url_filename);
    download_file_with_retry(&cfg.image_url, &download_path, "downloading base image", cfg.download_retries)
        .await?;

    let canonical = paths.base_image(&cfg.distro, &cfg.image_format);
    let (final_path, format) = post_process(download_path, Some(&canonical)).await?;
    state.base_image = final_path;
    state.format = format.clone();
    state.work_image = paths.work_image(&cfg.vm_name, &format);
    Ok(())
}

// ── Work image ─────────────────────────────────────────────

async fn disable_cow(dir: &Path) {
    let dir_str = dir.display().to_string();
    if run_extractor("chattr", &["+C", &dir_str]).await.is_err() {
        tracing::warn!(path = %dir.display(), "could not set +C (No_COW) attribute on BTRFS directory");
        return;
    }
    match tokio::process::Command::new("lsattr").args(["-d", &dir_str]).output().await {
        Ok(out) if String::from_utf8_lossy(&out.stdout).contains('C') => {
            tracing::info!(path = %dir.display(), "disabled BTRFS copy-on-write for VM images");
        }
        _ => tracing::warn!(path = %dir.display(), "BTRFS No_COW attribute did not stick"),
    }
}

/// BTRFS gets `chattr +C`; stacked or memory-backed filesystems get a
/// performance warning (the XML builder additionally downshifts io/cache).
pub async fn check_filesystem_compatibility(dir: &Path) {
    let fs_type = host::filesystem_type_at(dir);
    if fs_type.contains("btrfs") {
        disable_cow(dir).await;
    } else if ["overlay", "fuse", "ecryptfs", "tmpfs"].iter().any(|bad| fs_type.contains(bad)) {
        tracing::warn!(
            fs = %fs_type,
            path = %dir.display(),
            "VM images on {fs_type} can be slow; prefer a bind mount on a local filesystem"
        );
    }
}

fn check_disk_space(dir: &Path, required_bytes: u64) -> Result<(), BoxvmError> {
    let available = host::available_disk_space(dir);
    if available == 0 {
        return Ok(()); // probe failed; not a verdict
    }
    if available < required_bytes {
        return Err(BoxvmError::resource_with_hint(
            format!(
                "not enough free space at {}: {} GiB available, {} GiB required",
                dir.display(),
                available / (1024 * 1024 * 1024),
                required_bytes / (1024 * 1024 * 1024)
            ),
            "lower DISK_SIZE or mount a larger data volume",
        ));
    }
    if available < required_bytes.saturating_mul(2) {
        tracing::warn!(
            path = %dir.display(),
            "free space is below twice the requested disk size; the VM may fill the volume"
        );
    }
    Ok(())
}

pub async fn ensure_work_image(
    cfg: &VmConfig,
    paths: &Paths,
    state: &mut ImageState,
) -> Result<(), BoxvmError> {
    let vm_dir = paths.vm_dir(&cfg.vm_name);
    ensure_directory(&vm_dir)?;
    check_filesystem_compatibility(&vm_dir).await;

    if cfg.disk_size != "0" {
        check_disk_space(&vm_dir, parse_size_to_bytes(&cfg.disk_size)?)?;
    }

    state.disk_reused = false;
    if cfg.persist && state.work_image.exists() {
        let size = state.work_image.metadata().map(|m| m.len()).unwrap_or(0);
        if size >= MIN_VALID_IMAGE_BYTES {
            tracing::info!(path = %state.work_image.display(), "reusing persistent disk");
            state.disk_reused = true;
            if cfg.disk_size != "0" {
                // Grow only; an existing larger disk is left alone.
                let current = qemu_img::info(&state.work_image).await?.virtual_size;
                let requested = parse_size_to_bytes(&cfg.disk_size)?;
                if requested > current {
                    tracing::info!(
                        from_gib = current / (1024 * 1024 * 1024),
                        to = %cfg.disk_size,
                        "expanding persistent disk"
                    );
                    qemu_img::resize(&state.work_image, &cfg.disk_size).await?;
                }
            }
        } else {
            tracing::warn!(
                path = %state.work_image.display(),
                size_mib = size / (1024 * 1024),
                "existing disk below 100 MiB threshold; recreating"
            );
            let _ = std::fs::remove_file(&state.work_image);
        }
    }

    if !state.disk_reused {
        if cfg.blank_work_disk {
            tracing::info!(path = %state.work_image.display(), size = %cfg.disk_size, "creating blank disk");
            qemu_img::create(&state.work_image, &state.format, &cfg.disk_size, cfg.disk_preallocate).await?;
        } else {
            if state
                .base_image
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("iso"))
            {
                return Err(BoxvmError::resource_with_hint(
                    format!("base image is an ISO ({})", state.base_image.display()),
                    format!("try BOOT_FROM={} (and optionally BLANK_DISK=1)", state.base_image.display()),
                ));
            }
            tracing::info!(path = %state.work_image.display(), "creating working disk from base image");
            tokio::fs::copy(&state.base_image, &state.work_image)
                .await
                .map_err(|e| {
                    BoxvmError::io(
                        format!("copying {} to {}", state.base_image.display(), state.work_image.display()),
                        e,
                    )
                })?;
            if cfg.disk_size != "0" {
                let current = qemu_img::info(&state.work_image).await?.virtual_size;
                let requested = parse_size_to_bytes(&cfg.disk_size)?;
                if requested > current {
                    qemu_img::resize(&state.work_image, &cfg.disk_size).await?;
                } else if current > requested {
                    tracing::info!(
                        current_gib = current / (1024 * 1024 * 1024),
                        requested = %cfg.disk_size,
                        "base image already at least the requested size; skipping resize"
                    );
                }
            }
        }
    }

    // Extra disks (DISK2..DISK6) live next to the primary, same format.
    for disk in &cfg.extra_disks {
        let path = paths.extra_disk(&cfg.vm_name, disk.index, &state.format);
        if path.exists() && cfg.persist {
            tracing::info!(path = %path.display(), "reusing extra disk");
            continue;
        }
        tracing::info!(path = %path.display(), size = %disk.size, "creating extra disk");
        qemu_img::create(&path, &state.format, &disk.size, cfg.disk_preallocate).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn url_cache_name_is_stable_and_safe() {
        let a = url_cache_name("https://example.test/path/installer.iso");
        let b = url_cache_name("https://example.test/path/installer.iso");
        assert_eq!(a, b);
        assert!(a.ends_with("-installer.iso"));
        assert_eq!(a.split('-').next().unwrap().len(), 12);

        let weird = url_cache_name("https://example.test/a%20b/we ird@name.iso?sig=1");
        assert!(!weird.contains(' '));
        assert!(!weird.contains('@'));
        assert!(!weird.contains('?'));
    }

    #[test]
    fn url_cache_name_handles_bare_host() {
        let name = url_cache_name("https://example.test/");
        assert!(name.ends_with("-boot_from"));
    }

    #[test]
    fn largest_file_selection() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("small.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("nested/big.qcow2"), vec![0u8; 4096]).unwrap();
        let best = largest_regular_file(dir.path()).unwrap();
        assert!(best.ends_with("big.qcow2"));
    }

    #[tokio::test]
    async fn gz_extraction_strips_extension() {
        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("disk.raw.gz");
        let payload = b"payload-bytes";
        {
            let f = std::fs::File::create(&gz_path).unwrap();
            let mut enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
            enc.write_all(payload).unwrap();
            enc.finish().unwrap();
        }
        let extracted = extract_compressed(&gz_path, dir.path()).await.unwrap();
        assert_eq!(extracted, dir.path().join("disk.raw"));
        assert_eq!(std::fs::read(&extracted).unwrap(), payload);
    }

    #[tokio::test]
    async fn tar_extraction_keeps_largest_member() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("appliance.tar");
        {
            let f = std::fs::File::create(&tar_path).unwrap();
            let mut builder = tar::Builder::new(f);
            let small = b"x";
            let mut header = tar::Header::new_gnu();
            header.set_size(small.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, "manifest.mf", &small[..]).unwrap();
            let big = vec![7u8; 2048];
            let mut header = tar::Header::new_gnu();
            header.set_size(big.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, "disks/big.vmdk", &big[..]).unwrap();
            builder.finish().unwrap();
        }
        let extracted = extract_compressed(&tar_path, dir.path()).await.unwrap();
        assert!(extracted.ends_with("big.vmdk"));
        assert_eq!(std::fs::read(&extracted).unwrap().len(), 2048);
    }

    #[tokio::test]
    async fn unsupported_format_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.unknown");
        std::fs::write(&path, b"x").unwrap();
        assert!(extract_compressed(&path, dir.path()).await.is_err());
    }

    #[test]
    fn disk_space_gate() {
        let dir = tempfile::tempdir().unwrap();
        // Requiring more space than any test machine has must fail.
        assert!(check_disk_space(dir.path(), u64::MAX / 4).is_err());
        // A byte is always available.
        assert!(check_disk_space(dir.path(), 1).is_ok());
    }
}
