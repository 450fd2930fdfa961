//! OCI containerDisk pulls via skopeo.
//!
//! A containerDisk ships a VM disk as a single image layer. `skopeo inspect`
//! gives us the manifest digest up front so the extracted disk can be cached
//! content-addressed: a `{digest_prefix}-{name}.done` sentinel next to the
//! extracted `disk.qcow2` short-circuits repeat pulls of the same digest.

use std::io::Read;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::BoxvmError;
use crate::paths::ensure_directory;

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct OciIndex {
    #[facet(default)]
    manifests: Vec<OciDescriptor>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct OciDescriptor {
    #[facet(default)]
    digest: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct OciManifest {
    #[facet(default)]
    layers: Vec<OciLayer>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct OciLayer {
    #[facet(default)]
    digest: String,
    #[facet(default, rename = "mediaType")]
    media_type: String,
}

async fn run_skopeo(args: &[&str]) -> Result<String, BoxvmError> {
    tracing::debug!(args = ?args, "running skopeo");
    let output = tokio::process::Command::new("skopeo")
        .args(args)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BoxvmError::resource_with_hint(
                    "skopeo is not installed",
                    "install skopeo inside the container image to pull containerDisks",
                )
            } else {
                BoxvmError::io("running skopeo", e)
            }
        })?;
    if !output.status.success() {
        let verb = args.first().copied().unwrap_or("skopeo");
        return Err(BoxvmError::resource(format!(
            "skopeo {verb} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn safe_reference_name(reference: &str) -> String {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    last.chars()
        .map(|c| if c.is_ascii_alphanumeric() || ".-_".contains(c) { c } else { '_' })
        .collect()
}

fn digest_key(digest: &str) -> String {
    let flat = digest.replace(':', "-");
    flat.chars().take(19).collect()
}

const DISK_EXTENSIONS: &[&str] = &[".qcow2", ".img", ".raw"];

fn blob_path(layout: &Path, digest: &str) -> PathBuf {
    let hash = digest.strip_prefix("sha256:").unwrap_or(digest);
    layout.join("blobs").join("sha256").join(hash)
}

/// Scan one layer tarball for a disk image; extract the largest match to `dest`.
fn extract_disk_from_layer(blob: &Path, gzipped: bool, dest: &Path) -> Result<bool, BoxvmError> {
    let open = || {
        std::fs::File::open(blob).map_err(|e| BoxvmError::io(format!("opening layer {}", blob.display()), e))
    };

    // First pass: locate the best candidate without unpacking everything.
    let mut best: Option<(u64, String)> = None;
    {
        let reader: Box<dyn Read> = if gzipped {
            Box::new(flate2::read::GzDecoder::new(open()?))
        } else {
            Box::new(open()?)
        };
        let mut archive = tar::Archive::new(reader);
        let Ok(entries) = archive.entries() else {
            return Ok(false); // not a tar; skip this layer
        };
        for entry in entries.flatten() {
            let Ok(path) = entry.path() else { continue };
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            let lower = name.to_ascii_lowercase();
            if DISK_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
                let size = entry.size();
                let full = path.display().to_string();
                if best.as_ref().is_none_or(|(s, _)| size > *s) {
                    best = Some((size, full));
                }
            }
        }
    }
    let Some((_, wanted)) = best else {
        return Ok(false);
    };

    // Second pass: stream just that entry out.
    let reader: Box<dyn Read> = if gzipped {
        Box::new(flate2::read::GzDecoder::new(open()?))
    } else {
        Box::new(open()?)
    };
    let mut archive = tar::Archive::new(reader);
    for entry in archive
        .entries()
        .map_err(|e| BoxvmError::io(format!("reading layer {}", blob.display()), e))?
        .flatten()
    {
        let is_wanted = entry.path().map(|p| p.display().to_string() == wanted).unwrap_or(false);
        if is_wanted {
            let mut entry = entry;
            let mut out = std::fs::File::create(dest)
                .map_err(|e| BoxvmError::io(format!("creating {}", dest.display()), e))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| BoxvmError::io(format!("extracting disk to {}", dest.display()), e))?;
            tracing::info!(disk = %wanted, "extracted containerDisk layer");
            return Ok(true);
        }
    }
    Ok(false)
}

/// Pull a containerDisk reference and return the path to the extracted disk.
pub async fn pull_oci_disk(reference: &str, cache_dir: &Path) -> Result<PathBuf, BoxvmError> {
    let inspect =
        run_skopeo(&["inspect", "--format", "{{.Digest}}", &format!("docker://{reference}")]).await?;
    let digest = inspect.trim().to_string();
    if digest.is_empty() {
        return Err(BoxvmError::resource(format!("skopeo inspect returned no digest for {reference}")));
    }

    let key = format!("{}-{}", digest_key(&digest), safe_reference_name(reference));
    let sentinel = cache_dir.join(format!("{key}.done"));
    let disk_dir = cache_dir.join(&key);
    let disk_path = disk_dir.join("disk.qcow2");

    if sentinel.exists() && disk_path.exists() {
        tracing::info!(path = %disk_path.display(), "using cached containerDisk");
        return Ok(disk_path);
    }

    ensure_directory(&disk_dir)?;
    let layout_dir = cache_dir.join(format!("{key}.oci"));
    let _ = std::fs::remove_dir_all(&layout_dir);
    tracing::info!(reference, digest = %digest, "pulling containerDisk");
    run_skopeo(&[
        "copy",
        &format!("docker://{reference}"),
        &format!("oci:{}", layout_dir.display()),
    ])
    .await?;

    let result = extract_from_layout(&layout_dir, &disk_path);
    let _ = std::fs::remove_dir_all(&layout_dir);
    result?;

    std::fs::write(&sentinel, format!("{digest}\n"))
        .map_err(|e| BoxvmError::io(format!("writing sentinel {}", sentinel.display()), e))?;
    Ok(disk_path)
}

fn extract_from_layout(layout_dir: &Path, disk_path: &Path) -> Result<(), BoxvmError> {
    let index_raw = std::fs::read_to_string(layout_dir.join("index.json"))
        .map_err(|e| BoxvmError::io("reading OCI index.json", e))?;
    let index: OciIndex = facet_json::from_str(&index_raw)
        .map_err(|e| BoxvmError::resource(format!("invalid OCI index.json: {e}")))?;
    let manifest_desc = index
        .manifests
        .first()
        .ok_or_else(|| BoxvmError::resource("OCI layout has no manifests"))?;

    let manifest_raw = std::fs::read_to_string(blob_path(layout_dir, &manifest_desc.digest))
        .map_err(|e| BoxvmError::io("reading OCI manifest", e))?;
    let manifest: OciManifest = facet_json::from_str(&manifest_raw)
        .map_err(|e| BoxvmError::resource(format!("invalid OCI manifest: {e}")))?;

    for layer in &manifest.layers {
        let blob = blob_path(layout_dir, &layer.digest);
        if !blob.exists() {
            continue;
        }
        let gzipped = layer.media_type.contains("gzip");
        if extract_disk_from_layer(&blob, gzipped, disk_path)? {
            return Ok(());
        }
    }
    Err(BoxvmError::resource_with_hint(
        "no disk image found in any layer of the OCI image",
        "containerDisks must ship a .qcow2/.img/.raw file inside an image layer",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digest_key_truncates_to_nineteen() {
        assert_eq!(digest_key("sha256:abcdef1234567890ffff"), "sha256-abcdef123456");
    }

    #[test]
    fn reference_name_is_sanitized() {
        assert_eq!(safe_reference_name("docker.io/test/image:latest"), "image_latest");
        assert_eq!(safe_reference_name("ghcr.io/org/vm-disk:v1.2"), "vm-disk_v1.2");
    }

    fn write_layer_tar(path: &Path, members: &[(&str, usize)]) {
        let f = std::fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(f);
        for (name, size) in members {
            let data = vec![1u8; *size];
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, *name, &data[..]).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn layer_extraction_finds_largest_disk() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("layer.tar");
        write_layer_tar(
            &layer,
            &[("etc/os-release", 64), ("disk/small.img", 128), ("disk/main.qcow2", 4096)],
        );
        let dest = dir.path().join("disk.qcow2");
        assert!(extract_disk_from_layer(&layer, false, &dest).unwrap());
        assert_eq!(std::fs::read(&dest).unwrap().len(), 4096);
    }

    #[test]
    fn layer_without_disk_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("layer.tar");
        write_layer_tar(&layer, &[("etc/passwd", 64)]);
        let dest = dir.path().join("disk.qcow2");
        assert!(!extract_disk_from_layer(&layer, false, &dest).unwrap());
        assert!(!dest.exists());
    }

    #[test]
    fn garbage_layer_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("layer.bin");
        std::fs::write(&layer, b"not a tar").unwrap();
        let dest = dir.path().join("disk.qcow2");
        assert!(!extract_disk_from_layer(&layer, false, &dest).unwrap());
    }

    #[test]
    fn layout_walk_reports_missing_disk() {
        let dir = tempfile::tempdir().unwrap();
        let layout = dir.path().join("layout");
        let blobs = layout.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs).unwrap();

        let layer_path = blobs.join("aaa111");
        write_layer_tar(&layer_path, &[("etc/passwd", 16)]);

        let manifest = r#"{"layers": [{"digest": "sha256:aaa111", "mediaType": "application/vnd.oci.image.layer.v1.tar"}]}"#;
        let mut f = std::fs::File::create(blobs.join("bbb222")).unwrap();
        write!(f, "{manifest}").unwrap();

        let index = r#"{"manifests": [{"digest": "sha256:bbb222"}]}"#;
        std::fs::write(layout.join("index.json"), index).unwrap();

        let err = extract_from_layout(&layout, &dir.path().join("disk.qcow2")).unwrap_err();
        assert!(err.to_string().contains("no disk image found"));
    }
}
