//! Thin wrapper around the `qemu-img` binary.

use std::path::Path;

use facet::Facet;

use crate::error::BoxvmError;

/// Subset of `qemu-img info --output=json` that the pipeline consumes.
#[derive(Debug, Default, Facet)]
#[facet(default)]
pub struct ImageInfo {
    #[facet(default)]
    pub format: String,
    #[facet(default, rename = "virtual-size")]
    pub virtual_size: u64,
}

async fn run_qemu_img(args: &[&str]) -> Result<String, BoxvmError> {
    tracing::debug!(args = ?args, "running qemu-img");
    let output = tokio::process::Command::new("qemu-img")
        .args(args)
        .output()
        .await
        .map_err(|e| BoxvmError::io("running qemu-img", e))?;

    if !output.status.success() {
        return Err(BoxvmError::ExternalCommand {
            command: "qemu-img".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Probe format and virtual size.
pub async fn info(image: &Path) -> Result<ImageInfo, BoxvmError> {
    let stdout = run_qemu_img(&["info", "--output=json", &image.display().to_string()]).await?;
    facet_json::from_str(&stdout).map_err(|e| BoxvmError::ExternalCommand {
        command: "qemu-img".into(),
        message: format!("unparseable info output for {}: {e}", image.display()),
    })
}

/// Detected on-disk format, or `"unknown"` when qemu-img is unavailable or fails.
pub async fn detect_format(image: &Path) -> String {
    match info(image).await {
        Ok(i) if !i.format.is_empty() => i.format,
        _ => "unknown".to_string(),
    }
}

/// Create an empty image. `preallocate` maps to `preallocation=falloc`.
pub async fn create(image: &Path, format: &str, size: &str, preallocate: bool) -> Result<(), BoxvmError> {
    let image_str = image.display().to_string();
    let mut args = vec!["create", "-f", format];
    if preallocate {
        args.extend(["-o", "preallocation=falloc"]);
    }
    args.extend([image_str.as_str(), size]);
    run_qemu_img(&args).await?;
    tracing::info!(path = %image.display(), size, format, "created disk image");
    Ok(())
}

/// Convert to qcow2.
pub async fn convert_to_qcow2(src: &Path, dest: &Path) -> Result<(), BoxvmError> {
    let src_str = src.display().to_string();
    let dest_str = dest.display().to_string();
    run_qemu_img(&["convert", "-O", "qcow2", &src_str, &dest_str]).await?;
    tracing::info!(src = %src.display(), dest = %dest.display(), "converted image to qcow2");
    Ok(())
}

/// Grow an image to `size`. Callers must never pass a smaller size — qemu-img
/// refuses plain shrinks, and the pipeline checks the virtual size first.
pub async fn resize(image: &Path, size: &str) -> Result<(), BoxvmError> {
    let image_str = image.display().to_string();
    run_qemu_img(&["resize", &image_str, size]).await?;
    tracing::info!(path = %image.display(), size, "resized disk image");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_json_parses() {
        let json = r#"{"virtual-size": 21474836480, "filename": "disk.qcow2", "format": "qcow2", "actual-size": 1234}"#;
        let parsed: ImageInfo = facet_json::from_str(json).unwrap();
        assert_eq!(parsed.format, "qcow2");
        assert_eq!(parsed.virtual_size, 21474836480);
    }

    #[test]
    fn info_json_missing_fields_default() {
        let parsed: ImageInfo = facet_json::from_str("{}").unwrap();
        assert_eq!(parsed.format, "");
        assert_eq!(parsed.virtual_size, 0);
    }
}
