//! Image files on disk.
//!
//! Every image path stored in the metadata document is relative to the
//! images directory. This module is the one place that turns those relative
//! paths into filesystem paths, so a path that tries to escape the directory
//! (absolute, or containing `..`) is refused before anything touches disk.
//!
//! It also stores the bytes the generative model hands back, either raw or
//! base64-encoded (optionally as a `data:` URL).

use anyhow::{bail, Context, Result};
use base64::Engine;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Resolve a document-relative image path inside `images_dir`.
pub fn resolve_image_path(images_dir: &Path, relative: &str) -> Result<PathBuf> {
    if relative.trim().is_empty() {
        bail!("Image path is empty");
    }
    let rel = Path::new(relative);
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("Image path escapes the images directory: {}", relative),
        }
    }
    Ok(images_dir.join(rel))
}

/// File extension for an image MIME type.
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

/// Decode a base64 image payload.
///
/// Accepts either bare base64 or a `data:<mime>;base64,<payload>` URL.
/// Returns the MIME type found in the data URL, if any, alongside the bytes.
pub fn decode_base64_image(payload: &str) -> Result<(Option<String>, Vec<u8>)> {
    let payload = payload.trim();
    let (mime, body) = match payload.strip_prefix("data:") {
        Some(rest) => {
            let (header, body) = rest
                .split_once(',')
                .ok_or_else(|| anyhow::anyhow!("Malformed data URL: missing ','"))?;
            let Some(mime) = header.strip_suffix(";base64") else {
                bail!("Only base64 data URLs are supported");
            };
            (Some(mime.to_string()), body)
        }
        None => (None, payload),
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body)
        .context("Invalid base64 image payload")?;
    if bytes.is_empty() {
        bail!("Image payload is empty");
    }
    Ok((mime, bytes))
}

/// Write image bytes as `<image_id>.<ext>` inside `images_dir`.
///
/// The file appears atomically (temp file + rename). Returns the path
/// relative to `images_dir`, ready to be stored on an [`Image`](crate::models::Image).
pub fn write_image_bytes(
    images_dir: &Path,
    image_id: &str,
    mime_type: &str,
    bytes: &[u8],
) -> Result<String> {
    let file_name = format!("{}.{}", image_id, extension_for_mime(mime_type));
    let target = resolve_image_path(images_dir, &file_name)?;

    std::fs::create_dir_all(images_dir)
        .with_context(|| format!("Failed to create images dir: {}", images_dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(images_dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&target)
        .with_context(|| format!("Failed to write image: {}", target.display()))?;

    Ok(file_name)
}

/// Delete an image file. A missing file is not an error; returns whether a
/// file was actually removed.
pub fn remove_image_file(images_dir: &Path, relative: &str) -> Result<bool> {
    let path = resolve_image_path(images_dir, relative)?;
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_rejects_escapes() {
        let dir = Path::new("/data/images");
        assert_eq!(
            resolve_image_path(dir, "a.png").unwrap(),
            PathBuf::from("/data/images/a.png")
        );
        assert!(resolve_image_path(dir, "../secrets.txt").is_err());
        assert!(resolve_image_path(dir, "/etc/passwd").is_err());
        assert!(resolve_image_path(dir, "sub/../../x.png").is_err());
        assert!(resolve_image_path(dir, "  ").is_err());
    }

    #[test]
    fn test_extension_for_mime() {
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("IMAGE/JPEG"), "jpg");
        assert_eq!(extension_for_mime("image/webp"), "webp");
        assert_eq!(extension_for_mime("application/octet-stream"), "png");
    }

    #[test]
    fn test_decode_data_url() {
        let (mime, bytes) = decode_base64_image("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(mime.as_deref(), Some("image/jpeg"));
        assert_eq!(bytes, b"hello");

        let (mime, bytes) = decode_base64_image("aGVsbG8=").unwrap();
        assert!(mime.is_none());
        assert_eq!(bytes, b"hello");

        assert!(decode_base64_image("data:image/png,rawdata").is_err());
        assert!(decode_base64_image("not base64!!").is_err());
        assert!(decode_base64_image("").is_err());
    }

    #[test]
    fn test_write_and_remove() {
        let tmp = TempDir::new().unwrap();
        let images = tmp.path().join("images");
        let rel = write_image_bytes(&images, "img-1", "image/png", b"\x89PNG").unwrap();
        assert_eq!(rel, "img-1.png");
        assert_eq!(std::fs::read(images.join(&rel)).unwrap(), b"\x89PNG");

        assert!(remove_image_file(&images, &rel).unwrap());
        assert!(!remove_image_file(&images, &rel).unwrap());
    }
}
