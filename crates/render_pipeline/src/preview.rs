use crate::error::RenderError;
use image::imageops::FilterType;
use std::path::{Path, PathBuf};

pub const DEFAULT_PREVIEW_MAX_DIMENSION: u32 = 1080;

/// `prev_<file name>` next to `artifact`.
pub fn preview_path(artifact: &Path) -> PathBuf {
    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    artifact.with_file_name(format!("prev_{name}"))
}

/// Writes a copy of `source` whose longest side is at most `max_dimension`,
/// keeping the aspect ratio. Smaller images are copied as is.
pub fn build_preview(source: &Path, max_dimension: u32) -> Result<PathBuf, RenderError> {
    let image = image::open(source).map_err(|e| RenderError::UnreadableImage {
        path: source.to_path_buf(),
        source: e,
    })?;

    let (w, h) = (image.width(), image.height());
    let longest = w.max(h).max(1);
    let scale = (max_dimension.max(1) as f64 / longest as f64).min(1.0);
    let target_w = ((w as f64 * scale).round() as u32).max(1);
    let target_h = ((h as f64 * scale).round() as u32).max(1);

    let preview = if (target_w, target_h) == (w, h) {
        image
    } else {
        image.resize_exact(target_w, target_h, FilterType::Triangle)
    };

    let path = preview_path(source);
    preview.save(&path).map_err(|e| RenderError::PreviewWrite {
        path: path.clone(),
        source: e,
    })?;
    tracing::debug!(
        source = %source.display(),
        preview = %path.display(),
        width = target_w,
        height = target_h,
        "Preview written"
    );
    Ok(path)
}
