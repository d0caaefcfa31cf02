//! Thumbnail rendering with the `image` crate.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::debug;

use crate::processors::{ImageProcessor, PortError, ThumbnailSize};

/// Renders JPEG thumbnails, longest edge bounded by [`ThumbnailSize::max_edge`].
/// Images already smaller than a size are not upscaled.
#[derive(Debug, Clone)]
pub struct ImageThumbnailer {
    sizes: Vec<ThumbnailSize>,
}

impl Default for ImageThumbnailer {
    fn default() -> Self {
        Self {
            sizes: ThumbnailSize::ALL.to_vec(),
        }
    }
}

impl ImageThumbnailer {
    pub fn new() -> Self {
        Self::default()
    }
}

fn render(
    source: &Path,
    dest_base: &Path,
    sizes: &[ThumbnailSize],
) -> Result<BTreeMap<ThumbnailSize, PathBuf>, PortError> {
    let img = image::open(source).map_err(|e| PortError::unavailable(format!("decode image: {e}")))?;
    let mut out = BTreeMap::new();
    for &size in sizes {
        let thumb = fit(&img, size.max_edge());
        let dest = size.sibling_path(dest_base, "jpg");
        DynamicImage::ImageRgb8(thumb.to_rgb8())
            .save_with_format(&dest, ImageFormat::Jpeg)
            .map_err(|e| PortError::unavailable(format!("encode {} thumbnail: {e}", size.as_str())))?;
        out.insert(size, dest);
    }
    Ok(out)
}

fn fit(img: &DynamicImage, max_edge: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w <= max_edge && h <= max_edge {
        img.clone()
    } else {
        img.thumbnail(max_edge, max_edge)
    }
}

#[async_trait]
impl ImageProcessor for ImageThumbnailer {
    async fn generate_all_thumbnails(
        &self,
        source: &Path,
        dest_base: &Path,
    ) -> Result<BTreeMap<ThumbnailSize, PathBuf>, PortError> {
        let source = source.to_path_buf();
        let dest_base = dest_base.to_path_buf();
        let sizes = self.sizes.clone();

        // Decoding is CPU-bound; a corrupt file may also panic inside a codec.
        let rendered = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(AssertUnwindSafe(|| render(&source, &dest_base, &sizes)))
                .unwrap_or_else(|_| Err(PortError::unavailable("image decoder panicked")))
        })
        .await
        .map_err(|e| PortError::unavailable(format!("thumbnail task failed: {e}")))??;

        debug!(sizes = rendered.len(), "rendered thumbnails");
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_aspect_ratio_and_never_upscales() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("original.png");
        image::RgbImage::from_pixel(1000, 500, image::Rgb([200, 30, 30]))
            .save(&source)
            .unwrap();

        let out = ImageThumbnailer::new()
            .generate_all_thumbnails(&source, &dir.path().join("photo"))
            .await
            .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(image::image_dimensions(&out[&ThumbnailSize::Small]).unwrap(), (150, 75));
        assert_eq!(image::image_dimensions(&out[&ThumbnailSize::Large]).unwrap(), (800, 400));
        assert!(out[&ThumbnailSize::Medium].ends_with("photo_medium.jpg"));

        let tiny = dir.path().join("tiny.png");
        image::RgbImage::new(40, 20).save(&tiny).unwrap();
        let out = ImageThumbnailer::new()
            .generate_all_thumbnails(&tiny, &dir.path().join("tiny"))
            .await
            .unwrap();
        assert_eq!(image::image_dimensions(&out[&ThumbnailSize::Large]).unwrap(), (40, 20));
    }

    #[tokio::test]
    async fn corrupt_sources_fail() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("broken.jpg");
        std::fs::write(&source, b"definitely not a jpeg").unwrap();

        let err = ImageThumbnailer::new()
            .generate_all_thumbnails(&source, &dir.path().join("photo"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("decode image"));
    }
}
