//! OCR engine abstraction.
//!
//! Defines the [`OcrEngine`] trait so the batch pipeline can run against any
//! backend that turns one image into text. The engine is a long-lived handle
//! injected at startup.

pub mod vllm;

/// Async trait implemented by each OCR backend.
#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Recognize the text in one encoded image. `None` means the backend's default prompt.
    async fn recognize(&self, image: &[u8], prompt: Option<&str>) -> anyhow::Result<String>;
}

/// MIME type for an encoded image, sniffed from its magic bytes. Falls back to PNG.
pub fn image_mime_type(data: &[u8]) -> &'static str {
    use image::ImageFormat;

    match image::guess_format(data) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Bmp) => "image/bmp",
        Ok(ImageFormat::Tiff) => "image/tiff",
        _ => "image/png",
    }
}
