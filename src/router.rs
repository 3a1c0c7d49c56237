//! Dispatches resolved payloads to the image or PDF handler.
//!
//! Every handler returns a [`DocumentResult`] directly: engine and splitter
//! failures are folded into the result and never escape.

use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::PdfSuccessPolicy;
use crate::error::{panic_message, ItemError};
use crate::ocr::OcrEngine;
use crate::pdf::PageSplitter;
use crate::schema::{DocumentKind, DocumentResult, PageResult, ResolvedPayload};

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "tif", "tiff",
];

pub struct DocumentRouter {
    engine: Arc<dyn OcrEngine>,
    splitter: Arc<dyn PageSplitter>,
    /// Shared by every item- and page-level engine call and by PDF splits.
    permits: Arc<Semaphore>,
    pdf_policy: PdfSuccessPolicy,
}

impl DocumentRouter {
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        splitter: Arc<dyn PageSplitter>,
        max_concurrency: usize,
        pdf_policy: PdfSuccessPolicy,
    ) -> Self {
        Self {
            engine,
            splitter,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            pdf_policy,
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub async fn route(&self, payload: ResolvedPayload, prompt: Option<&str>) -> DocumentResult {
        match payload.kind {
            DocumentKind::Image => self.handle_image(&payload.data, prompt).await,
            DocumentKind::Pdf => {
                self.handle_pdf(payload.data, prompt, &payload.display_name)
                    .await
            }
        }
    }

    /// Route an upload whose kind must be inferred from its name or content.
    pub async fn route_upload(
        &self,
        filename: &str,
        data: Vec<u8>,
        prompt: Option<&str>,
    ) -> DocumentResult {
        match infer_kind(filename, &data) {
            Some(kind) => {
                let payload = ResolvedPayload {
                    kind,
                    data,
                    display_name: filename.to_string(),
                };
                self.route(payload, prompt).await
            }
            None => {
                let err = ItemError::UnsupportedKind(filename.to_string());
                warn!("{}", err);
                err.into()
            }
        }
    }

    /// One engine call under a pool permit. A panicking engine counts as a failed call.
    async fn recognize(&self, image: &[u8], prompt: Option<&str>) -> Result<String, ItemError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ItemError::RecognitionFailed("engine pool is closed".to_string()))?;

        match AssertUnwindSafe(self.engine.recognize(image, prompt))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome.map_err(|e| ItemError::recognition_failed(&e)),
            Err(panic) => Err(ItemError::RecognitionFailed(format!(
                "engine panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    async fn split(&self, pdf: Vec<u8>) -> Result<Vec<Vec<u8>>, ItemError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ItemError::SplitFailed("worker pool is closed".to_string()))?;

        let splitter = Arc::clone(&self.splitter);
        match tokio::task::spawn_blocking(move || splitter.split_pages(&pdf)).await {
            Ok(Ok(pages)) if pages.is_empty() => {
                Err(ItemError::SplitFailed("PDF has no pages".to_string()))
            }
            Ok(Ok(pages)) => Ok(pages),
            Ok(Err(e)) => Err(ItemError::split_failed(&e)),
            Err(e) => Err(ItemError::SplitFailed(e.to_string())),
        }
    }

    /// OCR a single image with one engine call.
    pub async fn handle_image(&self, image: &[u8], prompt: Option<&str>) -> DocumentResult {
        debug!("Recognizing image ({} bytes)", image.len());
        match self.recognize(image, prompt).await {
            Ok(text) => DocumentResult::text(text),
            Err(err) => {
                warn!("Image recognition failed: {}", err);
                err.into()
            }
        }
    }

    /// Split a PDF and OCR every page. One page failing never stops the others.
    pub async fn handle_pdf(
        &self,
        pdf: Vec<u8>,
        prompt: Option<&str>,
        display_name: &str,
    ) -> DocumentResult {
        let pages = match self.split(pdf).await {
            Ok(pages) => pages,
            Err(err) => return split_failure(err, display_name),
        };
        info!("{}: {} pages", display_name, pages.len());

        let results = join_all(pages.iter().enumerate().map(|(idx, page)| async move {
            let page_num = idx as u32 + 1;
            match self.recognize(page, prompt).await {
                Ok(text) => PageResult::recognized(page_num, text),
                Err(err) => {
                    warn!("{}: page {} failed: {}", display_name, page_num, err);
                    PageResult::failed(page_num, &err)
                }
            }
        }))
        .await;

        aggregate_pages(results, self.pdf_policy).with_filename(display_name)
    }
}

fn split_failure(err: ItemError, display_name: &str) -> DocumentResult {
    warn!("{}: {}", display_name, err);
    DocumentResult::from(err).with_filename(display_name)
}

/// Build the document-level result from ordered page results.
pub fn aggregate_pages(pages: Vec<PageResult>, policy: PdfSuccessPolicy) -> DocumentResult {
    let page_count = pages.len() as u32;
    let failed = pages.iter().filter(|p| !p.success).count();

    let error = match policy {
        PdfSuccessPolicy::AllPages if failed > 0 => {
            Some(format!("{} of {} pages failed", failed, page_count))
        }
        _ => None,
    };

    DocumentResult {
        success: error.is_none(),
        result: None,
        error,
        page_count,
        pages: Some(pages),
        filename: None,
    }
}

/// Guess an upload's kind from its extension, then from its magic bytes.
pub fn infer_kind(filename: &str, data: &[u8]) -> Option<DocumentKind> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("pdf") => return Some(DocumentKind::Pdf),
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => return Some(DocumentKind::Image),
        _ => {}
    }

    if data.starts_with(b"%PDF") {
        Some(DocumentKind::Pdf)
    } else if image::guess_format(data).is_ok() {
        Some(DocumentKind::Image)
    } else {
        None
    }
}
