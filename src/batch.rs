//! Batch coordination: one result per submitted item, in input order.

use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::panic_message;
use crate::router::DocumentRouter;
use crate::schema::{BatchResult, DocumentResult, RequestItem};
use crate::source::SourceResolver;

pub struct BatchCoordinator {
    resolver: SourceResolver,
    router: DocumentRouter,
}

impl BatchCoordinator {
    pub fn new(resolver: SourceResolver, router: DocumentRouter) -> Self {
        Self { resolver, router }
    }

    pub fn router(&self) -> &DocumentRouter {
        &self.router
    }

    /// Process every item concurrently and assemble the results in input order.
    ///
    /// The output always has exactly one entry per input item.
    pub async fn process_batch(&self, items: Vec<RequestItem>) -> BatchResult {
        let batch_id = Uuid::new_v4();
        info!("Batch {}: processing {} items", batch_id, items.len());

        let results = join_all(items.iter().enumerate().map(|(idx, item)| async move {
            match AssertUnwindSafe(self.process_item(item)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("Batch {}: item {} panicked: {}", batch_id, idx, message);
                    DocumentResult::failure(format!("Internal error: {}", message))
                }
            }
        }))
        .await;

        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            "Batch {}: complete ({} succeeded, {} failed)",
            batch_id,
            results.len() - failed,
            failed
        );
        results
    }

    /// Resolve and route a single item. Failures become a failed result.
    pub async fn process_item(&self, item: &RequestItem) -> DocumentResult {
        match self.resolver.resolve(item).await {
            Ok(payload) => self.router.route(payload, item.prompt.as_deref()).await,
            Err(err) => {
                warn!("Item rejected: {}", err);
                err.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PdfSuccessPolicy;
    use crate::testing::{ScriptedEngine, ScriptedFetcher, ScriptedSplitter};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use std::sync::Arc;

    struct Harness {
        engine: Arc<ScriptedEngine>,
        splitter: Arc<ScriptedSplitter>,
        fetcher: Arc<ScriptedFetcher>,
        coordinator: BatchCoordinator,
    }

    fn harness(engine: ScriptedEngine, splitter: ScriptedSplitter, fetcher: ScriptedFetcher) -> Harness {
        let engine = Arc::new(engine);
        let splitter = Arc::new(splitter);
        let fetcher = Arc::new(fetcher);
        let coordinator = BatchCoordinator::new(
            SourceResolver::new(fetcher.clone(), 2),
            DocumentRouter::new(
                engine.clone(),
                splitter.clone(),
                2,
                PdfSuccessPolicy::SplitSucceeded,
            ),
        );
        Harness {
            engine,
            splitter,
            fetcher,
            coordinator,
        }
    }

    fn inline(kind: &str, data: &[u8]) -> RequestItem {
        RequestItem {
            kind: kind.to_string(),
            inline_data: Some(BASE64.encode(data)),
            ..Default::default()
        }
    }

    fn remote(kind: &str, url: &str) -> RequestItem {
        RequestItem {
            kind: kind.to_string(),
            source_ref: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_image_ok_and_failed_fetch() {
        let h = harness(
            ScriptedEngine::default(),
            ScriptedSplitter::pages(&[b"p1"]),
            ScriptedFetcher::default(),
        );

        let results = h
            .coordinator
            .process_batch(vec![
                inline("image", b"invoice"),
                remote("pdf", "http://x/bad.pdf"),
            ])
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert_eq!(results[0].result.as_deref(), Some("text of invoice"));
        assert_eq!(results[0].page_count, 1);

        assert!(!results[1].success);
        let error = results[1].error.as_deref().unwrap();
        assert!(error.contains("http://x/bad.pdf"), "{}", error);
        assert!(error.starts_with("Error downloading file from URL"), "{}", error);
        assert_eq!(h.splitter.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_kind_does_no_work() {
        let h = harness(
            ScriptedEngine::default(),
            ScriptedSplitter::pages(&[]),
            ScriptedFetcher::default(),
        );

        let results = h
            .coordinator
            .process_batch(vec![remote("docx", "http://x/a.docx")])
            .await;

        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("docx"));
        assert_eq!(results[0].page_count, 0);
        assert_eq!(h.fetcher.calls(), 0);
        assert_eq!(h.engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_source() {
        let h = harness(
            ScriptedEngine::default(),
            ScriptedSplitter::pages(&[]),
            ScriptedFetcher::default(),
        );

        let results = h
            .coordinator
            .process_batch(vec![RequestItem {
                kind: "image".to_string(),
                ..Default::default()
            }])
            .await;
        assert_eq!(
            results[0].error.as_deref(),
            Some("No file data or URL provided")
        );
    }

    #[tokio::test]
    async fn test_order_and_isolation_across_mixed_batch() {
        let h = harness(
            ScriptedEngine::default().failing(b"smudged"),
            ScriptedSplitter::pages(&[b"p1", b"p2", b"p3"]),
            ScriptedFetcher::default().with("http://x/ok.png", b"remote"),
        );

        let items = vec![
            inline("image", b"first"),
            RequestItem {
                kind: "image".to_string(),
                inline_data: Some("%%%".to_string()),
                ..Default::default()
            },
            remote("image", "http://x/ok.png"),
            inline("image", b"smudged"),
            remote("pdf", "http://x/missing.pdf"),
            inline("pdf", b"%PDF-1.4"),
            inline("spreadsheet", b"a,b"),
            inline("image", b"last"),
        ];
        let results = h.coordinator.process_batch(items).await;

        assert_eq!(results.len(), 8);
        assert_eq!(results[0].result.as_deref(), Some("text of first"));
        assert!(results[1].error.as_deref().unwrap().starts_with("Error decoding file data"));
        assert_eq!(results[2].result.as_deref(), Some("text of remote"));
        assert_eq!(
            results[3].error.as_deref(),
            Some("OCR failed: CUDA out of memory")
        );
        assert!(!results[4].success);
        assert!(results[5].success);
        assert_eq!(results[5].page_count, 3);
        assert_eq!(results[5].filename.as_deref(), Some("unknown"));
        assert!(results[6].error.as_deref().unwrap().contains("spreadsheet"));
        assert_eq!(results[7].result.as_deref(), Some("text of last"));

        // 4 images + 3 pages reached the engine; 1 fetch per remote item
        assert_eq!(h.engine.calls(), 7);
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_panicking_item_is_contained() {
        let h = harness(
            ScriptedEngine::default().panicking(b"boom"),
            ScriptedSplitter::pages(&[]),
            ScriptedFetcher::default(),
        );

        let results = h
            .coordinator
            .process_batch(vec![
                inline("image", b"before"),
                inline("image", b"boom"),
                inline("image", b"after"),
            ])
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert_eq!(
            results[1].error.as_deref(),
            Some("OCR failed: engine panicked: engine crashed")
        );
        assert!(results[2].success);
    }

    #[tokio::test]
    async fn test_non_string_kind_fails_only_its_item() {
        let h = harness(
            ScriptedEngine::default(),
            ScriptedSplitter::pages(&[]),
            ScriptedFetcher::default(),
        );

        let items = crate::schema::parse_batch_event(
            br#"{"input": {"inputs": [
                {"file_type": "image", "file_data": "aGVsbG8="},
                {"file_type": 5, "file_data": "aGVsbG8="}
            ]}}"#,
        )
        .unwrap();
        let results = h.coordinator.process_batch(items).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].result.as_deref(), Some("text of hello"));
        assert_eq!(
            results[1].error.as_deref(),
            Some("Invalid file type: 5, should be one of: pdf, image")
        );
        assert_eq!(h.engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_prompt_passes_through() {
        let h = harness(
            ScriptedEngine::default(),
            ScriptedSplitter::pages(&[]),
            ScriptedFetcher::default(),
        );

        let mut item = inline("image", b"chart");
        item.prompt = Some("Describe the chart.".to_string());
        h.coordinator.process_batch(vec![item, inline("image", b"x")]).await;

        let mut prompts = h.engine.prompts();
        prompts.sort();
        assert_eq!(prompts, vec![None, Some("Describe the chart.".to_string())]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let h = harness(
            ScriptedEngine::default(),
            ScriptedSplitter::pages(&[]),
            ScriptedFetcher::default(),
        );
        assert!(h.coordinator.process_batch(Vec::new()).await.is_empty());
    }
}
