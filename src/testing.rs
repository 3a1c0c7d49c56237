//! Scripted collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::ocr::OcrEngine;
use crate::pdf::PageSplitter;
use crate::source::Fetcher;

/// Recognizes UTF-8 "images" as `text of <content>`.
///
/// Images listed via [`ScriptedEngine::failing`] return an error, images listed
/// via [`ScriptedEngine::panicking`] panic.
#[derive(Default)]
pub struct ScriptedEngine {
    failing: HashSet<Vec<u8>>,
    panicking: HashSet<Vec<u8>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    prompts: Mutex<Vec<Option<String>>>,
}

impl ScriptedEngine {
    pub fn failing(mut self, image: &[u8]) -> Self {
        self.failing.insert(image.to_vec());
        self
    }

    pub fn panicking(mut self, image: &[u8]) -> Self {
        self.panicking.insert(image.to_vec());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Option<String>> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl OcrEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn recognize(&self, image: &[u8], prompt: Option<&str>) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.map(str::to_string));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panicking.contains(image) {
            panic!("engine crashed");
        }
        if self.failing.contains(image) {
            anyhow::bail!("CUDA out of memory");
        }
        Ok(format!("text of {}", String::from_utf8_lossy(image)))
    }
}

/// Returns fixed pages, or fails when constructed with [`ScriptedSplitter::broken`].
pub struct ScriptedSplitter {
    pages: Result<Vec<Vec<u8>>, String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSplitter {
    pub fn pages(pages: &[&[u8]]) -> Self {
        Self::scripted(Ok(pages.iter().map(|p| p.to_vec()).collect()))
    }

    pub fn broken(message: &str) -> Self {
        Self::scripted(Err(message.to_string()))
    }

    fn scripted(pages: Result<Vec<Vec<u8>>, String>) -> Self {
        Self {
            pages,
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Block the splitting thread this long on every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl PageSplitter for ScriptedSplitter {
    fn split_pages(&self, _pdf: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.pages.clone().map_err(|e| anyhow::anyhow!(e))
    }
}

/// Serves registered URLs; every other URL fails like a refused connection.
#[derive(Default)]
pub struct ScriptedFetcher {
    bodies: HashMap<String, Vec<u8>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn with(mut self, url: &str, body: &[u8]) -> Self {
        self.bodies.insert(url.to_string(), body.to_vec());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("connection refused"))
    }
}
