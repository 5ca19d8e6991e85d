//! Page structure extraction.
//!
//! [`PageExtractor`] validates the URL, answers from the [`StructureCache`]
//! when it can, and otherwise runs the blocking [`PageDriver`] on the tokio
//! blocking pool under a hard timeout. Linked stylesheets are fetched in
//! parallel afterwards; a stylesheet that fails to load is skipped.
//!
//! Concurrent requests for the same uncached URL share one navigation: the
//! first caller spawns the run and installs a shared handle keyed by the
//! cache key, later callers await the same handle. The run owns its slot and
//! clears it when it finishes, whether or not anyone is still waiting.

use crate::cache::StructureCache;
use crate::css;
use crate::driver::{dedup_capped, normalize_tree, PageDriver};
use crate::model::{ExtractionResult, PageAssets, StyleMap};
use crate::{Error, ExtractorConfig, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

type SharedExtraction = Shared<BoxFuture<'static, Result<Arc<ExtractionResult>>>>;
type InFlight = Arc<Mutex<HashMap<String, SharedExtraction>>>;

/// Check that `url` is a well-formed absolute http(s) URL within `max_len`.
pub fn check_url(url: &str, max_len: usize) -> Result<Url> {
    let url = url.trim();
    if url.is_empty() {
        return Err(Error::Validation("url is required".into()));
    }
    if url.len() > max_len {
        return Err(Error::Validation(format!(
            "url exceeds {} characters",
            max_len
        )));
    }
    let parsed =
        Url::parse(url).map_err(|e| Error::Validation(format!("invalid url {:?}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::Validation(format!(
            "unsupported url scheme: {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(Error::Validation(format!("url has no host: {}", url)));
    }
    Ok(parsed)
}

/// Everything one extraction run needs, detached from `&self` so the run can
/// be shared between callers.
#[derive(Clone)]
struct ExtractionContext {
    config: ExtractorConfig,
    driver: Arc<dyn PageDriver>,
    cache: Arc<StructureCache>,
    http: reqwest::Client,
    navigations: Arc<AtomicUsize>,
    in_flight: InFlight,
}

/// Extracts and caches page structure snapshots.
pub struct PageExtractor {
    ctx: ExtractionContext,
}

impl PageExtractor {
    pub fn new(config: ExtractorConfig, driver: Arc<dyn PageDriver>) -> Result<Self> {
        let cache = Arc::new(StructureCache::new(config.cache.clone()));
        Self::with_cache(config, driver, cache)
    }

    pub fn with_cache(
        config: ExtractorConfig,
        driver: Arc<dyn PageDriver>,
        cache: Arc<StructureCache>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(header_map(&config.headers)?)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            ctx: ExtractionContext {
                config,
                driver,
                cache,
                http,
                navigations: Arc::new(AtomicUsize::new(0)),
                in_flight: Arc::new(Mutex::new(HashMap::new())),
            },
        })
    }

    pub fn cache(&self) -> &Arc<StructureCache> {
        &self.ctx.cache
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.ctx.config
    }

    /// Number of driver navigations started so far.
    pub fn navigation_count(&self) -> usize {
        self.ctx.navigations.load(Ordering::SeqCst)
    }

    /// Extract the structure of `url`, from cache when fresh.
    pub async fn extract(&self, url: &str) -> Result<Arc<ExtractionResult>> {
        check_url(url, self.ctx.config.max_url_len)?;
        let url = url.trim();

        let key = StructureCache::key_for(url);
        let run = {
            let mut in_flight = lock(&self.ctx.in_flight);
            if let Some(hit) = self.ctx.cache.get(url) {
                return Ok(hit);
            }
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!("joining in-flight extraction of {}", url);
                    existing.clone()
                }
                None => {
                    let task = tokio::spawn(run_extraction(
                        self.ctx.clone(),
                        url.to_string(),
                        key.clone(),
                    ));
                    let run = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(Error::Extraction(format!("extraction task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, run.clone());
                    run
                }
            }
        };
        run.await
    }

    /// Extractions currently running.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.ctx.in_flight).len()
    }

    /// Whether `url` is well formed and reachable. Never fails.
    pub async fn validate_url(&self, url: &str) -> bool {
        if check_url(url, self.ctx.config.max_url_len).is_err() {
            return false;
        }
        let driver = self.ctx.driver.clone();
        let url = url.trim().to_string();
        let timeout = Duration::from_millis(self.ctx.config.timeout_ms);
        let probe = tokio::task::spawn_blocking(move || driver.probe(&url, timeout));
        matches!(tokio::time::timeout(timeout, probe).await, Ok(Ok(Ok(()))))
    }
}

fn lock(in_flight: &InFlight) -> std::sync::MutexGuard<'_, HashMap<String, SharedExtraction>> {
    in_flight.lock().unwrap_or_else(|e| e.into_inner())
}

fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Config(format!("invalid header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Config(format!("invalid value for header {}: {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// One spawned extraction run. The result is cached before the in-flight
/// slot is released so a new caller sees one or the other.
async fn run_extraction(ctx: ExtractionContext, url: String, key: String) -> Result<Arc<ExtractionResult>> {
    let outcome = extract_uncached(&ctx, &url).await;
    match &outcome {
        Ok(result) => {
            ctx.cache.set(&url, result.clone());
            info!(
                "extracted {} via {}: {} nodes, {} style rules",
                url,
                ctx.driver.name(),
                result.structure.node_count(),
                result.styles.len()
            );
        }
        Err(e) => error!("Extraction of {} via {} failed: {}", url, ctx.driver.name(), e),
    }
    lock(&ctx.in_flight).remove(&key);
    outcome
}

async fn extract_uncached(ctx: &ExtractionContext, url: &str) -> Result<Arc<ExtractionResult>> {
    let config = &ctx.config;
    let timeout = Duration::from_millis(config.timeout_ms);

    ctx.navigations.fetch_add(1, Ordering::SeqCst);
    let driver = ctx.driver.clone();
    let nav_url = url.to_string();
    let task = tokio::task::spawn_blocking(move || driver.navigate(&nav_url, timeout));
    let raw = match tokio::time::timeout(timeout, task).await {
        Err(_) => return Err(Error::Timeout(config.timeout_ms)),
        Ok(Err(join)) => {
            return Err(Error::Extraction(format!("driver task failed: {}", join)));
        }
        Ok(Ok(res)) => res?,
    };

    let mut structure = raw.structure;
    normalize_tree(&mut structure);

    let mut styles: BTreeMap<String, StyleMap> = BTreeMap::new();
    for inline in &raw.inline_styles {
        css::merge_rules(&mut styles, &css::parse_stylesheet(inline));
    }

    let mut fonts = raw.assets.fonts;
    let sheets = fetch_stylesheets(
        &ctx.http,
        &raw.stylesheets,
        config.stylesheet_fetch_concurrency,
        timeout,
    )
    .await;
    for (sheet_url, text) in sheets {
        let sheet = css::parse_stylesheet(&text);
        css::merge_rules(&mut styles, &sheet);
        if let Ok(base) = Url::parse(&sheet_url) {
            fonts.extend(
                sheet
                    .font_sources
                    .iter()
                    .filter_map(|src| crate::driver::resolve_url(&base, src)),
            );
        }
    }

    let assets = PageAssets {
        images: dedup_capped(raw.assets.images, config.max_images),
        fonts: dedup_capped(fonts, config.max_fonts),
        scripts: dedup_capped(raw.assets.scripts, config.max_scripts),
    };

    Ok(Arc::new(ExtractionResult {
        structure,
        styles,
        assets,
    }))
}

/// Fetch stylesheets with bounded concurrency, keeping document order and
/// dropping the ones that fail.
async fn fetch_stylesheets(
    client: &reqwest::Client,
    urls: &[String],
    concurrency: usize,
    timeout: Duration,
) -> Vec<(String, String)> {
    futures::stream::iter(urls.iter().cloned())
        .map(|sheet_url| {
            let client = client.clone();
            async move {
                let text = fetch_stylesheet(&client, &sheet_url, timeout).await;
                (sheet_url, text)
            }
        })
        .buffered(concurrency.max(1))
        .filter_map(|(sheet_url, text)| async move {
            match text {
                Ok(text) => Some((sheet_url, text)),
                Err(e) => {
                    warn!("Skipping stylesheet {}: {}", sheet_url, e);
                    None
                }
            }
        })
        .collect()
        .await
}

async fn fetch_stylesheet(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<String> {
    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::Network(format!("HTTP {}", resp.status())));
    }
    resp.text().await.map_err(|e| Error::Network(e.to_string()))
}
