//! varinject
//!
//! Page structure extraction and variant injection for A/B experiments.
//!
//! - [`PageExtractor`] navigates to a page through a swappable [`PageDriver`]
//!   (browser-less static HTML by default, headless Chrome with the `cdp`
//!   feature), serializes its DOM, styles and assets, and caches the result
//!   in a bounded [`StructureCache`].
//! - [`AgentCodeGenerator`] renders the self-contained JavaScript agent that
//!   applies a variant in real browsers and reports tracking events.
//! - [`VariantRegistry`] serves per-variant agents under opaque keys.
//! - [`StatsAggregator`] folds tracking events into experiment statistics.
//! - [`server`] exposes all of it over HTTP.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use varinject::{driver, ExtractorConfig, PageExtractor};
//!
//! # async fn run() -> varinject::Result<()> {
//! let config = ExtractorConfig {
//!     timeout_ms: 10_000,
//!     ..Default::default()
//! };
//! let extractor = PageExtractor::new(config.clone(), driver::default_driver(&config)?)?;
//! let result = extractor.extract("https://example.com").await?;
//! println!("{} nodes", result.structure.node_count());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

pub mod error;
pub use error::{Error, Result};

pub mod agent;
pub mod cache;
pub mod clock;
pub mod css;
pub mod driver;
pub mod extractor;
pub mod model;
pub mod registry;
pub mod server;
pub mod stats;

pub use agent::{AgentCodeGenerator, EnvironmentConfig, GenerateOptions, Mode};
pub use cache::{CacheConfig, StructureCache};
pub use driver::PageDriver;
pub use extractor::PageExtractor;
pub use model::{
    ElementNode, ElementSelection, EventType, Experiment, ExperimentStats, ExtractionResult,
    PageAssets, Status, TrackingEvent, Variant,
};
pub use registry::{RegisteredVariant, VariantRegistry};
pub use stats::{ExperimentStore, ExperimentUpdate, MemoryExperimentStore, StatsAggregator};

/// Configuration for page extraction
///
/// Defaults: 30 s navigation budget, 500 ms network-idle window, asset lists
/// capped at 100 images, 20 fonts and 50 scripts, URLs up to 2048 characters.
///
/// # Examples
///
/// ```
/// let cfg = varinject::ExtractorConfig::default();
/// assert_eq!(cfg.timeout_ms, 30_000);
/// assert_eq!(cfg.max_images, 100);
/// ```
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// User agent string to send with requests
    pub user_agent: String,
    /// Viewport dimensions (headless Chrome only)
    pub viewport: Viewport,
    /// Hard budget for one navigation in milliseconds
    pub timeout_ms: u64,
    /// Quiet period without new network requests that counts as idle
    pub idle_ms: u64,
    /// Custom HTTP headers
    pub headers: HashMap<String, String>,
    /// Linked stylesheets fetched at once
    pub stylesheet_fetch_concurrency: usize,
    pub max_images: usize,
    pub max_fonts: usize,
    pub max_scripts: usize,
    /// Longest accepted target URL
    pub max_url_len: usize,
    pub cache: CacheConfig,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) varinject/0.1"
                .to_string(),
            viewport: Viewport::default(),
            timeout_ms: 30_000,
            idle_ms: 500,
            headers: HashMap::new(),
            stylesheet_fetch_concurrency: 4,
            max_images: 100,
            max_fonts: 20,
            max_scripts: 50,
            max_url_len: 2048,
            cache: CacheConfig::default(),
        }
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExtractorConfig::default();
        assert_eq!(config.viewport.width, 1280);
        assert_eq!(config.viewport.height, 720);
        assert_eq!(config.idle_ms, 500);
        assert_eq!((config.max_images, config.max_fonts, config.max_scripts), (100, 20, 50));
        assert_eq!(config.max_url_len, 2048);
        assert_eq!(config.cache.max_entries, 100);
    }
}
