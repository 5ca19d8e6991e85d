//! Page drivers: the narrow adapter between extraction and a browser.
//!
//! A driver opens an isolated session, navigates to one URL, serializes the
//! live DOM starting at `<body>`, lists assets and stylesheets, and releases
//! the session before returning. Caching, stylesheet fetching, and id
//! normalization live above this seam so backends stay swappable.

use crate::model::{is_path_id, ElementNode, PageAssets};
use crate::{Error, ExtractorConfig, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "cdp")]
pub mod cdp;

#[cfg(feature = "simple")]
pub mod static_html;

/// What a driver hands back for a single navigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPage {
    /// `<body>` subtree; `id` holds the native id or is empty
    pub structure: ElementNode,
    #[serde(default)]
    pub assets: PageAssets,
    /// Absolute URLs of linked stylesheets in document order
    #[serde(default)]
    pub stylesheets: Vec<String>,
    /// Text of inline `<style>` blocks in document order
    #[serde(default)]
    pub inline_styles: Vec<String>,
}

/// A swappable browser automation backend.
pub trait PageDriver: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Navigate to `url` and serialize the page, failing after `timeout`.
    fn navigate(&self, url: &str, timeout: Duration) -> Result<RawPage>;

    /// Check that `url` can be navigated to. Defaults to a full navigation.
    fn probe(&self, url: &str, timeout: Duration) -> Result<()> {
        self.navigate(url, timeout).map(|_| ())
    }
}

/// Build the driver named `name` (`static` or `cdp`).
pub fn driver_by_name(name: &str, config: &ExtractorConfig) -> Result<Arc<dyn PageDriver>> {
    match name {
        #[cfg(feature = "simple")]
        "static" | "simple" => Ok(Arc::new(static_html::StaticHtmlDriver::new(config)?)),
        #[cfg(feature = "cdp")]
        "cdp" | "chrome" => Ok(Arc::new(cdp::CdpDriver::new(config))),
        other => Err(Error::Config(format!(
            "unknown or disabled page driver: {}",
            other
        ))),
    }
}

/// Create the default driver for the enabled features.
///
/// Prefers headless Chrome when the `cdp` feature is enabled and falls back
/// to the browser-less static driver otherwise.
pub fn default_driver(config: &ExtractorConfig) -> Result<Arc<dyn PageDriver>> {
    if cfg!(feature = "cdp") {
        driver_by_name("cdp", config)
    } else {
        driver_by_name("static", config)
    }
}

/// Decode the JSON a page-side serializer produced.
///
/// The payload must be an object with a `structure` field; an `error` field
/// reports a failure raised inside the page.
pub fn parse_serialized_page(payload: &str) -> Result<RawPage> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    if let Some(err) = value.get("error") {
        return Err(Error::Extraction(format!("page serializer failed: {}", err)));
    }
    if value.get("structure").map_or(true, |s| s.is_null()) {
        return Err(Error::Extraction(
            "malformed structure payload: missing structure".into(),
        ));
    }
    Ok(serde_json::from_value(value)?)
}

/// Path-derived id for a node: `el-0` is `<body>`, `el-0-2` its third element child.
pub fn path_id(path: &[usize]) -> String {
    let mut id = String::from("el");
    for idx in path {
        id.push('-');
        id.push_str(&idx.to_string());
    }
    id
}

/// Enforce the tree invariants every extraction result carries.
///
/// Native ids are kept on first occurrence. Duplicates, id-less elements and
/// native ids shaped like path ids get their path id, so a path id always
/// names the element at that position. Parent links are rebuilt from the
/// tree and inline `style` attributes dropped.
pub fn normalize_tree(root: &mut ElementNode) {
    let mut used = HashSet::new();
    let mut path = vec![0];
    normalize_node(root, &mut path, None, &mut used);
}

fn normalize_node(
    node: &mut ElementNode,
    path: &mut Vec<usize>,
    parent_id: Option<&str>,
    used: &mut HashSet<String>,
) {
    let native = node.id.trim();
    let id = if !native.is_empty() && !is_path_id(native) && !used.contains(native) {
        native.to_string()
    } else {
        path_id(path)
    };
    used.insert(id.clone());

    node.id = id;
    node.parent_id = parent_id.map(str::to_string);
    node.selectable = true;
    node.editable = true;
    node.attributes.remove("style");
    node.tag = node.tag.to_ascii_lowercase();

    let own_id = node.id.clone();
    for (i, child) in node.children.iter_mut().enumerate() {
        path.push(i);
        normalize_node(child, path, Some(&own_id), used);
        path.pop();
    }
}

/// Resolve `href` against `base`, keeping only http(s) results.
pub fn resolve_url(base: &url::Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("data:") || href.starts_with("javascript:") {
        return None;
    }
    let joined = base.join(href).ok()?;
    match joined.scheme() {
        "http" | "https" => Some(joined.to_string()),
        _ => None,
    }
}

/// Drop duplicates (first occurrence wins) and truncate to `cap`.
pub fn dedup_capped(items: Vec<String>, cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .take(cap)
        .collect()
}
