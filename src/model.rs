//! Data model shared by the extractor, generator, registry, and aggregator.
//!
//! Every map is a `BTreeMap` so the JSON produced for a given value is stable;
//! generated agents embed these values and must be byte-for-byte reproducible.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Property name to value.
pub type StyleMap = BTreeMap<String, String>;

fn yes() -> bool {
    true
}

/// A serialized DOM element.
///
/// Children are owned by their parent; `parent_id` is a lookup key into the
/// same extraction result, never a traversal pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementNode {
    #[serde(default)]
    pub id: String,
    pub tag: String,
    #[serde(default)]
    pub class_list: BTreeSet<String>,
    /// Attributes other than `style`
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Style values restricted to [`crate::css::PRESERVED_PROPERTIES`]
    #[serde(default)]
    pub computed_styles: StyleMap,
    /// Trimmed text owned directly by this element (not its descendants)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub children: Vec<ElementNode>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default = "yes")]
    pub selectable: bool,
    #[serde(default = "yes")]
    pub editable: bool,
}

impl ElementNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            tag: tag.into(),
            class_list: BTreeSet::new(),
            attributes: BTreeMap::new(),
            computed_styles: BTreeMap::new(),
            text: None,
            children: Vec::new(),
            parent_id: None,
            selectable: true,
            editable: true,
        }
    }

    /// Depth-first, document-order traversal starting at this node.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    pub fn find(&self, id: &str) -> Option<&ElementNode> {
        self.walk().find(|n| n.id == id)
    }

    pub fn node_count(&self) -> usize {
        self.walk().count()
    }
}

/// Iterator returned by [`ElementNode::walk`].
pub struct Walk<'a> {
    stack: Vec<&'a ElementNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a ElementNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        // reverse so the first child is visited next
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Whether `id` has the shape of a path-derived id (`el-0`, `el-0-2-1`).
pub fn is_path_id(id: &str) -> bool {
    match id.strip_prefix("el-0") {
        Some("") => true,
        Some(rest) => rest.strip_prefix('-').is_some_and(|tail| {
            tail.split('-')
                .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
        }),
        None => false,
    }
}

/// Turn a node id into a CSS selector. Path-derived ids (`el-0-2-1`) become
/// a `:nth-child` chain rooted at `<body>`; any other id is matched as an
/// attribute so ids like `1hero` or `:r1:` stay valid.
pub fn selector_for_node_id(id: &str) -> String {
    if is_path_id(id) {
        let mut selector = String::from("body");
        for part in id.split('-').skip(2) {
            let idx: usize = part.parse().unwrap_or(0);
            selector.push_str(&format!(" > :nth-child({})", idx + 1));
        }
        return selector;
    }
    format!("[id=\"{}\"]", css_string_escape(id))
}

fn css_string_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\a "),
            _ => out.push(c),
        }
    }
    out
}

/// Asset inventory of a page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAssets {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub fonts: Vec<String>,
    #[serde(default)]
    pub scripts: Vec<String>,
}

/// Structure snapshot of one page at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub structure: ElementNode,
    /// Selector to declarations, gathered from inline and linked stylesheets
    pub styles: BTreeMap<String, StyleMap>,
    pub assets: PageAssets,
}

/// Lifecycle state shared by experiments and variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Draft,
    Active,
    Paused,
    Completed,
}

/// One element targeted by a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSelection {
    /// Extraction node id of the element (native id or path-derived id)
    pub id: String,
    /// CSS selector; when absent the selector is derived from `id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub original_styles: StyleMap,
    #[serde(default)]
    pub variant_styles: StyleMap,
}

impl ElementSelection {
    /// Selector the agent queries for this element.
    pub fn query(&self) -> String {
        match &self.selector {
            Some(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => selector_for_node_id(&self.id),
        }
    }
}

/// A named set of element style overrides plus a traffic allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_control: bool,
    #[serde(default)]
    pub elements: Vec<ElementSelection>,
    /// Percentage of traffic, 0 to 100
    #[serde(default)]
    pub traffic: f64,
    #[serde(default)]
    pub status: Status,
}

impl Variant {
    /// A control carries no overrides and traffic must be a percentage.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.trim().is_empty() {
            return Err(crate::Error::Validation("variant id is required".into()));
        }
        if !(0.0..=100.0).contains(&self.traffic) {
            return Err(crate::Error::Validation(format!(
                "variant {} traffic {} is outside 0..=100",
                self.id, self.traffic
            )));
        }
        if self.is_control && self.elements.iter().any(|e| !e.variant_styles.is_empty()) {
            return Err(crate::Error::Validation(format!(
                "control variant {} cannot carry style overrides",
                self.id
            )));
        }
        Ok(())
    }
}

/// Running statistics of an experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStats {
    #[serde(default)]
    pub visitors: u64,
    #[serde(default)]
    pub conversions: u64,
    #[serde(default)]
    pub variant_visitors: u64,
    #[serde(default)]
    pub variant_conversions: u64,
    #[serde(default)]
    pub control_conversion_rate: f64,
    #[serde(default)]
    pub variant_conversion_rate: f64,
    #[serde(default)]
    pub improvement: f64,
}

impl ExperimentStats {
    /// Rebuild every derived field from the four raw counters.
    pub fn recompute(&mut self) {
        self.control_conversion_rate = rate(self.conversions, self.visitors);
        self.variant_conversion_rate = rate(self.variant_conversions, self.variant_visitors);
        self.improvement = self.variant_conversion_rate - self.control_conversion_rate;
    }
}

fn rate(hits: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64 * 100.0
    }
}

/// An A/B test record as held by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Substring the host page URL must contain for the agent to act
    #[serde(default)]
    pub target_url: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub results: ExperimentStats,
}

impl Experiment {
    /// First non-control variant flagged active.
    pub fn active_variant(&self) -> Option<&Variant> {
        self.variants
            .iter()
            .find(|v| !v.is_control && v.status == Status::Active)
    }
}

/// Kinds of tracking events emitted by agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    VariantView,
    ControlView,
    VariantConversion,
    ControlConversion,
    VariantClick,
    /// Anything else; accepted and ignored
    #[serde(other)]
    Unknown,
}

/// A single event posted by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    pub experiment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    pub event_type: EventType,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}
