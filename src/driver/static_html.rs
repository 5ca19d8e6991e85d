//! A browser-less driver that fetches HTML and serializes the parsed DOM.
//!
//! No script runs, so the structure is the server-rendered document and
//! `computedStyles` only reflects inline `style` attributes. Each navigation
//! builds its own HTTP client, which doubles as the isolated session.

use super::{resolve_url, PageDriver, RawPage};
use crate::css;
use crate::model::{ElementNode, PageAssets};
use crate::{Error, ExtractorConfig, Result};
use reqwest::blocking::Client;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;

pub struct StaticHtmlDriver {
    user_agent: String,
    headers: Vec<(String, String)>,
}

impl StaticHtmlDriver {
    pub fn new(config: &ExtractorConfig) -> Result<Self> {
        Ok(Self {
            user_agent: config.user_agent.clone(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    fn fetch(&self, url: &str, timeout: Duration) -> Result<(String, url::Url)> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| Error::Extraction(format!("Failed to build HTTP client: {}", e)))?;

        let mut req = client.get(url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(timeout.as_millis() as u64)
            } else {
                Error::Extraction(format!("Failed to fetch {}: {}", url, e))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Extraction(format!(
                "Navigation to {} returned HTTP {}",
                url, status
            )));
        }
        let final_url = resp.url().clone();
        let body = resp
            .text()
            .map_err(|e| Error::Extraction(format!("Failed to read response body: {}", e)))?;
        Ok((body, final_url))
    }
}

impl PageDriver for StaticHtmlDriver {
    fn name(&self) -> &'static str {
        "static"
    }

    fn navigate(&self, url: &str, timeout: Duration) -> Result<RawPage> {
        let (body, final_url) = self.fetch(url, timeout)?;
        page_from_html(&body, &final_url)
    }

    fn probe(&self, url: &str, timeout: Duration) -> Result<()> {
        self.fetch(url, timeout).map(|_| ())
    }
}

fn selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| Error::Other(format!("bad selector {}: {:?}", s, e)))
}

/// Serialize an HTML document the way a browser session would.
pub fn page_from_html(html: &str, base: &url::Url) -> Result<RawPage> {
    let document = Html::parse_document(html);

    let body = document
        .select(&selector("body")?)
        .next()
        .ok_or_else(|| Error::Extraction("document has no <body>".into()))?;
    let structure = serialize_element(body);

    let images = document
        .select(&selector("img[src]")?)
        .filter_map(|n| n.value().attr("src"))
        .filter_map(|src| resolve_url(base, src))
        .collect();
    let scripts = document
        .select(&selector("script[src]")?)
        .filter_map(|n| n.value().attr("src"))
        .filter_map(|src| resolve_url(base, src))
        .collect();

    let stylesheets = document
        .select(&selector("link[rel][href]")?)
        .filter(|n| {
            n.value().attr("rel").is_some_and(|rel| {
                rel.split_whitespace()
                    .any(|r| r.eq_ignore_ascii_case("stylesheet"))
            })
        })
        .filter_map(|n| n.value().attr("href"))
        .filter_map(|href| resolve_url(base, href))
        .collect();

    let inline_styles: Vec<String> = document
        .select(&selector("style")?)
        .map(|n| n.text().collect::<String>())
        .filter(|s| !s.trim().is_empty())
        .collect();

    let fonts = inline_styles
        .iter()
        .flat_map(|s| css::parse_stylesheet(s).font_sources)
        .filter_map(|src| resolve_url(base, &src))
        .collect();

    Ok(RawPage {
        structure,
        assets: PageAssets {
            images,
            fonts,
            scripts,
        },
        stylesheets,
        inline_styles,
    })
}

fn serialize_element(el: ElementRef<'_>) -> ElementNode {
    let value = el.value();
    let mut node = ElementNode::new(value.name());
    node.id = value.attr("id").unwrap_or_default().to_string();
    node.class_list = value.classes().map(str::to_string).collect();
    node.attributes = value
        .attrs()
        .filter(|(k, _)| *k != "style")
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    if let Some(style) = value.attr("style") {
        node.computed_styles = css::preserved_inline_styles(style);
    }

    let mut own_text = String::new();
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            own_text.push_str(&text.text);
            own_text.push(' ');
        }
    }
    let own_text = own_text.split_whitespace().collect::<Vec<_>>().join(" ");
    if !own_text.is_empty() {
        node.text = Some(own_text);
    }

    // every element child is kept so path ids line up with :nth-child
    node.children = el
        .children()
        .filter_map(ElementRef::wrap)
        .map(serialize_element)
        .collect();
    node
}
