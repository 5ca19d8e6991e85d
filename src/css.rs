//! Minimal stylesheet handling for extraction.
//!
//! This is not a CSS engine: it splits a stylesheet into selector blocks and
//! declaration lists, flattens conditional group rules (`@media`, `@supports`,
//! `@layer`), and collects `@font-face` sources. Everything else is skipped.

use crate::model::StyleMap;

/// Style properties kept in an element's `computedStyles`.
pub const PRESERVED_PROPERTIES: &[&str] = &[
    "background-color",
    "background-image",
    "border",
    "border-color",
    "border-radius",
    "border-width",
    "bottom",
    "box-shadow",
    "color",
    "display",
    "font-family",
    "font-size",
    "font-style",
    "font-weight",
    "height",
    "left",
    "letter-spacing",
    "line-height",
    "margin",
    "margin-bottom",
    "margin-left",
    "margin-right",
    "margin-top",
    "opacity",
    "padding",
    "padding-bottom",
    "padding-left",
    "padding-right",
    "padding-top",
    "position",
    "right",
    "text-align",
    "text-decoration",
    "text-transform",
    "top",
    "visibility",
    "width",
    "z-index",
];

pub fn is_preserved(property: &str) -> bool {
    PRESERVED_PROPERTIES.binary_search(&property).is_ok()
}

/// Rules and font sources found in one stylesheet, in source order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedSheet {
    pub rules: Vec<(String, StyleMap)>,
    pub font_sources: Vec<String>,
}

/// Parse a `prop: value; ...` declaration list. Names are lowercased.
pub fn parse_declarations(block: &str) -> StyleMap {
    let mut out = StyleMap::new();
    for decl in split_top_level(block, ';') {
        let Some((name, value)) = decl.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        if name.is_empty() || value.is_empty() {
            continue;
        }
        out.insert(name, value.to_string());
    }
    out
}

/// Declarations of an inline `style` attribute restricted to the preserved set.
pub fn preserved_inline_styles(style_attr: &str) -> StyleMap {
    parse_declarations(style_attr)
        .into_iter()
        .filter(|(k, _)| is_preserved(k))
        .collect()
}

pub fn parse_stylesheet(css: &str) -> ParsedSheet {
    let mut sheet = ParsedSheet::default();
    parse_into(&strip_comments(css), &mut sheet);
    sheet
}

/// Merge a sheet into a selector map; later declarations win per property.
pub fn merge_rules(
    target: &mut std::collections::BTreeMap<String, StyleMap>,
    sheet: &ParsedSheet,
) {
    for (selector, decls) in &sheet.rules {
        target
            .entry(selector.clone())
            .or_default()
            .extend(decls.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

fn parse_into(css: &str, sheet: &mut ParsedSheet) {
    let bytes = css.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        let Some((prelude_end, terminator)) = scan_until(css, pos, &[b'{', b';']) else {
            break;
        };
        let prelude = css[pos..prelude_end].trim();
        if terminator == b';' {
            // @import, @charset and stray statements
            pos = prelude_end + 1;
            continue;
        }
        let body_start = prelude_end + 1;
        let body_end = matching_brace(css, prelude_end).unwrap_or(bytes.len());
        let body = &css[body_start..body_end.min(bytes.len())];
        pos = body_end + 1;

        if let Some(at_rule) = prelude.strip_prefix('@') {
            let name = at_rule
                .split(|c: char| c.is_whitespace() || c == '(')
                .next()
                .unwrap_or("")
                .to_ascii_lowercase();
            match name.as_str() {
                "media" | "supports" | "layer" | "document" => parse_into(body, sheet),
                "font-face" => {
                    if let Some(src) = parse_declarations(body).get("src") {
                        sheet.font_sources.extend(extract_urls(src));
                    }
                }
                _ => {}
            }
            continue;
        }

        let selector = prelude.split_whitespace().collect::<Vec<_>>().join(" ");
        let decls = parse_declarations(body);
        if selector.is_empty() || decls.is_empty() {
            continue;
        }
        sheet.rules.push((selector, decls));
    }
}

/// Every `url(...)` argument in a property value, unquoted.
pub fn extract_urls(value: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find("url(") {
        let after = &rest[start + 4..];
        let Some(end) = after.find(')') else {
            break;
        };
        let raw = after[..end].trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if !raw.is_empty() && !raw.starts_with("data:") {
            urls.push(raw.to_string());
        }
        rest = &after[end + 1..];
    }
    urls
}

fn strip_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Find the first of `stops` at paren depth zero and outside quotes.
fn scan_until(s: &str, from: usize, stops: &[u8]) -> Option<(usize, u8)> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut depth = 0i32;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ if depth <= 0 && stops.contains(&b) => return Some((i, b)),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

fn matching_brace(s: &str, open: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
    }
    None
}

fn split_top_level(s: &str, delim: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth -= 1,
                _ if c == delim && depth <= 0 => {
                    parts.push(&s[start..i]);
                    start = i + c.len_utf8();
                }
                _ => {}
            },
        }
    }
    parts.push(&s[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserved_list_is_sorted_for_binary_search() {
        let mut sorted = PRESERVED_PROPERTIES.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, PRESERVED_PROPERTIES);
        assert!(is_preserved("color"));
        assert!(!is_preserved("cursor"));
    }

    #[test]
    fn declarations_survive_data_urls() {
        let decls = parse_declarations(
            "color: Red; background-image: url(data:image/png;base64,AAA=); ;bad",
        );
        assert_eq!(decls.get("color").map(String::as_str), Some("Red"));
        assert_eq!(
            decls.get("background-image").map(String::as_str),
            Some("url(data:image/png;base64,AAA=)")
        );
        assert_eq!(decls.len(), 2);
    }

    #[test]
    fn inline_styles_are_filtered() {
        let styles = preserved_inline_styles("COLOR: blue; cursor: pointer; font-size:12px");
        assert_eq!(styles.len(), 2);
        assert_eq!(styles.get("color").map(String::as_str), Some("blue"));
        assert!(!styles.contains_key("cursor"));
    }

    #[test]
    fn stylesheet_rules_media_and_fonts() {
        let css = r#"
            @charset "utf-8";
            /* header { color: green } */
            h1,  h2 { color: red; font-size: 2em }
            @media (max-width: 600px) { .nav { display: none } }
            @font-face { font-family: "Inter"; src: url("/fonts/inter.woff2") format("woff2"), url(inter.woff) }
            @keyframes spin { from { opacity: 0 } to { opacity: 1 } }
            .empty { }
        "#;
        let sheet = parse_stylesheet(css);
        let selectors: Vec<_> = sheet.rules.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(selectors, vec!["h1, h2", ".nav"]);
        assert_eq!(sheet.font_sources, vec!["/fonts/inter.woff2", "inter.woff"]);
    }

    #[test]
    fn later_rules_override_per_property() {
        let mut map = std::collections::BTreeMap::new();
        merge_rules(&mut map, &parse_stylesheet("p { color: red; margin: 0 }"));
        merge_rules(&mut map, &parse_stylesheet("p { color: blue }"));
        let p = &map["p"];
        assert_eq!(p["color"], "blue");
        assert_eq!(p["margin"], "0");
    }
}
