#![cfg(feature = "simple")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use varinject::{driver, Error, ExtractorConfig, PageExtractor};

const PAGE: &str = r#"<!DOCTYPE html>
<html><head>
<title>Shop</title>
<link rel="stylesheet" href="/css/main.css">
<link rel="stylesheet" href="/css/missing.css">
<style>h1 { color: red; margin: 0 } .cta { padding: 4px }</style>
<script src="/js/app.js"></script>
</head>
<body>
<h1>Summer sale</h1>
<div id="hero"><img src="/img/hero.jpg"><a class="cta" href="/buy">Buy</a></div>
</body></html>"#;

const MAIN_CSS: &str = r#"
/* theme */
h1 { color: green }
@media (min-width: 600px) { .cta { padding: 8px } }
@font-face { font-family: Brand; src: url("../fonts/brand.woff2") format("woff2"), url(data:font/woff2;base64,AAAA) }
"#;

/// Serves the fixture site; counts requests for HTML documents.
fn fixture_server() -> (String, Arc<AtomicUsize>) {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr();
    let pages = Arc::new(AtomicUsize::new(0));
    let counter = pages.clone();

    std::thread::spawn(move || {
        for req in server.incoming_requests() {
            let counter = counter.clone();
            std::thread::spawn(move || {
                let path = req.url().to_string();
                let html = tiny_http::Header::from_bytes("Content-Type", "text/html").unwrap();
                let response = match path.as_str() {
                    "/" => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tiny_http::Response::from_string(PAGE).with_header(html)
                    }
                    "/slow" => {
                        std::thread::sleep(Duration::from_millis(1500));
                        tiny_http::Response::from_string(PAGE).with_header(html)
                    }
                    "/css/main.css" => tiny_http::Response::from_string(MAIN_CSS),
                    _ => tiny_http::Response::from_string("not found").with_status_code(404),
                };
                let _ = req.respond(response);
            });
        }
    });
    (format!("http://{}", addr), pages)
}

fn extractor(timeout_ms: u64) -> PageExtractor {
    let config = ExtractorConfig {
        timeout_ms,
        ..Default::default()
    };
    let driver = driver::driver_by_name("static", &config).unwrap();
    PageExtractor::new(config, driver).unwrap()
}

#[tokio::test]
async fn extracts_structure_styles_and_assets() {
    let (base, _) = fixture_server();
    let extractor = extractor(10_000);
    let result = extractor.extract(&format!("{}/", base)).await.unwrap();

    let root = &result.structure;
    assert_eq!(root.tag, "body");
    assert_eq!(root.id, "el-0");
    let h1 = &root.children[0];
    assert_eq!(h1.id, "el-0-0");
    assert_eq!(h1.parent_id.as_deref(), Some("el-0"));
    assert_eq!(h1.text.as_deref(), Some("Summer sale"));
    let hero = root.find("hero").unwrap();
    assert_eq!(hero.children[1].id, "el-0-1-1");
    assert!(hero.children[1].class_list.contains("cta"));

    // linked sheet overrides the inline block, unreachable sheet is skipped
    assert_eq!(result.styles["h1"]["color"], "green");
    assert_eq!(result.styles["h1"]["margin"], "0");
    assert_eq!(result.styles[".cta"]["padding"], "8px");

    assert_eq!(result.assets.images, vec![format!("{}/img/hero.jpg", base)]);
    assert_eq!(result.assets.scripts, vec![format!("{}/js/app.js", base)]);
    assert_eq!(result.assets.fonts, vec![format!("{}/fonts/brand.woff2", base)]);
}

#[tokio::test]
async fn second_extraction_is_served_from_cache() {
    let (base, pages) = fixture_server();
    let extractor = extractor(10_000);
    let url = format!("{}/", base);

    let first = extractor.extract(&url).await.unwrap();
    let second = extractor.extract(&url).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first, second);
    assert_eq!(extractor.navigation_count(), 1);
    assert_eq!(pages.load(Ordering::SeqCst), 1);
    assert_eq!(extractor.cache().len(), 1);
}

#[tokio::test]
async fn invalid_url_never_navigates() {
    let extractor = extractor(10_000);
    for bad in ["not a url", "", "/relative", "ftp://files.test/x"] {
        assert!(matches!(extractor.extract(bad).await, Err(Error::Validation(_))));
    }
    let long = format!("https://shop.test/{}", "a".repeat(2048));
    assert!(matches!(extractor.extract(&long).await, Err(Error::Validation(_))));
    assert_eq!(extractor.navigation_count(), 0);
}

#[tokio::test]
async fn failed_navigation_is_not_cached() {
    let (base, _) = fixture_server();
    let extractor = extractor(10_000);
    let url = format!("{}/gone", base);
    let err = extractor.extract(&url).await.unwrap_err();
    assert!(matches!(err, Error::Extraction(_)), "got {:?}", err);
    assert_eq!(err.status_code(), 500);
    assert!(extractor.cache().is_empty());
    assert!(!extractor.validate_url(&url).await);
    assert!(extractor.validate_url(&format!("{}/", base)).await);
}

#[tokio::test]
async fn slow_page_times_out() {
    let (base, _) = fixture_server();
    let extractor = extractor(300);
    let err = extractor.extract(&format!("{}/slow", base)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);
    assert!(extractor.cache().is_empty());
}
