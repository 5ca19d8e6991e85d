//! Chrome DevTools Protocol driver (uses the `headless_chrome` crate)
//!
//! Every navigation launches its own headless Chrome and tab. The session is
//! held by a guard that closes the tab and drops the browser process on every
//! exit path, including timeouts and in-page failures.

use super::{parse_serialized_page, PageDriver, RawPage};
use crate::css::PRESERVED_PROPERTIES;
use crate::{Error, ExtractorConfig, Result};
use headless_chrome::browser::tab::Tab;
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const IDLE_PROBE: &str = r#"JSON.stringify([document.readyState, performance.getEntriesByType('resource').length])"#;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Headless Chrome backed [`PageDriver`].
pub struct CdpDriver {
    user_agent: String,
    headers: HashMap<String, String>,
    viewport: (u32, u32),
    idle: Duration,
    caps: serde_json::Value,
}

/// One isolated browser session; released on drop.
struct Session {
    // dropped after the tab so the process outlives the close request
    tab: Arc<Tab>,
    _browser: Browser,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.tab.close(false) {
            warn!("Failed to close extraction tab: {}", e);
        }
    }
}

impl CdpDriver {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            headers: config.headers.clone(),
            viewport: (config.viewport.width, config.viewport.height),
            idle: Duration::from_millis(config.idle_ms),
            caps: serde_json::json!({
                "images": config.max_images,
                "fonts": config.max_fonts,
                "scripts": config.max_scripts,
            }),
        }
    }

    fn open_session(&self, timeout: Duration) -> Result<Session> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some(self.viewport))
            .build()
            .map_err(|e| Error::Extraction(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::Extraction(format!("Failed to launch browser: {}", e)))?;
        let tab = browser
            .new_tab()
            .map_err(|e| Error::Extraction(format!("Failed to create tab: {}", e)))?;
        let session = Session {
            tab,
            _browser: browser,
        };

        session.tab.set_default_timeout(timeout);
        session
            .tab
            .set_user_agent(&self.user_agent, None, None)
            .map_err(|e| Error::Extraction(format!("Failed to set user agent: {}", e)))?;
        if !self.headers.is_empty() {
            let headers: HashMap<&str, &str> = self
                .headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            session
                .tab
                .set_extra_http_headers(headers)
                .map_err(|e| Error::Extraction(format!("Failed to set headers: {}", e)))?;
        }
        Ok(session)
    }

    /// Poll until the document is complete and no resource was requested for
    /// `self.idle`, or fail once `deadline` passes.
    fn wait_for_idle(&self, tab: &Tab, deadline: Instant, budget_ms: u64) -> Result<()> {
        let mut last_count: Option<u64> = None;
        let mut quiet_since = Instant::now();
        loop {
            let probe = tab
                .evaluate(IDLE_PROBE, false)
                .map_err(|e| Error::Extraction(format!("Idle probe failed: {}", e)))?;
            let (state, count) = probe
                .value
                .as_ref()
                .and_then(|v| v.as_str())
                .and_then(|s| serde_json::from_str::<(String, u64)>(s).ok())
                .unwrap_or_else(|| ("loading".to_string(), 0));

            if last_count != Some(count) {
                last_count = Some(count);
                quiet_since = Instant::now();
            }
            if state == "complete" && quiet_since.elapsed() >= self.idle {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(budget_ms));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn serializer_script(&self) -> String {
        let preserved = serde_json::to_string(PRESERVED_PROPERTIES).unwrap_or_else(|_| "[]".into());
        include_str!("serialize.js")
            .replace("__VARINJECT_PRESERVED__", &preserved)
            .replace("__VARINJECT_CAPS__", &self.caps.to_string())
    }
}

impl PageDriver for CdpDriver {
    fn name(&self) -> &'static str {
        "cdp"
    }

    fn navigate(&self, url: &str, timeout: Duration) -> Result<RawPage> {
        let started = Instant::now();
        let deadline = started + timeout;
        let budget_ms = timeout.as_millis() as u64;
        let session = self.open_session(timeout)?;

        session
            .tab
            .navigate_to(url)
            .map_err(|e| Error::Extraction(format!("Navigation failed: {}", e)))?;
        session.tab.wait_until_navigated().map_err(|e| {
            if Instant::now() >= deadline {
                Error::Timeout(budget_ms)
            } else {
                Error::Extraction(format!("Wait for navigation failed: {}", e))
            }
        })?;
        self.wait_for_idle(&session.tab, deadline, budget_ms)?;

        let eval = session
            .tab
            .evaluate(&self.serializer_script(), false)
            .map_err(|e| Error::Extraction(format!("Serialization failed: {}", e)))?;
        let payload = eval
            .value
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::Extraction("Serializer returned no value".into()))?;

        debug!(
            "cdp navigation of {} finished in {}ms",
            url,
            started.elapsed().as_millis()
        );
        parse_serialized_page(&payload)
    }
}
