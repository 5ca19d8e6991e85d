//! Runtime agent generation
//!
//! [`AgentCodeGenerator`] renders `agent.js` with a single embedded JSON
//! literal carrying the experiment id, the environment preset, request options
//! and (for per-variant agents) the experiment itself. Rendering is a pure
//! function of its inputs so identical arguments give byte-identical scripts.

pub mod state;

use crate::model::{Status, Variant};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

const TEMPLATE: &str = include_str!("agent.js");
const CONFIG_TOKEN: &str = "__VARINJECT_CONFIG__";

/// Deployment mode selecting an [`EnvironmentConfig`] preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Mode::Development),
            "production" | "prod" => Ok(Mode::Production),
            other => Err(Error::Config(format!("unknown mode: {}", other))),
        }
    }
}

/// Per-environment settings baked into every generated agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    /// Base URL of the collector API, without trailing slash
    pub api_base_url: String,
    pub debug: bool,
    /// Retries after the first failed attempt
    pub retry_attempts: u32,
    /// Fixed delay between attempts, in milliseconds
    #[serde(rename = "retryDelay")]
    pub retry_delay_ms: u64,
    /// DOM observation throttle window, in milliseconds
    #[serde(rename = "throttleInterval")]
    pub throttle_interval_ms: u64,
}

impl EnvironmentConfig {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Development => Self::development(),
            Mode::Production => Self::production(),
        }
    }

    pub fn development() -> Self {
        Self {
            api_base_url: "http://localhost:3001/api".to_string(),
            debug: true,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            throttle_interval_ms: 100,
        }
    }

    pub fn production() -> Self {
        Self {
            api_base_url: "https://api.varinject.dev/api".to_string(),
            debug: false,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            throttle_interval_ms: 250,
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base_url = base.into().trim_end_matches('/').to_string();
        self
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Caller-supplied generation options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Opaque CSP nonce, echoed in the banner and the agent registry entry
    pub nonce: Option<String>,
    /// Per-request budget the agent applies to its own network calls
    pub timeout_ms: u64,
    /// Merged into every request the agent makes
    pub custom_headers: BTreeMap<String, String>,
    /// Generation timestamp shown in the banner; left out when `None`
    pub generated_at: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            nonce: None,
            timeout_ms: 5000,
            custom_headers: BTreeMap::new(),
            generated_at: None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentConfig<'a> {
    experiment_id: &'a str,
    env: &'a EnvironmentConfig,
    timeout: u64,
    custom_headers: &'a BTreeMap<String, String>,
    nonce: Option<&'a str>,
    experiment: Option<EmbeddedExperiment<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddedExperiment<'a> {
    id: &'a str,
    target_url: &'a str,
    status: Status,
    variants: [EmbeddedVariant<'a>; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddedVariant<'a> {
    id: &'a str,
    name: &'a str,
    is_control: bool,
    status: Status,
    elements: Vec<EmbeddedElement<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddedElement<'a> {
    id: &'a str,
    selector: String,
    variant_styles: &'a BTreeMap<String, String>,
}

/// Renders runtime agents for one environment.
#[derive(Debug, Clone, Default)]
pub struct AgentCodeGenerator {
    env: EnvironmentConfig,
}

impl AgentCodeGenerator {
    pub fn new(env: EnvironmentConfig) -> Self {
        Self { env }
    }

    pub fn for_mode(mode: Mode) -> Self {
        Self::new(EnvironmentConfig::for_mode(mode))
    }

    pub fn env(&self) -> &EnvironmentConfig {
        &self.env
    }

    /// Canonical agent: fetches the experiment record at runtime.
    pub fn generate(&self, experiment_id: &str, opts: &GenerateOptions) -> String {
        self.render(experiment_id, None, opts)
    }

    /// Self-contained agent for one variant. The experiment literal is embedded
    /// with both the experiment and the variant marked active, so the agent
    /// needs no lookup besides its tracking calls.
    pub fn generate_for_variant(
        &self,
        experiment_id: &str,
        variant: &Variant,
        target_url: &str,
        opts: &GenerateOptions,
    ) -> String {
        let embedded = EmbeddedExperiment {
            id: experiment_id,
            target_url,
            status: Status::Active,
            variants: [EmbeddedVariant {
                id: &variant.id,
                name: &variant.name,
                is_control: variant.is_control,
                status: Status::Active,
                elements: variant
                    .elements
                    .iter()
                    .map(|e| EmbeddedElement {
                        id: &e.id,
                        selector: e.query(),
                        variant_styles: &e.variant_styles,
                    })
                    .collect(),
            }],
        };
        self.render(experiment_id, Some(embedded), opts)
    }

    fn render(
        &self,
        experiment_id: &str,
        experiment: Option<EmbeddedExperiment<'_>>,
        opts: &GenerateOptions,
    ) -> String {
        let config = AgentConfig {
            experiment_id,
            env: &self.env,
            timeout: opts.timeout_ms,
            custom_headers: &opts.custom_headers,
            nonce: opts.nonce.as_deref(),
            experiment,
        };
        // plain string-keyed structs always serialize
        let literal = serde_json::to_string(&config).unwrap_or_else(|_| "{}".to_string());

        let mut out = banner(experiment_id, opts);
        out.push_str(&TEMPLATE.replace(CONFIG_TOKEN, &script_safe(&literal)));
        out
    }
}

fn banner(experiment_id: &str, opts: &GenerateOptions) -> String {
    let mut line = format!("/* varinject agent | experiment {}", comment_safe(experiment_id));
    if let Some(nonce) = &opts.nonce {
        line.push_str(&format!(" | nonce {}", comment_safe(nonce)));
    }
    if let Some(at) = &opts.generated_at {
        line.push_str(&format!(" | generated {}", comment_safe(at)));
    }
    line.push_str(" */\n");
    line
}

fn comment_safe(s: &str) -> String {
    s.replace("*/", "* /")
        .replace('<', "\\u003c")
        .replace(['\n', '\r'], " ")
}

/// Make a JSON text safe to embed inside an inline `<script>` element.
fn script_safe(json: &str) -> String {
    json.replace('<', "\\u003c")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

/// A script that only logs `message`; served instead of an agent when the
/// experiment is missing or inactive so script tags never see a parse error.
pub fn error_script(message: &str) -> String {
    let literal = serde_json::to_string(message).unwrap_or_else(|_| "\"varinject error\"".into());
    format!(
        "/* varinject: agent unavailable */\nconsole.warn({});\n",
        script_safe(&literal)
    )
}
