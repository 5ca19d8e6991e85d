//! HTTP surface.
//!
//! Extraction, agent registration and delivery, experiment lookup and event
//! collection, served by `axum`. Errors are returned as
//! `{"error": {"kind": ..., "message": ...}}` with the status from
//! [`Error::status_code`]; script endpoints always answer with executable
//! JavaScript, even on failure.

use crate::agent::{error_script, AgentCodeGenerator, GenerateOptions};
use crate::extractor::PageExtractor;
use crate::model::{Experiment, Status, TrackingEvent, Variant};
use crate::registry::VariantRegistry;
use crate::stats::{ExperimentStore, MemoryExperimentStore, StatsAggregator};
use crate::Error;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

const JAVASCRIPT: &str = "application/javascript; charset=utf-8";

/// Everything the handlers share.
pub struct AppState {
    pub extractor: PageExtractor,
    pub generator: AgentCodeGenerator,
    pub registry: VariantRegistry,
    pub aggregator: StatsAggregator,
    pub store: Arc<dyn ExperimentStore>,
    /// Options for canonical agents served from `/experiments/:id/script`
    pub script_options: GenerateOptions,
}

impl AppState {
    /// State backed by a fresh in-memory experiment store.
    pub fn new(extractor: PageExtractor, generator: AgentCodeGenerator) -> Self {
        Self::with_store(extractor, generator, Arc::new(MemoryExperimentStore::new()))
    }

    pub fn with_store(
        extractor: PageExtractor,
        generator: AgentCodeGenerator,
        store: Arc<dyn ExperimentStore>,
    ) -> Self {
        let registry =
            VariantRegistry::new(generator.clone()).with_max_url_len(extractor.config().max_url_len);
        Self {
            extractor,
            registry,
            aggregator: StatsAggregator::new(store.clone()),
            generator,
            store,
            script_options: GenerateOptions::default(),
        }
    }
}

/// `Error` rendered as a JSON response.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        } else {
            debug!("request rejected: {}", self.0);
        }
        let body = serde_json::json!({
            "error": { "kind": self.0.kind(), "message": self.0.to_string() }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/extract", get(extract))
        .route("/validate", get(validate))
        .route("/inject", post(inject))
        .route("/script/:variant_key", get(registered_script).delete(evict_script))
        .route("/experiments", post(create_experiment))
        .route("/experiments/:id", get(get_experiment))
        .route("/experiments/:id/script", get(experiment_script))
        .route("/tracking/event", post(tracking_event))
        .layer(cors)
        .with_state(state)
}

/// Bind `addr` and serve until the future is dropped.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn javascript(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, JAVASCRIPT)], body).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct UrlQuery {
    url: Option<String>,
}

async fn extract(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UrlQuery>,
) -> ApiResult<Response> {
    let url = q
        .url
        .ok_or_else(|| Error::Validation("url query parameter is required".into()))?;
    let result = state.extractor.extract(&url).await?;
    Ok(Json(result.as_ref()).into_response())
}

async fn validate(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UrlQuery>,
) -> Json<serde_json::Value> {
    let valid = match q.url {
        Some(url) => state.extractor.validate_url(&url).await,
        None => false,
    };
    Json(serde_json::json!({ "valid": valid }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InjectRequest {
    experiment_id: String,
    variant: Variant,
    #[serde(rename = "targetURL", alias = "targetUrl")]
    target_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InjectResponse {
    variant_key: String,
    script: String,
}

async fn inject(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InjectRequest>,
) -> ApiResult<Json<InjectResponse>> {
    let key = state
        .registry
        .register(&req.experiment_id, &req.variant, &req.target_url)?;
    let script = state
        .registry
        .lookup(&key)
        .map(|entry| entry.script)
        .ok_or_else(|| Error::Other(format!("variant {} vanished after registration", key)))?;
    Ok(Json(InjectResponse {
        variant_key: key,
        script,
    }))
}

async fn registered_script(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    match state.registry.lookup(&key) {
        Some(entry) => javascript(StatusCode::OK, entry.script),
        None => javascript(
            StatusCode::NOT_FOUND,
            error_script(&format!("No variant registered under {}", key)),
        ),
    }
}

async fn evict_script(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> ApiResult<StatusCode> {
    if state.registry.evict(&key) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("variant {}", key)).into())
    }
}

async fn create_experiment(
    State(state): State<Arc<AppState>>,
    Json(mut experiment): Json<Experiment>,
) -> ApiResult<(StatusCode, Json<Experiment>)> {
    if experiment.id.trim().is_empty() {
        return Err(Error::Validation("experiment id is required".into()).into());
    }
    for variant in &experiment.variants {
        variant.validate()?;
    }
    experiment.results.recompute();
    state.store.insert_experiment(experiment.clone());
    debug!("stored experiment {}", experiment.id);
    Ok((StatusCode::CREATED, Json(experiment)))
}

async fn get_experiment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Experiment>> {
    state
        .store
        .get_experiment(&id)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("experiment {}", id)).into())
}

async fn experiment_script(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.get_experiment(&id) {
        None => javascript(
            StatusCode::NOT_FOUND,
            error_script(&format!("Experiment {} not found", id)),
        ),
        Some(exp) if exp.status != Status::Active => javascript(
            StatusCode::FORBIDDEN,
            error_script(&format!("Experiment {} is not active", id)),
        ),
        Some(exp) => javascript(
            StatusCode::OK,
            state.generator.generate(&exp.id, &state.script_options),
        ),
    }
}

async fn tracking_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<TrackingEvent>,
) -> ApiResult<StatusCode> {
    match state.aggregator.apply_event(&event) {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            warn!("tracking event for {} rejected: {}", event.experiment_id, e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{PageDriver, RawPage};
    use crate::model::{ElementNode, ElementSelection, ExperimentStats, PageAssets, StyleMap};
    use crate::{ExtractorConfig, Result};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct StubDriver;

    impl PageDriver for StubDriver {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn navigate(&self, _url: &str, _timeout: Duration) -> Result<RawPage> {
            let mut body = ElementNode::new("body");
            body.children.push(ElementNode::new("h1"));
            Ok(RawPage {
                structure: body,
                assets: PageAssets::default(),
                stylesheets: vec![],
                inline_styles: vec!["h1 { color: blue }".into()],
            })
        }
    }

    fn app() -> (Router, Arc<AppState>) {
        let extractor = PageExtractor::new(ExtractorConfig::default(), Arc::new(StubDriver)).unwrap();
        let state = Arc::new(AppState::new(extractor, AgentCodeGenerator::default()));
        (router(state.clone()), state)
    }

    fn experiment(status: Status) -> Experiment {
        Experiment {
            id: "E1".into(),
            name: "Headline".into(),
            target_url: "shop.test".into(),
            status,
            variants: vec![],
            results: ExperimentStats::default(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String, Option<String>) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let ctype = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap(), ctype)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn extract_validates_and_serves_structure() {
        let (app, state) = app();
        let (status, body, _) = send(&app, get("/extract?url=not%20a%20url")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("validation_error"));
        let (status, _, _) = send(&app, get("/extract")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.extractor.navigation_count(), 0);

        let (status, body, _) = send(&app, get("/extract?url=https%3A%2F%2Fshop.test%2F")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["structure"]["children"][0]["id"], "el-0-0");
        assert_eq!(json["styles"]["h1"]["color"], "blue");
    }

    #[tokio::test]
    async fn validate_reports_boolean() {
        let (app, _) = app();
        let (_, body, _) = send(&app, get("/validate?url=https%3A%2F%2Fshop.test%2F")).await;
        assert_eq!(body, r#"{"valid":true}"#);
        let (_, body, _) = send(&app, get("/validate?url=ftp%3A%2F%2Fx")).await;
        assert_eq!(body, r#"{"valid":false}"#);
    }

    #[tokio::test]
    async fn inject_then_fetch_and_evict_script() {
        let (app, state) = app();
        let mut styles = StyleMap::new();
        styles.insert("color".into(), "red".into());
        let variant = Variant {
            id: "V1".into(),
            name: "Red".into(),
            is_control: false,
            elements: vec![ElementSelection {
                id: "el-0-0".into(),
                selector: None,
                original_styles: StyleMap::new(),
                variant_styles: styles,
            }],
            traffic: 50.0,
            status: Status::Draft,
        };
        let (status, body, _) = send(
            &app,
            post_json(
                "/inject",
                serde_json::json!({
                    "experimentId": "E1",
                    "variant": variant,
                    "targetURL": "https://shop.test/"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let key = json["variantKey"].as_str().unwrap().to_string();

        let (status, script, ctype) = send(&app, get(&format!("/script/{}", key))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ctype.as_deref(), Some(JAVASCRIPT));
        assert_eq!(script, json["script"].as_str().unwrap());

        let del = Request::delete(format!("/script/{}", key)).body(Body::empty()).unwrap();
        assert_eq!(send(&app, del).await.0, StatusCode::NO_CONTENT);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn inject_rejects_bad_target_urls() {
        let (app, state) = app();
        let variant = serde_json::json!({ "id": "V1", "name": "Red", "traffic": 50 });
        let long = format!("https://shop.test/{}", "a".repeat(2048));
        for target in ["", "not a url", long.as_str()] {
            let (status, body, _) = send(
                &app,
                post_json(
                    "/inject",
                    serde_json::json!({ "experimentId": "E1", "variant": variant, "targetURL": target }),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "target {:?}", target);
            assert!(body.contains("validation_error"));
        }
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_script_key_is_404_and_leaves_registry_alone() {
        let (app, state) = app();
        let (status, body, ctype) = send(&app, get("/script/deadbeef")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(ctype.as_deref(), Some(JAVASCRIPT));
        assert!(body.contains("console.warn("));
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn experiment_script_is_gated_on_status() {
        let (app, state) = app();
        let (status, body, _) = send(&app, get("/experiments/E1/script")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("console.warn("));

        state.store.insert_experiment(experiment(Status::Paused));
        let (status, body, _) = send(&app, get("/experiments/E1/script")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("not active"));

        state.store.insert_experiment(experiment(Status::Active));
        let (status, body, ctype) = send(&app, get("/experiments/E1/script")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ctype.as_deref(), Some(JAVASCRIPT));
        assert!(body.contains("\"experimentId\":\"E1\""));
    }

    #[tokio::test]
    async fn tracking_updates_stats() {
        let (app, state) = app();
        let (status, _, _) = send(
            &app,
            post_json("/experiments", serde_json::to_value(experiment(Status::Active)).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        for kind in ["control_view", "control_view", "variant_view", "variant_conversion"] {
            let (status, _, _) = send(
                &app,
                post_json(
                    "/tracking/event",
                    serde_json::json!({ "experimentId": "E1", "eventType": kind, "url": "https://shop.test/" }),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
        let stats = state.store.get_experiment("E1").unwrap().results;
        assert_eq!(stats.visitors, 2);
        assert_eq!(stats.improvement, 100.0);

        let (_, body, _) = send(&app, get("/experiments/E1")).await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["results"]["variantConversionRate"], 100.0);

        let (status, body, _) = send(
            &app,
            post_json(
                "/tracking/event",
                serde_json::json!({ "experimentId": "nope", "eventType": "control_view", "url": "" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("not_found"));
    }
}
