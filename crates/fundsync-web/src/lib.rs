//! Axum JSON API: trigger syncs, read run outcomes and browse stored funds.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fundsync_adapters::AdapterError;
use fundsync_core::{FatalKind, SyncOutcome};
use fundsync_source::{BitableSource, FixtureSource, LarkCredentials};
use fundsync_sync::{FundStore, SyncConfig, SyncPipeline};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "fundsync-web";

const DEFAULT_OUTCOME_LIMIT: usize = 20;
const MAX_OUTCOME_LIMIT: usize = 500;

/// Picks the Bitable source a sync request runs against.
pub trait SourceFactory: Send + Sync {
    fn build(
        &self,
        pipeline: &SyncPipeline,
        credentials: LarkCredentials,
    ) -> anyhow::Result<Arc<dyn BitableSource>>;
}

/// Live Lark client; requests with the configured credentials share one client.
pub struct LarkSourceFactory;

impl SourceFactory for LarkSourceFactory {
    fn build(
        &self,
        pipeline: &SyncPipeline,
        credentials: LarkCredentials,
    ) -> anyhow::Result<Arc<dyn BitableSource>> {
        Ok(pipeline.lark_client(credentials)?)
    }
}

/// Serves every sync from a captured bundle; credentials are ignored.
pub struct FixtureSourceFactory {
    path: PathBuf,
}

impl FixtureSourceFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SourceFactory for FixtureSourceFactory {
    fn build(
        &self,
        _pipeline: &SyncPipeline,
        _credentials: LarkCredentials,
    ) -> anyhow::Result<Arc<dyn BitableSource>> {
        Ok(Arc::new(FixtureSource::from_path(&self.path)?))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub sources: Arc<dyn SourceFactory>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, sources: Arc<dyn SourceFactory>) -> Self {
        Self { pipeline, sources }
    }
}

/// Body of `POST /api/sync`. Missing credentials fall back to the configured ones.
#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub app_token: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
}

impl SyncRequest {
    fn credentials(&self, config: &SyncConfig) -> LarkCredentials {
        let configured = config.credentials();
        LarkCredentials {
            app_id: self.app_id.clone().unwrap_or(configured.app_id),
            app_secret: self.app_secret.clone().unwrap_or(configured.app_secret),
            app_token: self.app_token.clone().unwrap_or(configured.app_token),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct OutcomesQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct FundsQuery {
    source: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/sync/outcomes", get(outcomes_handler))
        .route("/api/funds", get(funds_handler))
        .route("/api/funds/{record_id}", get(fund_detail_handler))
        .route("/api/funds/{record_id}/history", get(fund_history_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "fundsync api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// 200 once the run reached reconciliation, otherwise a status naming what stopped it.
pub fn outcome_status(outcome: &SyncOutcome) -> StatusCode {
    if outcome.reached_reconciliation() {
        return StatusCode::OK;
    }
    match outcome.fatal_kind {
        Some(FatalKind::Auth) => StatusCode::UNAUTHORIZED,
        Some(FatalKind::LockContention) => StatusCode::CONFLICT,
        Some(FatalKind::Fetch) | Some(FatalKind::Timeout) => StatusCode::BAD_GATEWAY,
        Some(FatalKind::Persistence) | None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn sync_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: SyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => return client_error(StatusCode::BAD_REQUEST, format!("invalid sync request: {err}")),
        }
    };

    let credentials = request.credentials(state.pipeline.config());
    let source = match state.sources.build(&state.pipeline, credentials) {
        Ok(source) => source,
        Err(err) => return server_error(err.context("building bitable client")),
    };

    match state.pipeline.run(source.as_ref(), &request.tables).await {
        Ok(outcome) => (outcome_status(&outcome), Json(outcome)).into_response(),
        Err(err @ AdapterError::UnknownTable(_)) => client_error(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => server_error(err.into()),
    }
}

async fn outcomes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OutcomesQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_OUTCOME_LIMIT)
        .min(MAX_OUTCOME_LIMIT);
    match state.pipeline.store().recent_outcomes(limit).await {
        Ok(outcomes) => Json(outcomes).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn funds_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FundsQuery>,
) -> Response {
    let source = query.source.as_deref().filter(|s| !s.is_empty());
    match state.pipeline.store().list_funds(source).await {
        Ok(funds) => Json(funds).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn fund_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<String>,
) -> Response {
    match state.pipeline.store().get_fund(&record_id).await {
        Ok(Some(fund)) => Json(fund).into_response(),
        Ok(None) => client_error(StatusCode::NOT_FOUND, format!("fund {record_id} not found")),
        Err(err) => server_error(err.into()),
    }
}

async fn fund_history_handler(
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<String>,
) -> Response {
    let store = state.pipeline.store();
    match store.get_fund(&record_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return client_error(StatusCode::NOT_FOUND, format!("fund {record_id} not found")),
        Err(err) => return server_error(err.into()),
    }
    match store.nav_history(&record_id).await {
        Ok(points) => Json(points).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn client_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": format!("{err:#}")})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use fundsync_adapters::TableRegistry;
    use fundsync_core::name_identity;
    use fundsync_source::SourceError;
    use fundsync_sync::MemoryFundStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct FailingFactory(SourceError);

    impl SourceFactory for FailingFactory {
        fn build(
            &self,
            _pipeline: &SyncPipeline,
            _credentials: LarkCredentials,
        ) -> anyhow::Result<Arc<dyn BitableSource>> {
            Ok(Arc::new(FixtureSource::failing(self.0.clone())))
        }
    }

    fn bundle_path() -> PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/bitable/sample/bundle.json")
    }

    fn state_with(store: &MemoryFundStore, sources: Arc<dyn SourceFactory>) -> AppState {
        let pipeline = SyncPipeline::new(
            SyncConfig::default(),
            Arc::new(store.clone()),
            TableRegistry::builtin(),
        );
        AppState::new(Arc::new(pipeline), sources)
    }

    fn fixture_state(store: &MemoryFundStore) -> AppState {
        state_with(store, Arc::new(FixtureSourceFactory::new(bundle_path())))
    }

    fn post_sync(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/sync")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = app(fixture_state(&MemoryFundStore::new()));
        let resp = app.oneshot(get("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_then_browse_funds() {
        let store = MemoryFundStore::new();
        let app = app(fixture_state(&store));

        let resp = app.clone().oneshot(post_sync("")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = json_body(resp).await;
        assert_eq!(outcome["status"], "success");
        assert_eq!(outcome["records_inserted"], 3);

        let funds = json_body(app.clone().oneshot(get("/api/funds")).await.unwrap()).await;
        assert_eq!(funds.as_array().unwrap().len(), 3);
        let fof = json_body(app.clone().oneshot(get("/api/funds?source=fof")).await.unwrap()).await;
        assert_eq!(fof.as_array().unwrap().len(), 1);

        let alpha = name_identity("Alpha Quant 1号");
        let detail = app
            .clone()
            .oneshot(get(&format!("/api/funds/{alpha}")))
            .await
            .unwrap();
        assert_eq!(detail.status(), StatusCode::OK);
        assert_eq!(json_body(detail).await["strategy"], "CTA");

        let history = json_body(
            app.clone()
                .oneshot(get(&format!("/api/funds/{alpha}/history")))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(history.as_array().unwrap().len(), 4);

        let missing = app.clone().oneshot(get("/api/funds/nope")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let outcomes = json_body(app.oneshot(get("/api/sync/outcomes?limit=5")).await.unwrap()).await;
        assert_eq!(outcomes.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_table_and_bad_body_are_client_errors() {
        let app = app(fixture_state(&MemoryFundStore::new()));
        let resp = app
            .clone()
            .oneshot(post_sync(r#"{"tables": ["tblNope"]}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app.oneshot(post_sync("{not json")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn auth_failure_maps_to_unauthorized() {
        let store = MemoryFundStore::new();
        let app = app(state_with(
            &store,
            Arc::new(FailingFactory(SourceError::Auth("invalid app secret".into()))),
        ));
        let resp = app.oneshot(post_sync(r#"{"app_id": "cli_x"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let outcome = json_body(resp).await;
        assert_eq!(outcome["fatal_kind"], "auth");
        assert_eq!(outcome["records_processed"], 0);
    }

    #[tokio::test]
    async fn exhausted_fetch_retries_map_to_bad_gateway() {
        let store = MemoryFundStore::new();
        let app = app(state_with(
            &store,
            Arc::new(FailingFactory(SourceError::Transient {
                attempts: 4,
                message: "http 503 Service Unavailable from records".into(),
                timed_out: false,
            })),
        ));
        let resp = app.clone().oneshot(post_sync("")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let outcome = json_body(resp).await;
        assert_eq!(outcome["fatal_kind"], "fetch");
        assert_eq!(outcome["records_processed"], 0);

        let funds = json_body(app.oneshot(get("/api/funds")).await.unwrap()).await;
        assert!(funds.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_sync_maps_to_conflict() {
        let store = MemoryFundStore::new();
        let held = store.begin_run("bitable").await.expect("session");
        let app = app(fixture_state(&store));
        let resp = app.oneshot(post_sync("{}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        held.release().await.expect("release");
    }

    #[test]
    fn request_credentials_override_configured_ones() {
        let config = SyncConfig {
            lark_app_id: "cfg-id".into(),
            lark_app_secret: "cfg-secret".into(),
            lark_app_token: "cfg-token".into(),
            ..SyncConfig::default()
        };
        let request = SyncRequest {
            app_token: Some("req-token".into()),
            ..SyncRequest::default()
        };
        let credentials = request.credentials(&config);
        assert_eq!(credentials.app_id, "cfg-id");
        assert_eq!(credentials.app_token, "req-token");
    }
}
