use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::archive;
use crate::command::CommandResponse;
use crate::control::{Controller, ControllerHandle};

/// Wire shape of every control-plane reply.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CtlResponse {
    #[serde(rename = "ctrl-message", default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    #[serde(rename = "ctrl-errors", default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl From<CommandResponse> for CtlResponse {
    fn from(resp: CommandResponse) -> Self {
        Self {
            errors: resp.error_strings(),
            messages: resp.messages,
        }
    }
}

#[derive(Clone)]
struct ServiceState {
    handle: ControllerHandle,
    api_key: Arc<String>,
    workspace: Arc<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct UnitQuery {
    #[serde(default)]
    unit: Option<String>,
}

impl UnitQuery {
    fn unit(&self) -> &str {
        self.unit.as_deref().unwrap_or_default()
    }
}

/// HTTP control plane. Owns the controller; `run_ctx` serves requests and
/// drives the controller until cancellation.
pub struct Service {
    bind: String,
    api_key: String,
    controller: Controller,
}

impl Service {
    pub fn new(bind: impl Into<String>, controller: Controller, api_key: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            api_key: api_key.into(),
            controller,
        }
    }

    pub async fn run_ctx(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.bind)
            .await
            .with_context(|| format!("listen on {:?}", self.bind))?;
        info!("serving on {:?}", listener.local_addr()?);

        let handle = self.controller.handle();
        let workspace = self.controller.dir().to_path_buf();
        let controller_task = tokio::spawn(self.controller.run_ctx(cancel.clone()));

        // Bring the fleet up; per-unit outcomes are logged by the command loop.
        let _ = handle.start_all().await;

        let state = ServiceState {
            handle,
            api_key: Arc::new(self.api_key),
            workspace: Arc::new(workspace),
        };
        let app = router(state);

        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .await
            .context("serve http")?;

        controller_task.await.context("join controller")?;
        info!("controller is done");
        Ok(())
    }
}

fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/stat", get(handle_stat))
        .route("/start-all", post(handle_start_all))
        .route("/stop-all", post(handle_stop_all))
        .route("/start", post(handle_start))
        .route("/stop", post(handle_stop))
        .route("/enable", post(handle_enable))
        .route("/disable", post(handle_disable))
        .route("/deploy", post(handle_deploy))
        .fallback(handle_not_found)
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .layer(DefaultBodyLimit::max(512 * 1024 * 1024))
        .with_state(state)
}

async fn require_bearer(State(state): State<ServiceState>, req: Request, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == state.api_key.as_str())
        .unwrap_or(false);
    if !authorized {
        let body = CtlResponse {
            errors: vec!["unauthorized".to_string()],
            ..Default::default()
        };
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }
    next.run(req).await
}

async fn handle_not_found(uri: Uri) -> Response {
    let body = CtlResponse {
        errors: vec![format!("no such resource {:?}", uri.path())],
        ..Default::default()
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

async fn handle_stat(State(state): State<ServiceState>, Query(q): Query<UnitQuery>) -> Json<CtlResponse> {
    let resp = match q.unit.as_deref() {
        Some(unit) if !unit.is_empty() => state.handle.stat(unit),
        _ => state.handle.stat_all(),
    };
    Json(resp.into())
}

async fn handle_start_all(State(state): State<ServiceState>) -> Json<CtlResponse> {
    Json(state.handle.start_all().await.into())
}

async fn handle_stop_all(State(state): State<ServiceState>) -> Json<CtlResponse> {
    Json(state.handle.stop_all().await.into())
}

async fn handle_start(State(state): State<ServiceState>, Query(q): Query<UnitQuery>) -> Json<CtlResponse> {
    Json(state.handle.start(q.unit()).await.into())
}

async fn handle_stop(State(state): State<ServiceState>, Query(q): Query<UnitQuery>) -> Json<CtlResponse> {
    Json(state.handle.stop(q.unit()).await.into())
}

async fn handle_enable(State(state): State<ServiceState>, Query(q): Query<UnitQuery>) -> Json<CtlResponse> {
    Json(state.handle.enable(q.unit()).await.into())
}

async fn handle_disable(State(state): State<ServiceState>, Query(q): Query<UnitQuery>) -> Json<CtlResponse> {
    Json(state.handle.disable(q.unit()).await.into())
}

async fn handle_deploy(
    State(state): State<ServiceState>,
    Query(q): Query<UnitQuery>,
    body: Bytes,
) -> Response {
    match deploy_upload(&state, q.unit(), &body).await {
        Ok(resp) => (StatusCode::OK, Json(CtlResponse::from(resp))).into_response(),
        Err(e) => {
            let body = CtlResponse {
                errors: vec![format!("{e:#}")],
                ..Default::default()
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

/// Stages the uploaded archive under `<workspace>/.tmp` and hands the
/// extracted directory to the controller. Extraction rejects entries that
/// escape the staging directory.
async fn deploy_upload(
    state: &ServiceState,
    unit: &str,
    body: &[u8],
) -> anyhow::Result<CommandResponse> {
    let tmp_root = state.workspace.join(".tmp");
    std::fs::create_dir_all(&tmp_root)
        .with_context(|| format!("mkdir {}", tmp_root.display()))?;

    let stamp = format!(
        "deploy_{}_{:03}",
        Utc::now().format("%Y%m%d%H%M%S"),
        rand::thread_rng().gen_range(0..1000),
    );
    let tmp_file = tmp_root.join(format!("{stamp}.zip"));
    let tmp_dir = tmp_root.join(&stamp);

    std::fs::write(&tmp_file, body)
        .with_context(|| format!("write upload to {}", tmp_file.display()))?;

    let extracted = archive::unzip_to(&tmp_file, &tmp_dir)
        .with_context(|| format!("unzip {} to {}", tmp_file.display(), tmp_dir.display()));
    let result = match extracted {
        Ok(()) => Ok(state.handle.deploy(unit, &tmp_dir).await),
        Err(e) => Err(e),
    };

    // A successful deploy moved the staging dir away; anything left behind is
    // scrap.
    let _ = std::fs::remove_file(&tmp_file);
    let _ = std::fs::remove_dir_all(&tmp_dir);
    result
}
