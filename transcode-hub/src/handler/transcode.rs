use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::config::ConfigStore;
use crate::handler::ApiJsonResult;
use crate::session::SessionInfo;
use crate::supervisor::{Supervisor, TaskInfo};

#[derive(Clone)]
pub struct TranscodeApi {
    pub supervisor: Arc<Supervisor>,
    pub config_path: Arc<String>,
}

pub fn transcode_router(api: TranscodeApi) -> Router {
    Router::new()
        .route("/list", get(list_tasks))
        .route("/start", post(start_transcode))
        .route("/stop/{app}/{stream}", post(stop_transcode))
        .route("/stop_id/{task_id}", post(stop_transcode_by_id))
        .route("/status/{app}/{stream}", get(task_status))
        .route("/sessions", get(running_sessions))
        .route("/templates", get(template_names))
        .route("/stats", get(stats))
        .route("/reload", post(reload_config))
        .with_state(api)
}

#[derive(Deserialize)]
struct StartRequest {
    app: String,
    stream: String,
    #[serde(default)]
    templates: Vec<String>,
    input_url: Option<String>,
}

#[derive(Serialize)]
struct StartResponse {
    task_id: String,
}

#[derive(Serialize)]
struct StatsResponse {
    running_tasks: i64,
    total_tasks: u64,
    running_sessions: i64,
    total_sessions: u64,
}

async fn list_tasks(State(api): State<TranscodeApi>) -> Json<Vec<TaskInfo>> {
    Json(api.supervisor.tasks())
}

async fn start_transcode(
    State(api): State<TranscodeApi>,
    Json(req): Json<StartRequest>,
) -> ApiJsonResult<StartResponse> {
    let task_id = api
        .supervisor
        .start_transcode(&req.app, &req.stream, &req.templates, req.input_url.as_deref())?;
    Ok(Json(StartResponse { task_id }))
}

async fn stop_transcode(
    State(api): State<TranscodeApi>,
    Path((app, stream)): Path<(String, String)>,
) -> Json<bool> {
    Json(api.supervisor.stop_transcode(&app, &stream).await)
}

async fn stop_transcode_by_id(State(api): State<TranscodeApi>, Path(task_id): Path<String>) -> Json<bool> {
    Json(api.supervisor.stop_transcode_by_id(&task_id).await)
}

async fn task_status(
    State(api): State<TranscodeApi>,
    Path((app, stream)): Path<(String, String)>,
) -> Json<Option<TaskInfo>> {
    Json(api.supervisor.task(&app, &stream))
}

async fn running_sessions(State(api): State<TranscodeApi>) -> Json<Vec<SessionInfo>> {
    Json(api.supervisor.running_sessions_info())
}

async fn template_names(State(api): State<TranscodeApi>) -> Json<Vec<String>> {
    Json(api.supervisor.template_names())
}

async fn stats(State(api): State<TranscodeApi>) -> Json<StatsResponse> {
    Json(StatsResponse {
        running_tasks: api.supervisor.running_task_count(),
        total_tasks: api.supervisor.total_task_count(),
        running_sessions: api.supervisor.running_session_count(),
        total_sessions: api.supervisor.total_session_count(),
    })
}

/// Re-reads the config file and swaps templates and rules atomically.
async fn reload_config(State(api): State<TranscodeApi>) -> ApiJsonResult<&'static str> {
    let store = ConfigStore::from_file(api.config_path.as_str())?;
    api.supervisor.reload_config(&store)?;
    Ok(Json("ok"))
}
