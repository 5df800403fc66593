use crate::api::sse::{ClientStream, EventFilter, SseHub};
use crate::drivers;
use crate::plc::manager::PlcManager;
use crate::tags::value::Value;
use crate::write::executor::{WriteExecutor, WriteGateway, WriteOutcome, WriteRequest};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;

const SSE_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<PlcManager>,
    pub hub: Arc<SseHub>,
    pub gateway: Arc<dyn WriteGateway>,
    pub executor: Arc<WriteExecutor>,
}

#[derive(Serialize)]
pub struct PlcSummary {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u8>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct TagEntry {
    pub plc: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memloc: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn not_found(msg: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody { error: msg.into() }),
    )
}

pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(list_plcs))
        .route("/api/events", get(events))
        .route("/:plc", get(get_plc))
        .route("/:plc/tags", get(list_tags))
        .route("/:plc/tags/:tag", get(get_tag))
        .route("/:plc/programs", get(list_programs))
        .route("/:plc/programs/:program/tags", get(list_program_tags))
        .route("/:plc/health", get(get_health))
        .route("/:plc/write", post(write_tag))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn summarize(manager: &Arc<PlcManager>, name: &str) -> Option<PlcSummary> {
    let plc = manager.plc(name).await?;
    let p = plc.read().await;
    Some(PlcSummary {
        name: p.config.name.clone(),
        address: p.config.address.clone(),
        slot: p.config.slot,
        status: p.status.to_string(),
        product_name: p.device_info.as_ref().map(|d| d.product_name.clone()),
        error: p.last_error.clone(),
    })
}

async fn list_plcs(State(state): State<ApiState>) -> Json<Vec<PlcSummary>> {
    let mut out = Vec::new();
    for name in state.manager.plc_names().await {
        if let Some(summary) = summarize(&state.manager, &name).await {
            out.push(summary);
        }
    }
    Json(out)
}

async fn get_plc(
    State(state): State<ApiState>,
    Path(plc): Path<String>,
) -> Result<Json<PlcSummary>, (StatusCode, Json<ErrorBody>)> {
    summarize(&state.manager, &plc)
        .await
        .map(Json)
        .ok_or_else(|| not_found(format!("unknown plc {}", plc)))
}

/// Map keyed "<plc>.<tag-or-alias>"; only enabled, non-no-REST tags.
async fn tag_map(
    state: &ApiState,
    plc_name: &str,
    program: Option<&str>,
) -> Option<HashMap<String, TagEntry>> {
    let plc = state.manager.plc(plc_name).await?;
    let p = plc.read().await;
    let mut out = HashMap::new();
    let prefix = program.map(|prog| format!("Program:{}.", prog));
    for sel in &p.selections {
        if sel.no_rest {
            continue;
        }
        if let Some(prefix) = &prefix {
            if !sel.name.starts_with(prefix.as_str()) {
                continue;
            }
        }
        let tv = p.values.get(&sel.name);
        let aliased = sel.alias != sel.name;
        out.insert(
            format!("{}.{}", plc_name, sel.alias),
            TagEntry {
                plc: plc_name.to_string(),
                name: sel.alias.clone(),
                memloc: aliased.then(|| sel.name.clone()),
                type_name: tv
                    .map(|v| v.tag_type.name().to_string())
                    .or_else(|| sel.type_hint.map(|t| t.name().to_string()))
                    .unwrap_or_default(),
                value: tv.and_then(|v| v.error.is_none().then(|| v.value.clone())),
                error: tv.and_then(|v| v.error.clone()),
            },
        );
    }
    Some(out)
}

async fn list_tags(
    State(state): State<ApiState>,
    Path(plc): Path<String>,
) -> Result<Json<HashMap<String, TagEntry>>, (StatusCode, Json<ErrorBody>)> {
    tag_map(&state, &plc, None)
        .await
        .map(Json)
        .ok_or_else(|| not_found(format!("unknown plc {}", plc)))
}

async fn get_tag(
    State(state): State<ApiState>,
    Path((plc, tag)): Path<(String, String)>,
) -> Result<Json<TagEntry>, (StatusCode, Json<ErrorBody>)> {
    let managed = state
        .manager
        .plc(&plc)
        .await
        .ok_or_else(|| not_found(format!("unknown plc {}", plc)))?;
    let p = managed.read().await;
    let sel = p
        .selection(&tag)
        .filter(|s| !s.no_rest)
        .ok_or_else(|| not_found(format!("unknown tag {}", tag)))?;
    let tv = p.values.get(&sel.name);
    let aliased = sel.alias != sel.name;
    Ok(Json(TagEntry {
        plc: plc.clone(),
        name: sel.alias.clone(),
        memloc: aliased.then(|| sel.name.clone()),
        type_name: tv
            .map(|v| v.tag_type.name().to_string())
            .or_else(|| sel.type_hint.map(|t| t.name().to_string()))
            .unwrap_or_default(),
        value: tv.and_then(|v| v.error.is_none().then(|| v.value.clone())),
        error: tv.and_then(|v| v.error.clone()),
    }))
}

async fn list_programs(
    State(state): State<ApiState>,
    Path(plc): Path<String>,
) -> Result<Json<Vec<String>>, (StatusCode, Json<ErrorBody>)> {
    let managed = state
        .manager
        .plc(&plc)
        .await
        .ok_or_else(|| not_found(format!("unknown plc {}", plc)))?;
    let p = managed.read().await;
    if !drivers::family_supports_discovery(p.config.family) {
        return Err(not_found(format!(
            "plc {} does not support program discovery",
            plc
        )));
    }
    Ok(Json(p.programs.clone()))
}

async fn list_program_tags(
    State(state): State<ApiState>,
    Path((plc, program)): Path<(String, String)>,
) -> Result<Json<HashMap<String, TagEntry>>, (StatusCode, Json<ErrorBody>)> {
    tag_map(&state, &plc, Some(&program))
        .await
        .map(Json)
        .ok_or_else(|| not_found(format!("unknown plc {}", plc)))
}

async fn get_health(
    State(state): State<ApiState>,
    Path(plc): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    state
        .manager
        .health(&plc)
        .await
        .map(Json)
        .ok_or_else(|| not_found(format!("unknown plc {}", plc)))
}

async fn write_tag(
    State(state): State<ApiState>,
    Path(plc): Path<String>,
    Json(request): Json<WriteRequest>,
) -> impl IntoResponse {
    info!(plc = %plc, tag = %request.tag, "rest write request");
    let (response, outcome) = state
        .executor
        .execute(state.gateway.as_ref(), &request, Some(&plc))
        .await;
    let code = match outcome {
        WriteOutcome::Success => StatusCode::OK,
        WriteOutcome::BadRequest => StatusCode::BAD_REQUEST,
        WriteOutcome::UnknownTag => StatusCode::NOT_FOUND,
        WriteOutcome::NotWritable => StatusCode::FORBIDDEN,
        WriteOutcome::Disconnected => StatusCode::SERVICE_UNAVAILABLE,
        WriteOutcome::Failed | WriteOutcome::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(response))
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    #[serde(default)]
    types: Option<String>,
    #[serde(default)]
    plc: Option<String>,
    #[serde(default)]
    plcs: Option<String>,
    #[serde(default)]
    tags: Option<String>,
}

fn comma_set(raw: &str) -> Option<HashSet<String>> {
    let set: HashSet<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!set.is_empty()).then_some(set)
}

async fn events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let mut filter = EventFilter::default();
    if let Some(types) = query.types.as_deref() {
        filter.types = comma_set(types);
    }
    let mut plcs = query
        .plcs
        .as_deref()
        .and_then(comma_set)
        .unwrap_or_default();
    if let Some(plc) = query.plc {
        if !plc.is_empty() {
            plcs.insert(plc);
        }
    }
    if !plcs.is_empty() {
        filter.plcs = Some(plcs);
    }
    if let Some(tags) = query.tags.as_deref() {
        filter.tags = comma_set(tags);
    }
    let stream = ClientStream::new(Arc::clone(&state.hub), filter).map(|event| {
        Ok(Event::default()
            .event(event.kind)
            .data(event.payload.to_string()))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEPALIVE)
            .text("keepalive"),
    )
}
