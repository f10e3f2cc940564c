//! Request handlers.

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use polystep_engine::Engine;
use polystep_engine::observability::{Trace, TraceGroup};
use polystep_types::{ItemsQuery, LogEntry, StateEntry, StateFilter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ApiError;

const DEFAULT_LOG_LIMIT: usize = 100;

pub(crate) fn router(engine: Engine) -> Router {
    Router::new()
        .route("/state", get(list_state).post(set_state))
        .route("/state/delete", post(delete_state))
        .route("/emit", post(emit))
        .route("/traces", get(list_trace_groups))
        .route("/traces/{trace_id}", get(list_traces))
        .route("/trace/clear", post(clear_traces))
        .route("/logs", get(list_logs))
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateListQuery {
    group_id: Option<String>,
    /// JSON-encoded list of filters.
    filter: Option<String>,
}

async fn list_state(
    State(engine): State<Engine>,
    Query(query): Query<StateListQuery>,
) -> Result<Json<Vec<StateEntry>>, ApiError> {
    let filter = query
        .filter
        .as_deref()
        .map(serde_json::from_str::<Vec<StateFilter>>)
        .transpose()
        .map_err(|error| ApiError::bad_request(format!("Invalid filter: {error}")))?;
    let items = engine
        .state()
        .items(&ItemsQuery {
            group_id: query.group_id,
            filter,
        })
        .await?;
    Ok(Json(items))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetStateBody {
    key: String,
    group_id: String,
    #[serde(default)]
    value: Value,
}

async fn set_state(State(engine): State<Engine>, Json(body): Json<SetStateBody>) -> Result<Json<SetStateBody>, ApiError> {
    let value = engine.state().set(&body.group_id, &body.key, body.value).await?;
    Ok(Json(SetStateBody { value, ..body }))
}

#[derive(Debug, Deserialize)]
struct DeleteStateBody {
    /// `groupId:key` pairs.
    ids: Vec<String>,
}

async fn delete_state(State(engine): State<Engine>, Json(body): Json<DeleteStateBody>) -> Result<StatusCode, ApiError> {
    let targets = body
        .ids
        .iter()
        .map(|id| {
            id.split_once(':')
                .ok_or_else(|| ApiError::bad_request(format!("Invalid state id '{id}', expected groupId:key")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let state = engine.state();
    for (group_id, key) in targets {
        state.delete(group_id, key).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EmitBody {
    topic: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    flows: Vec<String>,
}

async fn emit(State(engine): State<Engine>, Json(body): Json<EmitBody>) -> Json<Value> {
    let trace = engine.trigger(body.topic, body.data, body.flows);
    debug!(trace_id = %trace.trace_id, "Event accepted over HTTP");
    Json(json!({"traceId": trace.trace_id}))
}

async fn list_trace_groups(State(engine): State<Engine>) -> Json<Vec<TraceGroup>> {
    Json(engine.trace_store().map(|store| store.groups()).unwrap_or_default())
}

async fn list_traces(State(engine): State<Engine>, Path(trace_id): Path<String>) -> Result<Json<Vec<Trace>>, ApiError> {
    engine
        .trace_store()
        .and_then(|store| store.traces(&trace_id))
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Trace '{trace_id}' not found")))
}

async fn clear_traces(State(engine): State<Engine>) -> Json<Value> {
    engine.tracer_factory().clear();
    Json(json!({"message": "Traces cleared"}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    trace_id: Option<String>,
    limit: Option<usize>,
}

async fn list_logs(State(engine): State<Engine>, Query(query): Query<LogsQuery>) -> Json<Vec<LogEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let collector = engine.collector();
    let entries = match query.trace_id {
        Some(trace_id) => collector.for_trace(&trace_id, limit),
        None => collector.recent(limit),
    };
    Json(entries)
}
