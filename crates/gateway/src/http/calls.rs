//! The three invocation surfaces and the retrieval endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use bolt_contracts::{ApiError, CallType, ErrorKind, Payload, NO_CACHE_HEADER};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use super::gate::AuthedGroup;
use super::{output_error, output_request};
use crate::engine::Engine;
use crate::metrics;
use crate::pipeline::{process_call, Responder};

pub async fn handle_work(
    State(engine): State<Arc<Engine>>,
    Path(call): Path<String>,
    Extension(AuthedGroup(group)): Extension<AuthedGroup>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_call(engine, CallType::Work, call, group, headers, body).await
}

pub async fn handle_task(
    State(engine): State<Arc<Engine>>,
    Path(call): Path<String>,
    Extension(AuthedGroup(group)): Extension<AuthedGroup>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_call(engine, CallType::Task, call, group, headers, body).await
}

pub async fn handle_request(
    State(engine): State<Arc<Engine>>,
    Path(call): Path<String>,
    Extension(AuthedGroup(group)): Extension<AuthedGroup>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_call(engine, CallType::Request, call, group, headers, body).await
}

/// Preps and performs queueing, validation, and processing for an API call.
async fn handle_call(
    engine: Arc<Engine>,
    call_type: CallType,
    call_name: String,
    group: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if engine.is_shutdown() {
        return output_error(&ApiError::new(
            "shutdown",
            "Engine restarting, please try again",
            "",
            ErrorKind::Internal,
        ));
    }
    if !engine.broker.is_connected() {
        return output_error(&ApiError::new(
            "maintenance",
            "Engine temporarily unavailable, please try again",
            "",
            ErrorKind::Internal,
        ));
    }

    let input: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            tracing::debug!(cmd = %call_name, "request_malformed");
            return output_error(&ApiError::new(
                "request",
                "Malformed request. API call name or payload could not be processed",
                format!("{call_name}:{}", String::from_utf8_lossy(&body)),
                ErrorKind::Request,
            ));
        }
    };

    let Some(api_call) = engine.api_call(&call_name) else {
        tracing::debug!(cmd = %call_name, "request_unknown_apicall");
        return output_error(&ApiError::new(
            "request",
            "Unknown API Call",
            call_name,
            ErrorKind::Request,
        ));
    };

    let proc = engine
        .registry
        .create(call_type, &call_name, api_call, Payload::empty(), &group, "")
        .await;

    let id = proc.id.clone();
    proc.with_payload_mut(|p| {
        p.set("call_in", json!(Utc::now().to_rfc3339()));
        p.set("id", json!(id));
    })
    .await;
    proc.set_initial_input(&input).await;

    tracing::info!(id = %proc.id, call = %call_name, group = %group, "call_in");
    metrics::inc_call_in(&call_name);

    // Cache probe, unless the caller opted out for this request.
    if headers.contains_key(NO_CACHE_HEADER) {
        metrics::inc_cache_event("override");
    } else if let Some(cached) = engine
        .cache
        .get(&call_name, &proc.initial_input_string().await)
        .await
    {
        match serde_json::from_str::<Value>(&cached) {
            Err(_) => {
                engine
                    .cache
                    .delete(&call_name, &proc.initial_input_string().await)
                    .await;
                tracing::warn!(id = %proc.id, command = %call_name, "cache_error");
            }
            Ok(return_value) => {
                metrics::inc_cache_event("hit");
                proc.set_complete().await;
                proc.with_payload_mut(|p| {
                    p.set("complete", json!(true));
                    p.set("return_value", return_value);
                    p.set("cached", json!(true));
                })
                .await;

                // Work calls keep their no-id output shape even on a hit.
                let response = if call_type == CallType::Work {
                    id_response(None)
                } else {
                    output_request(&engine, &proc).await
                };
                engine.registry.remove(&proc.id).await;
                tracing::info!(id = %proc.id, command = %call_name, cached = true, "call_out");
                return response;
            }
        }
    } else if engine.cache.enabled() {
        metrics::inc_cache_event("miss");
    }

    match call_type {
        CallType::Request => {
            let (tx, rx) = oneshot::channel();
            tokio::spawn(process_call(engine.clone(), proc.clone(), Responder::new(tx)));
            // Woken at completion, at a timeout annotation, or at a
            // return-after step; the payload carries whichever state is
            // current.
            let _ = rx.await;

            let complete = proc.is_complete().await;
            proc.with_payload_mut(|p| p.set("complete", json!(complete))).await;
            let response = output_request(&engine, &proc).await;
            tracing::info!(id = %proc.id, command = %proc.initial_command, "call_out");
            if complete {
                engine.registry.remove(&proc.id).await;
            }
            response
        }
        CallType::Task => {
            tokio::spawn(process_call(engine.clone(), proc.clone(), Responder::none()));
            id_response(Some(&proc.id))
        }
        CallType::Work => {
            tokio::spawn(process_call(engine.clone(), proc.clone(), Responder::none()));
            id_response(None)
        }
    }
}

/// Returns the current state of a request by id. `peek` removes the entry
/// only once complete, `fetch` removes it unconditionally, `status` returns
/// engine metadata without the payload.
pub async fn handle_retr(
    State(engine): State<Arc<Engine>>,
    Path((op, id)): Path<(String, String)>,
) -> Response {
    let Some(proc) = engine.registry.get(&id).await else {
        return output_error(&ApiError::new(
            "retr",
            "Invalid request ID",
            id,
            ErrorKind::Request,
        ));
    };

    proc.update_peek_time().await;
    let complete = proc.is_complete().await;
    proc.with_payload_mut(|p| p.set("complete", json!(complete))).await;

    match op.as_str() {
        "fetch" => {
            let response = output_request(&engine, &proc).await;
            tracing::info!(id = %proc.id, command = %proc.initial_command, "call_out");
            engine.registry.remove(&id).await;
            response
        }
        "status" => {
            tracing::info!(id = %proc.id, command = %proc.initial_command, "status_call");
            let status = proc.status().await;
            let body = serde_json::to_string_pretty(&status)
                .unwrap_or_else(|_| "{}".to_string());
            ([(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        _ => {
            tracing::info!(id = %proc.id, command = %proc.initial_command, "peek_call");
            let response = output_request(&engine, &proc).await;
            if complete {
                engine.registry.remove(&id).await;
            }
            response
        }
    }
}

fn id_response(id: Option<&str>) -> Response {
    let body = match id {
        Some(id) => json!({"id": id}),
        None => json!({"id": null}),
    };
    (
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
