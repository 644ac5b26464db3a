//! Introspection endpoints: connectivity checks, stats, pending requests,
//! config access, and the documentation data surfaces.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bolt_contracts::{ApiError, ErrorKind};
use serde_json::{json, Map};

use super::output_error;
use crate::engine::Engine;
use crate::metrics;

pub async fn handle_test() -> Response {
    ([(header::CONTENT_TYPE, "application/json")], "{\"test\": 1}").into_response()
}

pub async fn handle_echo(uri: Uri) -> Response {
    let body = json!({"echo": uri.to_string()}).to_string();
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

pub async fn handle_time() -> Response {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "application/json")],
        format!("{{\"time\": {nanos}}}"),
    )
        .into_response()
}

pub async fn handle_stats(State(engine): State<Arc<Engine>>) -> Response {
    metrics::set_pending_requests(engine.registry.count().await);
    match metrics::render() {
        Ok((body, content_type)) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "stats_render_failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn handle_pending(State(engine): State<Arc<Engine>>) -> Response {
    let status = engine.registry.status().await;
    let body = serde_json::to_string_pretty(&status).unwrap_or_else(|_| "[]".to_string());
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

pub async fn handle_get_config(State(engine): State<Arc<Engine>>) -> Response {
    match serde_json::to_string(&*engine.config) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(_) => output_error(&ApiError::new(
            "get-config",
            "Invalid config, couldn't convert to JSON",
            "",
            ErrorKind::Internal,
        )),
    }
}

/// Persists the posted config and shuts the engine down; the supervising
/// process manager restarts it against the new file.
pub async fn handle_save_config(State(engine): State<Arc<Engine>>, body: Bytes) -> Response {
    if let Err(err) = write_config(&engine, &body) {
        // Deliberately vague toward the client; the log carries the cause.
        tracing::error!(path = %engine.config_path.display(), error = %err, "save_config_failed");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    tracing::info!(path = %engine.config_path.display(), "saved new config file");
    engine.begin_shutdown();
    (StatusCode::ACCEPTED, "Accepted").into_response()
}

fn write_config(engine: &Engine, body: &[u8]) -> std::io::Result<()> {
    std::fs::write(&engine.config_path, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&engine.config_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// The command-list documentation data: every API call and command meta with
/// descriptions and required params.
pub async fn handle_docs(State(engine): State<Arc<Engine>>) -> Response {
    if !engine.config.engine.docs_enabled {
        return (StatusCode::OK, "Docs disabled").into_response();
    }

    let mut api_calls = Map::new();
    for (name, call) in &engine.config.api_calls {
        api_calls.insert(
            name.clone(),
            json!({
                "shortDescription": call.short_description,
                "longDescription": call.long_description,
                "requiredParams": call.required_params,
                "resultTimeoutMs": call.result_timeout_ms,
                "cache": {"enabled": call.cache.enabled},
                "commands": call.commands.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
            }),
        );
    }

    let mut command_meta = Map::new();
    for (name, meta) in &engine.config.command_meta {
        command_meta.insert(
            name.clone(),
            json!({
                "shortDescription": meta.short_description,
                "longDescription": meta.long_description,
                "requiredParams": meta.required_params,
            }),
        );
    }

    let body = json!({"apiCalls": api_calls, "commandMeta": command_meta}).to_string();
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// Per-call documentation data for the debug form.
pub async fn handle_form(State(engine): State<Arc<Engine>>, Path(call): Path<String>) -> Response {
    if !engine.config.engine.advanced.debug_form_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some(api_call) = engine.api_call(&call) else {
        let body = json!({"apiCall": null, "error": "Unknown API Call"}).to_string();
        return ([(header::CONTENT_TYPE, "application/json")], body).into_response();
    };

    let body = json!({
        "apiCall": call,
        "shortDescription": api_call.short_description,
        "longDescription": api_call.long_description,
        "requiredParams": api_call.required_params,
        "resultTimeoutMs": api_call.result_timeout_ms,
        "commands": api_call.commands.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
    })
    .to_string();
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

pub async fn handle_debug_log(State(engine): State<Arc<Engine>>) -> Response {
    let path = &engine.config.logging.fs_debug_path;
    let contents = if path.is_empty() {
        String::new()
    } else {
        std::fs::read_to_string(path).unwrap_or_default()
    };
    ([(header::CONTENT_TYPE, "text/plain")], contents).into_response()
}

pub async fn handle_engine_reboot(State(engine): State<Arc<Engine>>) -> Response {
    tracing::info!("engine reboot requested");
    engine.begin_shutdown();
    StatusCode::OK.into_response()
}
