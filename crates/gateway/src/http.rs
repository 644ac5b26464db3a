//! HTTP ingress: routing to the three invocation surfaces, the retrieval and
//! introspection endpoints, and the policy gate every request passes through.

use std::sync::Arc;

use axum::http::header;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bolt_contracts::ApiError;

use crate::engine::Engine;
use crate::process::CommandProcess;

mod calls;
mod gate;
mod introspect;

pub use gate::AuthedGroup;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        // connectivity check for client devs, no auth
        .route("/test", get(introspect::handle_test).post(introspect::handle_test))
        .route("/docs", get(introspect::handle_docs))
        .route("/form/{*call}", get(introspect::handle_form))
        .route("/echo/{*rest}", get(introspect::handle_echo).post(introspect::handle_echo))
        .route("/time", get(introspect::handle_time))
        .route("/stats", get(introspect::handle_stats))
        .route("/pending", get(introspect::handle_pending))
        .route("/get-config", get(introspect::handle_get_config))
        .route("/save-config", post(introspect::handle_save_config))
        .route("/debug-log", get(introspect::handle_debug_log))
        .route(
            "/engine-reboot",
            get(introspect::handle_engine_reboot).post(introspect::handle_engine_reboot),
        )
        .route("/work/{*call}", post(calls::handle_work).get(calls::handle_work))
        .route("/task/{*call}", post(calls::handle_task).get(calls::handle_task))
        .route(
            "/request/{*call}",
            post(calls::handle_request).get(calls::handle_request),
        )
        .route("/retr/{op}/{id}", get(calls::handle_retr).post(calls::handle_retr))
        .layer(middleware::from_fn_with_state(engine.clone(), gate::policy_gate))
        .with_state(engine)
}

/// Writes a bare error document (compact, regardless of prettyOutput).
fn output_error(error: &ApiError) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        error.to_payload().to_compact_string(),
    )
        .into_response()
}

/// Writes a call's payload, applying the call's filter keys and the
/// configured output formatting. The registry copy is unaffected.
async fn output_request(engine: &Engine, proc: &CommandProcess) -> Response {
    let payload = proc.payload_snapshot().await;
    let filtered = payload.filtered(proc.api_call.filter_keys.as_deref());
    let body = if engine.config.engine.pretty_output {
        serde_json::to_string_pretty(&filtered).unwrap_or_else(|_| filtered.to_string())
    } else {
        filtered.to_string()
    };
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}
