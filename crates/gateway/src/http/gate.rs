//! The policy gate every request passes through before reaching a handler:
//! CORS, basic-auth extraction, handler-level access rules, per-group
//! throttling, and the configured auth mode (shared key or HMAC envelope).

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bolt_auth::AuthMode;
use bolt_contracts::config::HandlerAccess;

use crate::engine::Engine;
use crate::metrics;
use crate::rate_limit::RateLimiter;

/// The caller's security group, extracted from basic auth and injected for
/// the admitted handler.
#[derive(Debug, Clone, Default)]
pub struct AuthedGroup(pub String);

const CALL_ROUTE_FLAGS: [&str; 4] = ["/request/", "/task/", "/work/", "/form/"];

pub async fn policy_gate(
    State(engine): State<Arc<Engine>>,
    request: Request,
    next: Next,
) -> Response {
    metrics::inc_requests_in();

    let path = request.uri().path().to_string();
    let method = request.method().clone();

    // CORS, honoring trailing-wildcard domains. OPTIONS terminates here.
    let mut cors_headers = HeaderMap::new();
    if let Some(origin) = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
    {
        if !origin_allowed(&origin, &engine.config.security.cors_domains) {
            tracing::info!(origin = %origin, url = %path, "cors_error");
            return StatusCode::PRECONDITION_FAILED.into_response();
        }
        if let Ok(value) = HeaderValue::from_str(&origin) {
            cors_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        cors_headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        cors_headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Authorization, Bolt-No-Cache"),
        );
        cors_headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("OPTIONS, GET, POST"),
        );
    }
    if method == Method::OPTIONS {
        return with_headers(StatusCode::OK.into_response(), cors_headers);
    }

    // The username half of basic auth is the group name; the password is
    // interpreted by the auth mode.
    let credentials = basic_auth(request.headers());
    let group = credentials
        .as_ref()
        .map(|(group, _)| group.clone())
        .unwrap_or_default();

    let require_auth = requires_auth(&path);
    let mut authed = true;

    if require_auth {
        let api_call = extract_call_name(&path).unwrap_or_default();
        if !handler_allowed(
            &group,
            &path,
            api_call,
            &engine.config.security.handler_access,
        ) {
            authed = false;
        }
    }

    // Throttle by group before any key checks.
    let limit = RateLimiter::limit_for(&group, &engine.config.security.groups);
    if authed && limit > 0 && !engine.throttle.allow(&group, limit) {
        tracing::warn!(group = %group, requests_per_second = limit, "throttled");
        metrics::inc_throttled(&group);
        return with_headers(StatusCode::TOO_MANY_REQUESTS.into_response(), cors_headers);
    }

    let mut group_key = String::new();
    if authed && credentials.is_some() {
        match bolt_auth::key_for_group(&group, &engine.config.security.groups) {
            Ok(key) => group_key = key.to_string(),
            Err(err) => {
                authed = false;
                tracing::warn!(group = %group, error = %err, "group_not_found");
            }
        }
    }

    let mut request = request;
    if authed {
        match (&credentials, engine.auth_mode) {
            (None, _) => {
                authed = false;
            }
            (Some((_, password)), AuthMode::Simple) => {
                // Empty passwords are permitted but still authed.
                if password != &group_key && !password.is_empty() {
                    authed = false;
                    tracing::warn!(group = %group, url = %path, "simple_auth_key_mismatch");
                } else if method == Method::GET && require_auth {
                    // GET is translated into POST with the payload query
                    // parameter as the body.
                    request = get_to_post(request);
                }
            }
            (Some(_), AuthMode::Hmac) => {
                if require_auth {
                    match open_envelope(&engine, &group_key, request).await {
                        Ok(opened) => request = opened,
                        Err(failed) => {
                            request = failed;
                            authed = false;
                        }
                    }
                }
            }
        }
    }

    if require_auth && !authed {
        metrics::inc_auth_failure();
        tracing::warn!(group = %group, url = %path, "auth_fail");
        let mut response = StatusCode::UNAUTHORIZED.into_response();
        if credentials.is_none() && engine.auth_mode == AuthMode::Simple {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"BoltEngine\""),
            );
        }
        return with_headers(response, cors_headers);
    }

    request.extensions_mut().insert(AuthedGroup(group));
    let response = next.run(request).await;
    with_headers(response, cors_headers)
}

/// Buffers the body, verifies the HMAC envelope, and rebuilds the request
/// around the inner message. On failure the request is returned with an
/// empty body and the caller rejects it.
async fn open_envelope(
    engine: &Engine,
    group_key: &str,
    request: Request,
) -> Result<Request, Request> {
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return Err(Request::from_parts(parts, Body::empty())),
    };

    match bolt_auth::decode_hmac(group_key, &bytes, engine.config.security.verify_timeout) {
        Ok(message) => Ok(Request::from_parts(parts, Body::from(message))),
        Err(err) => {
            tracing::warn!(url = %parts.uri, error = %err, "hmac_decode_failed");
            Err(Request::from_parts(parts, Body::empty()))
        }
    }
}

/// Simple-mode GET support: the `payload` query parameter becomes the body
/// of a simulated POST.
fn get_to_post(request: Request) -> Request {
    let (mut parts, _) = request.into_parts();
    let payload = parts
        .uri
        .query()
        .and_then(|query| query_param(query, "payload"))
        .unwrap_or_default();
    parts.method = Method::POST;
    Request::from_parts(parts, Body::from(payload))
}

fn with_headers(mut response: Response, headers: HeaderMap) -> Response {
    for (name, value) in headers.iter() {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response
}

/// Everything except the connectivity check and the documentation surfaces
/// runs the access/auth gates.
fn requires_auth(path: &str) -> bool {
    !(path == "/test" || path == "/docs" || path.starts_with("/form/"))
}

/// Pulls the API call name out of an invocation-surface URL.
pub(super) fn extract_call_name(path: &str) -> Option<&str> {
    CALL_ROUTE_FLAGS
        .iter()
        .find_map(|flag| path.strip_prefix(flag))
}

/// True when the origin matches the configured CORS list, honoring
/// trailing-wildcard entries: a domain containing `*` matches any origin
/// containing the substring before the `*`.
fn origin_allowed(origin: &str, domains: &[String]) -> bool {
    for domain in domains {
        if domain == origin {
            return true;
        }
        if let Some((prefix, _)) = domain.split_once('*') {
            if origin.contains(prefix) {
                return true;
            }
        }
    }
    false
}

/// Applies the configured handler-access rules. A rule matches on the URL
/// suffix or the API call name; deny wins over allow; a present allow list
/// admits only listed groups; absent rules allow by default.
fn handler_allowed(group: &str, url: &str, api_call: &str, rules: &[HandlerAccess]) -> bool {
    for rule in rules {
        let matches = (!rule.api_call.is_empty() && rule.api_call == api_call)
            || (!rule.handler_url.is_empty() && url.ends_with(&rule.handler_url));
        if !matches {
            continue;
        }

        if !rule.deny_groups.is_empty() && group.is_empty() {
            tracing::warn!(url = %url, "handler_access_missing_groupname");
            return false;
        }
        if rule.deny_groups.iter().any(|denied| denied == group) {
            tracing::warn!(group = %group, url = %url, "handler_access_denied");
            return false;
        }
        if !rule.allow_groups.is_empty() {
            if rule.allow_groups.iter().any(|allowed| allowed == group) {
                return true;
            }
            tracing::warn!(group = %group, url = %url, "handler_access_not_allowed");
            return false;
        }
    }
    true
}

fn basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));
    Some((user.to_string(), password.to_string()))
}

fn query_param(query: &str, name: &str) -> Option<String> {
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            return Some(form_decode(value));
        }
    }
    None
}

fn form_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
