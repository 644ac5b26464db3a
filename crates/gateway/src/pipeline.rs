//! The per-call pipeline: publishes each configured command to the broker,
//! awaits the correlated worker reply, merges it into the payload, and walks
//! the command list until completion.
//!
//! The original recursive "re-enter the loop after timeout" shape is
//! flattened into one loop with explicit state: `skip_timeouts` survives a
//! timeout annotation, the overall call timer is armed once, and the zombie
//! timer is authoritative.

use std::sync::Arc;
use std::time::Duration;

use bolt_contracts::{ApiError, CallType, ErrorKind, Payload, HALT_CALL};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::broker::ReplyQueue;
use crate::engine::Engine;
use crate::metrics;
use crate::process::CommandProcess;

/// Wakes the waiting request handler (if any) the first time the call has
/// something to say: a preliminary return-after result, a timeout
/// annotation, or completion.
pub struct Responder(Option<oneshot::Sender<()>>);

impl Responder {
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(Some(tx))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn signal(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// Validates and executes an admitted call. Runs on its own task for Task and
/// Work invocations; Request handlers await the responder.
pub async fn process_call(engine: Arc<Engine>, proc: Arc<CommandProcess>, mut responder: Responder) {
    let required = proc.api_call.required_params.clone();
    let validation = proc.with_payload(|p| p.check_required_params(&required)).await;
    if let Err(reason) = validation {
        tracing::info!(id = %proc.id, api_call = %proc.initial_command, reason = %reason, "validation");
        attach_error(
            &proc,
            ApiError::new(
                "validation",
                "Error validating required parameters",
                &proc.initial_command,
                ErrorKind::Request,
            ),
        )
        .await;
        proc.set_complete().await;
        responder.signal();
        return;
    }

    // An empty command list just completes.
    if proc.api_call.commands.is_empty() {
        proc.set_complete().await;
        responder.signal();
        return;
    }

    let worker_config = engine.config.worker_config.clone();
    if worker_config.is_object() {
        proc.with_payload_mut(|p| p.set("config", worker_config)).await;
    }

    let reply = match engine.broker.open_reply_queue().await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::error!(id = %proc.id, error = %err, "mq_error");
            attach_error(
                &proc,
                ApiError::new(
                    "mq",
                    "Error creating MQ queue",
                    &proc.initial_command,
                    ErrorKind::Internal,
                ),
            )
            .await;
            proc.set_complete().await;
            responder.signal();
            return;
        }
    };

    run_commands(engine, proc, reply, responder).await;
}

async fn run_commands(
    engine: Arc<Engine>,
    proc: Arc<CommandProcess>,
    mut reply: ReplyQueue,
    mut responder: Responder,
) {
    let prefix = engine.queue_prefix().to_string();
    let call = proc.api_call.clone();

    // The overall call timer is armed once, at the first await.
    let call_deadline =
        (!call.result_timeout.is_zero()).then(|| Instant::now() + call.result_timeout);
    let mut call_timer_armed = call_deadline.is_some();
    let mut skip_timeouts = false;

    loop {
        // publishing
        let index = proc.current_command_index().await;
        let Some(command) = call.commands.get(index).cloned() else {
            break;
        };

        if let Err(reason) = proc.with_payload(|p| p.check_structure()).await {
            tracing::info!(id = %proc.id, command = %command.name, reason = %reason, "validation");
            attach_error(
                &proc,
                ApiError::new(
                    "validation",
                    "Error validating required parameters",
                    &proc.initial_command,
                    ErrorKind::Request,
                ),
            )
            .await;
            complete(&engine, &proc, reply, &mut responder, false).await;
            return;
        }

        let redirect = {
            let next = proc.next_command().await;
            (!next.is_empty()).then_some(next)
        };
        let target = redirect.clone().unwrap_or_else(|| command.name.clone());

        if let Some(meta) = engine.config.command_meta.get(&target) {
            let checked = proc
                .with_payload(|p| p.check_required_params(&meta.required_params))
                .await;
            if let Err(reason) = checked {
                tracing::info!(id = %proc.id, command = %target, reason = %reason, "validation");
                attach_error(
                    &proc,
                    ApiError::new(
                        "validation",
                        "Error validating required parameters",
                        &proc.initial_command,
                        ErrorKind::Request,
                    ),
                )
                .await;
                complete(&engine, &proc, reply, &mut responder, false).await;
                return;
            }
        }

        // Redirects are published as-is; configured commands attach their
        // config params first.
        if redirect.is_none() {
            let params = command.config_params.clone();
            proc.with_payload_mut(|p| p.set("params", params)).await;
        }
        if engine.trace_enabled() {
            proc.add_trace_entry().await;
        }
        if redirect.is_some() {
            proc.set_next_command("").await;
            tracing::debug!(id = %proc.id, next = %target, "cmd_queued_next");
        } else {
            tracing::debug!(id = %proc.id, command = %target, "cmd_queued");
        }

        let body = proc.payload_snapshot().await.to_compact_string();
        let routing_key = format!("{prefix}{target}");
        let published = engine
            .broker
            .publish(&routing_key, body.as_bytes(), &proc.id, &reply.name)
            .await;
        proc.mark_command_published().await;
        if let Err(err) = published {
            tracing::error!(id = %proc.id, command = %target, error = %err, "mq_error");
            attach_error(
                &proc,
                ApiError::new(
                    "mq",
                    format!("Internal error: {err}"),
                    &command.name,
                    ErrorKind::Internal,
                ),
            )
            .await;
            complete(&engine, &proc, reply, &mut responder, false).await;
            return;
        }

        // awaiting
        let delivery = loop {
            let command_timeout =
                (!skip_timeouts && !command.result_timeout.is_zero()).then_some(command.result_timeout);
            let zombie_timeout = (!call.result_zombie.is_zero()).then_some(call.result_zombie);
            let overall = (call_timer_armed && !skip_timeouts)
                .then_some(call_deadline)
                .flatten();

            tokio::select! {
                _ = maybe_sleep(zombie_timeout) => {
                    tracing::warn!(id = %proc.id, command = %command.name, api_call = %proc.initial_command, "call_zombie");
                    metrics::inc_zombie(&proc.initial_command);
                    attach_error(
                        &proc,
                        ApiError::new(
                            &command.name,
                            "API Call zombie time limit reached, retry request and contact sysadmin if issue persists",
                            &proc.initial_command,
                            ErrorKind::Zombie,
                        ),
                    )
                    .await;
                    complete(&engine, &proc, reply, &mut responder, false).await;
                    return;
                }
                _ = maybe_sleep(command_timeout) => {
                    // Non-fatal: a later successful reply replaces the
                    // payload and with it this annotation.
                    tracing::info!(id = %proc.id, command = %command.name, api_call = %proc.initial_command, "command_timeout");
                    metrics::inc_command_timeout(&command.name);
                    attach_error(
                        &proc,
                        ApiError::new(
                            &command.name,
                            "Command timeout, use id to fetch result",
                            &proc.initial_command,
                            ErrorKind::Timeout,
                        ),
                    )
                    .await;
                    responder.signal();
                    skip_timeouts = true;
                }
                _ = maybe_sleep_until(overall) => {
                    tracing::info!(id = %proc.id, api_call = %proc.initial_command, "call_timeout");
                    metrics::inc_call_timeout(&proc.initial_command);
                    attach_error(
                        &proc,
                        ApiError::new(
                            &proc.initial_command,
                            "API Call timeout, use id to fetch result",
                            &proc.initial_command,
                            ErrorKind::Timeout,
                        ),
                    )
                    .await;
                    responder.signal();
                    skip_timeouts = true;
                    call_timer_armed = false;
                }
                delivery = reply.next() => break delivery,
            }
        };

        let Some(delivery) = delivery else {
            attach_error(
                &proc,
                ApiError::new("mq", "Reply channel closed", &command.name, ErrorKind::Internal),
            )
            .await;
            complete(&engine, &proc, reply, &mut responder, false).await;
            return;
        };

        tracing::debug!(
            id = %proc.id,
            correlation_id = %delivery.correlation_id,
            command = %command.name,
            "cmd_complete",
        );

        let parsed = match Payload::parse(&delivery.body) {
            Ok(parsed) => parsed,
            Err(err) => {
                attach_error(
                    &proc,
                    ApiError::new(
                        &command.name,
                        format!("Command error: {err}"),
                        &proc.initial_command,
                        ErrorKind::Request,
                    ),
                )
                .await;
                complete(&engine, &proc, reply, &mut responder, false).await;
                return;
            }
        };
        proc.replace_payload(parsed).await;

        match proc.with_payload(|p| p.next_command()).await {
            Some(next) => {
                proc.with_payload_mut(|p| p.clear_next_command()).await;
                if next == HALT_CALL {
                    metrics::inc_halt(&command.name);
                    tracing::info!(id = %proc.id, last_command = %command.name, "call_halt");
                    complete(&engine, &proc, reply, &mut responder, true).await;
                    return;
                }
                tracing::debug!(id = %proc.id, next = %next, "cmd_found_next");
                proc.set_next_command(&next).await;
            }
            None if index >= call.commands.len() - 1 => {
                tracing::debug!(id = %proc.id, api_call = %proc.initial_command, "cmd_last_complete");
                let is_work = proc.call_type == CallType::Work;
                complete(&engine, &proc, reply, &mut responder, true).await;
                if is_work {
                    engine.registry.remove(&proc.id).await;
                }
                return;
            }
            None if command.return_after => {
                // Return the preliminary result now, keep processing.
                tracing::debug!(id = %proc.id, command = %command.name, "cmd_return_after");
                responder.signal();
                proc.advance_command().await;
                skip_timeouts = true;
                cache_result(&engine, &proc).await;
            }
            None => {
                proc.advance_command().await;
            }
        }
    }

    complete(&engine, &proc, reply, &mut responder, true).await;
}

/// Tears down the reply queue (deleting it broker-side), marks the process
/// complete, optionally persists the result, and wakes the handler.
async fn complete(
    engine: &Engine,
    proc: &Arc<CommandProcess>,
    reply: ReplyQueue,
    responder: &mut Responder,
    cache: bool,
) {
    drop(reply);
    proc.set_complete().await;
    if cache {
        cache_result(engine, proc).await;
    }
    responder.signal();
}

/// Persists the `return_value` subtree under the call's fingerprint when
/// caching is enabled for the call.
async fn cache_result(engine: &Engine, proc: &CommandProcess) {
    if !engine.cache.enabled() || !proc.api_call.cache.enabled {
        return;
    }
    let input = proc.initial_input_string().await;
    let value = proc
        .with_payload(|p| p.get("return_value").cloned().unwrap_or(Value::Null))
        .await;
    engine
        .cache
        .set(
            &proc.initial_command,
            &input,
            &value.to_string(),
            proc.api_call.cache.expiration_time,
        )
        .await;
    tracing::info!(id = %proc.id, command = %proc.initial_command, input = %input, "cache_set");
}

async fn attach_error(proc: &CommandProcess, error: ApiError) {
    proc.with_payload_mut(|p| error.apply_to(p)).await;
}

async fn maybe_sleep(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use serde_json::json;

    use crate::broker::testing::MemoryBroker;
    use crate::cache::ResultCache;
    use crate::config::from_overlaid_value;

    fn test_engine(
        api_calls: Value,
        broker: Arc<MemoryBroker>,
        cache: ResultCache,
    ) -> Arc<Engine> {
        let config = from_overlaid_value(json!({
            "engine": {
                "bind": ":8294",
                "authMode": "simple",
                "tlsEnabled": false,
                "extraConfigFolder": "",
                "traceEnabled": true,
            },
            "apiCalls": api_calls,
        }))
        .expect("test config should build");
        Engine::assemble(config, PathBuf::from("/tmp/bolt-test.json"), broker, cache)
            .expect("test engine should assemble")
    }

    fn three_step_call(cache_enabled: bool) -> Value {
        json!({
            "v1/test": {
                "resultTimeoutMs": 0,
                "resultZombieMs": 0,
                "cache": {"enabled": cache_enabled, "expirationTimeSec": 600},
                "requiredParams": {"testinput": "string"},
                "commands": [
                    {"name": "test/command1"},
                    {"name": "test/command2"},
                    {"name": "test/command3", "returnAfter": true}
                ]
            }
        })
    }

    fn echo_worker(step: i64) -> impl Fn(&Payload) -> Option<Value> + Send + Sync {
        move |payload| {
            let mut reply = payload.value().clone();
            reply["return_value"]["step"] = json!(step);
            Some(reply)
        }
    }

    async fn admit(
        engine: &Arc<Engine>,
        call_type: CallType,
        input: Value,
    ) -> Arc<CommandProcess> {
        let api_call = engine.api_call("v1/test").expect("call configured");
        let proc = engine
            .registry
            .create(call_type, "v1/test", api_call, Payload::empty(), "readonly", "")
            .await;
        proc.set_initial_input(&input).await;
        proc
    }

    async fn run_request(engine: &Arc<Engine>, proc: &Arc<CommandProcess>) {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(process_call(engine.clone(), proc.clone(), Responder::new(tx)));
        let _ = rx.await;
    }

    #[tokio::test]
    async fn straight_line_call_runs_all_commands_in_order() {
        let broker = MemoryBroker::new();
        broker.register_worker("test/command1", echo_worker(1));
        broker.register_worker("test/command2", echo_worker(2));
        broker.register_worker("test/command3", echo_worker(3));
        let engine = test_engine(three_step_call(false), broker.clone(), ResultCache::disabled());

        let proc = admit(&engine, CallType::Request, json!({"testinput": "x"})).await;
        run_request(&engine, &proc).await;

        // return_after on the last command responds at completion.
        assert!(proc.is_complete().await);
        let payload = proc.payload_snapshot().await;
        assert_eq!(payload.get("return_value.step").and_then(|v| v.as_i64()), Some(3));
        assert_eq!(
            payload.get("trace").and_then(|v| v.as_array()).map(|t| t.len()),
            Some(3),
        );
        assert_eq!(
            broker.published_keys(),
            vec!["test/command1", "test/command2", "test/command3"],
        );
    }

    #[tokio::test]
    async fn halt_sentinel_short_circuits_and_caches() {
        let broker = MemoryBroker::new();
        broker.register_worker("test/command1", |payload| {
            let mut reply = payload.value().clone();
            reply["return_value"] = json!({"halted": true});
            reply["nextCommand"] = json!(HALT_CALL);
            Some(reply)
        });
        let cache = ResultCache::memory();
        let engine = test_engine(three_step_call(true), broker.clone(), cache.clone());

        let proc = admit(&engine, CallType::Request, json!({"testinput": "x"})).await;
        run_request(&engine, &proc).await;

        assert!(proc.is_complete().await);
        assert_eq!(broker.published_keys(), vec!["test/command1"]);

        let cached = cache
            .get("v1/test", r#"{"testinput":"x"}"#)
            .await
            .expect("halt should write the cache entry");
        assert_eq!(cached, r#"{"halted":true}"#);
        // The sentinel itself never leaks into the final payload.
        let payload = proc.payload_snapshot().await;
        assert_eq!(payload.next_command(), None);
    }

    #[tokio::test]
    async fn worker_redirect_is_published_in_place_of_advancement() {
        let broker = MemoryBroker::new();
        broker.register_worker("test/command1", |payload| {
            let mut reply = payload.value().clone();
            reply["nextCommand"] = json!("test/recheck");
            Some(reply)
        });
        broker.register_worker("test/recheck", echo_worker(10));
        broker.register_worker("test/command2", echo_worker(2));
        broker.register_worker("test/command3", echo_worker(3));
        let engine = test_engine(three_step_call(false), broker.clone(), ResultCache::disabled());

        let proc = admit(&engine, CallType::Request, json!({"testinput": "x"})).await;
        run_request(&engine, &proc).await;

        assert!(proc.is_complete().await);
        assert_eq!(
            broker.published_keys(),
            vec!["test/command1", "test/recheck", "test/command2", "test/command3"],
        );
    }

    #[tokio::test]
    async fn command_timeout_annotates_and_keeps_awaiting() {
        let api_calls = json!({
            "v1/test": {
                "resultTimeoutMs": 0,
                "resultZombieMs": 0,
                "cache": {"enabled": false},
                "commands": [{"name": "test/command1", "resultTimeoutMs": 50}]
            }
        });
        let broker = MemoryBroker::new();
        // No worker: the command never replies.
        let engine = test_engine(api_calls, broker.clone(), ResultCache::disabled());

        let proc = admit(&engine, CallType::Request, json!({})).await;
        run_request(&engine, &proc).await;

        // The handler was woken by the timeout, not completion.
        assert!(!proc.is_complete().await);
        let payload = proc.payload_snapshot().await;
        let error = payload
            .get("error")
            .and_then(|e| e.get("test/command1"))
            .expect("timeout error should name the command");
        assert_eq!(error.get("type").and_then(|v| v.as_i64()), Some(2));
    }

    #[tokio::test]
    async fn late_reply_after_timeout_overwrites_the_annotation() {
        let api_calls = json!({
            "v1/test": {
                "resultTimeoutMs": 0,
                "resultZombieMs": 0,
                "cache": {"enabled": false},
                "commands": [{"name": "test/command1", "resultTimeoutMs": 30}]
            }
        });
        let broker = MemoryBroker::new();
        let engine = test_engine(api_calls, broker.clone(), ResultCache::disabled());

        let proc = admit(&engine, CallType::Request, json!({})).await;
        run_request(&engine, &proc).await;
        assert!(!proc.is_complete().await);

        // The worker answers late on the same reply queue; no republish
        // happened, and the reply resolves the call successfully.
        let published = broker.published();
        assert_eq!(published.len(), 1);
        let mut reply = Payload::empty().into_value();
        reply["return_value"] = json!({"late": true});
        broker
            .inject_reply(&published[0].reply_to, reply.to_string().as_bytes(), &proc.id)
            .await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while !proc.is_complete().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("late reply should complete the call");

        let payload = proc.payload_snapshot().await;
        assert_eq!(payload.get("return_value.late"), Some(&json!(true)));
        assert!(payload
            .get("error")
            .and_then(|e| e.get("test/command1"))
            .is_none());
    }

    #[tokio::test]
    async fn zombie_terminates_and_ignores_later_replies() {
        let api_calls = json!({
            "v1/test": {
                "resultTimeoutMs": 0,
                "resultZombieMs": 80,
                "cache": {"enabled": false},
                "commands": [{"name": "test/command1"}]
            }
        });
        let broker = MemoryBroker::new();
        let engine = test_engine(api_calls, broker.clone(), ResultCache::disabled());

        let proc = admit(&engine, CallType::Request, json!({})).await;
        run_request(&engine, &proc).await;

        assert!(proc.is_complete().await);
        let payload = proc.payload_snapshot().await;
        let error = payload
            .get("error")
            .and_then(|e| e.get("test/command1"))
            .expect("zombie error should name the command");
        assert_eq!(error.get("type").and_then(|v| v.as_i64()), Some(3));

        // A worker reply arriving after the zombie fired is discarded.
        let published = broker.published();
        let mut reply = Payload::empty().into_value();
        reply["return_value"] = json!({"ghost": true});
        broker
            .inject_reply(&published[0].reply_to, reply.to_string().as_bytes(), &proc.id)
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let payload = proc.payload_snapshot().await;
        assert!(payload.get("return_value.ghost").is_none());
    }

    #[tokio::test]
    async fn overall_call_timeout_names_the_api_call() {
        let api_calls = json!({
            "v1/test": {
                "resultTimeoutMs": 40,
                "resultZombieMs": 0,
                "cache": {"enabled": false},
                "commands": [{"name": "test/command1"}]
            }
        });
        let broker = MemoryBroker::new();
        let engine = test_engine(api_calls, broker.clone(), ResultCache::disabled());

        let proc = admit(&engine, CallType::Request, json!({})).await;
        run_request(&engine, &proc).await;

        assert!(!proc.is_complete().await);
        let payload = proc.payload_snapshot().await;
        let error = payload
            .get("error")
            .and_then(|e| e.get("v1/test"))
            .expect("call timeout error should name the api call");
        assert_eq!(error.get("type").and_then(|v| v.as_i64()), Some(2));
    }

    #[tokio::test]
    async fn return_after_responds_early_and_keeps_processing() {
        let api_calls = json!({
            "v1/test": {
                "resultTimeoutMs": 0,
                "resultZombieMs": 0,
                "cache": {"enabled": true, "expirationTimeSec": 60},
                "commands": [
                    {"name": "test/command1", "returnAfter": true},
                    {"name": "test/command2"}
                ]
            }
        });
        let broker = MemoryBroker::new();
        broker.register_worker("test/command1", echo_worker(1));
        // command2 stays silent; the test replies manually below so the
        // early response is observable first.
        let cache = ResultCache::memory();
        let engine = test_engine(api_calls, broker.clone(), cache.clone());

        let proc = admit(&engine, CallType::Request, json!({"testinput": "x"})).await;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(process_call(engine.clone(), proc.clone(), Responder::new(tx)));
        rx.await.expect("return-after should wake the handler");

        // Woken after command1, before completion.
        assert!(!proc.is_complete().await);
        let payload = proc.payload_snapshot().await;
        assert_eq!(payload.get("return_value.step").and_then(|v| v.as_i64()), Some(1));

        // The cache is written at the return-after point, before the call is
        // actually complete.
        assert!(cache.get("v1/test", r#"{"testinput":"x"}"#).await.is_some());

        // Answer the second command manually.
        let published = broker.published();
        assert_eq!(published.len(), 2);
        let mut reply = proc.payload_snapshot().await.into_value();
        reply["return_value"] = json!({"step": 2});
        broker
            .inject_reply(&published[1].reply_to, reply.to_string().as_bytes(), &proc.id)
            .await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while !proc.is_complete().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second command should complete the call");
        let payload = proc.payload_snapshot().await;
        assert_eq!(payload.get("return_value.step").and_then(|v| v.as_i64()), Some(2));
    }

    #[tokio::test]
    async fn validation_failure_completes_without_broker_traffic() {
        let broker = MemoryBroker::new();
        let engine = test_engine(three_step_call(false), broker.clone(), ResultCache::disabled());

        // Missing required testinput.
        let proc = admit(&engine, CallType::Request, json!({})).await;
        run_request(&engine, &proc).await;

        assert!(proc.is_complete().await);
        assert!(broker.published().is_empty());
        let payload = proc.payload_snapshot().await;
        let error = payload
            .get("error.validation")
            .expect("validation error should be attached");
        assert_eq!(error.get("type").and_then(|v| v.as_i64()), Some(1));
    }

    #[tokio::test]
    async fn empty_command_list_completes_immediately() {
        let api_calls = json!({
            "v1/test": {"cache": {"enabled": false}, "commands": []}
        });
        let broker = MemoryBroker::new();
        let engine = test_engine(api_calls, broker.clone(), ResultCache::disabled());

        let proc = admit(&engine, CallType::Request, json!({})).await;
        run_request(&engine, &proc).await;

        assert!(proc.is_complete().await);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_terminal_with_mq_parent() {
        let broker = MemoryBroker::new();
        broker.set_disconnected(true);
        let engine = test_engine(three_step_call(false), broker.clone(), ResultCache::disabled());

        let proc = admit(&engine, CallType::Request, json!({"testinput": "x"})).await;
        run_request(&engine, &proc).await;

        assert!(proc.is_complete().await);
        let payload = proc.payload_snapshot().await;
        let error = payload.get("error.mq").expect("mq error should be attached");
        assert_eq!(error.get("type").and_then(|v| v.as_i64()), Some(0));
    }

    #[tokio::test]
    async fn unparseable_reply_is_terminal_request_error() {
        let broker = MemoryBroker::new();
        let engine = test_engine(three_step_call(false), broker.clone(), ResultCache::disabled());

        let proc = admit(&engine, CallType::Request, json!({"testinput": "x"})).await;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(process_call(engine.clone(), proc.clone(), Responder::new(tx)));

        // Wait for the publish, then answer with garbage.
        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.published().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("command should be published");
        let published = broker.published();
        broker
            .inject_reply(&published[0].reply_to, b"not json", &proc.id)
            .await;

        rx.await.expect("parse failure should complete the call");
        assert!(proc.is_complete().await);
        let payload = proc.payload_snapshot().await;
        let error = payload
            .get("error")
            .and_then(|e| e.get("test/command1"))
            .expect("parse error should name the command");
        assert_eq!(error.get("type").and_then(|v| v.as_i64()), Some(1));
    }

    #[tokio::test]
    async fn work_call_is_removed_from_registry_on_completion() {
        let broker = MemoryBroker::new();
        broker.register_worker("test/command1", echo_worker(1));
        broker.register_worker("test/command2", echo_worker(2));
        broker.register_worker("test/command3", echo_worker(3));
        let engine = test_engine(three_step_call(false), broker.clone(), ResultCache::disabled());

        let proc = admit(&engine, CallType::Work, json!({"testinput": "x"})).await;
        assert!(engine.registry.get(&proc.id).await.is_some());
        process_call(engine.clone(), proc.clone(), Responder::none()).await;

        assert!(proc.is_complete().await);
        assert!(engine.registry.get(&proc.id).await.is_none());
    }
}
