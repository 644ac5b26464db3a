//! Engine state and lifecycle: shared collaborators, background tasks, and
//! graceful shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bolt_auth::AuthMode;
use bolt_contracts::config::{ApiCall, Config};
use bolt_contracts::ERROR_QUEUE_NAME;
use tokio::sync::{mpsc, watch};

use crate::broker::{AmqpBroker, Broker};
use crate::cache::ResultCache;
use crate::config::StartupError;
use crate::metrics;
use crate::rate_limit::RateLimiter;
use crate::registry::Registry;

/// Cooperative shutdown: a flag for gates plus a watch channel for tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Flips the flag. Returns false when shutdown had already started.
    pub fn trigger(&self) -> bool {
        if self.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(true);
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Resolves once shutdown is triggered.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Engine {
    pub config: Arc<Config>,
    pub config_path: PathBuf,
    pub auth_mode: AuthMode,
    pub registry: Registry,
    pub broker: Arc<dyn Broker>,
    pub cache: ResultCache,
    pub throttle: RateLimiter,
    pub shutdown: ShutdownSignal,
    calls: HashMap<String, Arc<ApiCall>>,
}

impl Engine {
    /// Connects the broker and cache and wires the long-lived background
    /// tasks. Fatal failures here end the process at the call site.
    pub async fn start(config: Config, config_path: PathBuf) -> Result<Arc<Self>, StartupError> {
        let broker = AmqpBroker::connect(&config.engine.mq_url)
            .await
            .map_err(|err| StartupError {
                code: "ERR_MQ_UNAVAILABLE",
                message: format!("couldn't connect to mqUrl: {err}"),
            })?;

        let cache = ResultCache::setup(&config.cache).await?;

        let engine = Self::assemble(config, config_path, broker.clone(), cache)?;

        // Broker reconnect loop plus the worker error queue consumer it
        // re-subscribes after a reconnect.
        let (resub_tx, resub_rx) = mpsc::channel(1);
        broker.spawn_reconnect(resub_tx, engine.shutdown.subscribe());
        let error_queue = format!(
            "{}{ERROR_QUEUE_NAME}",
            engine.config.engine.advanced.queue_prefix
        );
        broker.spawn_error_queue_consumer(error_queue, resub_rx, engine.shutdown.subscribe());

        engine.clone().spawn_expire_loop();
        engine.clone().spawn_stats_loop();

        tracing::info!(
            version = %engine.config.engine.version,
            bind = %engine.config.engine.bind,
            auth_mode = %engine.config.engine.auth_mode,
            queue_prefix = %engine.config.engine.advanced.queue_prefix,
            "engine started",
        );

        Ok(engine)
    }

    /// Assembles an engine around explicit broker/cache collaborators.
    /// Background loops are not started.
    pub fn assemble(
        config: Config,
        config_path: PathBuf,
        broker: Arc<dyn Broker>,
        cache: ResultCache,
    ) -> Result<Arc<Self>, StartupError> {
        let auth_mode = AuthMode::parse(&config.engine.auth_mode).map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: err.message,
        })?;

        let throttle = RateLimiter::new(&config.security.groups);
        let calls = config
            .api_calls
            .iter()
            .map(|(name, call)| (name.clone(), Arc::new(call.clone())))
            .collect();

        Ok(Arc::new(Self {
            config: Arc::new(config),
            config_path,
            auth_mode,
            registry: Registry::new(),
            broker,
            cache,
            throttle,
            shutdown: ShutdownSignal::new(),
            calls,
        }))
    }

    pub fn api_call(&self, name: &str) -> Option<Arc<ApiCall>> {
        self.calls.get(name).cloned()
    }

    pub fn queue_prefix(&self) -> &str {
        &self.config.engine.advanced.queue_prefix
    }

    pub fn trace_enabled(&self) -> bool {
        self.config.engine.trace_enabled
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Periodically clears completed results from the registry.
    fn spawn_expire_loop(self: Arc<Self>) {
        let freq = self.config.complete_result_loop_freq();
        let expiration = self.config.complete_result_expiration();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(freq) => {}
                    _ = shutdown.changed() => return,
                }
                if self.is_shutdown() {
                    return;
                }
                let expired = self.registry.expire_completed(expiration).await;
                for id in &expired {
                    tracing::info!(id = %id, "call_expired");
                }
                metrics::inc_expired_results(expired.len() as u64);
                metrics::set_pending_requests(self.registry.count().await);
            }
        });
    }

    /// Periodically logs a stats snapshot.
    fn spawn_stats_loop(self: Arc<Self>) {
        let freq = self.config.log_stats_duration();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(freq) => {}
                    _ = shutdown.changed() => return,
                }
                let pending = self.registry.count().await;
                metrics::set_pending_requests(pending);
                tracing::info!(pending = pending, "stats");
            }
        });
    }

    /// Starts graceful shutdown: new non-core calls are rejected, completed
    /// results are evicted on the shutdown expiration, and the process exits
    /// once the registry drains (or the force-quit window elapses). Returns
    /// false if shutdown was already in progress.
    pub fn begin_shutdown(self: &Arc<Self>) -> bool {
        if !self.shutdown.trigger() {
            return false;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let expiration = engine.config.shutdown_result_expiration();
            let force_quit = engine.config.shutdown_force_quit();

            let initial_count = engine.registry.count().await;
            tracing::info!(count = initial_count, "shutdown started");
            loop {
                let expired = engine.registry.expire_completed(expiration).await;
                let count = engine.registry.count().await;
                tracing::info!(count = count, expired = expired.len(), "shutdown in progress");

                if count == 0 {
                    tracing::info!("shutdown complete");
                    std::process::exit(0);
                }
                if started.elapsed() >= force_quit {
                    tracing::warn!(count = count, "shutdown before all requests complete");
                    std::process::exit(0);
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_signal_triggers_once() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
        assert!(signal.trigger());
        assert!(signal.is_shutdown());
        assert!(!signal.trigger());
    }

    #[tokio::test]
    async fn shutdown_wait_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        signal.trigger();
        waiter.await.expect("wait should resolve");
    }
}
