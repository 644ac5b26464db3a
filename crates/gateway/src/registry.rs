//! Tracking of incoming and ongoing requests.
//!
//! Insert, lookup, and removal are serialized through a single owner task's
//! mailbox; the map itself sits behind a read/write lock so the expiry sweep
//! and status listing can scan without going through the mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bolt_contracts::config::ApiCall;
use bolt_contracts::{CallType, Payload};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::process::{CommandProcess, ProcessStatus};

enum RegistryOp {
    Insert(Arc<CommandProcess>),
    Get(String, oneshot::Sender<Option<Arc<CommandProcess>>>),
    Remove(String),
}

#[derive(Clone)]
pub struct Registry {
    requests: Arc<RwLock<HashMap<String, Arc<CommandProcess>>>>,
    ops: mpsc::Sender<RegistryOp>,
}

impl Registry {
    pub fn new() -> Self {
        let requests: Arc<RwLock<HashMap<String, Arc<CommandProcess>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (ops, mut rx) = mpsc::channel::<RegistryOp>(64);

        let owned = requests.clone();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    RegistryOp::Insert(proc) => {
                        owned.write().await.insert(proc.id.clone(), proc);
                    }
                    RegistryOp::Get(id, reply) => {
                        let found = owned.read().await.get(&id).cloned();
                        let _ = reply.send(found);
                    }
                    RegistryOp::Remove(id) => {
                        owned.write().await.remove(&id);
                    }
                }
            }
        });

        Self { requests, ops }
    }

    /// Creates a request, registers it, and returns the shared handle.
    pub async fn create(
        &self,
        call_type: CallType,
        call_name: &str,
        api_call: Arc<ApiCall>,
        payload: Payload,
        group: &str,
        token: &str,
    ) -> Arc<CommandProcess> {
        let proc = Arc::new(CommandProcess::new(
            call_type, call_name, api_call, payload, group, token,
        ));
        let _ = self.ops.send(RegistryOp::Insert(proc.clone())).await;
        proc
    }

    /// Looks up a known request by UUID.
    pub async fn get(&self, id: &str) -> Option<Arc<CommandProcess>> {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(RegistryOp::Get(id.to_string(), tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn remove(&self, id: &str) {
        let _ = self.ops.send(RegistryOp::Remove(id.to_string())).await;
    }

    pub async fn count(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Removes every completed request older than `expiration` and returns
    /// the removed ids.
    pub async fn expire_completed(&self, expiration: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(expiration).unwrap_or(chrono::Duration::zero());

        let mut expired = Vec::new();
        {
            let requests = self.requests.read().await;
            for (id, proc) in requests.iter() {
                if proc.is_complete().await {
                    if let Some(completed) = proc.complete_time().await {
                        if completed <= cutoff {
                            expired.push(id.clone());
                        }
                    }
                }
            }
        }

        for id in &expired {
            self.remove(id).await;
        }
        expired
    }

    /// Stable status projection of every tracked request.
    pub async fn status(&self) -> Vec<ProcessStatus> {
        let requests = self.requests.read().await;
        let mut out = Vec::with_capacity(requests.len());
        for proc in requests.values() {
            out.push(proc.status().await);
        }
        out
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolt_contracts::config::ApiCall;

    fn test_call() -> Arc<ApiCall> {
        Arc::new(ApiCall::default())
    }

    async fn create(registry: &Registry) -> Arc<CommandProcess> {
        registry
            .create(
                CallType::Task,
                "v1/test",
                test_call(),
                Payload::empty(),
                "readonly",
                "",
            )
            .await
    }

    #[tokio::test]
    async fn get_finds_created_until_removed() {
        let registry = Registry::new();
        let proc = create(&registry).await;

        let found = registry.get(&proc.id).await.expect("request should exist");
        assert_eq!(found.id, proc.id);

        registry.remove(&proc.id).await;
        assert!(registry.get(&proc.id).await.is_none());
    }

    #[tokio::test]
    async fn lookup_of_unknown_id_is_none() {
        let registry = Registry::new();
        assert!(registry.get("no-such-id").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_creates_are_all_tracked() {
        let registry = Registry::new();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let proc = registry
                    .create(
                        CallType::Work,
                        "v1/test",
                        Arc::new(ApiCall::default()),
                        Payload::empty(),
                        "readonly",
                        "",
                    )
                    .await;
                proc.id.clone()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.expect("task should not panic"));
        }

        assert_eq!(registry.count().await, 32);
        for id in ids {
            assert!(registry.get(&id).await.is_some());
        }
    }

    #[tokio::test]
    async fn expire_removes_only_old_completed_entries() {
        let registry = Registry::new();
        let completed = create(&registry).await;
        let pending = create(&registry).await;

        completed.set_complete().await;

        // Zero expiration makes anything completed already stale.
        let expired = registry.expire_completed(Duration::ZERO).await;
        assert_eq!(expired, vec![completed.id.clone()]);
        assert!(registry.get(&completed.id).await.is_none());
        assert!(registry.get(&pending.id).await.is_some());

        // A fresh completion inside a long window is not swept.
        pending.set_complete().await;
        let expired = registry.expire_completed(Duration::from_secs(3600)).await;
        assert!(expired.is_empty());
        assert!(registry.get(&pending.id).await.is_some());
    }

    #[tokio::test]
    async fn status_projects_tracked_requests() {
        let registry = Registry::new();
        let proc = create(&registry).await;
        proc.set_complete().await;

        let status = registry.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].id, proc.id);
        assert!(status[0].complete);
        assert_eq!(status[0].group, "readonly");
    }
}
