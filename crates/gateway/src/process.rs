//! In-process state for one API call.
//!
//! A `CommandProcess` is created at admission, owned by the single pipeline
//! task driving it, and shared read-mostly with the retrieval handlers
//! through the registry. All mutable state sits behind one `RwLock`; readers
//! (peek/fetch/status) run concurrently with each other and exclusively with
//! the pipeline writer.

use std::sync::Arc;

use bolt_contracts::config::ApiCall;
use bolt_contracts::{CallType, Payload};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct CommandProcess {
    /// UUID v4 for this request.
    pub id: String,
    /// The caller's security group name.
    pub group: String,
    /// The caller's token. Never serialized.
    pub token: String,
    pub call_type: CallType,
    /// The API call name this request was admitted under.
    pub initial_command: String,
    /// Immutable configuration for the call; commands are addressed by index.
    pub api_call: Arc<ApiCall>,
    /// When the request was first created.
    pub req_time: DateTime<Utc>,
    state: RwLock<ProcessState>,
}

#[derive(Debug)]
struct ProcessState {
    payload: Payload,
    /// Snapshot of the initial input at admission. Workers mutating the
    /// payload later never change it, which keeps cache keys stable.
    initial_input_string: String,
    peek_time: DateTime<Utc>,
    peek_count: u64,
    complete: bool,
    complete_time: Option<DateTime<Utc>>,
    command_time: Option<DateTime<Utc>>,
    current_command_index: usize,
    next_command: String,
}

/// Stable projection of a process for `/retr/status/{id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub id: String,
    pub group: String,
    #[serde(rename = "apiCall")]
    pub api_call: String,
    pub call_type: CallType,
    pub req_time: DateTime<Utc>,
    pub peek_time: DateTime<Utc>,
    pub peek_count: u64,
    pub complete: bool,
    pub complete_time: Option<DateTime<Utc>>,
    pub last_command_time: Option<DateTime<Utc>>,
    pub next_command: String,
}

impl CommandProcess {
    pub fn new(
        call_type: CallType,
        call_name: &str,
        api_call: Arc<ApiCall>,
        payload: Payload,
        group: &str,
        token: &str,
    ) -> Self {
        Self::with_id(
            Uuid::new_v4().to_string(),
            call_type,
            call_name,
            api_call,
            payload,
            group,
            token,
        )
    }

    pub fn with_id(
        id: String,
        call_type: CallType,
        call_name: &str,
        api_call: Arc<ApiCall>,
        payload: Payload,
        group: &str,
        token: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            group: group.to_string(),
            token: token.to_string(),
            call_type,
            initial_command: call_name.to_string(),
            api_call,
            req_time: now,
            state: RwLock::new(ProcessState {
                payload,
                initial_input_string: String::new(),
                peek_time: now,
                peek_count: 0,
                complete: false,
                complete_time: None,
                command_time: None,
                current_command_index: 0,
                next_command: String::new(),
            }),
        }
    }

    /// Copies `input` into the payload's `initial_input` and snapshots its
    /// string form for cache keying.
    pub async fn set_initial_input(&self, input: &Value) {
        let mut state = self.state.write().await;
        state.payload.set("initial_input", input.clone());
        state.initial_input_string = input.to_string();
    }

    pub async fn initial_input_string(&self) -> String {
        self.state.read().await.initial_input_string.clone()
    }

    /// Marks the process complete. The flag transitions false to true exactly
    /// once; later calls keep the original completion time.
    pub async fn set_complete(&self) {
        let mut state = self.state.write().await;
        if !state.complete {
            state.complete = true;
            state.complete_time = Some(Utc::now());
        }
    }

    pub async fn is_complete(&self) -> bool {
        self.state.read().await.complete
    }

    pub async fn complete_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.complete_time
    }

    /// Records a retrieval access for hung-call detection.
    pub async fn update_peek_time(&self) {
        let mut state = self.state.write().await;
        state.peek_time = Utc::now();
        state.peek_count += 1;
    }

    pub async fn mark_command_published(&self) {
        self.state.write().await.command_time = Some(Utc::now());
    }

    pub async fn current_command_index(&self) -> usize {
        self.state.read().await.current_command_index
    }

    /// Advances to the next configured command. Index growth is monotonic.
    pub async fn advance_command(&self) -> usize {
        let mut state = self.state.write().await;
        state.current_command_index += 1;
        state.current_command_index
    }

    pub async fn next_command(&self) -> String {
        self.state.read().await.next_command.clone()
    }

    pub async fn set_next_command(&self, command: &str) {
        self.state.write().await.next_command = command.to_string();
    }

    /// Runs `f` with mutable access to the payload under the write lock.
    pub async fn with_payload_mut<R>(&self, f: impl FnOnce(&mut Payload) -> R) -> R {
        let mut state = self.state.write().await;
        f(&mut state.payload)
    }

    /// Runs `f` with shared access to the payload under the read lock.
    pub async fn with_payload<R>(&self, f: impl FnOnce(&Payload) -> R) -> R {
        let state = self.state.read().await;
        f(&state.payload)
    }

    /// Replaces the payload wholesale (a worker reply is a full replacement
    /// document).
    pub async fn replace_payload(&self, payload: Payload) {
        self.state.write().await.payload = payload;
    }

    pub async fn payload_snapshot(&self) -> Payload {
        self.state.read().await.payload.clone()
    }

    /// Appends a trace entry snapshotting the current command context.
    pub async fn add_trace_entry(&self) {
        let mut state = self.state.write().await;
        let index = state.current_command_index;
        let command = self
            .api_call
            .commands
            .get(index)
            .map(|c| c.name.clone());
        state.payload.add_trace_entry(command.as_deref(), index);
    }

    pub async fn status(&self) -> ProcessStatus {
        let state = self.state.read().await;
        ProcessStatus {
            id: self.id.clone(),
            group: self.group.clone(),
            api_call: self.initial_command.clone(),
            call_type: self.call_type,
            req_time: self.req_time,
            peek_time: state.peek_time,
            peek_count: state.peek_count,
            complete: state.complete,
            complete_time: state.complete_time,
            last_command_time: state.command_time,
            next_command: state.next_command.clone(),
        }
    }
}
