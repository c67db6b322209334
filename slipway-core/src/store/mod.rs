//! Persistence contracts.
//!
//! The engine is generic over these traits. [`memory::MemoryStore`] backs
//! tests and single-process embedding; the server ships a SQLite
//! implementation.
//!
//! All trait methods use `impl Future` in their signatures so no extra
//! `async-trait` boxing is needed. Operations documented as atomic must be
//! implemented as a single conditional write in the backing store.

pub mod memory;

use std::future::Future;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::bootaction::{BootActionContext, BootActionRecord, BootActionStatus};
use crate::builddata::BuildData;
use crate::leader::ActiveInstance;
use crate::task::{ResultMessage, Task, TaskId};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "sqlx")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted column could not be decoded.
    #[error("malformed {column} in record {id}: {message}")]
    Malformed {
        id: String,
        column: &'static str,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn malformed(id: impl ToString, column: &'static str, message: impl ToString) -> Self {
        Self::Malformed {
            id: id.to_string(),
            column,
            message: message.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait TaskStore: Send + Sync + 'static {
    fn insert_task(&self, task: &Task) -> impl Future<Output = StoreResult<()>> + Send;

    /// Persist mutable fields of a non-terminal task.
    ///
    /// Returns `false` without writing when the stored task is already
    /// terminal or missing. `subtask_id_list` is left untouched and the
    /// stored `terminate` flag is never cleared.
    fn update_task(&self, task: &Task) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Set the terminate flag. Allowed in any status. Returns `false` if the
    /// task does not exist.
    fn mark_terminate(
        &self,
        task_id: TaskId,
        by: Option<&str>,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    fn get_task(&self, task_id: TaskId) -> impl Future<Output = StoreResult<Option<Task>>> + Send;

    fn list_tasks(&self) -> impl Future<Output = StoreResult<Vec<Task>>> + Send;

    fn get_subtasks(
        &self,
        parent_id: TaskId,
    ) -> impl Future<Output = StoreResult<Vec<Task>>> + Send;

    /// Atomically link `child_id` under `parent_id`.
    ///
    /// Idempotent: re-adding a linked child is a no-op returning `false`.
    /// Also returns `false` when the parent is missing or terminal.
    fn add_subtask(
        &self,
        parent_id: TaskId,
        child_id: TaskId,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Oldest pending top-level task.
    fn next_pending_task(&self) -> impl Future<Output = StoreResult<Option<Task>>> + Send;

    /// Append to the task's log, returning the assigned sequence number.
    fn post_result_message(
        &self,
        msg: &ResultMessage,
    ) -> impl Future<Output = StoreResult<i64>> + Send;

    fn get_result_messages(
        &self,
        task_id: TaskId,
    ) -> impl Future<Output = StoreResult<Vec<ResultMessage>>> + Send;
}

pub trait LeaderStore: Send + Sync + 'static {
    /// Atomic compare-and-update on the singleton leadership row.
    ///
    /// Succeeds when the row is empty, already held by `identity`, or its
    /// `last_ping` is at least `grace` older than `now`.
    fn claim_leadership(
        &self,
        identity: Uuid,
        now: DateTime<Utc>,
        grace: TimeDelta,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Refresh `last_ping` only if `identity` still holds the row.
    fn maintain_leadership(
        &self,
        identity: Uuid,
        now: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Release the row only if `identity` holds it.
    fn abdicate_leadership(&self, identity: Uuid) -> impl Future<Output = StoreResult<bool>> + Send;

    fn current_leader(&self) -> impl Future<Output = StoreResult<Option<ActiveInstance>>> + Send;
}

pub trait BootActionStore: Send + Sync + 'static {
    /// Bind `identity_key` to `(node_name, task_id)` as the node's current
    /// context.
    ///
    /// If the node's current context already belongs to `task_id` the stored
    /// key is kept and returned with `false`; otherwise the context is
    /// replaced and `(identity_key, true)` is returned.
    fn post_boot_action_context(
        &self,
        node_name: &str,
        task_id: TaskId,
        identity_key: &[u8],
    ) -> impl Future<Output = StoreResult<(Vec<u8>, bool)>> + Send;

    fn get_boot_action_context(
        &self,
        node_name: &str,
    ) -> impl Future<Output = StoreResult<Option<BootActionContext>>> + Send;

    fn put_boot_action(
        &self,
        record: &BootActionRecord,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn get_boot_action(
        &self,
        action_id: Uuid,
    ) -> impl Future<Output = StoreResult<Option<BootActionRecord>>> + Send;

    fn get_boot_actions_for_node(
        &self,
        node_name: &str,
        task_id: TaskId,
    ) -> impl Future<Output = StoreResult<Vec<BootActionRecord>>> + Send;

    /// Set-once status write. Returns `true` only for the write that moved
    /// the action out of `requested`.
    fn post_boot_action_status(
        &self,
        action_id: Uuid,
        status: BootActionStatus,
    ) -> impl Future<Output = StoreResult<bool>> + Send;
}

pub trait BuildDataStore: Send + Sync + 'static {
    fn put_build_data(&self, data: &BuildData) -> impl Future<Output = StoreResult<()>> + Send;

    /// All rows for the node, newest first, or only the newest row per
    /// generator when `latest` is set.
    fn get_build_data(
        &self,
        node_name: &str,
        latest: bool,
    ) -> impl Future<Output = StoreResult<Vec<BuildData>>> + Send;
}

/// Everything the engine needs from one backing store.
pub trait StateStore: TaskStore + LeaderStore + BootActionStore + BuildDataStore {}

impl<T> StateStore for T where T: TaskStore + LeaderStore + BootActionStore + BuildDataStore {}
