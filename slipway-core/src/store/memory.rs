use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BootActionStore, BuildDataStore, LeaderStore, StoreResult, TaskStore};
use crate::bootaction::{BootActionContext, BootActionRecord, BootActionStatus};
use crate::builddata::{BuildData, latest_per_generator};
use crate::leader::ActiveInstance;
use crate::task::{ResultMessage, Task, TaskId, TaskStatus};

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    messages: Vec<ResultMessage>,
    sequence: i64,
    leader: Option<ActiveInstance>,
    contexts: HashMap<String, BootActionContext>,
    boot_actions: HashMap<Uuid, BootActionRecord>,
    build_data: Vec<BuildData>,
}

/// Process-local store.
///
/// Everything sits behind one lock so the conditional operations are atomic
/// the same way a single SQL statement is.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .tasks
            .insert(task.task_id, task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(stored) = inner.tasks.get_mut(&task.task_id) else {
            return Ok(false);
        };
        if stored.status.is_terminal() {
            return Ok(false);
        }
        let subtasks = std::mem::take(&mut stored.subtask_id_list);
        let terminate = stored.terminate || task.terminate;
        let terminated_by = stored.terminated_by.clone();
        *stored = task.clone();
        stored.subtask_id_list = subtasks;
        stored.terminate = terminate;
        if stored.terminated_by.is_none() {
            stored.terminated_by = terminated_by;
        }
        Ok(true)
    }

    async fn mark_terminate(&self, task_id: TaskId, by: Option<&str>) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        task.terminate = true;
        if task.terminated_by.is_none() {
            task.terminated_by = by.map(str::to_owned);
        }
        Ok(true)
    }

    async fn get_task(&self, task_id: TaskId) -> StoreResult<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(&task_id).cloned())
    }

    async fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.inner.read().await.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created);
        Ok(tasks)
    }

    async fn get_subtasks(&self, parent_id: TaskId) -> StoreResult<Vec<Task>> {
        let inner = self.inner.read().await;
        let Some(parent) = inner.tasks.get(&parent_id) else {
            return Ok(Vec::new());
        };
        Ok(parent
            .subtask_id_list
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect())
    }

    async fn add_subtask(&self, parent_id: TaskId, child_id: TaskId) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(parent) = inner.tasks.get_mut(&parent_id) else {
            return Ok(false);
        };
        if parent.status.is_terminal() || parent.subtask_id_list.contains(&child_id) {
            return Ok(false);
        }
        parent.subtask_id_list.push(child_id);
        if let Some(child) = inner.tasks.get_mut(&child_id) {
            child.parent_task_id = Some(parent_id);
        }
        Ok(true)
    }

    async fn next_pending_task(&self) -> StoreResult<Option<Task>> {
        Ok(self
            .inner
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.parent_task_id.is_none())
            .min_by_key(|t| t.created)
            .cloned())
    }

    async fn post_result_message(&self, msg: &ResultMessage) -> StoreResult<i64> {
        let mut inner = self.inner.write().await;
        inner.sequence += 1;
        let mut msg = msg.clone();
        msg.sequence = inner.sequence;
        let seq = msg.sequence;
        inner.messages.push(msg);
        Ok(seq)
    }

    async fn get_result_messages(&self, task_id: TaskId) -> StoreResult<Vec<ResultMessage>> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.task_id == task_id)
            .cloned()
            .collect())
    }
}

impl LeaderStore for MemoryStore {
    async fn claim_leadership(
        &self,
        identity: Uuid,
        now: DateTime<Utc>,
        grace: TimeDelta,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let granted = match &inner.leader {
            None => true,
            Some(held) => held.identity == identity || now - held.last_ping >= grace,
        };
        if granted {
            inner.leader = Some(ActiveInstance {
                identity,
                last_ping: now,
            });
        }
        Ok(granted)
    }

    async fn maintain_leadership(&self, identity: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.leader.as_mut() {
            Some(held) if held.identity == identity => {
                held.last_ping = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn abdicate_leadership(&self, identity: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.leader.as_ref().is_some_and(|l| l.identity == identity) {
            inner.leader = None;
            return Ok(true);
        }
        Ok(false)
    }

    async fn current_leader(&self) -> StoreResult<Option<ActiveInstance>> {
        Ok(self.inner.read().await.leader.clone())
    }
}

impl BootActionStore for MemoryStore {
    async fn post_boot_action_context(
        &self,
        node_name: &str,
        task_id: TaskId,
        identity_key: &[u8],
    ) -> StoreResult<(Vec<u8>, bool)> {
        let mut inner = self.inner.write().await;
        if let Some(ctx) = inner.contexts.get(node_name)
            && ctx.task_id == task_id
        {
            return Ok((ctx.identity_key.clone(), false));
        }
        inner.contexts.insert(
            node_name.to_owned(),
            BootActionContext {
                node_name: node_name.to_owned(),
                task_id,
                identity_key: identity_key.to_vec(),
            },
        );
        Ok((identity_key.to_vec(), true))
    }

    async fn get_boot_action_context(
        &self,
        node_name: &str,
    ) -> StoreResult<Option<BootActionContext>> {
        Ok(self.inner.read().await.contexts.get(node_name).cloned())
    }

    async fn put_boot_action(&self, record: &BootActionRecord) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .boot_actions
            .insert(record.action_id, record.clone());
        Ok(())
    }

    async fn get_boot_action(&self, action_id: Uuid) -> StoreResult<Option<BootActionRecord>> {
        Ok(self.inner.read().await.boot_actions.get(&action_id).cloned())
    }

    async fn get_boot_actions_for_node(
        &self,
        node_name: &str,
        task_id: TaskId,
    ) -> StoreResult<Vec<BootActionRecord>> {
        let mut records: Vec<BootActionRecord> = self
            .inner
            .read()
            .await
            .boot_actions
            .values()
            .filter(|r| r.node_name == node_name && r.task_id == task_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.action_id);
        Ok(records)
    }

    async fn post_boot_action_status(
        &self,
        action_id: Uuid,
        status: BootActionStatus,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.boot_actions.get_mut(&action_id) {
            Some(record) if record.action_status == BootActionStatus::Requested => {
                record.action_status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl BuildDataStore for MemoryStore {
    async fn put_build_data(&self, data: &BuildData) -> StoreResult<()> {
        self.inner.write().await.build_data.push(data.clone());
        Ok(())
    }

    async fn get_build_data(&self, node_name: &str, latest: bool) -> StoreResult<Vec<BuildData>> {
        let rows: Vec<BuildData> = self
            .inner
            .read()
            .await
            .build_data
            .iter()
            .filter(|d| d.node_name == node_name)
            .cloned()
            .collect();
        if latest {
            return Ok(latest_per_generator(rows));
        }
        let mut rows = rows;
        rows.sort_by(|a, b| b.collected_date.cmp(&a.collected_date));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Action;

    // ── Tasks ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn add_subtask_is_idempotent() {
        let store = MemoryStore::new();
        let parent = Task::new(Action::DeployNodes, "memory://d", None, None);
        let child = parent.subtask(Action::DeployNodes, None);
        store.insert_task(&parent).await.unwrap();
        store.insert_task(&child).await.unwrap();

        assert!(store.add_subtask(parent.task_id, child.task_id).await.unwrap());
        assert!(!store.add_subtask(parent.task_id, child.task_id).await.unwrap());

        let stored = store.get_task(parent.task_id).await.unwrap().unwrap();
        assert_eq!(stored.subtask_id_list, vec![child.task_id]);
        let children = store.get_subtasks(parent.task_id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].parent_task_id, Some(parent.task_id));
    }

    #[tokio::test]
    async fn terminal_task_rejects_updates_and_links() {
        let store = MemoryStore::new();
        let mut task = Task::new(Action::Noop, "memory://d", None, None);
        store.insert_task(&task).await.unwrap();
        task.transition(TaskStatus::Terminated).unwrap();
        assert!(store.update_task(&task).await.unwrap());

        let mut again = task.clone();
        again.status = TaskStatus::Running;
        assert!(!store.update_task(&again).await.unwrap());
        assert!(!store.add_subtask(task.task_id, Uuid::new_v4()).await.unwrap());

        let stored = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Terminated);
    }

    #[tokio::test]
    async fn update_never_clears_terminate() {
        let store = MemoryStore::new();
        let mut task = Task::new(Action::Noop, "memory://d", None, None);
        store.insert_task(&task).await.unwrap();
        assert!(store.mark_terminate(task.task_id, Some("ops")).await.unwrap());

        task.transition(TaskStatus::Running).unwrap();
        assert!(!task.terminate);
        store.update_task(&task).await.unwrap();

        let stored = store.get_task(task.task_id).await.unwrap().unwrap();
        assert!(stored.terminate);
        assert_eq!(stored.terminated_by.as_deref(), Some("ops"));
        assert_eq!(stored.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn next_pending_skips_children_and_running() {
        let store = MemoryStore::new();
        let mut first = Task::new(Action::Noop, "memory://d", None, None);
        first.status = TaskStatus::Running;
        let second = Task::new(Action::Noop, "memory://d", None, None);
        let child = second.subtask(Action::Noop, None);
        store.insert_task(&first).await.unwrap();
        store.insert_task(&second).await.unwrap();
        store.insert_task(&child).await.unwrap();

        let next = store.next_pending_task().await.unwrap().unwrap();
        assert_eq!(next.task_id, second.task_id);
    }

    #[tokio::test]
    async fn result_messages_are_sequenced() {
        let store = MemoryStore::new();
        let task = Uuid::new_v4();
        let a = store
            .post_result_message(&ResultMessage::new(task, "a", false, "task", task.to_string()))
            .await
            .unwrap();
        let b = store
            .post_result_message(&ResultMessage::new(task, "b", true, "task", task.to_string()))
            .await
            .unwrap();
        assert!(b > a);
        let messages = store.get_result_messages(task).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].error);
    }

    // ── Boot actions ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn newer_task_replaces_node_context() {
        let store = MemoryStore::new();
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());

        let (k1, created) = store.post_boot_action_context("n1", t1, &[1; 32]).await.unwrap();
        assert!(created);
        let (again, created) = store.post_boot_action_context("n1", t1, &[2; 32]).await.unwrap();
        assert!(!created);
        assert_eq!(again, k1);

        let (k2, created) = store.post_boot_action_context("n1", t2, &[3; 32]).await.unwrap();
        assert!(created);
        assert_eq!(k2, vec![3; 32]);
        let ctx = store.get_boot_action_context("n1").await.unwrap().unwrap();
        assert_eq!(ctx.task_id, t2);
    }

    #[tokio::test]
    async fn status_write_is_set_once() {
        let store = MemoryStore::new();
        let record = BootActionRecord {
            action_id: Uuid::now_v7(),
            node_name: "n1".into(),
            action_name: "hello".into(),
            task_id: Uuid::new_v4(),
            identity_key: vec![0; 32],
            action_status: BootActionStatus::Requested,
        };
        store.put_boot_action(&record).await.unwrap();

        assert!(
            store
                .post_boot_action_status(record.action_id, BootActionStatus::Success)
                .await
                .unwrap()
        );
        assert!(
            !store
                .post_boot_action_status(record.action_id, BootActionStatus::Failure)
                .await
                .unwrap()
        );
        let stored = store.get_boot_action(record.action_id).await.unwrap().unwrap();
        assert_eq!(stored.action_status, BootActionStatus::Success);
    }

    // ── Build data ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn build_data_latest_per_generator() {
        let store = MemoryStore::new();
        let task = Uuid::new_v4();
        let mut old = BuildData::new("n1", task, "lshw", "text/plain", "old");
        old.collected_date -= TimeDelta::minutes(1);
        store.put_build_data(&old).await.unwrap();
        store
            .put_build_data(&BuildData::new("n1", task, "lshw", "text/plain", "new"))
            .await
            .unwrap();
        store
            .put_build_data(&BuildData::new("n2", task, "lshw", "text/plain", "other"))
            .await
            .unwrap();

        assert_eq!(store.get_build_data("n1", false).await.unwrap().len(), 2);
        let latest = store.get_build_data("n1", true).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].data_element, "new");
    }
}
