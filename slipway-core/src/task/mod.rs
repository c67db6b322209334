//! Task entity and its state machine.
//!
//! A task is one node in the orchestration tree. Parents and children refer to
//! each other by [`TaskId`] only; the store is the arena that owns the records.

mod action;
mod result;

pub use action::{Action, ActionPlan};
pub use result::{ActionResult, ResultMessage, TaskResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filter::NodeFilterSet;

/// Opaque 128-bit task identifier.
pub type TaskId = Uuid;

/// Lifecycle state of a task.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted and persisted, not yet picked up.
    #[default]
    Pending,
    Running,
    Complete,
    Terminated,
}

impl TaskStatus {
    /// Terminal tasks accept no further status writes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Terminated)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Terminated)
                | (TaskStatus::Running, TaskStatus::Complete)
                | (TaskStatus::Running, TaskStatus::Terminated)
        )
    }
}

/// Caller identity and audit fields captured at creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub user: Option<String>,
    pub request_id: Option<Uuid>,
    pub external_marker: Option<String>,
    pub end_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub parent_task_id: Option<TaskId>,
    /// Append-only; maintained by the store's `add_subtask`.
    pub subtask_id_list: Vec<TaskId>,
    pub action: Action,
    pub status: TaskStatus,
    pub result: TaskResult,
    pub retry: u32,
    pub design_ref: String,
    pub node_filter: Option<NodeFilterSet>,
    pub request_context: Option<RequestContext>,
    pub created: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub terminated: Option<DateTime<Utc>>,
    pub terminated_by: Option<String>,
    /// Cooperative cancellation request. Never reset once set.
    pub terminate: bool,
}

impl Task {
    pub fn new(
        action: Action,
        design_ref: impl Into<String>,
        node_filter: Option<NodeFilterSet>,
        request_context: Option<RequestContext>,
    ) -> Self {
        let created_by = request_context.as_ref().and_then(|c| c.user.clone());
        Self {
            task_id: Uuid::new_v4(),
            parent_task_id: None,
            subtask_id_list: Vec::new(),
            action,
            status: TaskStatus::Pending,
            result: TaskResult::default(),
            retry: 0,
            design_ref: design_ref.into(),
            node_filter,
            request_context,
            created: Utc::now(),
            created_by,
            updated: None,
            terminated: None,
            terminated_by: None,
            terminate: false,
        }
    }

    /// A child task covering one unit of this task's work.
    pub fn subtask(&self, action: Action, node_filter: Option<NodeFilterSet>) -> Self {
        let mut child = Task::new(
            action,
            self.design_ref.clone(),
            node_filter,
            self.request_context.clone(),
        );
        child.parent_task_id = Some(self.task_id);
        child
    }

    /// Move to `next`, rejecting moves the state machine does not allow.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                task_id: self.task_id,
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated = Some(now);
        if next == TaskStatus::Terminated {
            self.terminated = Some(now);
        }
        Ok(())
    }

    pub fn success(&mut self, unit: impl Into<String>) {
        self.result.add_success(unit);
    }

    pub fn failure(&mut self, unit: impl Into<String>) {
        self.result.add_failure(unit);
    }

    /// A filter selecting exactly the nodes this task succeeded on.
    pub fn node_filter_from_successes(&self) -> NodeFilterSet {
        NodeFilterSet::for_nodes(self.result.successes.iter().cloned())
    }

    /// A filter selecting exactly the nodes this task failed on.
    pub fn node_filter_from_failures(&self) -> NodeFilterSet {
        NodeFilterSet::for_nodes(self.result.failures.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_allows_documented_moves_only() {
        let mut task = Task::new(Action::Noop, "file:///design.json", None, None);
        task.transition(TaskStatus::Running).expect("pending -> running");
        task.transition(TaskStatus::Complete).expect("running -> complete");

        let err = task.transition(TaskStatus::Running).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition {
                from: TaskStatus::Complete,
                to: TaskStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn pending_task_can_be_terminated() {
        let mut task = Task::new(Action::Noop, "file:///design.json", None, None);
        task.transition(TaskStatus::Terminated).expect("pending -> terminated");
        assert!(task.terminated.is_some());
        assert!(task.status.is_terminal());
    }

    #[test]
    fn subtask_inherits_design_and_context() {
        let ctx = RequestContext {
            user: Some("ops".into()),
            ..Default::default()
        };
        let parent = Task::new(Action::DeployNodes, "file:///d.json", None, Some(ctx));
        let child = parent.subtask(Action::DeployNodes, None);
        assert_eq!(child.parent_task_id, Some(parent.task_id));
        assert_eq!(child.design_ref, parent.design_ref);
        assert_eq!(child.created_by.as_deref(), Some("ops"));
        assert_ne!(child.task_id, parent.task_id);
    }

    #[test]
    fn filters_from_outcomes_select_recorded_nodes() {
        let mut task = Task::new(Action::DeployNodes, "file:///d.json", None, None);
        task.success("n1");
        task.failure("n2");

        let ok = task.node_filter_from_successes();
        assert_eq!(ok.filter_set[0].node_names, vec!["n1".to_string()]);
        let failed = task.node_filter_from_failures();
        assert_eq!(failed.filter_set[0].node_names, vec!["n2".to_string()]);
    }
}
