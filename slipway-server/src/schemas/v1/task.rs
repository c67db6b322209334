use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use slipway_core::task::{ResultMessage, TaskResult};
use slipway_core::Task;

/// Request body for `POST /v1/tasks`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct CreateTaskRequest {
    /// Action name, e.g. `deploy_nodes`.
    #[validate(length(min = 1, max = 64))]
    pub action: String,
    /// Reference to the site design, e.g. `file:///etc/slipway/site.json`.
    #[validate(length(min = 1, max = 2048))]
    pub design_ref: String,
    /// Node filter set; all nodes in the design when absent.
    #[serde(default)]
    pub node_filter: Option<Value>,
}

/// Query parameters for `GET /v1/tasks/{id}`.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TaskQuery {
    /// Include the results of every descendant that recorded failures.
    #[serde(default)]
    pub subtaskerrors: bool,
}

/// Query parameters for `GET /v1/tasks/{id}/wait`.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct WaitQuery {
    /// Seconds to wait for a terminal status (default 60, at most 3600).
    pub timeout: Option<u64>,
    /// Milliseconds between status reads (default 500, at least 10).
    pub poll_interval: Option<u64>,
}

impl WaitQuery {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
    pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);
    pub const DEFAULT_POLL: Duration = Duration::from_millis(500);
    pub const MIN_POLL: Duration = Duration::from_millis(10);

    pub fn timeout(&self) -> Duration {
        self.timeout
            .map_or(Self::DEFAULT_TIMEOUT, Duration::from_secs)
            .min(Self::MAX_TIMEOUT)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
            .map_or(Self::DEFAULT_POLL, Duration::from_millis)
            .max(Self::MIN_POLL)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskResultResponse {
    /// `success`, `partial_success`, `failure` or `incomplete`.
    pub status: String,
    pub message: Option<String>,
    pub reason: Option<String>,
    pub error_count: u32,
    pub successes: Vec<String>,
    pub failures: Vec<String>,
}

impl From<&TaskResult> for TaskResultResponse {
    fn from(r: &TaskResult) -> Self {
        Self {
            status: r.status.to_string(),
            message: r.message.clone(),
            reason: r.reason.clone(),
            error_count: r.error_count,
            successes: r.successes.iter().cloned().collect(),
            failures: r.failures.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResultMessageResponse {
    pub sequence: i64,
    pub message: String,
    pub error: bool,
    pub context: String,
    pub context_type: String,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub extra: Value,
}

impl From<ResultMessage> for ResultMessageResponse {
    fn from(m: ResultMessage) -> Self {
        Self {
            sequence: m.sequence,
            message: m.message,
            error: m.error,
            context: m.context,
            context_type: m.context_type,
            ts: m.ts,
            extra: m.extra,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskResponse {
    pub task_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub subtask_id_list: Vec<Uuid>,
    pub action: String,
    /// `pending`, `running`, `complete` or `terminated`.
    pub status: String,
    pub result: TaskResultResponse,
    pub retry: u32,
    pub design_ref: String,
    pub node_filter: Option<Value>,
    pub created: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub terminated: Option<DateTime<Utc>>,
    pub terminated_by: Option<String>,
    pub terminate: bool,
    /// The task's log, included on single-task reads.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub messages: Option<Vec<ResultMessageResponse>>,
    /// Results of failed descendants keyed by task id.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subtask_errors: Option<BTreeMap<String, TaskResultResponse>>,
}

impl From<Task> for TaskResponse {
    fn from(t: Task) -> Self {
        Self {
            task_id: t.task_id,
            parent_task_id: t.parent_task_id,
            subtask_id_list: t.subtask_id_list,
            action: t.action.to_string(),
            status: t.status.to_string(),
            result: TaskResultResponse::from(&t.result),
            retry: t.retry,
            design_ref: t.design_ref,
            node_filter: t
                .node_filter
                .as_ref()
                .and_then(|f| serde_json::to_value(f).ok()),
            created: t.created,
            created_by: t.created_by,
            updated: t.updated,
            terminated: t.terminated,
            terminated_by: t.terminated_by,
            terminate: t.terminate,
            messages: None,
            subtask_errors: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_core::Action;

    #[test]
    fn wait_query_defaults_and_clamps() {
        let q = WaitQuery::default();
        assert_eq!(q.timeout(), Duration::from_secs(60));
        assert_eq!(q.poll_interval(), Duration::from_millis(500));

        let q = WaitQuery {
            timeout: Some(86_400),
            poll_interval: Some(0),
        };
        assert_eq!(q.timeout(), Duration::from_secs(3600));
        assert_eq!(q.poll_interval(), Duration::from_millis(10));

        let q = WaitQuery {
            timeout: Some(5),
            poll_interval: Some(25),
        };
        assert_eq!(q.poll_interval(), Duration::from_millis(25));
    }

    #[test]
    fn create_request_requires_action_and_design() {
        let req = CreateTaskRequest {
            action: String::new(),
            design_ref: "file:///site.json".into(),
            node_filter: None,
        };
        assert!(req.validate().is_err());

        let req = CreateTaskRequest {
            action: "deploy_nodes".into(),
            design_ref: String::new(),
            node_filter: None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn response_uses_wire_names() {
        let mut task = Task::new(Action::PrepareNodes, "file:///site.json", None, None);
        task.result.add_failure("n2");
        task.result.finalize();
        let body = serde_json::to_value(TaskResponse::from(task)).unwrap();
        assert_eq!(body["action"], "prepare_nodes");
        assert_eq!(body["status"], "pending");
        assert_eq!(body["result"]["status"], "failure");
        assert_eq!(body["result"]["error_count"], 1);
        assert!(body.get("messages").is_none());
    }
}
