use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::TaskId;

/// Outcome recorded on a task's aggregate result.
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
pub enum ActionResult {
    #[default]
    Incomplete,
    Success,
    PartialSuccess,
    Failure,
}

impl ActionResult {
    /// Partial success still counts as a failed action.
    pub fn is_failure(&self) -> bool {
        matches!(self, ActionResult::PartialSuccess | ActionResult::Failure)
    }
}

/// Aggregate result of a task.
///
/// `successes` and `failures` hold unit identifiers (node names, or the site
/// name for site-scoped work). A unit is never in both sets: a failure always
/// evicts a prior success and a later success never overrides a failure, so
/// merging child results is order independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: ActionResult,
    pub message: Option<String>,
    pub reason: Option<String>,
    pub error_count: u32,
    pub successes: BTreeSet<String>,
    pub failures: BTreeSet<String>,
}

impl TaskResult {
    pub fn add_success(&mut self, unit: impl Into<String>) {
        let unit = unit.into();
        if !self.failures.contains(&unit) {
            self.successes.insert(unit);
        }
    }

    pub fn add_failure(&mut self, unit: impl Into<String>) {
        let unit = unit.into();
        self.successes.remove(&unit);
        self.failures.insert(unit);
        self.error_count = self.failures.len() as u32;
    }

    /// Fold a child's unit outcomes into this result.
    pub fn merge(&mut self, other: &TaskResult) {
        for unit in &other.successes {
            self.add_success(unit.clone());
        }
        for unit in &other.failures {
            self.add_failure(unit.clone());
        }
    }

    /// Derive `status` and `error_count` from the recorded units.
    pub fn finalize(&mut self) {
        self.error_count = self.failures.len() as u32;
        self.status = match (self.successes.is_empty(), self.failures.is_empty()) {
            (_, true) => ActionResult::Success,
            (true, false) => ActionResult::Failure,
            (false, false) => ActionResult::PartialSuccess,
        };
    }

    /// Mark the whole result failed without attributing it to a unit.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ActionResult::Failure;
        self.reason = Some(reason.into());
    }

    pub fn units(&self) -> usize {
        self.successes.len() + self.failures.len()
    }
}

/// One entry in a task's append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Assigned by the store; strictly increasing per store.
    pub sequence: i64,
    pub task_id: TaskId,
    pub message: String,
    pub error: bool,
    pub context: String,
    pub context_type: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl ResultMessage {
    pub fn new(
        task_id: TaskId,
        message: impl Into<String>,
        error: bool,
        context_type: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            sequence: 0,
            task_id,
            message: message.into(),
            error,
            context: context.into(),
            context_type: context_type.into(),
            ts: Utc::now(),
            extra: serde_json::Value::Null,
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_evicts_success() {
        let mut r = TaskResult::default();
        r.add_success("n1");
        r.add_failure("n1");
        r.add_success("n1");
        assert!(r.successes.is_empty());
        assert_eq!(r.failures.len(), 1);
        assert_eq!(r.error_count, 1);
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a = TaskResult::default();
        a.add_success("n1");
        a.add_success("n2");
        let mut b = TaskResult::default();
        b.add_failure("n2");
        b.add_success("n3");

        let mut ab = TaskResult::default();
        ab.merge(&a);
        ab.merge(&b);
        let mut ba = TaskResult::default();
        ba.merge(&b);
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.failures.iter().collect::<Vec<_>>(), vec!["n2"]);
        assert_eq!(ab.units(), 3);
    }

    #[test]
    fn finalize_derives_status() {
        let mut r = TaskResult::default();
        r.finalize();
        assert_eq!(r.status, ActionResult::Success);

        r.add_failure("n1");
        r.finalize();
        assert_eq!(r.status, ActionResult::Failure);

        r.add_success("n2");
        r.finalize();
        assert_eq!(r.status, ActionResult::PartialSuccess);
        assert!(r.status.is_failure());
        assert_eq!(r.error_count as usize, r.failures.len());
    }
}
