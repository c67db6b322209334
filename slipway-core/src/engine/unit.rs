use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch as signal;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::bootaction::BootActionStatus;
use crate::design::{BaremetalNode, SiteDesign};
use crate::driver::{DriverError, UnitOfWork};
use crate::error::{Error, Result};
use crate::store::StateStore;
use crate::task::{Action, Task, TaskId, TaskStatus};

/// What one subtask covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum UnitScope {
    Site,
    Node,
}

impl<S: StateStore> Orchestrator<S> {
    /// Run `steps` in order for one unit and persist the child's outcome.
    ///
    /// The first failing step fails the unit; later steps are skipped.
    pub(super) async fn run_unit(
        &self,
        mut child: Task,
        unit: String,
        scope: UnitScope,
        design: Arc<SiteDesign>,
        steps: Arc<Vec<Action>>,
        cancel: signal::Receiver<bool>,
    ) {
        let task_id = child.task_id;
        if child.transition(TaskStatus::Running).is_err() {
            return;
        }
        if let Err(e) = self.store.update_task(&child).await {
            warn!(%task_id, error = %e, "failed to mark subtask running");
        }

        let node = match scope {
            UnitScope::Site => None,
            UnitScope::Node => design.node(&unit).cloned(),
        };
        let mut bootaction_key = None;
        let mut context_task = None;
        let mut terminated = false;
        let mut failed = false;

        for &step in steps.iter() {
            if self.is_cancelled(task_id, &cancel).await {
                info!(%task_id, %step, "termination requested, skipping remaining steps");
                self.post(task_id, format!("terminated before {step}"), true, "node", &unit)
                    .await;
                terminated = true;
                break;
            }

            let outcome = match step {
                Action::BootactionReport => {
                    self.collect_bootaction_reports(&child, &unit, context_task)
                        .await
                }
                Action::DeployNode => {
                    match self
                        .bootactions
                        .create_context(&unit, task_id, &design)
                        .await
                    {
                        Ok(key) => {
                            context_task = Some(task_id);
                            bootaction_key = key.map(hex::encode);
                            self.run_step(&mut child, step, node.as_ref(), &design, bootaction_key.clone())
                                .await
                        }
                        Err(e) => Err(e),
                    }
                }
                _ => {
                    self.run_step(&mut child, step, node.as_ref(), &design, bootaction_key.clone())
                        .await
                }
            };

            if let Err(e) = outcome {
                warn!(%task_id, %step, unit = %unit, error = %e, "step failed");
                self.post(task_id, format!("{step}: {e}"), true, "node", &unit)
                    .await;
                failed = true;
                break;
            }
        }

        if terminated || failed {
            child.failure(unit.clone());
        } else {
            child.success(unit.clone());
        }
        child.result.finalize();

        let next = if terminated {
            TaskStatus::Terminated
        } else {
            TaskStatus::Complete
        };
        if child.transition(next).is_ok() {
            match self.store.update_task(&child).await {
                Ok(true) => debug!(%task_id, status = %child.status, "subtask finished"),
                Ok(false) => warn!(%task_id, "subtask was already terminal"),
                Err(e) => warn!(%task_id, error = %e, "failed to persist subtask result"),
            }
        }
    }

    /// One driver step with bounded retry of transient errors.
    async fn run_step(
        &self,
        child: &mut Task,
        action: Action,
        node: Option<&BaremetalNode>,
        design: &SiteDesign,
        bootaction_key: Option<String>,
    ) -> Result<()> {
        let driver = self.drivers.resolve(action).ok_or_else(|| Error::Driver {
            action: action.to_string(),
            message: "Bad Configuration: no driver registered".to_owned(),
        })?;

        let mut attempt = 1u32;
        loop {
            let work = UnitOfWork {
                task_id: child.task_id,
                action,
                node: node.cloned(),
                site: design.name.clone(),
                design_ref: child.design_ref.clone(),
                attempt,
                bootaction_key: bootaction_key.clone(),
            };

            let outcome = AssertUnwindSafe(driver.execute(&work)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {
                    self.post(
                        child.task_id,
                        format!("{action} succeeded"),
                        false,
                        "node",
                        work.unit_name(),
                    )
                    .await;
                    return Ok(());
                }
                Ok(Err(DriverError::Transient { message })) if attempt <= self.config.max_retries => {
                    warn!(
                        task_id = %child.task_id,
                        %action,
                        attempt,
                        error = %message,
                        "transient driver error, retrying"
                    );
                    child.retry += 1;
                    if let Err(e) = self.store.update_task(child).await {
                        warn!(task_id = %child.task_id, error = %e, "failed to record retry");
                    }
                    tokio::time::sleep(self.config.retry_backoff).await;
                    attempt += 1;
                }
                Ok(Err(DriverError::Transient { .. })) => {
                    return Err(Error::MaxRetriesReached {
                        action: action.to_string(),
                        attempts: attempt,
                    });
                }
                Ok(Err(DriverError::Persistent { message })) => {
                    return Err(Error::Driver {
                        action: action.to_string(),
                        message,
                    });
                }
                Err(_) => {
                    return Err(Error::Driver {
                        action: action.to_string(),
                        message: format!("driver '{}' panicked", driver.name()),
                    });
                }
            }
        }
    }

    /// Poll the node's boot-action statuses until none is `requested`.
    ///
    /// `context_task` is the subtask that deployed the node in this unit.
    /// Without one, the node's current boot-action context decides which
    /// deployment is checked.
    async fn collect_bootaction_reports(
        &self,
        child: &Task,
        node: &str,
        context_task: Option<TaskId>,
    ) -> Result<()> {
        let source = match context_task {
            Some(task_id) => task_id,
            None => match self.store.get_boot_action_context(node).await? {
                Some(ctx) => ctx.task_id,
                None => {
                    self.post(child.task_id, "no boot actions deployed", false, "node", node)
                        .await;
                    return Ok(());
                }
            },
        };

        let deadline = Instant::now() + self.config.bootaction_report_timeout;
        loop {
            let records = self.store.get_boot_actions_for_node(node, source).await?;
            let pending = records
                .iter()
                .filter(|r| r.action_status == BootActionStatus::Requested)
                .count();

            let now = Instant::now();
            if pending == 0 || now >= deadline {
                for record in &records {
                    let error = matches!(
                        record.action_status,
                        BootActionStatus::Requested | BootActionStatus::Failure
                    );
                    self.post(
                        child.task_id,
                        format!("boot action {}: {}", record.action_name, record.action_status),
                        error,
                        "bootaction",
                        record.action_id,
                    )
                    .await;
                }
                if pending > 0 {
                    return Err(Error::Driver {
                        action: Action::BootactionReport.to_string(),
                        message: format!("{pending} boot action(s) did not report in time"),
                    });
                }
                let failed: Vec<&str> = records
                    .iter()
                    .filter(|r| r.action_status == BootActionStatus::Failure)
                    .map(|r| r.action_name.as_str())
                    .collect();
                if !failed.is_empty() {
                    return Err(Error::Driver {
                        action: Action::BootactionReport.to_string(),
                        message: format!("boot action(s) failed: {}", failed.join(", ")),
                    });
                }
                return Ok(());
            }

            tokio::time::sleep(self.config.bootaction_report_poll.min(deadline - now)).await;
        }
    }
}
