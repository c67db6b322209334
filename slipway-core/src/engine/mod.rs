//! Task engine.
//!
//! The [`Orchestrator`] decomposes a task into one subtask per unit of work
//! (the site, or each targeted node), runs the units concurrently and rolls
//! their outcomes into the parent. Tasks and their children live in the
//! store and refer to each other by id.

mod unit;
mod watch;


use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore, watch as signal};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::bootaction::BootActionPipeline;
use crate::config::EngineConfig;
use crate::design::DesignResolver;
use crate::driver::DriverRegistry;
use crate::error::{Error, Result};
use crate::filter::{self, NodeFilterSet};
use crate::leader::LeadershipCoordinator;
use crate::store::StateStore;
use crate::task::{
    Action, ActionPlan, RequestContext, ResultMessage, Task, TaskId, TaskStatus,
};

use self::unit::UnitScope;

/// Local cancellation senders for tasks executing in this process.
type CancelMap = Arc<RwLock<HashMap<TaskId, signal::Sender<bool>>>>;

#[derive(Debug)]
pub struct Orchestrator<S> {
    store: Arc<S>,
    designs: Arc<dyn DesignResolver>,
    drivers: DriverRegistry,
    bootactions: BootActionPipeline<S>,
    config: Arc<EngineConfig>,
    cancels: CancelMap,
    leader: LeadershipCoordinator<S>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            designs: Arc::clone(&self.designs),
            drivers: self.drivers.clone(),
            bootactions: self.bootactions.clone(),
            config: Arc::clone(&self.config),
            cancels: Arc::clone(&self.cancels),
            leader: self.leader.clone(),
        }
    }
}

impl<S: StateStore> Orchestrator<S> {
    pub fn new(
        store: Arc<S>,
        designs: Arc<dyn DesignResolver>,
        drivers: DriverRegistry,
        config: EngineConfig,
    ) -> Self {
        let bootactions = BootActionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&designs),
            config.report_url.clone(),
        );
        let leader = LeadershipCoordinator::new(
            Arc::clone(&store),
            Uuid::new_v4(),
            config.leader_grace_period,
        );
        Self {
            store,
            designs,
            drivers,
            bootactions,
            config: Arc::new(config),
            cancels: Arc::new(RwLock::new(HashMap::new())),
            leader,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn bootactions(&self) -> &BootActionPipeline<S> {
        &self.bootactions
    }

    pub fn leader(&self) -> &LeadershipCoordinator<S> {
        &self.leader
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Public API ───────────────────────────────────────────────────────────

    /// Validate and persist a new pending task.
    pub async fn create_task(
        &self,
        action: Action,
        design_ref: &str,
        node_filter: Option<NodeFilterSet>,
        request_context: Option<RequestContext>,
    ) -> Result<Task> {
        if design_ref.trim().is_empty() {
            return Err(Error::validation("design_ref must not be empty"));
        }
        if let Some(filter) = &node_filter {
            filter.validate()?;
        }

        let task = Task::new(action, design_ref, node_filter, request_context);
        self.store.insert_task(&task).await?;
        info!(task_id = %task.task_id, %action, design_ref, "task created");
        Ok(task)
    }

    /// Start a pending task in the background.
    ///
    /// A task already flagged for termination goes straight to `terminated`.
    /// The returned handle resolves once the task is terminal.
    pub async fn execute_task(&self, task_id: TaskId) -> Result<JoinHandle<()>> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(Error::TaskNotFound { task_id })?;

        if task.status != TaskStatus::Pending {
            return Err(Error::InvalidStateTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        if task.terminate {
            task.transition(TaskStatus::Terminated)?;
            task.result.message = Some("terminated before execution".to_owned());
            self.store.update_task(&task).await?;
            self.post(task_id, "task terminated before execution", false, "task", task_id)
                .await;
            info!(%task_id, "task terminated before execution");
            return Ok(tokio::spawn(async {}));
        }

        let from = task.status;
        task.transition(TaskStatus::Running)?;
        if !self.store.update_task(&task).await? {
            return Err(Error::InvalidStateTransition {
                task_id,
                from,
                to: TaskStatus::Running,
            });
        }

        let (cancel_tx, cancel_rx) = signal::channel(false);
        self.cancels.write().await.insert(task_id, cancel_tx);

        let span = info_span!("task", %task_id, action = %task.action);
        let this = self.clone();
        Ok(tokio::spawn(
            async move {
                this.drive(task, cancel_rx).await;
                this.cancels.write().await.remove(&task_id);
            }
            .instrument(span),
        ))
    }

    /// Flag `task_id` and all of its descendants for termination.
    ///
    /// Running work stops at its next safe point; in-flight driver calls
    /// finish first.
    pub async fn terminate_task(&self, task_id: TaskId, by: Option<&str>) -> Result<()> {
        if !self.store.mark_terminate(task_id, by).await? {
            return Err(Error::TaskNotFound { task_id });
        }

        let mut stack = vec![task_id];
        while let Some(current) = stack.pop() {
            if let Some(tx) = self.cancels.read().await.get(&current) {
                let _ = tx.send(true);
            }
            for child in self.store.get_subtasks(current).await? {
                self.store.mark_terminate(child.task_id, by).await?;
                stack.push(child.task_id);
            }
        }
        info!(%task_id, by = by.unwrap_or("-"), "termination requested");
        Ok(())
    }

    /// Node names `filter` selects in the design at `design_ref`.
    pub async fn resolve_node_filter(
        &self,
        design_ref: &str,
        node_filter: Option<&NodeFilterSet>,
    ) -> Result<BTreeSet<String>> {
        let design = self.designs.resolve(design_ref).await?;
        filter::resolve(node_filter, &design)
    }

    /// Poll until the task is terminal or `timeout` elapses.
    pub async fn wait_for_task(
        &self,
        task_id: TaskId,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or(Error::TaskNotFound { task_id })?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::WaitTimeout { task_id });
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    // ── Execution ────────────────────────────────────────────────────────────

    async fn drive(&self, mut task: Task, cancel: signal::Receiver<bool>) {
        let outcome = match task.action.plan() {
            ActionPlan::Leaf => self.run_leaf(&mut task).await,
            ActionPlan::PerSite(steps) => {
                self.fan_out(&mut task, steps, UnitScope::Site, &cancel).await
            }
            ActionPlan::PerNode(steps) => {
                self.fan_out(&mut task, steps, UnitScope::Node, &cancel).await
            }
        };

        task.result.finalize();
        if let Err(e) = outcome {
            error!(task_id = %task.task_id, error = %e, "task failed");
            self.post(task.task_id, e.to_string(), true, "task", task.task_id)
                .await;
            task.result.fail(e.to_string());
        }

        let next = if self.is_cancelled(task.task_id, &cancel).await {
            TaskStatus::Terminated
        } else {
            TaskStatus::Complete
        };
        if let Err(e) = task.transition(next) {
            error!(task_id = %task.task_id, error = %e, "cannot finish task");
            return;
        }
        match self.store.update_task(&task).await {
            Ok(true) => info!(
                task_id = %task.task_id,
                status = %task.status,
                result = %task.result.status,
                successes = task.result.successes.len(),
                failures = task.result.failures.len(),
                "task finished"
            ),
            Ok(false) => warn!(task_id = %task.task_id, "task was already terminal"),
            Err(e) => error!(task_id = %task.task_id, error = %e, "failed to persist task result"),
        }
    }

    async fn run_leaf(&self, task: &mut Task) -> Result<()> {
        match task.action {
            Action::ValidateDesign => {
                let design = self.designs.resolve(&task.design_ref).await?;
                let findings = design.validate();
                for finding in &findings {
                    self.post(task.task_id, finding.clone(), true, "site", &design.name)
                        .await;
                }
                if !findings.is_empty() {
                    return Err(Error::validation(format!(
                        "design '{}' has {} finding(s)",
                        design.name,
                        findings.len()
                    )));
                }
                task.result.message = Some(format!("design '{}' is valid", design.name));
            }
            _ => {
                task.result.message = Some("noop".to_owned());
            }
        }
        Ok(())
    }

    /// Create, dispatch, collect and aggregate one subtask per unit.
    async fn fan_out(
        &self,
        task: &mut Task,
        steps: Vec<Action>,
        scope: UnitScope,
        cancel: &signal::Receiver<bool>,
    ) -> Result<()> {
        let design = Arc::new(self.designs.resolve(&task.design_ref).await?);
        let units: Vec<String> = match scope {
            UnitScope::Site => vec![design.name.clone()],
            UnitScope::Node => filter::resolve(task.node_filter.as_ref(), &design)?
                .into_iter()
                .collect(),
        };
        if units.is_empty() {
            task.result.message = Some("node filter matched no nodes".to_owned());
            self.post(task.task_id, "node filter matched no nodes", false, "task", task.task_id)
                .await;
            return Ok(());
        }

        let steps = Arc::new(steps);
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_subtasks.max(1)));
        let mut running = JoinSet::new();
        let mut dispatched: Vec<(String, TaskId)> = Vec::with_capacity(units.len());

        for unit in units {
            if self.is_cancelled(task.task_id, cancel).await {
                info!(task_id = %task.task_id, "termination requested, halting dispatch");
                break;
            }

            let filter = match scope {
                UnitScope::Site => None,
                UnitScope::Node => Some(NodeFilterSet::for_nodes([unit.clone()])),
            };
            let child = task.subtask(task.action, filter);
            let linked = match self.link_subtask(task.task_id, &child).await {
                Ok(linked) => linked,
                Err(e) => {
                    // Units already dispatched keep running to completion.
                    running.detach_all();
                    return Err(e);
                }
            };
            if !linked {
                warn!(task_id = %task.task_id, subtask = %child.task_id, "subtask not linked");
                continue;
            }
            dispatched.push((unit.clone(), child.task_id));

            let span = info_span!("subtask", subtask_id = %child.task_id, unit = %unit);
            let this = self.clone();
            let design = Arc::clone(&design);
            let steps = Arc::clone(&steps);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            running.spawn(
                async move {
                    let _permit = permits.acquire_owned().await;
                    this.run_unit(child, unit, scope, design, steps, cancel).await;
                }
                .instrument(span),
            );
        }
        debug!(task_id = %task.task_id, units = dispatched.len(), "subtasks dispatched");

        let timeout = self.config.collection_timeout(&steps);
        let timed_out = self.collect(&mut running, timeout).await;
        self.aggregate(task, &dispatched, timed_out.then_some(timeout))
            .await
    }

    /// Wait for every unit until `timeout`. Returns `true` when the deadline
    /// expired and stragglers were detached.
    async fn collect(&self, running: &mut JoinSet<()>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, running.join_next()).await {
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(e))) => warn!(error = %e, "subtask execution aborted"),
                Ok(None) => return false,
                Err(_) => {
                    warn!(
                        pending = running.len(),
                        "subtask collection timed out; detaching stragglers"
                    );
                    running.detach_all();
                    return true;
                }
            }
        }
    }

    /// Fold child results into the parent by id. Every dispatched unit ends
    /// up in exactly one of the parent's outcome sets.
    async fn aggregate(
        &self,
        task: &mut Task,
        dispatched: &[(String, TaskId)],
        timed_out: Option<Duration>,
    ) -> Result<()> {
        let mut unfinished = Vec::new();
        for (unit, child_id) in dispatched {
            let child = self.store.get_task(*child_id).await?;
            match child {
                Some(child) if child.status.is_terminal() => {
                    task.result.merge(&child.result);
                    if !child.result.successes.contains(unit)
                        && !child.result.failures.contains(unit)
                    {
                        task.failure(unit.clone());
                    }
                }
                _ => {
                    task.failure(unit.clone());
                    unfinished.push(unit.clone());
                }
            }
        }

        if let Some(timeout) = timed_out.filter(|_| !unfinished.is_empty()) {
            let reason = Error::SubtaskCollectionTimeout {
                timeout,
                pending: unfinished.len(),
            };
            for unit in &unfinished {
                self.post(task.task_id, reason.to_string(), true, "node", unit)
                    .await;
            }
            task.result.reason = Some(reason.to_string());
        }
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    async fn link_subtask(&self, parent: TaskId, child: &Task) -> Result<bool> {
        self.store.insert_task(child).await?;
        Ok(self.store.add_subtask(parent, child.task_id).await?)
    }

    /// Local token first, then the persisted flag set by remote requests.
    async fn is_cancelled(&self, task_id: TaskId, cancel: &signal::Receiver<bool>) -> bool {
        if *cancel.borrow() {
            return true;
        }
        match self.store.get_task(task_id).await {
            Ok(task) => task.is_some_and(|t| t.terminate),
            Err(e) => {
                warn!(%task_id, error = %e, "cannot read terminate flag");
                false
            }
        }
    }

    /// Best-effort append to a task's result log.
    async fn post(
        &self,
        task_id: TaskId,
        message: impl Into<String>,
        error: bool,
        context_type: &str,
        context: impl ToString,
    ) {
        let msg = ResultMessage::new(task_id, message, error, context_type, context.to_string());
        if let Err(e) = self.store.post_result_message(&msg).await {
            warn!(%task_id, error = %e, "failed to record result message");
        }
    }
}
