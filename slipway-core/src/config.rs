use std::time::Duration;

use crate::task::Action;

/// Tunables for the orchestration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// A leader silent for this long may be replaced.
    pub leader_grace_period: Duration,
    /// Delay between leadership claims while not leader.
    pub leadership_claim_interval: Duration,
    /// Delay between queue polls and heartbeats while leader.
    pub poll_interval: Duration,
    /// Extra attempts allowed for a step failing transiently.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Budget for one unit's driver steps, on top of retry backoff and
    /// boot-action report collection.
    pub subtask_timeout: Duration,
    pub bootaction_report_timeout: Duration,
    pub bootaction_report_poll: Duration,
    pub max_parallel_subtasks: usize,
    /// Base URL nodes post boot-action status to.
    pub report_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            leader_grace_period: Duration::from_secs(15),
            leadership_claim_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            subtask_timeout: Duration::from_secs(300),
            bootaction_report_timeout: Duration::from_secs(30 * 60),
            bootaction_report_poll: Duration::from_secs(10),
            max_parallel_subtasks: 16,
            report_url: "http://localhost:9000/v1/bootactions/".to_owned(),
        }
    }
}

impl EngineConfig {
    /// How long a parent waits for units running `steps`.
    ///
    /// Covers every retry backoff a unit may sleep through and, when the
    /// unit waits on node reports, the whole report window.
    pub fn collection_timeout(&self, steps: &[Action]) -> Duration {
        let driver_steps = steps
            .iter()
            .filter(|step| **step != Action::BootactionReport)
            .count() as u32;
        let backoff = self
            .retry_backoff
            .saturating_mul(self.max_retries.saturating_mul(driver_steps));
        let mut timeout = self.subtask_timeout.saturating_add(backoff);
        if steps.contains(&Action::BootactionReport) {
            timeout = timeout.saturating_add(self.bootaction_report_timeout);
        }
        timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ActionPlan;

    fn steps(action: Action) -> Vec<Action> {
        match action.plan() {
            ActionPlan::PerSite(steps) | ActionPlan::PerNode(steps) => steps,
            ActionPlan::Leaf => Vec::new(),
        }
    }

    #[test]
    fn deploy_collection_outlasts_the_report_window() {
        let config = EngineConfig::default();
        let deploy = config.collection_timeout(&steps(Action::DeployNodes));
        assert!(deploy > config.subtask_timeout + config.bootaction_report_timeout);
    }

    #[test]
    fn collection_covers_retry_backoff() {
        let config = EngineConfig {
            subtask_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(2),
            max_retries: 3,
            ..EngineConfig::default()
        };
        // one step, three retries of two seconds each
        assert_eq!(
            config.collection_timeout(&steps(Action::RelabelNodes)),
            Duration::from_secs(16)
        );
    }
}
