use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{Driver, DriverError, UnitOfWork};
use crate::task::Action;

/// Succeeds at every driver action after an optional delay.
///
/// Used by development deployments that have no real hardware behind them.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDriver {
    delay: Duration,
}

impl SimulatedDriver {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Driver for SimulatedDriver {
    fn name(&self) -> &str {
        "simulated"
    }

    fn supported_actions(&self) -> Vec<Action> {
        Action::driver_actions().collect()
    }

    async fn execute(&self, work: &UnitOfWork) -> Result<(), DriverError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        info!(
            task_id = %work.task_id,
            action = %work.action,
            unit = work.unit_name(),
            attempt = work.attempt,
            "simulated step complete"
        );
        Ok(())
    }
}
