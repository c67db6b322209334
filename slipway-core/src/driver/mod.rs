//! Driver contract and dispatch registry.

mod simulated;

pub use simulated::SimulatedDriver;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::design::BaremetalNode;
use crate::task::{Action, TaskId};

/// One step of provisioning work handed to a driver.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub task_id: TaskId,
    pub action: Action,
    /// `None` for site-scoped steps.
    pub node: Option<BaremetalNode>,
    pub site: String,
    pub design_ref: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Hex identity key the node will present during boot, set for
    /// `deploy_node` when boot actions target the node.
    pub bootaction_key: Option<String>,
}

impl UnitOfWork {
    /// Node name, or the site name for site-scoped work.
    pub fn unit_name(&self) -> &str {
        self.node.as_ref().map_or(self.site.as_str(), |n| n.name.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// Worth retrying, e.g. a BMC timeout.
    #[error("transient: {message}")]
    Transient { message: String },

    #[error("persistent: {message}")]
    Persistent { message: String },
}

impl DriverError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn persistent(message: impl Into<String>) -> Self {
        Self::Persistent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient { .. })
    }
}

/// An executor for one or more driver actions.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn supported_actions(&self) -> Vec<Action>;

    async fn execute(&self, work: &UnitOfWork) -> Result<(), DriverError>;
}

/// Maps driver actions to drivers.
///
/// Built once at startup; registering after the registry has been cloned only
/// affects the local copy.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: Arc<HashMap<Action, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` for every action it supports, replacing any previous
    /// owner of those actions.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        let drivers = Arc::make_mut(&mut self.drivers);
        for action in driver.supported_actions() {
            if action.is_driver_action() {
                drivers.insert(action, Arc::clone(&driver));
            }
        }
    }

    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.register(driver);
        self
    }

    pub fn resolve(&self, action: Action) -> Option<Arc<dyn Driver>> {
        self.drivers.get(&action).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}
