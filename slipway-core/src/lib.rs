//! Orchestration core for bare-metal provisioning.
//!
//! A client creates a [`Task`] for an [`Action`] against a site design. The
//! [`Orchestrator`] fans the task out into one subtask per unit of work,
//! dispatches each unit's steps to a [`driver::Driver`], and rolls the
//! outcomes back up. Nodes being deployed talk back through the
//! [`bootaction`] pipeline. One replica at a time runs the queue, elected
//! through [`leader`].

pub mod bootaction;
pub mod builddata;
pub mod config;
pub mod design;
pub mod driver;
pub mod engine;
pub mod error;
pub mod filter;
pub mod leader;
pub mod store;
pub mod task;

pub use config::EngineConfig;
pub use design::{DesignResolver, FileDesignResolver, SiteDesign, StaticDesignResolver};
pub use driver::{Driver, DriverError, DriverRegistry, SimulatedDriver, UnitOfWork};
pub use engine::Orchestrator;
pub use error::{Error, Result};
pub use filter::NodeFilterSet;
pub use store::{MemoryStore, StateStore};
pub use task::{Action, ActionResult, Task, TaskId, TaskStatus};
