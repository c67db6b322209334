//! API v1 request / response types.

pub mod bootaction;
pub mod node;
pub mod task;
