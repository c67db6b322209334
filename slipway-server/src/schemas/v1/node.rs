use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use slipway_core::builddata::BuildData;

/// Request body for `POST /v1/nodes/{hostname}/builddata`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct BuildDataRequest {
    /// Task that produced the data.
    pub task_id: Uuid,
    /// Tool or step that produced the payload, e.g. `lshw`.
    #[validate(length(min = 1, max = 256))]
    pub generator: String,
    #[validate(length(min = 1, max = 256))]
    pub data_format: String,
    pub data_element: String,
    /// Defaults to the time the server received the data.
    #[serde(default)]
    pub collected_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BuildDataResponse {
    pub node_name: String,
    pub task_id: Uuid,
    pub collected_date: DateTime<Utc>,
    pub generator: String,
    pub data_format: String,
    pub data_element: String,
}

impl From<BuildData> for BuildDataResponse {
    fn from(d: BuildData) -> Self {
        Self {
            node_name: d.node_name,
            task_id: d.task_id,
            collected_date: d.collected_date,
            generator: d.generator,
            data_format: d.data_format,
            data_element: d.data_element,
        }
    }
}

/// Query parameters for `GET /v1/nodes/{hostname}/builddata`.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct BuildDataQuery {
    /// Only the newest entry per generator.
    #[serde(default)]
    pub latest: bool,
}

/// Request body for `POST /v1/nodefilter`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct NodeFilterRequest {
    #[validate(length(min = 1, max = 2048))]
    pub design_ref: String,
    #[serde(default)]
    pub node_filter: Option<Value>,
}
