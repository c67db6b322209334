use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use slipway_core::bootaction::{BootActionRecord, ReportDetail, StatusReport};
use slipway_core::design::AssetType;

use crate::error::ServerError;

/// A boot action as exposed to nodes. The identity key is never returned.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BootActionResponse {
    pub action_id: Uuid,
    pub node_name: String,
    pub action_name: String,
    pub task_id: Uuid,
    /// `requested`, `success`, `failure` or `unreported`.
    pub action_status: String,
}

impl From<BootActionRecord> for BootActionResponse {
    fn from(r: BootActionRecord) -> Self {
        Self {
            action_id: r.action_id,
            node_name: r.node_name,
            action_name: r.action_name,
            task_id: r.task_id,
            action_status: r.action_status.to_string(),
        }
    }
}

/// One detail line in a node's status report.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReportDetailRequest {
    pub message: String,
    #[serde(default)]
    pub error: bool,
    /// Any further fields are kept with the task message.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Request body for `POST /v1/bootactions/{action_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusReportRequest {
    /// Final status: `success` or `failure`.
    pub status: String,
    #[serde(default)]
    pub details: Vec<ReportDetailRequest>,
}

impl TryFrom<StatusReportRequest> for StatusReport {
    type Error = ServerError;

    fn try_from(req: StatusReportRequest) -> Result<Self, ServerError> {
        let status = req
            .status
            .to_lowercase()
            .parse()
            .map_err(|_| ServerError::BadRequest(format!("unknown status '{}'", req.status)))?;
        Ok(StatusReport {
            status,
            details: req
                .details
                .into_iter()
                .map(|d| ReportDetail {
                    message: d.message,
                    error: d.error,
                    extra: d.extra,
                })
                .collect(),
        })
    }
}

/// Query parameters for `GET /v1/bootactions/nodes/{hostname}/assets`.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AssetQuery {
    /// Restrict to one asset type: `unit`, `file` or `pkg_list`. `all` or
    /// no value selects every type.
    #[serde(rename = "type")]
    pub asset_type: Option<String>,
}

impl AssetQuery {
    /// The requested type filter, `None` for every type.
    pub fn type_filter(&self) -> Result<Option<AssetType>, ServerError> {
        match self.asset_type.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(t) if t.eq_ignore_ascii_case("all") => Ok(None),
            Some(t) => t
                .parse::<AssetType>()
                .map(Some)
                .map_err(|_| ServerError::BadRequest(format!("unknown asset type '{t}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_core::bootaction::BootActionStatus;

    fn query(t: Option<&str>) -> AssetQuery {
        AssetQuery {
            asset_type: t.map(str::to_owned),
        }
    }

    #[test]
    fn asset_type_all_means_no_filter() {
        assert_eq!(query(None).type_filter().unwrap(), None);
        assert_eq!(query(Some("all")).type_filter().unwrap(), None);
        assert_eq!(query(Some("file")).type_filter().unwrap(), Some(AssetType::File));
        assert!(matches!(
            query(Some("firmware")).type_filter(),
            Err(ServerError::BadRequest(_))
        ));
    }

    #[test]
    fn status_is_case_insensitive_and_extra_fields_survive() {
        let req: StatusReportRequest = serde_json::from_value(serde_json::json!({
            "status": "Success",
            "details": [{"message": "done", "step": 3}]
        }))
        .unwrap();
        let report = StatusReport::try_from(req).unwrap();
        assert_eq!(report.status, BootActionStatus::Success);
        assert_eq!(report.details[0].extra["step"], 3);
    }

    #[test]
    fn unknown_status_is_a_bad_request() {
        let req = StatusReportRequest {
            status: "maybe".into(),
            details: vec![],
        };
        assert!(matches!(
            StatusReport::try_from(req),
            Err(ServerError::BadRequest(_))
        ));
    }
}
