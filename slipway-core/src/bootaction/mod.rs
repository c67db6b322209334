//! Boot-action pipeline.
//!
//! When a node is deployed the engine creates a boot-action context: a fresh
//! 256-bit identity key bound to `(node, task)` plus one status record per
//! boot action targeting the node. During boot the node presents the key
//! (hex, in the `X-Bootaction-Key` header) to download its rendered assets
//! and later to report per-action status exactly once.

pub mod archive;
pub mod render;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::design::{AssetType, DesignResolver, SiteDesign};
use crate::error::Error;
use crate::store::{StateStore, StoreError};
use crate::task::{ResultMessage, TaskId};

pub use render::{DEFAULT_MODE, RenderedAsset};

/// Header carrying the hex-encoded identity key.
pub const KEY_HEADER: &str = "X-Bootaction-Key";

/// Length of a generated identity key in bytes.
pub const KEY_LEN: usize = 32;

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
pub enum BootActionStatus {
    /// Waiting for the node to report.
    #[default]
    Requested,
    Success,
    Failure,
    /// Signaling disabled; no report is expected.
    Unreported,
}

/// The node's current authentication context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootActionContext {
    pub node_name: String,
    pub task_id: TaskId,
    pub identity_key: Vec<u8>,
}

/// Status tracking for one boot action rendered for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootActionRecord {
    /// Time-ordered (UUIDv7).
    pub action_id: Uuid,
    pub node_name: String,
    pub action_name: String,
    pub task_id: TaskId,
    pub identity_key: Vec<u8>,
    pub action_status: BootActionStatus,
}

/// Errors from node callbacks, each mapping to a distinct response.
#[derive(Debug, Error)]
pub enum BootActionError {
    /// No key was presented.
    #[error("boot action key required")]
    Unauthenticated,

    /// A key was presented but does not match.
    #[error("boot action key rejected")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    /// The action's status was already set.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] Error),
}

impl From<StoreError> for BootActionError {
    fn from(e: StoreError) -> Self {
        BootActionError::Internal(Error::Store(e))
    }
}

/// A status report posted by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: BootActionStatus,
    #[serde(default)]
    pub details: Vec<ReportDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDetail {
    pub message: String,
    #[serde(default)]
    pub error: bool,
    /// Any further fields the node sent.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Compare the presented hex key against the expected bytes.
///
/// Absence and mismatch are distinct errors, and both are logged.
pub fn authenticate(
    subject: &str,
    expected: &[u8],
    presented: Option<&str>,
) -> Result<(), BootActionError> {
    let Some(presented) = presented else {
        warn!(subject, "boot action request without identity key");
        return Err(BootActionError::Unauthenticated);
    };
    match hex::decode(presented.trim()) {
        Ok(key) if key == expected => Ok(()),
        _ => {
            warn!(
                subject,
                expected = %hex::encode(expected),
                presented = %presented,
                "boot action identity key mismatch"
            );
            Err(BootActionError::Forbidden)
        }
    }
}

/// Renders, authenticates and tracks boot actions against a store.
#[derive(Debug)]
pub struct BootActionPipeline<S> {
    store: Arc<S>,
    designs: Arc<dyn DesignResolver>,
    report_url: String,
}

impl<S> Clone for BootActionPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            designs: Arc::clone(&self.designs),
            report_url: self.report_url.clone(),
        }
    }
}

impl<S: StateStore> BootActionPipeline<S> {
    pub fn new(store: Arc<S>, designs: Arc<dyn DesignResolver>, report_url: impl Into<String>) -> Self {
        Self {
            store,
            designs,
            report_url: report_url.into(),
        }
    }

    /// Create the node's boot-action context for `task_id`.
    ///
    /// Returns `None` when no boot action targets the node. Calling again for
    /// the same `(node, task)` returns the existing key without rotating it.
    pub async fn create_context(
        &self,
        node_name: &str,
        task_id: TaskId,
        design: &SiteDesign,
    ) -> Result<Option<Vec<u8>>, Error> {
        let actions = design.bootactions_for(node_name)?;
        if actions.is_empty() {
            return Ok(None);
        }

        let fresh: [u8; KEY_LEN] = rand::random();
        let (key, created) = self
            .store
            .post_boot_action_context(node_name, task_id, &fresh)
            .await?;

        if created {
            for spec in &actions {
                let record = BootActionRecord {
                    action_id: Uuid::now_v7(),
                    node_name: node_name.to_owned(),
                    action_name: spec.name.clone(),
                    task_id,
                    identity_key: key.clone(),
                    action_status: if spec.signaling {
                        BootActionStatus::Requested
                    } else {
                        BootActionStatus::Unreported
                    },
                };
                self.store.put_boot_action(&record).await?;
            }
            info!(
                node = node_name,
                %task_id,
                actions = actions.len(),
                "boot action context created"
            );
        }
        Ok(Some(key))
    }

    /// Authenticated asset download as a `.tar.gz`.
    pub async fn node_assets(
        &self,
        node_name: &str,
        presented_key: Option<&str>,
        type_filter: Option<AssetType>,
    ) -> Result<Vec<u8>, BootActionError> {
        let ctx = self.authenticated_context(node_name, presented_key).await?;
        let assets = self.render_for_context(&ctx, type_filter).await?;
        Ok(archive::pack(&assets)?)
    }

    /// Authenticated merge of every package list targeting the node.
    pub async fn package_list(
        &self,
        node_name: &str,
        presented_key: Option<&str>,
    ) -> Result<BTreeMap<String, Option<String>>, BootActionError> {
        let ctx = self.authenticated_context(node_name, presented_key).await?;
        let assets = self
            .render_for_context(&ctx, Some(AssetType::PkgList))
            .await?;
        let mut packages = BTreeMap::new();
        for asset in assets {
            packages.extend(asset.package_list);
        }
        Ok(packages)
    }

    pub async fn get(&self, action_id: Uuid) -> Result<BootActionRecord, BootActionError> {
        self.store
            .get_boot_action(action_id)
            .await?
            .ok_or_else(|| BootActionError::NotFound(format!("boot action {action_id} not found")))
    }

    /// Record a node's status report. The first report wins.
    pub async fn report_status(
        &self,
        action_id: Uuid,
        presented_key: Option<&str>,
        report: StatusReport,
    ) -> Result<(), BootActionError> {
        let record = self.get(action_id).await?;
        authenticate(&action_id.to_string(), &record.identity_key, presented_key)?;

        if record.action_status != BootActionStatus::Requested {
            return Err(BootActionError::Conflict(format!(
                "boot action {action_id} already reported as {}",
                record.action_status
            )));
        }
        if !matches!(
            report.status,
            BootActionStatus::Success | BootActionStatus::Failure
        ) {
            return Err(BootActionError::BadRequest(format!(
                "status must be success or failure, got {}",
                report.status
            )));
        }
        if !self
            .store
            .post_boot_action_status(action_id, report.status)
            .await?
        {
            return Err(BootActionError::Conflict(format!(
                "boot action {action_id} already reported"
            )));
        }

        for detail in report.details {
            let msg = ResultMessage::new(
                record.task_id,
                detail.message,
                detail.error,
                "bootaction",
                action_id.to_string(),
            )
            .with_extra(serde_json::Value::Object(detail.extra));
            self.store.post_result_message(&msg).await?;
        }

        info!(
            %action_id,
            node = %record.node_name,
            action = %record.action_name,
            status = %report.status,
            "boot action reported"
        );
        Ok(())
    }

    async fn authenticated_context(
        &self,
        node_name: &str,
        presented_key: Option<&str>,
    ) -> Result<BootActionContext, BootActionError> {
        let ctx = self
            .store
            .get_boot_action_context(node_name)
            .await?
            .ok_or_else(|| {
                BootActionError::NotFound(format!("no boot action context for node {node_name}"))
            })?;
        authenticate(node_name, &ctx.identity_key, presented_key)?;
        Ok(ctx)
    }

    async fn render_for_context(
        &self,
        ctx: &BootActionContext,
        type_filter: Option<AssetType>,
    ) -> Result<Vec<RenderedAsset>, BootActionError> {
        let task = self
            .store
            .get_task(ctx.task_id)
            .await?
            .ok_or_else(|| BootActionError::NotFound(format!("task {} not found", ctx.task_id)))?;
        let design = self.designs.resolve(&task.design_ref).await?;

        let records: HashMap<String, BootActionRecord> = self
            .store
            .get_boot_actions_for_node(&ctx.node_name, ctx.task_id)
            .await?
            .into_iter()
            .map(|r| (r.action_name.clone(), r))
            .collect();

        let mut assets = Vec::new();
        for spec in design.bootactions_for(&ctx.node_name)? {
            let Some(record) = records.get(&spec.name) else {
                continue;
            };
            assets.extend(render::render_bootaction(
                spec,
                &ctx.node_name,
                &design,
                record.action_id,
                &task.design_ref,
                &self.report_url,
                type_filter,
            )?);
        }
        Ok(assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::StaticDesignResolver;
    use crate::store::{BootActionStore, MemoryStore, TaskStore};
    use crate::task::{Action, Task};
    use serde_json::json;
    use tracing_test::traced_test;

    const DESIGN_REF: &str = "memory://site";

    fn design() -> SiteDesign {
        serde_json::from_value(json!({
            "name": "site",
            "nodes": [
                {"name": "n1", "tags": ["compute"]},
                {"name": "n2"}
            ],
            "bootactions": [
                {
                    "name": "hello",
                    "node_filter": {
                        "filter_set_type": "union",
                        "filter_set": [{"filter_type": "union", "node_tags": ["compute"]}]
                    },
                    "assets": [
                        {"type": "file", "path": "/etc/hello", "data": "hi {{ node.hostname }}", "data_pipeline": ["template"]},
                        {"type": "unit", "path": "/etc/systemd/system/hello.service", "data": "[Unit]"},
                        {"type": "pkg_list", "package_list": {"curl": null}}
                    ]
                },
                {
                    "name": "quiet",
                    "signaling": false,
                    "assets": [{"type": "pkg_list", "package_list": {"jq": "1.6"}}]
                }
            ]
        }))
        .unwrap()
    }

    async fn setup() -> (Arc<MemoryStore>, BootActionPipeline<MemoryStore>, Task) {
        let store = Arc::new(MemoryStore::new());
        let designs = Arc::new(StaticDesignResolver::new().with_design(DESIGN_REF, design()));
        let pipeline = BootActionPipeline::new(Arc::clone(&store), designs, "http://report/");
        let task = Task::new(Action::DeployNode, DESIGN_REF, None, None);
        store.insert_task(&task).await.unwrap();
        (store, pipeline, task)
    }

    #[tokio::test]
    async fn context_is_idempotent_per_node_and_task() {
        let (store, pipeline, task) = setup().await;
        let design = design();

        let first = pipeline.create_context("n1", task.task_id, &design).await.unwrap();
        let second = pipeline.create_context("n1", task.task_id, &design).await.unwrap();
        let key = first.expect("n1 is targeted");
        assert_eq!(key.len(), KEY_LEN);
        assert_eq!(Some(key), second, "key must not rotate");

        let records = store.get_boot_actions_for_node("n1", task.task_id).await.unwrap();
        assert_eq!(records.len(), 2, "one record per targeting boot action");
        let quiet = records.iter().find(|r| r.action_name == "quiet").unwrap();
        assert_eq!(quiet.action_status, BootActionStatus::Unreported);
    }

    #[tokio::test]
    async fn untargeted_node_gets_no_context() {
        let (_store, pipeline, task) = setup().await;
        let mut design = design();
        design.bootactions.retain(|b| b.name == "hello");
        assert!(pipeline.create_context("n2", task.task_id, &design).await.unwrap().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn asset_download_requires_matching_key() {
        let (_store, pipeline, task) = setup().await;
        let key = pipeline
            .create_context("n1", task.task_id, &design())
            .await
            .unwrap()
            .unwrap();

        let missing = pipeline.node_assets("n1", None, None).await;
        assert!(matches!(missing, Err(BootActionError::Unauthenticated)));

        let wrong = hex::encode([7u8; KEY_LEN]);
        let forbidden = pipeline.node_assets("n1", Some(&wrong), None).await;
        assert!(matches!(forbidden, Err(BootActionError::Forbidden)));
        assert!(logs_contain("identity key mismatch"));
        assert!(logs_contain(&wrong));

        let archive = pipeline
            .node_assets("n1", Some(&hex::encode(&key)), None)
            .await
            .expect("authorized download");
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(archive.as_slice()));
        assert_eq!(tar.entries().unwrap().count(), 2, "file and unit assets only");

        let unknown = pipeline.node_assets("n9", Some(&hex::encode(&key)), None).await;
        assert!(matches!(unknown, Err(BootActionError::NotFound(_))));
    }

    #[tokio::test]
    async fn package_lists_are_merged() {
        let (_store, pipeline, task) = setup().await;
        let key = pipeline
            .create_context("n1", task.task_id, &design())
            .await
            .unwrap()
            .unwrap();
        let packages = pipeline
            .package_list("n1", Some(&hex::encode(&key)))
            .await
            .unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages.get("jq"), Some(&Some("1.6".to_owned())));
        assert_eq!(packages.get("curl"), Some(&None));
    }

    #[tokio::test]
    async fn status_is_set_once() {
        let (store, pipeline, task) = setup().await;
        let key = pipeline
            .create_context("n1", task.task_id, &design())
            .await
            .unwrap()
            .unwrap();
        let hello = store
            .get_boot_actions_for_node("n1", task.task_id)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.action_name == "hello")
            .unwrap();
        let key_hex = hex::encode(&key);

        let report: StatusReport = serde_json::from_value(json!({
            "status": "success",
            "details": [{"message": "hello done", "error": false, "duration_ms": 42}]
        }))
        .unwrap();
        pipeline
            .report_status(hello.action_id, Some(&key_hex), report.clone())
            .await
            .expect("first report accepted");

        let again = pipeline
            .report_status(hello.action_id, Some(&key_hex), report)
            .await;
        assert!(matches!(again, Err(BootActionError::Conflict(_))));

        let messages = store.get_result_messages(task.task_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].context_type, "bootaction");
        assert_eq!(messages[0].context, hello.action_id.to_string());
        assert_eq!(messages[0].extra["duration_ms"], 42);
    }

    #[tokio::test]
    async fn report_validates_status_and_existence() {
        let (store, pipeline, task) = setup().await;
        let key = pipeline
            .create_context("n1", task.task_id, &design())
            .await
            .unwrap()
            .unwrap();
        let hello = store
            .get_boot_actions_for_node("n1", task.task_id)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.action_name == "hello")
            .unwrap();

        let bogus = StatusReport {
            status: BootActionStatus::Requested,
            details: vec![],
        };
        let err = pipeline
            .report_status(hello.action_id, Some(&hex::encode(&key)), bogus.clone())
            .await;
        assert!(matches!(err, Err(BootActionError::BadRequest(_))));

        let err = pipeline.report_status(Uuid::now_v7(), Some("00"), bogus).await;
        assert!(matches!(err, Err(BootActionError::NotFound(_))));
    }
}
