//! Site design model and the resolvers that load it.
//!
//! Designs are produced by an external ingestion layer. The core only reads
//! them: node inventory, networks for template context, and boot-action
//! specifications with their target selectors.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::error::{Error, Result};
use crate::filter::NodeFilterSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteDesign {
    pub name: String,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub nodes: Vec<BaremetalNode>,
    #[serde(default)]
    pub bootactions: Vec<BootActionSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub cidr: Option<String>,
    pub dns_domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaremetalNode {
    pub name: String,
    #[serde(default)]
    pub rack: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Operator-supplied labels (owner data).
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub primary_network: Option<String>,
    #[serde(default)]
    pub addressing: Vec<Addressing>,
    #[serde(default)]
    pub interfaces: Vec<NodeInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Addressing {
    pub network: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInterface {
    pub device_name: String,
    #[serde(default)]
    pub sriov: bool,
    #[serde(default)]
    pub vf_count: Option<u32>,
}

impl BaremetalNode {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootActionSpec {
    pub name: String,
    /// Absent selects every node in the design.
    #[serde(default)]
    pub node_filter: Option<NodeFilterSet>,
    /// When `false` nodes are not expected to report status.
    #[serde(default = "default_signaling")]
    pub signaling: bool,
    #[serde(default)]
    pub assets: Vec<BootActionAsset>,
}

fn default_signaling() -> bool {
    true
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AssetType {
    Unit,
    File,
    PkgList,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PipelineSegment {
    Base64Encode,
    Base64Decode,
    Utf8Decode,
    Utf8Encode,
    Template,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootActionAsset {
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    #[serde(default)]
    pub path: Option<String>,
    /// File mode; accepts an integer or an octal string such as `"0755"`.
    #[serde(default, deserialize_with = "deserialize_mode")]
    pub permissions: Option<u32>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub data_pipeline: Vec<PipelineSegment>,
    /// Package name to optional version, for `pkg_list` assets.
    #[serde(default)]
    pub package_list: BTreeMap<String, Option<String>>,
}

fn deserialize_mode<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawMode {
        Int(u32),
        Text(String),
    }

    match Option::<RawMode>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawMode::Int(mode)) => Ok(Some(mode)),
        Some(RawMode::Text(text)) => {
            let digits = text.trim().trim_start_matches("0o");
            u32::from_str_radix(digits, 8)
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid mode '{text}': {e}")))
        }
    }
}

impl SiteDesign {
    pub fn node(&self, name: &str) -> Option<&BaremetalNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// The node's own domain, else the DNS domain of its primary network.
    pub fn node_domain(&self, node: &BaremetalNode) -> Option<String> {
        node.domain.clone().or_else(|| {
            node.primary_network
                .as_deref()
                .and_then(|net| self.network(net))
                .and_then(|net| net.dns_domain.clone())
        })
    }

    /// Boot actions whose selector targets `node`.
    pub fn bootactions_for(&self, node: &str) -> Result<Vec<&BootActionSpec>> {
        let mut matched = Vec::new();
        for ba in &self.bootactions {
            let targets = crate::filter::resolve(ba.node_filter.as_ref(), self)?;
            if targets.contains(node) {
                matched.push(ba);
            }
        }
        Ok(matched)
    }

    /// Structural findings; an empty list means the design is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = Vec::new();

        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                findings.push("node with an empty name".to_owned());
            } else if !seen.insert(node.name.as_str()) {
                findings.push(format!("duplicate node name '{}'", node.name));
            }
            for addr in &node.addressing {
                if self.network(&addr.network).is_none() {
                    findings.push(format!(
                        "node '{}' is addressed on undefined network '{}'",
                        node.name, addr.network
                    ));
                }
            }
        }

        let mut seen = BTreeSet::new();
        for ba in &self.bootactions {
            if !seen.insert(ba.name.as_str()) {
                findings.push(format!("duplicate boot action name '{}'", ba.name));
            }
            if let Some(filter) = &ba.node_filter {
                if let Err(e) = filter.validate() {
                    findings.push(format!("boot action '{}': {e}", ba.name));
                }
            }
            for asset in &ba.assets {
                match asset.asset_type {
                    AssetType::Unit | AssetType::File => {
                        if asset.path.as_deref().is_none_or(str::is_empty) {
                            findings.push(format!(
                                "boot action '{}' has a {} asset without a path",
                                ba.name, asset.asset_type
                            ));
                        }
                        if asset.data.is_none() {
                            findings.push(format!(
                                "boot action '{}' has a {} asset without data",
                                ba.name, asset.asset_type
                            ));
                        }
                    }
                    AssetType::PkgList => {
                        if asset.package_list.is_empty() {
                            findings.push(format!(
                                "boot action '{}' has an empty package list",
                                ba.name
                            ));
                        }
                    }
                }
            }
        }

        findings
    }
}

/// Loads the site design a task refers to.
#[async_trait]
pub trait DesignResolver: Send + Sync + std::fmt::Debug {
    async fn resolve(&self, design_ref: &str) -> Result<SiteDesign>;
}

/// Fixed set of designs keyed by reference.
#[derive(Debug, Default, Clone)]
pub struct StaticDesignResolver {
    designs: HashMap<String, SiteDesign>,
}

impl StaticDesignResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_design(mut self, design_ref: impl Into<String>, design: SiteDesign) -> Self {
        self.designs.insert(design_ref.into(), design);
        self
    }
}

#[async_trait]
impl DesignResolver for StaticDesignResolver {
    async fn resolve(&self, design_ref: &str) -> Result<SiteDesign> {
        self.designs
            .get(design_ref)
            .cloned()
            .ok_or_else(|| Error::design(format!("unknown design reference '{design_ref}'")))
    }
}

/// Reads JSON designs from `file://` references.
#[derive(Debug, Default, Clone)]
pub struct FileDesignResolver;

#[async_trait]
impl DesignResolver for FileDesignResolver {
    async fn resolve(&self, design_ref: &str) -> Result<SiteDesign> {
        let path = design_ref.strip_prefix("file://").ok_or_else(|| {
            Error::design(format!("unsupported design reference scheme: '{design_ref}'"))
        })?;
        debug!(path, "loading site design");
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| Error::design(format!("cannot read {path}: {e}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::design(format!("cannot parse {path}: {e}")))
    }
}
