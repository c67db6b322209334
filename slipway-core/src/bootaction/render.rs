use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use minijinja::Environment;
use serde::Serialize;
use uuid::Uuid;

use crate::design::{AssetType, BaremetalNode, BootActionSpec, PipelineSegment, SiteDesign};
use crate::error::{Error, Result};

/// Mode applied to assets that do not declare one.
pub const DEFAULT_MODE: u32 = 0o600;

/// A boot-action asset rendered for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedAsset {
    pub action_name: String,
    pub asset_type: AssetType,
    pub path: Option<String>,
    pub permissions: u32,
    pub content: Vec<u8>,
    pub package_list: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Serialize)]
struct TemplateContext<'a> {
    node: NodeContext,
    action: ActionContext<'a>,
}

#[derive(Debug, Serialize)]
struct NodeContext {
    hostname: String,
    domain: Option<String>,
    tags: Vec<String>,
    labels: BTreeMap<String, String>,
    network: BTreeMap<String, NetworkContext>,
    interfaces: BTreeMap<String, InterfaceContext>,
}

#[derive(Debug, Clone, Serialize)]
struct NetworkContext {
    ip: String,
    cidr: Option<String>,
    dns_suffix: Option<String>,
}

#[derive(Debug, Serialize)]
struct InterfaceContext {
    sriov: bool,
    vf_count: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ActionContext<'a> {
    key: String,
    report_url: &'a str,
    design_ref: &'a str,
}

fn node_context(node: &BaremetalNode, design: &SiteDesign) -> NodeContext {
    let mut network = BTreeMap::new();
    for addr in &node.addressing {
        let Some(ip) = addr.address.clone() else {
            continue;
        };
        let net = design.network(&addr.network);
        let ctx = NetworkContext {
            ip,
            cidr: net.and_then(|n| n.cidr.clone()),
            dns_suffix: net.and_then(|n| n.dns_domain.clone()),
        };
        if node.primary_network.as_deref() == Some(addr.network.as_str()) {
            network.insert("default".to_owned(), ctx.clone());
        }
        network.insert(addr.network.clone(), ctx);
    }

    let interfaces = node
        .interfaces
        .iter()
        .map(|i| {
            (
                i.device_name.clone(),
                InterfaceContext {
                    sriov: i.sriov,
                    vf_count: i.vf_count,
                },
            )
        })
        .collect();

    NodeContext {
        hostname: node.name.clone(),
        domain: design.node_domain(node),
        tags: node.tags.clone(),
        labels: node.labels.clone(),
        network,
        interfaces,
    }
}

/// Render every asset of `spec` destined for `node_name`.
///
/// `type_filter` of `None` renders all asset types.
pub fn render_bootaction(
    spec: &BootActionSpec,
    node_name: &str,
    design: &SiteDesign,
    action_id: Uuid,
    design_ref: &str,
    report_url: &str,
    type_filter: Option<AssetType>,
) -> Result<Vec<RenderedAsset>> {
    let node = design
        .node(node_name)
        .ok_or_else(|| Error::render(format!("node '{node_name}' is not in the design")))?;
    let ctx = TemplateContext {
        node: node_context(node, design),
        action: ActionContext {
            key: action_id.to_string(),
            report_url,
            design_ref,
        },
    };

    spec.assets
        .iter()
        .filter(|a| type_filter.is_none_or(|t| t == a.asset_type))
        .map(|asset| -> Result<RenderedAsset> {
            let content = match (asset.asset_type, &asset.data) {
                (AssetType::PkgList, _) | (_, None) => Vec::new(),
                (_, Some(data)) => {
                    execute_pipeline(data.as_bytes().to_vec(), &asset.data_pipeline, &ctx)
                        .map_err(|e| {
                            Error::render(format!(
                                "boot action '{}' asset {}: {e}",
                                spec.name,
                                asset.path.as_deref().unwrap_or("<none>")
                            ))
                        })?
                }
            };
            Ok(RenderedAsset {
                action_name: spec.name.clone(),
                asset_type: asset.asset_type,
                path: asset.path.clone(),
                permissions: asset.permissions.unwrap_or(DEFAULT_MODE),
                content,
                package_list: asset.package_list.clone(),
            })
        })
        .collect()
}

/// Run `data` through each pipeline segment in order.
pub fn execute_pipeline(
    mut data: Vec<u8>,
    pipeline: &[PipelineSegment],
    ctx: &impl Serialize,
) -> Result<Vec<u8>> {
    for segment in pipeline {
        data = match segment {
            PipelineSegment::Base64Encode => STANDARD.encode(&data).into_bytes(),
            PipelineSegment::Base64Decode => STANDARD
                .decode(data.trim_ascii())
                .map_err(|e| Error::render(format!("base64_decode: {e}")))?,
            PipelineSegment::Utf8Decode => String::from_utf8(data)
                .map_err(|e| Error::render(format!("utf8_decode: {e}")))?
                .into_bytes(),
            PipelineSegment::Utf8Encode => data,
            PipelineSegment::Template => {
                let source = String::from_utf8(data)
                    .map_err(|e| Error::render(format!("template is not UTF-8: {e}")))?;
                Environment::new()
                    .render_str(&source, ctx)
                    .map_err(|e| Error::render(format!("template: {e}")))?
                    .into_bytes()
            }
        };
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn design() -> SiteDesign {
        serde_json::from_value(json!({
            "name": "site",
            "networks": [{"name": "mgmt", "cidr": "10.0.0.0/24", "dns_domain": "mgmt.example.com"}],
            "nodes": [{
                "name": "n1",
                "tags": ["compute"],
                "labels": {"rack_pos": "12"},
                "primary_network": "mgmt",
                "addressing": [{"network": "mgmt", "address": "10.0.0.11"}]
            }],
            "bootactions": [{
                "name": "hello",
                "assets": [
                    {
                        "type": "file",
                        "path": "/etc/hello",
                        "permissions": "0644",
                        "data": "host={{ node.hostname }} ip={{ node.network.default.ip }} key={{ action.key }}",
                        "data_pipeline": ["template"]
                    },
                    {
                        "type": "unit",
                        "path": "/lib/systemd/system/hello.service",
                        "data": "W1VuaXRdCg==",
                        "data_pipeline": ["base64_decode", "utf8_decode"]
                    },
                    {"type": "pkg_list", "package_list": {"curl": null, "jq": "1.6"}}
                ]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn template_sees_node_and_action_context() {
        let design = design();
        let action_id = Uuid::now_v7();
        let assets = render_bootaction(
            &design.bootactions[0],
            "n1",
            &design,
            action_id,
            "file:///d.json",
            "http://report/",
            Some(AssetType::File),
        )
        .unwrap();
        assert_eq!(assets.len(), 1);
        let text = String::from_utf8(assets[0].content.clone()).unwrap();
        assert_eq!(text, format!("host=n1 ip=10.0.0.11 key={action_id}"));
        assert_eq!(assets[0].permissions, 0o644);
    }

    #[test]
    fn decode_pipeline_and_default_mode() {
        let design = design();
        let assets = render_bootaction(
            &design.bootactions[0],
            "n1",
            &design,
            Uuid::now_v7(),
            "file:///d.json",
            "http://report/",
            Some(AssetType::Unit),
        )
        .unwrap();
        assert_eq!(assets[0].content, b"[Unit]\n");
        assert_eq!(assets[0].permissions, DEFAULT_MODE);
    }

    #[test]
    fn no_filter_renders_every_asset_type() {
        let design = design();
        let assets = render_bootaction(
            &design.bootactions[0],
            "n1",
            &design,
            Uuid::now_v7(),
            "file:///d.json",
            "http://report/",
            None,
        )
        .unwrap();
        assert_eq!(assets.len(), 3);
        assert_eq!(assets[2].package_list.get("jq"), Some(&Some("1.6".to_owned())));
    }

    #[test]
    fn bad_base64_is_a_render_error() {
        let err = execute_pipeline(b"%%%".to_vec(), &[PipelineSegment::Base64Decode], &()).unwrap_err();
        assert!(matches!(err, Error::Render { .. }));
    }

    #[test]
    fn base64_round_trip() {
        let out = execute_pipeline(
            b"payload".to_vec(),
            &[PipelineSegment::Base64Encode, PipelineSegment::Base64Decode],
            &(),
        )
        .unwrap();
        assert_eq!(out, b"payload");
    }
}
