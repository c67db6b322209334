//! Node filter resolution.
//!
//! A [`NodeFilterSet`] combines filter groups with a set operation. Inside a
//! group each populated criterion yields a node set, and the group's own
//! `filter_type` combines those sets.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::design::{BaremetalNode, SiteDesign};
use crate::error::{Error, Result};

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
pub enum SetOp {
    #[default]
    Union,
    Intersection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeFilterSet {
    pub filter_set_type: SetOp,
    #[serde(default)]
    pub filter_set: Vec<NodeFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeFilter {
    pub filter_type: SetOp,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rack_names: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,
}

impl NodeFilterSet {
    /// Parse an untrusted JSON filter, mapping shape errors to
    /// [`Error::InvalidNodeFilter`].
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let filter: NodeFilterSet =
            serde_json::from_value(value).map_err(|e| Error::invalid_filter(e.to_string()))?;
        filter.validate()?;
        Ok(filter)
    }

    /// A filter selecting exactly `node_names`.
    pub fn for_nodes(node_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            filter_set_type: SetOp::Union,
            filter_set: vec![NodeFilter {
                filter_type: SetOp::Union,
                node_names: node_names.into_iter().collect(),
                ..Default::default()
            }],
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (idx, group) in self.filter_set.iter().enumerate() {
            if group.is_empty() {
                return Err(Error::invalid_filter(format!(
                    "filter group {idx} has no selection criteria"
                )));
            }
        }
        Ok(())
    }
}

impl NodeFilter {
    pub fn is_empty(&self) -> bool {
        self.node_names.is_empty()
            && self.node_tags.is_empty()
            && self.rack_names.is_empty()
            && self.node_labels.is_empty()
    }

    fn select<'a>(&self, nodes: &'a [BaremetalNode]) -> BTreeSet<&'a str> {
        let mut criteria: Vec<BTreeSet<&'a str>> = Vec::with_capacity(4);

        if !self.node_names.is_empty() {
            criteria.push(matching(nodes, |n| self.node_names.contains(&n.name)));
        }
        if !self.node_tags.is_empty() {
            criteria.push(matching(nodes, |n| {
                self.node_tags.iter().any(|t| n.has_tag(t))
            }));
        }
        if !self.rack_names.is_empty() {
            criteria.push(matching(nodes, |n| {
                n.rack.as_ref().is_some_and(|r| self.rack_names.contains(r))
            }));
        }
        if !self.node_labels.is_empty() {
            criteria.push(matching(nodes, |n| {
                self.node_labels
                    .iter()
                    .any(|(k, v)| n.labels.get(k) == Some(v))
            }));
        }

        combine(self.filter_type, criteria)
    }
}

fn matching<'a>(
    nodes: &'a [BaremetalNode],
    pred: impl Fn(&BaremetalNode) -> bool,
) -> BTreeSet<&'a str> {
    nodes
        .iter()
        .filter(|n| pred(n))
        .map(|n| n.name.as_str())
        .collect()
}

fn combine<'a>(op: SetOp, sets: Vec<BTreeSet<&'a str>>) -> BTreeSet<&'a str> {
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    iter.fold(first, |acc, set| match op {
        SetOp::Union => acc.union(&set).copied().collect(),
        SetOp::Intersection => acc.intersection(&set).copied().collect(),
    })
}

/// Resolve `filter` against the nodes of `design`.
///
/// An absent filter selects every node. Criteria that match nothing simply
/// contribute an empty set; only malformed filters are errors.
pub fn resolve(filter: Option<&NodeFilterSet>, design: &SiteDesign) -> Result<BTreeSet<String>> {
    let Some(filter) = filter else {
        return Ok(design.nodes.iter().map(|n| n.name.clone()).collect());
    };
    filter.validate()?;

    let groups = filter
        .filter_set
        .iter()
        .map(|group| group.select(&design.nodes))
        .collect();
    let selected = combine(filter.filter_set_type, groups);
    debug!(
        filter_set_type = %filter.filter_set_type,
        groups = filter.filter_set.len(),
        selected = selected.len(),
        "node filter resolved"
    );
    Ok(selected.into_iter().map(str::to_owned).collect())
}
