//! Per-node artifacts collected during provisioning.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildData {
    pub node_name: String,
    pub task_id: TaskId,
    pub collected_date: DateTime<Utc>,
    /// Tool or step that produced the payload, e.g. `lshw`.
    pub generator: String,
    /// MIME-ish format label such as `application/json`.
    pub data_format: String,
    pub data_element: String,
}

impl BuildData {
    pub fn new(
        node_name: impl Into<String>,
        task_id: TaskId,
        generator: impl Into<String>,
        data_format: impl Into<String>,
        data_element: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            task_id,
            collected_date: Utc::now(),
            generator: generator.into(),
            data_format: data_format.into(),
            data_element: data_element.into(),
        }
    }
}

/// Keep only the newest row per generator, newest first.
pub fn latest_per_generator(rows: impl IntoIterator<Item = BuildData>) -> Vec<BuildData> {
    let mut newest: HashMap<String, BuildData> = HashMap::new();
    for row in rows {
        match newest.get(&row.generator) {
            Some(seen) if seen.collected_date >= row.collected_date => {}
            _ => {
                newest.insert(row.generator.clone(), row);
            }
        }
    }
    let mut out: Vec<BuildData> = newest.into_values().collect();
    out.sort_by(|a, b| b.collected_date.cmp(&a.collected_date));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use uuid::Uuid;

    #[test]
    fn latest_keeps_newest_per_generator() {
        let task = Uuid::new_v4();
        let base = Utc::now();
        let mut old = BuildData::new("n1", task, "lshw", "text/plain", "old");
        old.collected_date = base - TimeDelta::minutes(5);
        let mut new = BuildData::new("n1", task, "lshw", "text/plain", "new");
        new.collected_date = base;
        let mut other = BuildData::new("n1", task, "lldp", "text/plain", "lldp");
        other.collected_date = base - TimeDelta::minutes(1);

        let latest = latest_per_generator(vec![new.clone(), old, other.clone()]);
        assert_eq!(latest, vec![new, other]);
    }
}
