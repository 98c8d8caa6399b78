//! Per-component parameter objects (one per component or shard).

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "parameters.trellis.io",
    version = "v1",
    kind = "ComponentParameter",
    plural = "componentparameters",
    shortname = "cmpp",
    namespaced,
    status = "ComponentParameterStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentParameterSpec {
    pub cluster_name: String,
    pub component_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_items: Vec<ConfigItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigItem {
    /// Config template name from the component definition.
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentParameterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ConfigItemStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigItemStatus {
    pub name: String,
    pub phase: ParameterPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterPhase {
    Pending,
    Running,
    Finished,
    Failed,
}

impl ComponentParameter {
    /// Every template in `templates` has been rendered and rolled out for the current generation.
    pub fn is_synced<'a>(&self, templates: impl IntoIterator<Item = &'a str>) -> bool {
        let Some(st) = self.status.as_ref() else { return false };
        if let (Some(o), Some(g)) = (st.observed_generation, self.metadata.generation) {
            if o < g {
                return false;
            }
        }
        templates.into_iter().all(|t| st.items.iter().any(|i| i.name == t && i.phase == ParameterPhase::Finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synced_only_when_all_templates_finished() {
        let mut p = ComponentParameter::new(
            "c-a",
            ComponentParameterSpec { cluster_name: "c".into(), component_name: "a".into(), config_items: vec![] },
        );
        assert!(!p.is_synced(["my.cnf"]));
        p.status = Some(ComponentParameterStatus {
            observed_generation: None,
            items: vec![
                ConfigItemStatus { name: "my.cnf".into(), phase: ParameterPhase::Finished },
                ConfigItemStatus { name: "log.cnf".into(), phase: ParameterPhase::Running },
            ],
        });
        assert!(p.is_synced(["my.cnf"]));
        assert!(!p.is_synced(["my.cnf", "log.cnf"]));
        p.metadata.generation = Some(3);
        p.status.as_mut().unwrap().observed_generation = Some(2);
        assert!(!p.is_synced(["my.cnf"]));
    }
}
