//! Check verdicts and their printable form

use crate::plan::DestructiveChanges;
use rigger_core::error::{RiggerError, RiggerResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    #[default]
    Ok,
    Changed,
    DestructivelyChanged,
    Abandoned,
    Absent,
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Changed => "changed",
            CheckStatus::DestructivelyChanged => "destructively_changed",
            CheckStatus::Abandoned => "abandoned",
            CheckStatus::Absent => "absent",
            CheckStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterCheckResult {
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destructive_changes: Option<DestructiveChanges>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCheckResult {
    pub group: String,
    pub name: String,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destructive_changes: Option<DestructiveChanges>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupCheckResult {
    pub name: String,
    pub status: CheckStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    #[serde(rename = "nodes", skip_serializing_if = "Vec::is_empty", default)]
    pub node: Vec<NodeCheckResult>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub node_templates: Vec<NodeGroupCheckResult>,
    pub cluster: ClusterCheckResult,
    #[serde(rename = "terraform_plan", skip_serializing_if = "Vec::is_empty", default)]
    pub infrastructure_plan: Vec<Value>,
}

impl Statistics {
    /// Render as `json` or `yaml` without plans and destructive changes.
    pub fn format(&self, output_format: &str) -> RiggerResult<Vec<u8>> {
        let mut printable = self.clone();
        printable.infrastructure_plan.clear();
        printable.cluster.destructive_changes = None;
        for node in printable.node.iter_mut() {
            node.destructive_changes = None;
        }

        match output_format {
            "json" => Ok(serde_json::to_vec(&printable)?),
            "yaml" => Ok(serde_yaml::to_string(&printable)?.into_bytes()),
            other => Err(RiggerError::validation(
                "output format",
                format!("unknown output format {}", other),
            )),
        }
    }

    /// Node results with the given status, in check order
    pub fn nodes_with_status(&self, status: CheckStatus) -> Vec<&NodeCheckResult> {
        self.node.iter().filter(|n| n.status == status).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_strips_plans() {
        let stats = Statistics {
            node: vec![NodeCheckResult {
                group: "master".to_string(),
                name: "foo-master-0".to_string(),
                status: CheckStatus::DestructivelyChanged,
                destructive_changes: Some(DestructiveChanges::default()),
            }],
            node_templates: vec![NodeGroupCheckResult {
                name: "master".to_string(),
                status: CheckStatus::Ok,
            }],
            cluster: ClusterCheckResult {
                status: CheckStatus::Changed,
                destructive_changes: Some(DestructiveChanges::default()),
            },
            infrastructure_plan: vec![serde_json::json!({"resource_changes": []})],
        };

        let json: Value = serde_json::from_slice(&stats.format("json").unwrap()).unwrap();
        assert_eq!(json["cluster"], serde_json::json!({"status": "changed"}));
        assert_eq!(json["nodes"][0]["status"], "destructively_changed");
        assert!(json["nodes"][0].get("destructive_changes").is_none());
        assert!(json.get("terraform_plan").is_none());

        let yaml = String::from_utf8(stats.format("yaml").unwrap()).unwrap();
        assert!(yaml.contains("status: changed"));

        let err = stats.format("xml").unwrap_err();
        assert!(err.to_string().contains("unknown output format xml"));
    }
}
