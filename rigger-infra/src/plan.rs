//! Plan document model and destructive-change classification
//!
//! The plan JSON is kept as a dynamic value; only `resource_changes` and
//! `output_changes` are navigated.

use rigger_core::error::{RiggerError, RiggerResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlanClass {
    #[default]
    NoChanges,
    HasChanges,
    HasDestructiveChanges,
}

impl PlanClass {
    pub fn has_changes(&self) -> bool {
        !matches!(self, PlanClass::NoChanges)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResourceChange {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub change: Change,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub before: Value,
    #[serde(default)]
    pub after: Value,
}

impl ResourceChange {
    pub fn has_action(&self, action: &str) -> bool {
        self.change.actions.iter().any(|a| a == action)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan(Value);

impl Plan {
    pub fn from_slice(data: &[u8]) -> RiggerResult<Self> {
        let value: Value =
            serde_json::from_slice(data).map_err(|e| RiggerError::parse("infrastructure plan", e))?;
        Ok(Plan(value))
    }

    pub fn from_value(value: Value) -> Self {
        Plan(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn resource_changes(&self) -> RiggerResult<Vec<ResourceChange>> {
        match self.0.get("resource_changes") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(changes) => serde_json::from_value(changes.clone())
                .map_err(|e| RiggerError::parse("resource_changes", e)),
        }
    }

    /// `output_changes.<name>.after`
    pub fn output_after(&self, name: &str) -> Option<&Value> {
        self.0
            .get("output_changes")
            .and_then(|outputs| outputs.get(name))
            .and_then(|output| output.get("after"))
    }

    /// Zones the plan will leave in `cloud_discovery_data`, when present
    pub fn discovery_zones_after(&self) -> Option<Vec<String>> {
        self.output_after("cloud_discovery_data")
            .and_then(|data| data.get("zones"))
            .and_then(string_list)
    }
}

pub(crate) fn string_list(value: &Value) -> Option<Vec<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect()
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueChange {
    pub current_value: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub next_value: Value,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub type_: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonesChange {
    pub current: Vec<String>,
    pub next: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestructiveChanges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources_deleted: Vec<ValueChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources_recreated: Vec<ValueChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_zones_changed: Option<ZonesChange>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DestructiveReport {
    pub changes: Option<DestructiveChanges>,
    pub has_vm_destruction: bool,
}

/// Collect every resource the plan deletes. A resource that is also created
/// is a recreation. The first non-empty provider name wins and VM
/// destruction is sticky once seen.
pub fn destructive_report(
    plan: &Plan,
    is_vm_change: impl Fn(&ResourceChange) -> bool,
) -> RiggerResult<DestructiveReport> {
    let mut report = DestructiveReport::default();

    for resource in plan.resource_changes()? {
        if !resource.has_action("delete") {
            continue;
        }

        let changes = report.changes.get_or_insert_with(DestructiveChanges::default);
        if changes.provider.is_empty() && !resource.provider_name.is_empty() {
            changes.provider = resource.provider_name.clone();
        }

        if !report.has_vm_destruction {
            report.has_vm_destruction = is_vm_change(&resource);
        }

        if resource.has_action("create") {
            changes.resources_recreated.push(ValueChange {
                current_value: resource.change.before.clone(),
                next_value: resource.change.after.clone(),
                type_: resource.type_.clone(),
            });
        } else {
            changes.resources_deleted.push(ValueChange {
                current_value: resource.change.before.clone(),
                next_value: Value::Null,
                type_: resource.type_.clone(),
            });
        }
    }

    Ok(report)
}

/// Classification from a bare action list
pub fn classify_actions<S: AsRef<str>>(actions: &[S]) -> PlanClass {
    if actions.iter().any(|a| a.as_ref() == "delete") {
        PlanClass::HasDestructiveChanges
    } else {
        PlanClass::HasChanges
    }
}

/// Every action in the plan's resource changes, in document order
pub fn plan_actions(plan: &Plan) -> RiggerResult<Vec<String>> {
    Ok(plan
        .resource_changes()?
        .into_iter()
        .flat_map(|rc| rc.change.actions)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan() -> Plan {
        Plan(json!({
            "resource_changes": [
                {"type": "yandex_vpc_subnet", "name": "a", "provider_name": "",
                 "change": {"actions": ["update"], "before": {}, "after": {}}},
                {"type": "yandex_compute_instance", "name": "master",
                 "provider_name": "registry.terraform.io/yandex-cloud/yandex",
                 "change": {"actions": ["delete", "create"], "before": {"id": 1}, "after": {"id": 2}}},
                {"type": "yandex_compute_disk", "name": "data",
                 "provider_name": "registry.terraform.io/other",
                 "change": {"actions": ["delete"], "before": {"id": 3}, "after": null}}
            ]
        }))
    }

    #[test]
    fn test_destructive_report() {
        let report = destructive_report(&plan(), |rc| rc.type_ == "yandex_compute_instance").unwrap();
        assert!(report.has_vm_destruction);

        let changes = report.changes.unwrap();
        assert_eq!(changes.provider, "registry.terraform.io/yandex-cloud/yandex");
        assert_eq!(changes.resources_recreated.len(), 1);
        assert_eq!(changes.resources_recreated[0].next_value, json!({"id": 2}));
        assert_eq!(changes.resources_deleted.len(), 1);
        assert_eq!(changes.resources_deleted[0].type_, "yandex_compute_disk");
        assert!(changes.resources_deleted[0].next_value.is_null());
    }

    #[test]
    fn test_no_deletes_means_no_report() {
        let plan = Plan(json!({"resource_changes": [
            {"type": "t", "change": {"actions": ["create"]}}
        ]}));
        let report = destructive_report(&plan, |_| true).unwrap();
        assert!(report.changes.is_none());
        assert!(!report.has_vm_destruction);
    }

    #[test]
    fn test_classify_actions() {
        assert_eq!(classify_actions(&["create", "update"]), PlanClass::HasChanges);
        assert_eq!(
            classify_actions(&["create", "delete"]),
            PlanClass::HasDestructiveChanges
        );
        assert_eq!(plan_actions(&plan()).unwrap().len(), 4);
    }

    #[test]
    fn test_zones_after() {
        let plan = Plan(json!({"output_changes": {"cloud_discovery_data": {
            "after": {"zones": ["ru-central1-b", "ru-central1-c"]}}}}));
        assert_eq!(
            plan.discovery_zones_after(),
            Some(vec!["ru-central1-b".to_string(), "ru-central1-c".to_string()])
        );
        assert_eq!(Plan(json!({})).discovery_zones_after(), None);
    }
}
