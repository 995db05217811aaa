//! Kubernetes-style condition ledger
//!
//! Conditions are kept in insertion order; every `set` moves the touched
//! condition to the end of the list so the most recently reported phase is
//! always last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            observed_generation: 0,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    fn same_content(&self, other: &Condition) -> bool {
        self.status == other.status
            && self.reason == other.reason
            && self.observed_generation == other.observed_generation
            && self.message == other.message
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `condition`.
    ///
    /// Returns true when the ledger changed. Identical content is a no-op; a
    /// status flip stamps the current time, any other change keeps the prior
    /// transition time.
    pub fn set(&mut self, mut condition: Condition) -> bool {
        self.set_at(&mut condition, Utc::now())
    }

    pub(crate) fn set_at(&mut self, condition: &mut Condition, now: DateTime<Utc>) -> bool {
        match self.0.iter().position(|c| c.type_ == condition.type_) {
            Some(idx) => {
                let existing = &self.0[idx];
                if existing.same_content(condition) {
                    return false;
                }

                condition.last_transition_time = if existing.status != condition.status {
                    now
                } else {
                    existing.last_transition_time
                };

                self.0.remove(idx);
                self.0.push(condition.clone());
                true
            }
            None => {
                condition.last_transition_time = now;
                self.0.push(condition.clone());
                true
            }
        }
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).map(Condition::is_true).unwrap_or(false)
    }

    pub fn remove(&mut self, type_: &str) {
        self.0.retain(|c| c.type_ != type_);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Keep only conditions whose type is in `supported`.
    pub fn cleanup_unsupported(&mut self, supported: &[&str]) {
        self.0.retain(|c| supported.contains(&c.type_.as_str()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Condition] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cond(status: bool, message: &str) -> Condition {
        Condition::new("Ready", status.into(), "Processing", message)
    }

    #[test]
    fn test_identical_set_is_noop() {
        let mut ledger = Conditions::new();
        let t0 = Utc::now() - Duration::minutes(5);
        assert!(ledger.set_at(&mut cond(false, "wait"), t0));
        assert!(!ledger.set_at(&mut cond(false, "wait"), Utc::now()));
        assert_eq!(ledger.get("Ready").unwrap().last_transition_time, t0);
    }

    #[test]
    fn test_status_flip_updates_time_once() {
        let mut ledger = Conditions::new();
        let t0 = Utc::now() - Duration::minutes(5);
        let t1 = Utc::now();
        ledger.set_at(&mut cond(false, "wait"), t0);
        ledger.set_at(&mut cond(true, "done"), t1);
        assert_eq!(ledger.get("Ready").unwrap().last_transition_time, t1);

        // Message change without a status flip keeps the transition time.
        ledger.set_at(&mut cond(true, "done again"), Utc::now() + Duration::minutes(1));
        assert_eq!(ledger.get("Ready").unwrap().last_transition_time, t1);
        assert_eq!(ledger.get("Ready").unwrap().message, "done again");
    }

    #[test]
    fn test_set_moves_condition_to_end() {
        let mut ledger = Conditions::new();
        ledger.set(Condition::new("A", ConditionStatus::True, "", ""));
        ledger.set(Condition::new("B", ConditionStatus::True, "", ""));
        ledger.set(Condition::new("A", ConditionStatus::False, "", ""));
        let order: Vec<_> = ledger.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(order, vec!["B", "A"]);
    }

    #[test]
    fn test_cleanup_unsupported() {
        let mut ledger = Conditions::new();
        ledger.set(Condition::new("A", ConditionStatus::True, "", ""));
        ledger.set(Condition::new("Legacy", ConditionStatus::True, "", ""));
        ledger.cleanup_unsupported(&["A", "Ready"]);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.is_true("A"));
        assert!(!ledger.is_true("Legacy"));
    }
}
