//! Per-registry work lists
//!
//! A [`Queue`] splits its images into untried `items`, failed `retry`
//! entries and a `processed` counter. Moving an item between the three never
//! changes [`Queue::total`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Full image reference, `host/path@digest` or `host/path:tag`
    pub image: String,
    /// Where the image came from, e.g. `deckhouse` or `<module>/<image>`
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: Item,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    /// Hash of the registry params the items were built for
    pub params_hash: String,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub retry: Vec<FailedItem>,
    #[serde(default)]
    pub processed: usize,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
}

impl Queue {
    pub fn new(params_hash: impl Into<String>, items: Vec<Item>) -> Self {
        Self {
            params_hash: params_hash.into(),
            items,
            ..Default::default()
        }
    }

    pub fn total(&self) -> usize {
        self.processed + self.items.len() + self.retry.len()
    }

    pub fn is_done(&self) -> bool {
        self.items.is_empty() && self.retry.is_empty()
    }

    fn cooled_down(&self, delay: Duration, now: DateTime<Utc>) -> bool {
        match self.last_attempt {
            None => true,
            Some(at) => match chrono::Duration::from_std(delay) {
                Ok(delay) => at + delay < now,
                Err(_) => false,
            },
        }
    }

    /// Move failed items back to `items` once the retry delay has passed.
    ///
    /// Returns true when anything was promoted.
    pub fn promote_retry(&mut self, delay: Duration, now: DateTime<Utc>) -> bool {
        if !self.items.is_empty() || self.retry.is_empty() || !self.cooled_down(delay, now) {
            return false;
        }

        self.items = self.retry.drain(..).map(|failed| failed.item).collect();
        self.last_attempt = Some(now);
        true
    }

    /// Items are pending and the last attempt is old enough.
    pub fn ready_to_run(&self, delay: Duration, now: DateTime<Utc>) -> bool {
        if self.items.is_empty() {
            return false;
        }
        // A freshly promoted queue has just stamped `last_attempt`.
        self.retry.is_empty() || self.cooled_down(delay, now)
    }

    /// Take every pending item out of the queue for a worker round.
    pub fn take_items(&mut self) -> Vec<Item> {
        std::mem::take(&mut self.items)
    }

    /// Account for one probe result.
    pub fn record(&mut self, item: Item, result: Result<(), String>) {
        match result {
            Ok(()) => self.processed += 1,
            Err(error) => self.retry.push(FailedItem { item, error }),
        }
    }

    /// Put items that were never dispatched back in front of the queue.
    pub fn restore(&mut self, mut undispatched: Vec<Item>) {
        undispatched.append(&mut self.items);
        self.items = undispatched;
    }

    /// Human readable progress for this queue.
    pub fn message(&self, max_err_items: usize) -> String {
        let total = self.total();
        if self.is_done() {
            return format!("all {} items checked", total);
        }

        let mut msg = format!(
            "{} of {} processed, {} items with errors:",
            self.processed,
            total,
            self.retry.len()
        );
        for failed in self.retry.iter().take(max_err_items) {
            let _ = write!(
                msg,
                "\n- source: {}, image: {}, error: {}",
                failed.item.source, failed.item.image, failed.error
            );
        }
        if self.retry.len() > max_err_items {
            msg.push_str("\n...and more");
        }
        msg
    }
}

/// Checker state carried between rounds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Params version the queues were built for
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub queues: BTreeMap<String, Queue>,
    #[serde(default)]
    pub message: String,
}

impl State {
    pub fn has_pending(&self) -> bool {
        self.queues.values().any(|q| !q.is_done())
    }

    pub fn build_message(&self, max_err_items: usize) -> String {
        if self.queues.is_empty() {
            return "no registries to check".to_string();
        }
        self.queues
            .iter()
            .map(|(name, queue)| format!("{}: {}", name, queue.message(max_err_items)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: usize) -> Item {
        Item {
            image: format!("r.example.com/deckhouse@sha256:{:02}", n),
            source: format!("module/image-{}", n),
        }
    }

    #[test]
    fn test_total_is_stable_across_a_round() {
        let mut queue = Queue::new("h", (0..4).map(item).collect());
        assert_eq!(queue.total(), 4);

        let mut taken = queue.take_items();
        let undispatched = taken.split_off(3);
        for (i, it) in taken.into_iter().enumerate() {
            let result = if i == 0 { Err("HTTP 404".to_string()) } else { Ok(()) };
            queue.record(it, result);
        }
        queue.restore(undispatched);

        assert_eq!(queue.processed, 2);
        assert_eq!(queue.retry.len(), 1);
        assert_eq!(queue.items.len(), 1);
        assert_eq!(queue.total(), 4);
    }

    #[test]
    fn test_promote_retry_waits_for_delay() {
        let now = Utc::now();
        let mut queue = Queue::new("h", vec![]);
        queue.record(item(1), Err("timeout".to_string()));
        queue.last_attempt = Some(now);

        assert!(!queue.promote_retry(Duration::from_secs(30), now + chrono::Duration::seconds(10)));
        assert!(queue.promote_retry(Duration::from_secs(30), now + chrono::Duration::seconds(31)));
        assert_eq!(queue.items.len(), 1);
        assert!(queue.retry.is_empty());
        assert_eq!(queue.total(), 1);
    }

    #[test]
    fn test_message() {
        let mut queue = Queue::new("h", vec![]);
        queue.processed = 3;
        assert_eq!(queue.message(5), "all 3 items checked");

        for n in 0..3 {
            queue.record(item(n), Err("denied".to_string()));
        }
        let msg = queue.message(2);
        assert!(msg.starts_with("3 of 6 processed, 3 items with errors:"));
        assert!(msg.contains("- source: module/image-0, image: r.example.com/deckhouse@sha256:00, error: denied"));
        assert!(!msg.contains("image-2"));
        assert!(msg.ends_with("...and more"));
    }
}
