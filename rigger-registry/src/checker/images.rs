//! Target image set for a registry

use super::params::CheckMode;
use super::queue::Item;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DECKHOUSE_SOURCE: &str = "deckhouse";

/// Images the cluster needs, as published by the running release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesInfo {
    /// Tag of the running deckhouse image, e.g. `v1.69.3`
    pub deckhouse_tag: String,
    /// `<module>/<image>` to digest
    pub digests: BTreeMap<String, String>,
}

impl ImagesInfo {
    /// Flatten the nested `images_digests.json` layout
    /// (`{module: {image: digest}}`).
    pub fn from_digests_json(deckhouse_tag: &str, data: &[u8]) -> rigger_core::RiggerResult<Self> {
        let nested: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_slice(data)
            .map_err(|e| rigger_core::RiggerError::parse("images digests", e))?;

        let digests = nested
            .into_iter()
            .flat_map(|(module, images)| {
                images
                    .into_iter()
                    .map(move |(image, digest)| (format!("{}/{}", module, image), digest))
            })
            .collect();

        Ok(Self {
            deckhouse_tag: deckhouse_tag.to_string(),
            digests,
        })
    }
}

/// Build the queue items for `address`.
///
/// Soft mode probes only the deckhouse image tag; the default mode probes
/// every known digest, deduplicated.
pub fn build_items(address: &str, info: &ImagesInfo, mode: CheckMode) -> Vec<Item> {
    let address = address.trim_end_matches('/');
    match mode {
        CheckMode::Soft => vec![Item {
            image: format!("{}:{}", address, info.deckhouse_tag),
            source: DECKHOUSE_SOURCE.to_string(),
        }],
        CheckMode::Default => {
            let mut seen = std::collections::BTreeSet::new();
            info.digests
                .iter()
                .filter(|(_, digest)| seen.insert(digest.as_str()))
                .map(|(source, digest)| Item {
                    image: format!("{}@{}", address, digest),
                    source: source.clone(),
                })
                .collect()
        }
    }
}
