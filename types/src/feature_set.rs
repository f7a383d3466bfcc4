use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// Per-server record of the four MCPL feature flags. Keys in a
/// [`FeatureSetMap`] may be concrete `serverId`s or `prefix.*` wildcards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default)]
    pub context_hooks: bool,
    #[serde(default)]
    pub push_events: bool,
    #[serde(default)]
    pub inference_requests: bool,
    #[serde(default)]
    pub tool_management: bool,
}

/// `serverId | "prefix.*"` -> [`FeatureSet`], as sent in `mcpl/featureSets_changed`.
pub type FeatureSetMap = HashMap<String, FeatureSet>;
