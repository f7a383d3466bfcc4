use serde::Deserialize;
use serde::Serialize;

/// One of the four MCPL capabilities a session can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ContextHooks,
    PushEvents,
    InferenceRequests,
    ToolManagement,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::ContextHooks,
        Capability::PushEvents,
        Capability::InferenceRequests,
        Capability::ToolManagement,
    ];
}
