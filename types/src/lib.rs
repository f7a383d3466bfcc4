//! Wire types shared by the MCPL host and delegate processes.
//!
//! Everything here is pure data: `serde`-driven (de)serialization only, no
//! I/O and no async. The host and the delegate-side crates both depend on
//! this crate so that a single source of truth defines the shape of every
//! message that crosses the wire.

mod capability;
mod close;
pub mod delegate_to_host;
mod feature_set;
mod frame;
pub mod host_to_delegate;
mod tool;

#[cfg(test)]
mod tests;

pub use capability::Capability;
pub use close::CloseCode;
pub use delegate_to_host::DelegateToHost;
pub use delegate_to_host::HookInjection;
pub use delegate_to_host::InjectionPosition;
pub use feature_set::FeatureSet;
pub use feature_set::FeatureSetMap;
pub use frame::ReliableFrame;
pub use host_to_delegate::CheckpointSummary;
pub use host_to_delegate::HostToDelegate;
pub use host_to_delegate::ScopeContext;
pub use host_to_delegate::ToolInvocation;
pub use tool::ToolCallContent;
pub use tool::ToolCallResult;
pub use tool::ToolManifestEntry;

/// Re-exported so downstream crates apply RFC 6902 patches without pinning
/// their own `json-patch` version.
pub use json_patch::Patch as JsonPatch;
