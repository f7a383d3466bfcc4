//! Delegate-side webhook front-end (§6, "Webhook front-end (delegate)").
//!
//! An external service (GitHub, GitLab, or anything else an operator wires
//! up) POSTs to one of the endpoints in `webhook.toml`. This crate verifies
//! the delivery's signature, normalizes its payload into the
//! `{context, systemMessage}` shape the Event Queue expects, and hands the
//! resulting `mcpl/push_event` to a [`PushEventSink`] — the delegate
//! process's own connection to the host, out of scope for this crate (see
//! [`sink`]).
//!
//! Usable as a library embedded in a larger delegate process, or run
//! standalone via the `mcpl-webhook` binary for endpoint smoke-testing.

pub mod args;
pub mod config;
pub mod error;
pub mod normalize;
pub mod server;
pub mod signature;
pub mod sink;

pub use config::WebhookConfig;
pub use config::WebhookEndpointConfig;
pub use error::Result;
pub use error::WebhookError;
pub use server::build_router;
pub use sink::LoggingSink;
pub use sink::PushEventSink;
