//! # Parley — a multi-agent communication network node
//!
//! Parley is a process that accepts long-lived connections from autonomous
//! agents and routes messages among them according to one of two
//! topologies (centralized hub, or decentralized peer mesh), with
//! pluggable application-level mods that implement higher-level messaging
//! semantics on top of routed envelopes.
//!
//! ## Architecture
//!
//! - [`transport`] — the duplex-stream transport and its length-delimited
//!   JSON frame codec.
//! - [`peer`] — the per-node registry of connected peers and their bound
//!   agent identities.
//! - [`topology`] — centralized (coordinator/client) and decentralized
//!   (gossip mesh) routing.
//! - [`orchestrator`] — ties transport, topology, and mods together; owns
//!   the node's background tasks.
//! - [`mods`] — the mod host and the built-in Thread Messaging mod.
//! - [`envelope`] — the unit the transport carries.
//! - [`domain_types`] — validated newtypes shared across the crate.
//! - [`config`] — YAML-loaded node configuration.
//! - [`error`] — per-subsystem error enums and their wire-level kinds.
//! - [`server`] — the ambient HTTP health/status endpoint.
//! - [`snapshot`] — optional periodic directory persistence.
//! - [`observability`] — tracing span and event conventions.

pub mod config;
pub mod domain_types;
pub mod envelope;
pub mod error;
pub mod mods;
pub mod observability;
pub mod orchestrator;
pub mod peer;
pub mod server;
pub mod snapshot;
pub mod topology;
pub mod transport;

pub use config::NetworkConfig;
pub use envelope::{Envelope, EnvelopeKind};
pub use error::ParleyError;
pub use orchestrator::Network;
