//! Mod Host: static registry of mods that receive dispatched envelopes.
//!
//! Each enabled mod gets its own serialization lock so the envelopes it
//! receives are handled one at a time, in arrival order, while distinct
//! mods proceed fully concurrently with each other — the same isolation
//! the message router gives each conversation's handler state, just scoped
//! to a mod instance instead of a conversation id.

pub mod thread_messaging;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::domain_types::{ModName, PeerHandle};
use crate::envelope::Envelope;
use crate::error::OrchestratorError;
use crate::orchestrator::Network;

use thread_messaging::ThreadMessagingMod;

/// Error type mods raise from their lifecycle hooks, boxed so the host
/// doesn't need to know every mod's concrete error enum.
pub type ModError = Box<dyn std::error::Error + Send + Sync>;

/// Contract every mod implements. `on_envelope` is called once per inbound
/// `mod_message` envelope addressed to this mod's name.
#[async_trait]
pub trait Mod: Send + Sync {
    /// This mod's registration name.
    fn name(&self) -> &ModName;

    /// Called once, after transports and topology are listening.
    async fn on_start(&self, network: Arc<Network>) -> Result<(), ModError>;

    /// Called for every envelope addressed to this mod.
    async fn on_envelope(
        &self,
        network: &Network,
        sender_peer: PeerHandle,
        envelope: Envelope,
    ) -> Result<(), ModError>;

    /// Called once during node shutdown, before the drain window expires.
    async fn on_shutdown(&self);
}

struct ModEntry {
    instance: Arc<dyn Mod>,
    order_lock: Mutex<()>,
}

/// Holds every enabled mod, in configuration order, and arbitrates
/// dispatch.
pub struct ModHost {
    entries: HashMap<ModName, ModEntry>,
    order: Vec<ModName>,
    network: OnceCell<Arc<Network>>,
}

impl ModHost {
    /// Builds the host from `config.mods`. Only `thread_messaging` has a
    /// built-in implementation; any other configured name is logged and
    /// skipped, since mod sandboxing and dynamic loading are out of scope.
    #[must_use]
    pub fn build(config: &NetworkConfig) -> Self {
        let mut entries = HashMap::new();
        let mut order = Vec::new();
        for section in &config.mods {
            if !section.enabled {
                continue;
            }
            let Ok(name) = ModName::try_new(section.name.clone()) else {
                warn!(name = %section.name, "skipping mod with invalid name");
                continue;
            };
            let instance: Arc<dyn Mod> = match section.name.as_str() {
                "thread_messaging" => Arc::new(ThreadMessagingMod::new(
                    name.clone(),
                    config.thread_messaging_config(),
                )),
                other => {
                    warn!(mod_name = other, "no built-in implementation for this mod, skipping");
                    continue;
                }
            };
            order.push(name.clone());
            entries.insert(
                name,
                ModEntry {
                    instance,
                    order_lock: Mutex::new(()),
                },
            );
        }
        if entries.is_empty() {
            warn!("no mods enabled; node accepts connections but dispatches no mod_message envelopes");
        }
        Self {
            entries,
            order,
            network: OnceCell::new(),
        }
    }

    /// The names of every enabled mod, in declaration order.
    #[must_use]
    pub fn mod_names(&self) -> Vec<String> {
        self.order.iter().map(ToString::to_string).collect()
    }

    /// Calls `on_start` on every enabled mod, in declaration order.
    pub async fn start_all(&self, network: Arc<Network>) {
        let _ = self.network.set(Arc::clone(&network));
        for name in &self.order {
            let entry = &self.entries[name];
            match entry.instance.on_start(Arc::clone(&network)).await {
                Ok(()) => info!(%name, "mod started"),
                Err(err) => warn!(%name, %err, "mod on_start failed"),
            }
        }
    }

    /// Dispatches `envelope` to the named mod, serialized against any other
    /// envelope currently being handled by the same mod instance.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::UnknownMod`] if no enabled mod matches
    /// `mod_name`, or if the host has not yet completed [`Self::start_all`].
    pub async fn dispatch(
        &self,
        mod_name: &ModName,
        sender_peer: PeerHandle,
        envelope: Envelope,
    ) -> Result<(), OrchestratorError> {
        let entry = self
            .entries
            .get(mod_name)
            .ok_or_else(|| OrchestratorError::UnknownMod(mod_name.to_string()))?;
        let Some(network) = self.network.get() else {
            return Err(OrchestratorError::UnknownMod(mod_name.to_string()));
        };
        let _guard = entry.order_lock.lock().await;
        if let Err(err) = entry.instance.on_envelope(network, sender_peer, envelope).await {
            warn!(%mod_name, %err, "mod on_envelope failed");
            crate::observability::record(
                network.node_id(),
                crate::observability::NetworkEvent::ModDispatchFailed {
                    mod_name: mod_name.clone(),
                    error: err.to_string(),
                },
            );
        }
        Ok(())
    }

    /// Calls `on_shutdown` on every enabled mod, in reverse declaration order.
    pub async fn shutdown_all(&self) {
        for name in self.order.iter().rev() {
            self.entries[name].instance.on_shutdown().await;
        }
    }
}
