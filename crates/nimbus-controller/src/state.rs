use std::sync::Arc;

use nimbus_core::CcError;
use nimbus_core::host::HostTools;
use nimbus_core::nc::NcClient;
use nimbus_core::vnet::{VnetService, VnetState};
use tracing::{info, warn};

use crate::checkpoint;
use crate::config::CcConfig;
use crate::instance_cache::InstanceCache;
use crate::locks::{LockId, OrderedMutex};
use crate::network;
use crate::resource_cache::ResourceCache;

/// Capability handles the control plane consumes but does not define.
#[derive(Clone)]
pub struct Capabilities {
    pub nc: Arc<dyn NcClient>,
    pub vnet: Arc<dyn VnetService>,
    pub tools: Arc<dyn HostTools>,
}

/// The four shared regions plus the NC critical-section lock, each behind
/// its ranked mutex, and the capability set. Handlers receive this context
/// explicitly; there is no module-level mutable state.
pub struct ClusterState {
    /// One-time initialization latch (network-state restore).
    pub init: OrderedMutex<bool>,
    pub config: OrderedMutex<CcConfig>,
    /// Serializes all NC traffic fleet-wide.
    pub nc_call: OrderedMutex<()>,
    pub instances: OrderedMutex<InstanceCache>,
    pub resources: OrderedMutex<ResourceCache>,
    pub vnet: OrderedMutex<VnetState>,
    pub caps: Capabilities,
}

impl ClusterState {
    /// Assemble from explicit parts. Used by [`ClusterState::open`] and by
    /// tests that want full control over the starting caches.
    pub fn assemble(
        config: CcConfig,
        instances: InstanceCache,
        resources: ResourceCache,
        vnet: VnetState,
        caps: Capabilities,
    ) -> Arc<Self> {
        Arc::new(Self {
            init: OrderedMutex::new(LockId::Init, false),
            config: OrderedMutex::new(LockId::Config, config),
            nc_call: OrderedMutex::new(LockId::NcCall, ()),
            instances: OrderedMutex::new(LockId::InstCache, instances),
            resources: OrderedMutex::new(LockId::ResCache, resources),
            vnet: OrderedMutex::new(LockId::Vnet, vnet),
            caps,
        })
    }

    /// Build the controller state for a loaded configuration: rehydrate the
    /// checkpointed regions when they are usable, start fresh otherwise.
    pub async fn open(mut config: CcConfig, caps: Capabilities) -> Result<Arc<Self>, CcError> {
        let regions = checkpoint::rehydrate(&config.state_dir).await;

        // The scheduler cursor lives in the config region; everything else
        // in it comes fresh from the files.
        if let Some(old) = regions.config {
            config.sched_state = old.sched_state;
        }

        let fresh_nodes = config.build_nodes(caps.tools.as_ref());
        let resources = match regions.resources {
            Some(cached) if cached.hostnames() == config.nodes => {
                info!(nodes = cached.len(), "Rehydrated resource cache");
                cached
            }
            _ => ResourceCache::new(fresh_nodes),
        };

        let instances = regions.instances.unwrap_or_default();
        if !instances.is_empty() {
            info!(instances = instances.len(), "Rehydrated instance cache");
        }

        let vnet = match regions.vnet {
            Some(state) => state,
            None => {
                let mut state = VnetState::default();
                caps.vnet.init(&mut state, &config.vnet).await?;
                state
            }
        };

        Ok(Self::assemble(config, instances, resources, vnet, caps))
    }

    /// Run the one-time startup work exactly once across all callers:
    /// re-assert host network state from the rehydrated vnet region. Every
    /// verb calls this first; the Init lock ranks below everything else.
    pub async fn ensure_initialized(&self) -> Result<(), CcError> {
        let mut init = self.init.lock().await;
        if *init {
            return Ok(());
        }
        if let Err(e) = network::restore_network_state(self, &init).await {
            // Best effort: a partially restored network is still serviceable
            warn!(error = %e, "Network state restore incomplete");
        }
        *init = true;
        Ok(())
    }
}
