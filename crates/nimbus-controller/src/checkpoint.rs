use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use nimbus_core::vnet::VnetState;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{debug, warn};

use crate::config::CcConfig;
use crate::instance_cache::InstanceCache;
use crate::network;
use crate::resource_cache::ResourceCache;
use crate::state::ClusterState;

/// Bumped whenever a region's layout changes; a mismatch on disk means
/// fresh start, never migration.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(serde::Serialize, serde::Deserialize)]
struct Region<T> {
    schema_version: u32,
    data: T,
}

/// The rehydrated regions; any of them may be absent or unusable.
#[derive(Default)]
pub struct Regions {
    pub config: Option<CcConfig>,
    pub instances: Option<InstanceCache>,
    pub resources: Option<ResourceCache>,
    pub vnet: Option<VnetState>,
}

/// Load whatever checkpointed regions are present and version-compatible.
pub async fn rehydrate(dir: &Path) -> Regions {
    Regions {
        config: load_region(dir, "config").await,
        instances: load_region(dir, "instances").await,
        resources: load_region(dir, "resources").await,
        vnet: load_region(dir, "vnet").await,
    }
}

async fn load_region<T: DeserializeOwned>(dir: &Path, name: &str) -> Option<T> {
    let path = dir.join(format!("{}.json", name));
    let bytes = fs::read(&path).await.ok()?;
    match serde_json::from_slice::<Region<T>>(&bytes) {
        Ok(region) if region.schema_version == SCHEMA_VERSION => {
            debug!(region = name, "Rehydrated checkpoint region");
            Some(region.data)
        }
        Ok(region) => {
            warn!(
                region = name,
                found = region.schema_version,
                expected = SCHEMA_VERSION,
                "Checkpoint schema mismatch, starting fresh"
            );
            None
        }
        Err(e) => {
            warn!(region = name, error = %e, "Unreadable checkpoint region, starting fresh");
            None
        }
    }
}

async fn write_region<T: Serialize>(dir: &Path, name: &str, data: &T) -> Result<()> {
    let region = Region {
        schema_version: SCHEMA_VERSION,
        data,
    };
    let bytes = serde_json::to_vec(&region)?;
    let tmp = dir.join(format!("{}.json.tmp", name));
    let path = dir.join(format!("{}.json", name));
    fs::write(&tmp, &bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Snapshot all four regions (brief, in rank order) and write them out.
pub async fn flush(state: &ClusterState) -> Result<()> {
    let config = { state.config.lock().await.clone() };
    let instances = { state.instances.lock().await.clone() };
    let resources = { state.resources.lock().await.clone() };
    let vnet = { state.vnet.lock().await.clone() };

    let dir = config.state_dir.clone();
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating state dir {}", dir.display()))?;

    write_region(&dir, "config", &config).await?;
    write_region(&dir, "instances", &instances).await?;
    write_region(&dir, "resources", &resources).await?;
    write_region(&dir, "vnet", &vnet).await?;
    debug!(dir = %dir.display(), "Checkpoint flushed");
    Ok(())
}

/// Fire-and-forget flush; the verb does not wait for the disk.
pub fn spawn_flush(state: &Arc<ClusterState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(e) = flush(&state).await {
            warn!(error = %e, "Checkpoint flush failed");
        }
    });
}

/// Verb-completion hook: re-assert network state, then flush asynchronously.
pub async fn verb_complete(state: &Arc<ClusterState>) {
    if let Err(e) = network::maintain_network_state(state).await {
        warn!(error = %e, "Network state maintenance failed");
    }
    spawn_flush(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MANAGED_CONFIG, harness, pending_record, up_node};

    #[tokio::test]
    async fn test_flush_then_rehydrate_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0"), up_node("nc1")]).await;
        {
            let mut config = h.state.config.lock().await;
            config.state_dir = dir.path().to_path_buf();
            config.sched_state = 1;
        }
        {
            let mut instances = h.state.instances.lock().await;
            instances.add(pending_record("i-1", 0));
        }

        flush(&h.state).await.unwrap();

        let regions = rehydrate(dir.path()).await;
        assert_eq!(regions.config.unwrap().sched_state, 1);
        let instances = regions.instances.unwrap();
        assert!(instances.find_by_id("i-1").is_some());
        let resources = regions.resources.unwrap();
        assert_eq!(resources.hostnames(), vec!["nc0", "nc1"]);
        assert_eq!(regions.vnet.unwrap().public_ips.len(), 2);
    }

    #[tokio::test]
    async fn test_rehydrate_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let regions = rehydrate(dir.path()).await;
        assert!(regions.config.is_none());
        assert!(regions.instances.is_none());
        assert!(regions.resources.is_none());
        assert!(regions.vnet.is_none());
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = serde_json::json!({
            "schema_version": SCHEMA_VERSION + 1,
            "data": { "entries": {} }
        });
        std::fs::write(
            dir.path().join("instances.json"),
            serde_json::to_vec(&bogus).unwrap(),
        )
        .unwrap();

        let regions = rehydrate(dir.path()).await;
        assert!(regions.instances.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_region_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vnet.json"), b"not json at all").unwrap();
        let regions = rehydrate(dir.path()).await;
        assert!(regions.vnet.is_none());
    }
}
