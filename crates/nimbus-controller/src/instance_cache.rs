use std::collections::HashMap;

use nimbus_core::instance::InstanceRecord;
use nimbus_core::time::unix_now;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One cached instance with its last-seen timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedInstance {
    pub record: InstanceRecord,
    pub last_seen: u64,
}

/// The authoritative in-memory set of known VM records, keyed by
/// instance-id. Entries age out when not refreshed within the instance
/// timeout. Guarded by the InstCache lock; every method here assumes the
/// caller holds it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceCache {
    entries: HashMap<String, CachedInstance>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_by_id(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.entries.get(instance_id).map(|e| e.record.clone())
    }

    /// Look up by public or private IP.
    pub fn find_by_ip(&self, ip: &str) -> Option<InstanceRecord> {
        self.entries
            .values()
            .find(|e| e.record.net.public_ip == ip || e.record.net.private_ip == ip)
            .map(|e| e.record.clone())
    }

    /// Idempotent admit: when the id is already cached only the last-seen
    /// stamp moves; the stored contents are untouched.
    pub fn add(&mut self, record: InstanceRecord) {
        let now = unix_now();
        if let Some(existing) = self.entries.get_mut(&record.instance_id) {
            existing.last_seen = now;
            return;
        }
        debug!(instance = %record.instance_id, state = %record.state, "Adding instance to cache");
        self.entries.insert(
            record.instance_id.clone(),
            CachedInstance {
                record,
                last_seen: now,
            },
        );
    }

    /// Overwrite-or-add: the record replaces whatever is cached.
    pub fn refresh(&mut self, record: InstanceRecord) {
        let now = unix_now();
        self.entries.insert(
            record.instance_id.clone(),
            CachedInstance {
                record,
                last_seen: now,
            },
        );
    }

    pub fn del(&mut self, instance_id: &str) {
        self.entries.remove(instance_id);
    }

    /// Drop every entry not seen within `timeout_secs`. Returns the ids
    /// that were invalidated.
    pub fn invalidate_stale(&mut self, timeout_secs: u64) -> Vec<String> {
        let now = unix_now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_seen) > timeout_secs)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            debug!(instance = %id, "Invalidating stale instance");
            self.entries.remove(id);
        }
        stale
    }

    /// Apply `op` to every record matching `matches`. Returns how many
    /// records were touched.
    pub fn map<M, O>(&mut self, matches: M, mut op: O) -> usize
    where
        M: Fn(&InstanceRecord) -> bool,
        O: FnMut(&mut InstanceRecord),
    {
        let mut touched = 0;
        for entry in self.entries.values_mut() {
            if matches(&entry.record) {
                op(&mut entry.record);
                touched += 1;
            }
        }
        touched
    }

    /// Backdate an entry's last-seen stamp (staleness tests).
    #[cfg(test)]
    pub fn age_entry(&mut self, instance_id: &str, secs: u64) {
        if let Some(entry) = self.entries.get_mut(instance_id) {
            entry.last_seen = entry.last_seen.saturating_sub(secs);
        }
    }

    /// Copy of every record, sorted by instance id for stable output.
    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        let mut out: Vec<InstanceRecord> =
            self.entries.values().map(|e| e.record.clone()).collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        out
    }
}
