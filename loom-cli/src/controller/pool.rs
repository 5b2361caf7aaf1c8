//! Per-compute numeric id pools.

use crate::config::PoolSection;
use loom_model::{LoomError, PoolKind, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tracing::debug;

/// Hands out the lowest free id in a fixed range.
#[derive(Debug, Clone)]
pub struct IdPool {
    range: RangeInclusive<u32>,
    used: BTreeSet<u32>,
}

impl IdPool {
    pub fn new(range: RangeInclusive<u32>) -> Self {
        Self {
            range,
            used: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        if self.range.is_empty() {
            0
        } else {
            (*self.range.end() - *self.range.start()) as usize + 1
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }

    pub fn allocate(&mut self) -> Result<u32> {
        let id = self
            .range
            .clone()
            .find(|id| !self.used.contains(id))
            .ok_or_else(|| {
                LoomError::ResourceExhausted(format!(
                    "all {} ids in {}..={} are taken",
                    self.capacity(),
                    self.range.start(),
                    self.range.end()
                ))
            })?;
        self.used.insert(id);
        Ok(id)
    }

    /// Takes a specific id, e.g. one recorded in a saved topology.
    pub fn reserve(&mut self, id: u32) -> Result<()> {
        if !self.range.contains(&id) {
            return Err(LoomError::InvalidArgument(format!(
                "id {} is outside {}..={}",
                id,
                self.range.start(),
                self.range.end()
            )));
        }
        if !self.used.insert(id) {
            return Err(LoomError::conflict(format!("id {} is already in use", id)));
        }
        Ok(())
    }

    pub fn release(&mut self, id: u32) -> bool {
        self.used.remove(&id)
    }
}

/// Key in a compute's advertised `limits` that caps a pool.
pub fn limit_key(kind: PoolKind) -> &'static str {
    match kind {
        PoolKind::ApplicationId => "application_ids",
        PoolKind::DynamipsId => "dynamips_ids",
        PoolKind::UdpPort => "udp_ports",
    }
}

type PoolKey = (String, PoolKind);

/// One mutex-guarded pool per (compute, kind), created on first use.
pub struct ComputePools {
    defaults: PoolSection,
    pools: StdMutex<HashMap<PoolKey, Arc<Mutex<IdPool>>>>,
}

impl ComputePools {
    pub fn new(defaults: PoolSection) -> Self {
        Self {
            defaults,
            pools: StdMutex::new(HashMap::new()),
        }
    }

    fn default_range(&self, kind: PoolKind) -> RangeInclusive<u32> {
        match kind {
            PoolKind::ApplicationId => 1..=self.defaults.application_ids,
            PoolKind::DynamipsId => 1..=self.defaults.dynamips_ids,
            PoolKind::UdpPort => {
                u32::from(self.defaults.udp_port_start)..=u32::from(self.defaults.udp_port_end)
            }
        }
    }

    fn pool(&self, compute_id: &str, kind: PoolKind) -> Arc<Mutex<IdPool>> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools
            .entry((compute_id.to_string(), kind))
            .or_insert_with(|| Arc::new(Mutex::new(IdPool::new(self.default_range(kind)))))
            .clone()
    }

    /// Narrows pools to the limits a compute advertises. Pools already in use
    /// keep their range.
    pub fn apply_limits(&self, compute_id: &str, limits: &BTreeMap<String, u32>) {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        for kind in [PoolKind::ApplicationId, PoolKind::DynamipsId, PoolKind::UdpPort] {
            let Some(&limit) = limits.get(limit_key(kind)) else {
                continue;
            };
            let key = (compute_id.to_string(), kind);
            if pools.contains_key(&key) {
                continue;
            }
            let default = self.default_range(kind);
            let start = *default.start();
            let end = (*default.end()).min(start.saturating_add(limit.saturating_sub(1)));
            let range = if limit == 0 { 1..=0 } else { start..=end };
            debug!(compute_id, ?kind, ?range, "Pool limited by compute");
            pools.insert(key, Arc::new(Mutex::new(IdPool::new(range))));
        }
    }

    pub async fn allocate(&self, compute_id: &str, kind: PoolKind) -> Result<u32> {
        let pool = self.pool(compute_id, kind);
        let id = pool.lock().await.allocate().map_err(|e| match e {
            LoomError::ResourceExhausted(msg) => {
                LoomError::ResourceExhausted(format!("compute {} {:?} pool: {}", compute_id, kind, msg))
            }
            other => other,
        })?;
        Ok(id)
    }

    pub async fn reserve(&self, compute_id: &str, kind: PoolKind, id: u32) -> Result<()> {
        self.pool(compute_id, kind).lock().await.reserve(id)
    }

    pub async fn release(&self, compute_id: &str, kind: PoolKind, id: u32) {
        if !self.pool(compute_id, kind).lock().await.release(id) {
            debug!(compute_id, ?kind, id, "Released an id that was not taken");
        }
    }

    pub async fn in_use(&self, compute_id: &str, kind: PoolKind) -> usize {
        self.pool(compute_id, kind).lock().await.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_id_first() {
        let mut pool = IdPool::new(1..=3);
        assert_eq!(pool.allocate().unwrap(), 1);
        assert_eq!(pool.allocate().unwrap(), 2);
        assert!(pool.release(1));
        assert_eq!(pool.allocate().unwrap(), 1);
        assert_eq!(pool.allocate().unwrap(), 3);
        assert!(matches!(pool.allocate(), Err(LoomError::ResourceExhausted(_))));
    }

    #[test]
    fn reserve_checks_range_and_use() {
        let mut pool = IdPool::new(10..=12);
        pool.reserve(11).unwrap();
        assert!(pool.reserve(11).unwrap_err().is_conflict());
        assert!(pool.reserve(13).is_err());
        assert_eq!(pool.allocate().unwrap(), 10);
        assert_eq!(pool.allocate().unwrap(), 12);
    }

    #[tokio::test]
    async fn pools_are_per_compute_and_kind() {
        let pools = ComputePools::new(PoolSection {
            application_ids: 1,
            ..PoolSection::default()
        });
        assert_eq!(pools.allocate("c1", PoolKind::ApplicationId).await.unwrap(), 1);
        assert_eq!(pools.allocate("c2", PoolKind::ApplicationId).await.unwrap(), 1);
        assert!(pools.allocate("c1", PoolKind::ApplicationId).await.is_err());
        assert_eq!(pools.allocate("c1", PoolKind::UdpPort).await.unwrap(), 20000);
    }

    #[tokio::test]
    async fn advertised_limits_shrink_new_pools() {
        let pools = ComputePools::new(PoolSection::default());
        let limits = BTreeMap::from([("dynamips_ids".to_string(), 2)]);
        pools.apply_limits("c1", &limits);
        pools.allocate("c1", PoolKind::DynamipsId).await.unwrap();
        pools.allocate("c1", PoolKind::DynamipsId).await.unwrap();
        assert!(pools.allocate("c1", PoolKind::DynamipsId).await.is_err());
    }
}
