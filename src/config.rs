#![forbid(unsafe_code)]
//! TOML configuration for a keyclaim instance.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! [`KeyclaimConfig::validate`] rejects inconsistent settings up front
//! instead of silently replacing them.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{
    IdAuthorityOptions, IdBlockSizer, IdPlacementStrategy, IdPoolOptions, PoolTypeBlockSizer,
    PropertyPlacementStrategy, SimpleBulkPlacementStrategy, DEFAULT_ID_STORE_NAME,
};
use crate::locking::options::{
    DEFAULT_LOCK_EXPIRE, DEFAULT_LOCK_RETRY_COUNT, DEFAULT_LOCK_WAIT, DEFAULT_MEDIATOR_PREFIX,
    DEFAULT_OPERATION_TIMEOUT,
};
use crate::locking::LockerOptions;
use crate::primitives::time::{SystemTimestamps, TimestampProvider, TimestampResolution};
use crate::types::{ClaimError, PartitionId, Result, Rid};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyclaimConfig {
    pub instance: InstanceConfig,
    pub locking: LockingConfig,
    pub ids: IdsConfig,
    pub placement: PlacementConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceConfig {
    /// Explicit instance id; derived from host and process when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    pub timestamp_resolution: TimestampResolution,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockingConfig {
    pub retry_count: usize,
    pub wait_ms: u64,
    pub expire_ms: u64,
    pub mediator_prefix: String,
    pub clean_expired: bool,
    pub operation_timeout_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_LOCK_RETRY_COUNT,
            wait_ms: DEFAULT_LOCK_WAIT.as_millis() as u64,
            expire_ms: DEFAULT_LOCK_EXPIRE.as_millis() as u64,
            mediator_prefix: DEFAULT_MEDIATOR_PREFIX.to_owned(),
            clean_expired: false,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdsConfig {
    /// Base block size; other pool types are sized relative to it.
    pub block_size: u64,
    /// Exclusive per-partition id limit; unlimited when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_upper_bound: Option<u64>,
    pub store_name: String,
    pub renew_timeout_ms: u64,
    pub renew_buffer_percentage: f64,
    pub authority_wait_ms: u64,
    pub partition_bound: PartitionId,
}

impl Default for IdsConfig {
    fn default() -> Self {
        Self {
            block_size: 10_000,
            id_upper_bound: None,
            store_name: DEFAULT_ID_STORE_NAME.to_owned(),
            renew_timeout_ms: 120_000,
            renew_buffer_percentage: 0.3,
            authority_wait_ms: 300,
            partition_bound: 32,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementKind {
    #[default]
    Simple,
    Property,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlacementConfig {
    pub strategy: PlacementKind,
    pub concurrent_partitions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    /// Placements between window re-randomizations; 0 disables.
    pub rotation_interval: u64,
    /// Fixed random seed for reproducible placement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            strategy: PlacementKind::Simple,
            concurrent_partitions: 10,
            partition_key: None,
            rotation_interval: 0,
            seed: None,
        }
    }
}

impl KeyclaimConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| ClaimError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|err| match err {
            ClaimError::Config(msg) => ClaimError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| ClaimError::Config(err.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(ClaimError::Config(msg));
        let locking = &self.locking;
        if locking.retry_count == 0 {
            return bad("locking.retry_count must be at least 1".into());
        }
        // a claim must outlive the wait before its own verification
        if locking.expire_ms < locking.wait_ms
            || (locking.wait_ms > 0 && locking.expire_ms == locking.wait_ms)
        {
            return bad(format!(
                "locking.expire_ms ({}) must exceed locking.wait_ms ({})",
                locking.expire_ms, locking.wait_ms
            ));
        }
        if locking.mediator_prefix.is_empty() {
            return bad("locking.mediator_prefix must not be empty".into());
        }
        if locking.operation_timeout_ms == 0 {
            return bad("locking.operation_timeout_ms must be positive".into());
        }
        if let Some(rid) = &self.instance.rid {
            if rid.is_empty() {
                return bad("instance.rid must not be empty".into());
            }
        }

        let ids = &self.ids;
        if ids.block_size == 0 {
            return bad("ids.block_size must be positive".into());
        }
        if ids.id_upper_bound == Some(0) {
            return bad("ids.id_upper_bound must be positive".into());
        }
        if ids.store_name.is_empty() {
            return bad("ids.store_name must not be empty".into());
        }
        if ids.renew_timeout_ms == 0 {
            return bad("ids.renew_timeout_ms must be positive".into());
        }
        if !(ids.renew_buffer_percentage > 0.0 && ids.renew_buffer_percentage <= 1.0) {
            return bad(format!(
                "ids.renew_buffer_percentage must be in (0, 1], got {}",
                ids.renew_buffer_percentage
            ));
        }
        if ids.partition_bound == 0 {
            return bad("ids.partition_bound must be at least 1".into());
        }

        let placement = &self.placement;
        if placement.concurrent_partitions == 0 {
            return bad("placement.concurrent_partitions must be at least 1".into());
        }
        if placement.concurrent_partitions as u64 > u64::from(ids.partition_bound) {
            return bad(format!(
                "placement.concurrent_partitions ({}) exceeds ids.partition_bound ({})",
                placement.concurrent_partitions, ids.partition_bound
            ));
        }
        if placement.strategy == PlacementKind::Property
            && placement.partition_key.as_deref().map_or(true, str::is_empty)
        {
            return bad("placement.strategy = \"property\" requires placement.partition_key".into());
        }
        Ok(())
    }

    /// The configured rid, or one derived from this process.
    pub fn rid(&self) -> Result<Rid> {
        match &self.instance.rid {
            Some(rid) => Rid::new(rid.clone()),
            None => Ok(Rid::from_process()),
        }
    }

    pub fn timestamps(&self) -> Arc<dyn TimestampProvider> {
        Arc::new(SystemTimestamps::new(self.instance.timestamp_resolution))
    }

    pub fn locker_options(&self, rid: Rid) -> LockerOptions {
        let l = &self.locking;
        LockerOptions::new(rid)
            .retry_count(l.retry_count)
            .lock_wait(Duration::from_millis(l.wait_ms))
            .lock_expire(Duration::from_millis(l.expire_ms))
            .mediator_prefix(l.mediator_prefix.clone())
            .clean_expired(l.clean_expired)
            .operation_timeout(Duration::from_millis(l.operation_timeout_ms))
    }

    pub fn id_authority_options(&self) -> IdAuthorityOptions {
        IdAuthorityOptions::new()
            .store_name(self.ids.store_name.clone())
            .wait(Duration::from_millis(self.ids.authority_wait_ms))
            .operation_timeout(Duration::from_millis(self.locking.operation_timeout_ms))
    }

    pub fn id_pool_options(&self) -> IdPoolOptions {
        IdPoolOptions::new()
            .renew_timeout(Duration::from_millis(self.ids.renew_timeout_ms))
            .renew_buffer_percentage(self.ids.renew_buffer_percentage)
    }

    pub fn block_sizer(&self) -> Result<Arc<dyn IdBlockSizer>> {
        let bound = self.ids.id_upper_bound.unwrap_or(u64::MAX);
        Ok(Arc::new(PoolTypeBlockSizer::new(self.ids.block_size, bound)?))
    }

    pub fn placement_strategy(&self) -> Result<Arc<dyn IdPlacementStrategy>> {
        let p = &self.placement;
        let bound = self.ids.partition_bound;
        let bulk = match p.seed {
            Some(seed) => SimpleBulkPlacementStrategy::with_seed(p.concurrent_partitions, bound, seed)?,
            None => SimpleBulkPlacementStrategy::new(p.concurrent_partitions, bound)?,
        }
        .rotation_interval(p.rotation_interval);
        match (p.strategy, &p.partition_key) {
            (PlacementKind::Simple, _) => Ok(Arc::new(bulk)),
            (PlacementKind::Property, Some(key)) => Ok(Arc::new(PropertyPlacementStrategy::new(
                key.clone(),
                bound,
                Arc::new(bulk),
            )?)),
            (PlacementKind::Property, None) => Err(ClaimError::Config(
                "placement.strategy = \"property\" requires placement.partition_key".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{PartitionValue, PropertyMap};
    use tempfile::tempdir;

    #[test]
    fn empty_file_uses_defaults() {
        let config = KeyclaimConfig::from_toml_str("").unwrap();
        assert_eq!(config, KeyclaimConfig::default());
        assert_eq!(config.locking.retry_count, 3);
        assert_eq!(config.locking.wait_ms, 100);
        assert_eq!(config.locking.expire_ms, 300_000);
        assert_eq!(config.ids.partition_bound, 32);
        assert_eq!(config.placement.concurrent_partitions, 10);
    }

    #[test]
    fn zero_wait_and_expire_is_legal() {
        let config = KeyclaimConfig::from_toml_str(
            "[locking]\nwait_ms = 0\nexpire_ms = 0\nretry_count = 3\n",
        )
        .unwrap();
        let opts = config.locker_options(Rid::new("A").unwrap());
        assert_eq!(opts.lock_wait, Duration::ZERO);
        assert_eq!(opts.lock_expire, Duration::ZERO);
    }

    #[test]
    fn inconsistent_settings_are_rejected() {
        let cases = [
            "[locking]\nretry_count = 0\n",
            "[locking]\nwait_ms = 500\nexpire_ms = 100\n",
            "[locking]\nwait_ms = 50\nexpire_ms = 50\n",
            "[locking]\nmediator_prefix = \"\"\n",
            "[ids]\nblock_size = 0\n",
            "[ids]\nrenew_buffer_percentage = 1.5\n",
            "[ids]\npartition_bound = 4\n[placement]\nconcurrent_partitions = 5\n",
            "[placement]\nstrategy = \"property\"\n",
            "[instance]\nbogus = 1\n",
        ];
        for case in cases {
            let err = KeyclaimConfig::from_toml_str(case).unwrap_err();
            assert!(matches!(err, ClaimError::Config(_)), "{case}: {err}");
        }
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyclaim.toml");
        let mut config = KeyclaimConfig::default();
        config.instance.rid = Some("node-a".into());
        config.placement.strategy = PlacementKind::Property;
        config.placement.partition_key = Some("tenant".into());
        fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        let loaded = KeyclaimConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.rid().unwrap().as_bytes(), b"node-a");
    }

    #[test]
    fn property_strategy_is_built_from_config() {
        let config = KeyclaimConfig::from_toml_str(
            "[ids]\npartition_bound = 16\n[placement]\nstrategy = \"property\"\npartition_key = \"tenant\"\nconcurrent_partitions = 4\nseed = 1\n",
        )
        .unwrap();
        let strategy = config.placement_strategy().unwrap();
        let element = PropertyMap::new().with("tenant", "acme");
        assert_eq!(
            strategy.get_partition(&element).unwrap(),
            PartitionValue::from("acme").partition(16)
        );
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = KeyclaimConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ClaimError::Io(_)));
    }
}
