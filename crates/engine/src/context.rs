//! Shared context of all entities
//!
//! One `WikiContext` per process: the table, the relational store, the
//! droplet generator, the external-cache policy, the batch retry policy and
//! the clock. Entities hold it behind an `Arc`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use wikivc_core::{Droplet, DropletGenerator, Result};
use wikivc_storage::{KvTable, RetryConfig};

use crate::config::WikiConfig;
use crate::external::ExternalCache;
use crate::relational::RelationalStore;

/// Source of the current time
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock stopped at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Set the clock
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Everything an entity needs to talk to the outside world
pub struct WikiContext {
    /// Sorted key-value table
    pub table: Arc<dyn KvTable>,
    /// Relational store
    pub relational: Arc<dyn RelationalStore>,
    /// Id generator
    pub ids: Arc<DropletGenerator>,
    /// External field policy
    pub external: ExternalCache,
    /// Batch write retry policy
    pub retry: RetryConfig,
    /// Rewrite a stale latest pointer when a consistent load detects one
    pub repair_stale_latest: bool,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl WikiContext {
    /// Context built from a configuration
    pub fn new(
        table: Arc<dyn KvTable>,
        relational: Arc<dyn RelationalStore>,
        config: &WikiConfig,
    ) -> Result<Self> {
        Ok(Self {
            table,
            relational,
            ids: Arc::new(DropletGenerator::new(config.resolve_machine_tag())),
            external: ExternalCache::new().with_ttl_overrides(&config.ttl_overrides()?),
            retry: config.retry.clone(),
            repair_stale_latest: config.repair_stale_latest,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the id generator
    pub fn with_generator(mut self, ids: Arc<DropletGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Current time
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// New droplet stamped with the current time
    pub fn next_id(&self) -> Droplet {
        self.ids.generate(self.now())
    }
}

impl fmt::Debug for WikiContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WikiContext")
            .field("machine_tag", &self.ids.machine_tag())
            .field("retry", &self.retry)
            .field("repair_stale_latest", &self.repair_stale_latest)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
