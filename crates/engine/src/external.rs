//! External-data cache
//!
//! External fields are values owned by the relational aggregate of a
//! collection (links, market figures) and copied onto documents and blocks
//! with a per-field time to live.
//!
//! ```text
//! field          ttl     upstream column
//! website        24h     links.website
//! twitter        24h     links.twitter
//! discord        24h     links.discord
//! floor_price    15m     floor_price
//! total_volume   1h      total_volume
//! owner_count    1h      owner_count
//! ```
//!
//! An entry is expired when it was never fetched or when
//! `now > cached_at + ttl`. All expired fields of one map are refreshed with
//! a single upstream call.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;
use wikivc_core::{CacheEntry, ExternalField, ExternalMap, Result};

use crate::relational::{Aggregate, RelationalStore};

const LINKS: &str = "links";

/// Where a field's value comes from in the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// Key inside the `links` object column
    Link(&'static str),
    /// Top-level column
    Column(&'static str),
}

impl Source {
    fn column(&self) -> &'static str {
        match self {
            Source::Link(_) => LINKS,
            Source::Column(c) => *c,
        }
    }

    fn extract(&self, aggregate: &Aggregate) -> (Option<Value>, Option<DateTime<Utc>>) {
        let Some(column) = aggregate.get(self.column()) else {
            return (None, None);
        };
        let value = match self {
            Source::Link(key) => column
                .value
                .as_ref()
                .and_then(|links| links.get(*key))
                .filter(|v| !v.is_null())
                .cloned(),
            Source::Column(_) => column.value.clone().filter(|v| !v.is_null()),
        };
        (value, column.updated_at)
    }
}

/// Refresh policy of one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPolicy {
    /// Time to live of a fetched value
    pub ttl: Duration,
    source: Source,
}

impl FieldPolicy {
    /// Upstream column needed to recompute the field
    pub fn requires(&self) -> &'static str {
        self.source.column()
    }
}

fn default_policy(field: ExternalField) -> FieldPolicy {
    let (ttl, source) = match field {
        ExternalField::Website => (Duration::hours(24), Source::Link("website")),
        ExternalField::Twitter => (Duration::hours(24), Source::Link("twitter")),
        ExternalField::Discord => (Duration::hours(24), Source::Link("discord")),
        ExternalField::FloorPrice => (Duration::minutes(15), Source::Column("floor_price")),
        ExternalField::TotalVolume => (Duration::hours(1), Source::Column("total_volume")),
        ExternalField::OwnerCount => (Duration::hours(1), Source::Column("owner_count")),
    };
    FieldPolicy { ttl, source }
}

/// Expired fields of one map and the upstream columns they need
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiredFields {
    /// Fields to recompute
    pub fields: Vec<ExternalField>,
    /// Union of upstream columns needed
    pub requires: BTreeSet<&'static str>,
}

impl ExpiredFields {
    /// Whether nothing needs refreshing
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Per-field TTL cache policy
#[derive(Debug, Clone)]
pub struct ExternalCache {
    policies: BTreeMap<ExternalField, FieldPolicy>,
}

impl Default for ExternalCache {
    fn default() -> Self {
        Self {
            policies: ExternalField::ALL
                .into_iter()
                .map(|f| (f, default_policy(f)))
                .collect(),
        }
    }
}

impl ExternalCache {
    /// Cache with the built-in policies
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the TTL of the given fields
    pub fn with_ttl_overrides(mut self, overrides: &BTreeMap<ExternalField, Duration>) -> Self {
        for (field, ttl) in overrides {
            if let Some(policy) = self.policies.get_mut(field) {
                policy.ttl = *ttl;
            }
        }
        self
    }

    /// Policy of a field
    pub fn policy(&self, field: ExternalField) -> FieldPolicy {
        self.policies
            .get(&field)
            .cloned()
            .unwrap_or_else(|| default_policy(field))
    }

    /// Time to live of a field
    pub fn ttl(&self, field: ExternalField) -> Duration {
        self.policy(field).ttl
    }

    /// Whether an entry must be refetched at `now`
    pub fn is_expired(&self, field: ExternalField, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match entry.cached_at {
            None => true,
            Some(cached_at) => now > cached_at + self.ttl(field),
        }
    }

    /// Expired fields of `map` at `now`
    pub fn get_expired(&self, map: &ExternalMap, now: DateTime<Utc>) -> ExpiredFields {
        let mut expired = ExpiredFields::default();
        for (field, entry) in map {
            if self.is_expired(*field, entry, now) {
                expired.fields.push(*field);
                expired.requires.insert(self.policy(*field).requires());
            }
        }
        expired
    }

    /// Fetch the upstream columns needed by `expired` in one call
    ///
    /// Makes no call when nothing is expired.
    pub async fn load(
        &self,
        relational: &dyn RelationalStore,
        collection_id: &str,
        expired: &ExpiredFields,
    ) -> Result<Option<Aggregate>> {
        if expired.is_empty() {
            return Ok(None);
        }
        let columns: Vec<&str> = expired.requires.iter().copied().collect();
        relational.load_aggregate_fields(collection_id, &columns).await
    }

    /// Replace every expired entry with a freshly fetched one
    ///
    /// A missing aggregate records the fields as fetched and absent. Entries
    /// not listed in `expired` are untouched.
    pub fn recompute(
        &self,
        map: &ExternalMap,
        expired: &ExpiredFields,
        aggregate: Option<&Aggregate>,
        now: DateTime<Utc>,
    ) -> ExternalMap {
        let mut out = map.clone();
        for field in &expired.fields {
            let (value, updated_at) = match aggregate {
                Some(agg) => self.policy(*field).source.extract(agg),
                None => (None, None),
            };
            out.insert(*field, CacheEntry::fetched(value, now, updated_at));
        }
        out
    }

    /// Refresh the expired entries of `map`
    ///
    /// Returns `None` when there is no upstream collection or nothing is
    /// expired.
    pub async fn refresh(
        &self,
        relational: &dyn RelationalStore,
        collection_id: Option<&str>,
        map: &ExternalMap,
        now: DateTime<Utc>,
    ) -> Result<Option<ExternalMap>> {
        let Some(collection_id) = collection_id else {
            return Ok(None);
        };
        let expired = self.get_expired(map, now);
        if expired.is_empty() {
            return Ok(None);
        }
        debug!(
            collection = collection_id,
            fields = expired.fields.len(),
            "refreshing external fields"
        );
        let aggregate = self.load(relational, collection_id, &expired).await?;
        Ok(Some(self.recompute(map, &expired, aggregate.as_ref(), now)))
    }
}

/// Copy of `map` with every entry reset to never fetched
///
/// Used when the upstream collection changes and no cached value can be
/// trusted regardless of its age.
pub fn unfetched(map: &ExternalMap) -> ExternalMap {
    map.keys().map(|f| (*f, CacheEntry::unfetched())).collect()
}
