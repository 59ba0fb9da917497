//! MemoryTable: in-process implementation of `KvTable`
//!
//! Backed by ordered maps behind a single `parking_lot::RwLock`:
//! - primary map `(pk, sk) -> Item`
//! - one map per secondary index `(index pk, index sk) -> (pk, sk)`
//!
//! Every read is strongly consistent, so the `consistent` flag is accepted
//! and ignored. The table counts calls and written items, and can be
//! scripted to hand back unprocessed batch items or fail batch calls with a
//! transient error, which is how the retry paths are exercised.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::trace;
use wikivc_core::{Error, Result};

use crate::table::{Item, KvTable, PageToken, Query, QueryPage};

/// Default number of items per query page
pub const DEFAULT_PAGE_SIZE: usize = 100;

type PrimaryKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    items: BTreeMap<PrimaryKey, Item>,
    indexes: BTreeMap<String, BTreeMap<PrimaryKey, PrimaryKey>>,
}

impl Tables {
    fn insert(&mut self, item: Item) {
        let key = (item.partition_key.clone(), item.sort_key.clone());
        if let Some(old) = self.items.remove(&key) {
            for (name, ik) in &old.indexes {
                if let Some(index) = self.indexes.get_mut(name) {
                    index.remove(&(ik.partition_key.clone(), ik.sort_key.clone()));
                }
            }
        }
        for (name, ik) in &item.indexes {
            self.indexes
                .entry(name.clone())
                .or_default()
                .insert((ik.partition_key.clone(), ik.sort_key.clone()), key.clone());
        }
        self.items.insert(key, item);
    }
}

/// Snapshot of the table's call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// `get` calls
    pub gets: u64,
    /// `put` calls
    pub puts: u64,
    /// `batch_write` calls
    pub batch_calls: u64,
    /// `query` calls
    pub queries: u64,
    /// Items persisted by `put` or `batch_write`
    pub items_written: u64,
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    batch_calls: AtomicU64,
    queries: AtomicU64,
    items_written: AtomicU64,
}

#[derive(Debug)]
enum BatchScript {
    Unprocessed(usize),
    Transient,
}

/// In-memory sorted table
#[derive(Debug)]
pub struct MemoryTable {
    tables: RwLock<Tables>,
    counters: Counters,
    script: Mutex<VecDeque<BatchScript>>,
    page_size: usize,
}

impl MemoryTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Create an empty table returning at most `page_size` items per query
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            counters: Counters::default(),
            script: Mutex::new(VecDeque::new()),
            page_size: page_size.max(1),
        }
    }

    /// Make the next `batch_write` call skip its last `count` items
    ///
    /// Scripts queue up; each batch call consumes one.
    pub fn push_unprocessed(&self, count: usize) {
        self.script.lock().push_back(BatchScript::Unprocessed(count));
    }

    /// Make the next `batch_write` call fail with `UpstreamTransient`
    pub fn push_transient_failure(&self) {
        self.script.lock().push_back(BatchScript::Transient);
    }

    /// Current call counters
    pub fn stats(&self) -> TableStats {
        TableStats {
            gets: self.counters.gets.load(Ordering::SeqCst),
            puts: self.counters.puts.load(Ordering::SeqCst),
            batch_calls: self.counters.batch_calls.load(Ordering::SeqCst),
            queries: self.counters.queries.load(Ordering::SeqCst),
            items_written: self.counters.items_written.load(Ordering::SeqCst),
        }
    }

    /// Reset all call counters to zero
    pub fn reset_stats(&self) {
        for c in [
            &self.counters.gets,
            &self.counters.puts,
            &self.counters.batch_calls,
            &self.counters.queries,
            &self.counters.items_written,
        ] {
            c.store(0, Ordering::SeqCst);
        }
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.tables.read().items.len()
    }

    /// Whether the table holds no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove one item, bypassing the table contract
    ///
    /// Lets tests simulate a lost write.
    pub fn remove(&self, partition_key: &str, sort_key: &str) -> Option<Item> {
        let mut tables = self.tables.write();
        let old = tables
            .items
            .remove(&(partition_key.to_string(), sort_key.to_string()))?;
        for (name, ik) in &old.indexes {
            if let Some(index) = tables.indexes.get_mut(name) {
                index.remove(&(ik.partition_key.clone(), ik.sort_key.clone()));
            }
        }
        Some(old)
    }

    fn scan(&self, query: &Query) -> Result<Vec<Item>> {
        let tables = self.tables.read();
        let lower = Bound::Included((query.partition_key.clone(), String::new()));

        let matching: Vec<&Item> = match &query.index {
            None => tables
                .items
                .range((lower, Bound::Unbounded))
                .take_while(|((pk, _), _)| *pk == query.partition_key)
                .map(|(_, item)| item)
                .collect(),
            Some(name) => match tables.indexes.get(name) {
                Some(idx) => idx
                    .range((lower, Bound::Unbounded))
                    .take_while(|((pk, _), _)| *pk == query.partition_key)
                    .filter_map(|(_, primary)| tables.items.get(primary))
                    .collect(),
                None => Vec::new(),
            },
        };

        let sort_key_of = |item: &Item| -> String {
            match &query.index {
                None => item.sort_key.clone(),
                Some(name) => item
                    .indexes
                    .get(name)
                    .map(|ik| ik.sort_key.clone())
                    .unwrap_or_default(),
            }
        };

        let mut selected: Vec<Item> = matching
            .into_iter()
            .filter(|item| {
                query
                    .condition
                    .as_ref()
                    .map_or(true, |c| c.matches(&sort_key_of(item)))
            })
            .cloned()
            .collect();

        if !query.scan_forward {
            selected.reverse();
        }
        if let Some(PageToken(after)) = &query.start_after {
            selected.retain(|item| {
                let sk = sort_key_of(item);
                if query.scan_forward {
                    sk.as_str() > after.as_str()
                } else {
                    sk.as_str() < after.as_str()
                }
            });
        }
        Ok(selected)
    }
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvTable for MemoryTable {
    async fn get(
        &self,
        partition_key: &str,
        sort_key: &str,
        _consistent: bool,
    ) -> Result<Option<Item>> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.read();
        Ok(tables
            .items
            .get(&(partition_key.to_string(), sort_key.to_string()))
            .cloned())
    }

    async fn put(&self, item: Item) -> Result<()> {
        self.counters.puts.fetch_add(1, Ordering::SeqCst);
        trace!(pk = %item.partition_key, sk = %item.sort_key, "put");
        self.tables.write().insert(item);
        self.counters.items_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn batch_write(&self, items: &[Item]) -> Result<Vec<Item>> {
        self.counters.batch_calls.fetch_add(1, Ordering::SeqCst);
        if items.len() > self.max_batch_size() {
            return Err(Error::validation(format!(
                "batch of {} items exceeds the limit of {}",
                items.len(),
                self.max_batch_size()
            )));
        }

        let skip = match self.script.lock().pop_front() {
            Some(BatchScript::Transient) => {
                return Err(Error::UpstreamTransient(
                    "batch write throttled".to_string(),
                ))
            }
            Some(BatchScript::Unprocessed(n)) => n.min(items.len()),
            None => 0,
        };

        let (processed, unprocessed) = items.split_at(items.len() - skip);
        {
            let mut tables = self.tables.write();
            for item in processed {
                tables.insert(item.clone());
            }
        }
        self.counters
            .items_written
            .fetch_add(processed.len() as u64, Ordering::SeqCst);
        trace!(
            written = processed.len(),
            unprocessed = unprocessed.len(),
            "batch write"
        );
        Ok(unprocessed.to_vec())
    }

    async fn query(&self, query: &Query) -> Result<QueryPage> {
        self.counters.queries.fetch_add(1, Ordering::SeqCst);
        let mut items = self.scan(query)?;
        let limit = query.limit.unwrap_or(self.page_size).min(self.page_size);

        let next = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|item| {
                let sk = match &query.index {
                    None => item.sort_key.clone(),
                    Some(name) => item
                        .indexes
                        .get(name)
                        .map(|ik| ik.sort_key.clone())
                        .unwrap_or_default(),
                };
                PageToken(sk)
            })
        } else {
            None
        };
        Ok(QueryPage { items, next })
    }
}
