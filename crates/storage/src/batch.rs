//! Batch writes with retry
//!
//! `batch_write_with_retry` splits items into chunks of the table's per-call
//! limit and resubmits whatever the table hands back as unprocessed, backing
//! off exponentially between attempts. Transient call failures are retried
//! the same way. Retrying is unbounded unless `max_retries` is set.
//!
//! `query_all` follows page tokens until a query is exhausted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wikivc_core::{Error, Result};

use crate::table::{Item, KvTable, Query};

// ============================================================================
// Retry Configuration
// ============================================================================

/// Backoff policy for batch writes
///
/// # Example
/// ```ignore
/// let retry = RetryConfig::new()
///     .with_base_delay_ms(5)
///     .with_max_retries(10);
/// batch_write_with_retry(&table, items, &retry).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts per chunk (`None` = unbounded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<usize>,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Items per batch call, clamped to the table's limit
    pub chunk_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            base_delay_ms: 50,
            max_delay_ms: 5_000,
            chunk_size: crate::table::MAX_BATCH_WRITE_ITEMS,
        }
    }
}

impl RetryConfig {
    /// Create a RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig that gives up after the first call
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Default::default()
        }
    }

    /// Cap the number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Calculate delay for a given attempt (exponential backoff)
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        // 1 << 63 is the largest shift a u64 takes
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

// ============================================================================
// Batch Write
// ============================================================================

/// What a retried batch write took
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWriteReport {
    /// Items submitted
    pub items: usize,
    /// `batch_write` calls made, retries included
    pub calls: usize,
    /// Retry attempts across all chunks
    pub retries: usize,
}

/// Write all `items`, retrying unprocessed items until none remain
pub async fn batch_write_with_retry(
    table: &dyn KvTable,
    items: Vec<Item>,
    retry: &RetryConfig,
) -> Result<BatchWriteReport> {
    let chunk_size = retry.chunk_size.clamp(1, table.max_batch_size());
    let mut report = BatchWriteReport {
        items: items.len(),
        ..Default::default()
    };

    for chunk in items.chunks(chunk_size) {
        let mut pending = chunk.to_vec();
        let mut attempt = 0usize;

        loop {
            report.calls += 1;
            match table.batch_write(&pending).await {
                Ok(unprocessed) if unprocessed.is_empty() => break,
                Ok(unprocessed) => {
                    warn!(
                        attempt,
                        unprocessed = unprocessed.len(),
                        "batch write left items unprocessed"
                    );
                    pending = unprocessed;
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "batch write failed transiently");
                }
                Err(e) => return Err(e),
            }

            if let Some(max) = retry.max_retries {
                if attempt >= max {
                    return Err(Error::UpstreamTransient(format!(
                        "{} items still unprocessed after {} retries",
                        pending.len(),
                        attempt
                    )));
                }
            }
            tokio::time::sleep(retry.calculate_delay(attempt)).await;
            attempt += 1;
            report.retries += 1;
        }
    }

    debug!(
        items = report.items,
        calls = report.calls,
        retries = report.retries,
        "batch write complete"
    );
    Ok(report)
}

// ============================================================================
// Paged Queries
// ============================================================================

/// Run `query` to exhaustion, concatenating every page
///
/// A `limit` on the query caps the total number of items returned.
pub async fn query_all(table: &dyn KvTable, mut query: Query) -> Result<Vec<Item>> {
    let cap = query.limit;
    let mut items = Vec::new();
    loop {
        if let Some(cap) = cap {
            query.limit = Some(cap - items.len());
        }
        let page = table.query(&query).await?;
        items.extend(page.items);
        match page.next {
            Some(token) if cap.map_or(true, |c| items.len() < c) => {
                query.start_after = Some(token);
            }
            _ => break,
        }
    }
    Ok(items)
}
