//! Oldest-first eviction by entry count.
//!
//! Insertion order is the only signal: reads never refresh an entry's
//! position.  When a partition holds more than its limit, the oldest
//! `count - limit` entries are removed.

use anyhow::Result;
use tracing::debug;

use super::entry::CacheKey;
use super::store::CacheStore;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Trim `partition` down to `limit` entries.  Returns the evicted keys.
///
/// Selection and removal happen inside the store under the partition lock,
/// so an entry re-inserted while eviction runs is never the one removed.
/// Limits are read at call time, so a limit lowered between generations is
/// enforced on the next cycle for the partition.
pub async fn enforce_limit(
    store: &dyn CacheStore,
    partition: &str,
    limit: usize,
) -> Result<Vec<CacheKey>> {
    let evicted = store.trim(partition, limit).await?;
    if !evicted.is_empty() {
        debug!(
            %partition,
            limit,
            evicted = evicted.len(),
            "trimmed partition to limit"
        );
    }
    Ok(evicted)
}
