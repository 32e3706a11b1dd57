//! Self-excluding neighbor retrieval on top of a [`ForestIndex`].

use crate::forest::{ForestIndex, Neighbor};
use crate::item::ItemId;
use crate::Result;

/// The `k` nearest neighbors of an indexed item, never including the item.
///
/// Asks the forest for `k + 1` results: the query is usually its own nearest
/// neighbor and gets filtered out, and when it is missing from the raw list
/// the extra entry is truncated instead.
pub fn get_neighbors(index: &ForestIndex, query: ItemId, k: usize) -> Result<Vec<Neighbor>> {
    if k == 0 {
        return Ok(Vec::new());
    }
    let raw = index.query_item(query, k.saturating_add(1))?;
    Ok(exclude(raw, query, k))
}

#[inline]
fn exclude(raw: Vec<Neighbor>, query: ItemId, k: usize) -> Vec<Neighbor> {
    raw.into_iter()
        .filter(|neighbor| neighbor.id != query)
        .take(k)
        .collect()
}
