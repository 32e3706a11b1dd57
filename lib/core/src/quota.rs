//! Category-balanced selection over a ranked neighbor stream.

use crate::category::MergedCategory;
use crate::forest::Neighbor;
use crate::item::ItemId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Neighbors scanned at most for a whole-corpus query.
pub const GLOBAL_SCAN_BOUND: usize = 50_000;
/// Neighbors scanned at most for a subset query (further capped by its size).
pub const SUBSET_SCAN_BOUND: usize = 1_000;

/// Merged category -> accepted neighbors, each list in rank order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CategoryResults {
    buckets: BTreeMap<MergedCategory, Vec<Neighbor>>,
}

impl CategoryResults {
    /// An empty bucket for each of `categories`.
    pub fn empty(categories: &[MergedCategory]) -> Self {
        Self {
            buckets: categories.iter().map(|&c| (c, Vec::new())).collect(),
        }
    }

    /// Accepted neighbors of `category`; empty when it was not requested.
    pub fn get(&self, category: MergedCategory) -> &[Neighbor] {
        self.buckets.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Buckets in canonical category order.
    pub fn iter(&self) -> impl Iterator<Item = (MergedCategory, &[Neighbor])> {
        self.buckets.iter().map(|(&c, list)| (c, list.as_slice()))
    }

    pub fn categories(&self) -> impl Iterator<Item = MergedCategory> + '_ {
        self.buckets.keys().copied()
    }

    /// Total accepted neighbors across all buckets.
    pub fn total(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.buckets.values().flatten().any(|n| n.id == id)
    }

    pub fn into_map(self) -> BTreeMap<MergedCategory, Vec<Neighbor>> {
        self.buckets
    }
}

/// Fills one bucket per category with up to `quota` neighbors, in rank order.
///
/// Scanning stops once every bucket is full or after `scan_bound` neighbors,
/// whichever comes first; buckets that were not reached stay short.
#[derive(Debug, Clone)]
pub struct CategoryQuotaSelector {
    quota: usize,
    scan_bound: usize,
    categories: Vec<MergedCategory>,
}

impl CategoryQuotaSelector {
    pub fn new(quota: usize) -> Self {
        Self {
            quota,
            scan_bound: GLOBAL_SCAN_BOUND,
            categories: MergedCategory::ALL.to_vec(),
        }
    }

    #[must_use]
    pub fn with_scan_bound(mut self, scan_bound: usize) -> Self {
        self.scan_bound = scan_bound;
        self
    }

    /// Restrict the buckets. An empty restriction keeps all seven.
    #[must_use]
    pub fn with_categories(mut self, categories: &[MergedCategory]) -> Self {
        if !categories.is_empty() {
            let mut categories = categories.to_vec();
            categories.sort_unstable();
            categories.dedup();
            self.categories = categories;
        }
        self
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn scan_bound(&self) -> usize {
        self.scan_bound
    }

    pub fn categories(&self) -> &[MergedCategory] {
        &self.categories
    }

    /// Neighbors whose category is unknown or not requested are passed over
    /// but still count toward the scan bound.
    pub fn select<I, F>(&self, neighbors: I, category_of: F) -> CategoryResults
    where
        I: IntoIterator<Item = Neighbor>,
        F: Fn(ItemId) -> Option<MergedCategory>,
    {
        let mut buckets: [Option<Vec<Neighbor>>; MergedCategory::COUNT] = Default::default();
        for &category in &self.categories {
            buckets[category.index()] = Some(Vec::with_capacity(self.quota.min(64)));
        }

        let target = self.categories.len();
        let mut filled = if self.quota == 0 { target } else { 0 };
        let mut scanned = 0usize;

        for neighbor in neighbors.into_iter().take(self.scan_bound) {
            if filled >= target {
                break;
            }
            scanned += 1;
            let Some(category) = category_of(neighbor.id) else {
                continue;
            };
            let Some(bucket) = buckets[category.index()].as_mut() else {
                continue;
            };
            if bucket.len() < self.quota {
                bucket.push(neighbor);
                if bucket.len() == self.quota {
                    filled += 1;
                }
            }
        }
        tracing::trace!(scanned, filled, target, "category selection finished");

        CategoryResults {
            buckets: MergedCategory::ALL
                .iter()
                .zip(buckets)
                .filter_map(|(&category, bucket)| bucket.map(|list| (category, list)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn neighbor(id: u32, distance: f32) -> Neighbor {
        Neighbor {
            id: ItemId(id),
            distance,
        }
    }

    /// Items are categorized by `id % 7` in canonical order.
    fn by_modulo(id: ItemId) -> Option<MergedCategory> {
        Some(MergedCategory::ALL[(id.0 % 7) as usize])
    }

    #[test]
    fn test_quota_bound_and_rank_order() {
        let stream: Vec<Neighbor> = (0..100).map(|i| neighbor(i, i as f32)).collect();
        let results = CategoryQuotaSelector::new(3).select(stream, by_modulo);

        assert_eq!(results.categories().count(), 7);
        for (category, list) in results.iter() {
            assert_eq!(list.len(), 3, "{}", category);
            for pair in list.windows(2) {
                assert!(pair[0].distance <= pair[1].distance);
            }
        }
        assert_eq!(
            results.get(MergedCategory::Tops).iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![ItemId(2), ItemId(9), ItemId(16)]
        );
    }

    #[test]
    fn test_stops_once_every_bucket_is_full() {
        let consumed = Cell::new(0);
        let stream = (0..1_000).map(|i| {
            consumed.set(consumed.get() + 1);
            neighbor(i, i as f32)
        });
        let results = CategoryQuotaSelector::new(1).select(stream, by_modulo);
        assert_eq!(results.total(), 7);
        assert!(consumed.get() <= 8);
    }

    #[test]
    fn test_terminates_with_unreachable_categories() {
        // An endless stream of tops: every other bucket is unreachable.
        let stream = std::iter::repeat(neighbor(2, 0.1));
        let results = CategoryQuotaSelector::new(2)
            .with_scan_bound(500)
            .select(stream, by_modulo);
        assert_eq!(results.get(MergedCategory::Tops).len(), 2);
        assert!(results.get(MergedCategory::Hats).is_empty());
        assert_eq!(results.total(), 2);
    }

    #[test]
    fn test_unknown_categories_are_skipped() {
        let stream = vec![neighbor(1, 0.1), neighbor(2, 0.2), neighbor(3, 0.3)];
        let results = CategoryQuotaSelector::new(5).select(stream, |id| {
            (id.0 != 2).then_some(MergedCategory::Shoes)
        });
        assert_eq!(results.get(MergedCategory::Shoes).len(), 2);
        assert!(!results.contains(ItemId(2)));
    }

    #[test]
    fn test_category_restriction() {
        let stream: Vec<Neighbor> = (0..50).map(|i| neighbor(i, i as f32)).collect();
        let results = CategoryQuotaSelector::new(2)
            .with_categories(&[MergedCategory::Bags, MergedCategory::Hats, MergedCategory::Bags])
            .select(stream, by_modulo);
        assert_eq!(
            results.categories().collect::<Vec<_>>(),
            vec![MergedCategory::Hats, MergedCategory::Bags]
        );
        assert_eq!(results.total(), 4);
        assert!(results.get(MergedCategory::Tops).is_empty());
    }

    #[test]
    fn test_zero_quota_and_empty_stream() {
        let stream: Vec<Neighbor> = (0..10).map(|i| neighbor(i, i as f32)).collect();
        assert_eq!(CategoryQuotaSelector::new(0).select(stream, by_modulo).total(), 0);

        let empty = CategoryQuotaSelector::new(4).select(Vec::new(), by_modulo);
        assert_eq!(empty, CategoryResults::empty(&MergedCategory::ALL));
        let json = serde_json::to_value(&empty).unwrap();
        assert_eq!(json["all-body"], serde_json::json!([]));
    }
}
