//! Random projection forest for approximate nearest neighbor search.
//!
//! Every tree recursively splits the item set by a hyperplane placed between
//! two 2-means centroids of a random sample, until leaves hold at most
//! `max_leaf_size` items. A query walks all trees at once through a priority
//! queue ordered by the smallest margin seen on the path, gathers `search_k`
//! candidates from the leaves it reaches, then ranks them by exact distance.
//!
//! Nodes of all trees live in one arena. Children are always allocated after
//! their parent, so every child index is strictly greater than its parent's;
//! [`ForestIndex::from_parts`] checks this, which rules out cycles in loaded
//! artifacts.

use crate::background::CancelToken;
use crate::item::ItemId;
use crate::space::EmbeddingSpace;
use crate::{Error, Result};
use ahash::AHashMap;
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BinaryHeap;

pub const DEFAULT_NUM_TREES: usize = 10;
pub const DEFAULT_MAX_LEAF_SIZE: usize = 32;

/// Corpora at least this large grow their trees on the rayon pool.
const PARALLEL_BUILD_THRESHOLD: usize = 10_000;
/// Sampled assignment steps when refining the two split centroids.
const TWO_MEANS_STEPS: usize = 64;

type LeafItems = SmallVec<[u32; 16]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub num_trees: usize,
    pub max_leaf_size: usize,
    /// Fixed seed for reproducible trees; `None` draws one per build.
    pub seed: Option<u64>,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            num_trees: DEFAULT_NUM_TREES,
            max_leaf_size: DEFAULT_MAX_LEAF_SIZE,
            seed: None,
        }
    }
}

/// One ranked query result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: ItemId,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    /// Positions into the forest's item table.
    Leaf(LeafItems),
    /// Items with `dot(normal, v) - offset > 0` descend right.
    Split {
        normal: Vec<f32>,
        offset: f32,
        left: u32,
        right: u32,
    },
}

impl TreeNode {
    fn placeholder() -> Self {
        TreeNode::Leaf(LeafItems::new())
    }
}

/// Accumulates items for one space before the forest is grown.
pub struct ForestBuilder {
    space: EmbeddingSpace,
    params: ForestParams,
    ids: Vec<ItemId>,
    vectors: Vec<f32>,
    positions: AHashMap<ItemId, u32>,
}

impl ForestBuilder {
    pub fn new(space: EmbeddingSpace, params: ForestParams) -> Self {
        Self {
            space,
            params,
            ids: Vec::new(),
            vectors: Vec::new(),
            positions: AHashMap::new(),
        }
    }

    pub fn with_capacity(space: EmbeddingSpace, params: ForestParams, capacity: usize) -> Self {
        let mut builder = Self::new(space, params);
        builder.ids.reserve(capacity);
        builder.vectors.reserve(capacity * space.dim);
        builder.positions.reserve(capacity);
        builder
    }

    pub fn add_item(&mut self, id: ItemId, vector: &[f32]) -> Result<()> {
        self.space.check_dim(vector.len())?;
        if !vector.iter().all(|x| x.is_finite()) {
            return Err(Error::InvalidVector(id));
        }
        let pos = self.ids.len() as u32;
        if self.positions.insert(id, pos).is_some() {
            return Err(Error::DuplicateItem(id));
        }
        self.ids.push(id);
        let start = self.vectors.len();
        self.vectors.extend_from_slice(vector);
        self.space.metric.prepare(&mut self.vectors[start..]);
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn build(self) -> Result<ForestIndex> {
        self.build_cancellable(&CancelToken::new())
    }

    /// Grow the forest, giving up with [`Error::BuildCancelled`] as soon as
    /// `cancel` fires.
    pub fn build_cancellable(self, cancel: &CancelToken) -> Result<ForestIndex> {
        let n = self.ids.len();
        let num_trees = self.params.num_trees.max(1);
        let leaf_size = self.params.max_leaf_size.max(1);
        let seed = self.params.seed.unwrap_or_else(|| rand::rng().random());

        let table = ItemTable {
            dim: self.space.dim,
            vectors: &self.vectors,
        };
        let grow = |tree: usize| -> Result<Vec<TreeNode>> {
            let mut rng = StdRng::seed_from_u64(tree_seed(seed, tree as u64));
            let mut nodes = Vec::new();
            if n > 0 {
                grow_tree(&table, (0..n as u32).collect(), leaf_size, &mut rng, &mut nodes, cancel)?;
            }
            Ok(nodes)
        };

        let trees: Vec<Vec<TreeNode>> = if n >= PARALLEL_BUILD_THRESHOLD {
            (0..num_trees).into_par_iter().map(grow).collect::<Result<_>>()?
        } else {
            (0..num_trees).map(grow).collect::<Result<_>>()?
        };

        let mut nodes = Vec::with_capacity(trees.iter().map(Vec::len).sum());
        let mut roots = Vec::with_capacity(trees.len());
        for tree in trees {
            if tree.is_empty() {
                continue;
            }
            let base = nodes.len() as u32;
            roots.push(base);
            nodes.extend(tree.into_iter().map(|node| match node {
                TreeNode::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => TreeNode::Split {
                    normal,
                    offset,
                    left: left + base,
                    right: right + base,
                },
                leaf => leaf,
            }));
        }

        Ok(ForestIndex {
            space: self.space,
            ids: self.ids,
            vectors: self.vectors,
            nodes,
            roots,
            positions: self.positions,
        })
    }
}

/// Immutable random projection forest over one space and one item set.
#[derive(Debug)]
pub struct ForestIndex {
    space: EmbeddingSpace,
    ids: Vec<ItemId>,
    /// Contiguous `ids.len() * dim` floats, prepared for the space's metric.
    vectors: Vec<f32>,
    nodes: Vec<TreeNode>,
    roots: Vec<u32>,
    positions: AHashMap<ItemId, u32>,
}

/// Borrowed view of a forest for serialization.
#[derive(Serialize)]
pub struct ForestPartsRef<'a> {
    pub space: EmbeddingSpace,
    pub ids: &'a [ItemId],
    pub vectors: &'a [f32],
    pub nodes: &'a [TreeNode],
    pub roots: &'a [u32],
}

/// Owned, unvalidated forest contents, as decoded from an artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct ForestParts {
    pub space: EmbeddingSpace,
    pub ids: Vec<ItemId>,
    pub vectors: Vec<f32>,
    pub nodes: Vec<TreeNode>,
    pub roots: Vec<u32>,
}

impl ForestIndex {
    #[inline]
    pub fn space(&self) -> EmbeddingSpace {
        self.space
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[inline]
    pub fn num_trees(&self) -> usize {
        self.roots.len()
    }

    #[inline]
    pub fn contains(&self, id: ItemId) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn ids(&self) -> &[ItemId] {
        &self.ids
    }

    /// The stored (metric-prepared) vector of an item.
    pub fn vector(&self, id: ItemId) -> Option<&[f32]> {
        self.positions.get(&id).map(|&pos| self.vector_at(pos))
    }

    #[inline]
    fn vector_at(&self, pos: u32) -> &[f32] {
        let start = pos as usize * self.space.dim;
        &self.vectors[start..start + self.space.dim]
    }

    /// Up to `k` neighbors of an indexed item, ascending by distance.
    /// The item itself is usually, but not always, the first result.
    pub fn query_item(&self, id: ItemId, k: usize) -> Result<Vec<Neighbor>> {
        self.query_item_with(id, k, None)
    }

    pub fn query_item_with(&self, id: ItemId, k: usize, search_k: Option<usize>) -> Result<Vec<Neighbor>> {
        let pos = *self.positions.get(&id).ok_or(Error::ItemNotFound(id))?;
        let query = self.vector_at(pos).to_vec();
        Ok(self.search(&query, k, search_k))
    }

    /// Up to `k` neighbors of an arbitrary vector, ascending by distance.
    pub fn query_vector(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.query_vector_with(vector, k, None)
    }

    pub fn query_vector_with(&self, vector: &[f32], k: usize, search_k: Option<usize>) -> Result<Vec<Neighbor>> {
        self.space.check_dim(vector.len())?;
        let mut query = vector.to_vec();
        self.space.metric.prepare(&mut query);
        Ok(self.search(&query, k, search_k))
    }

    fn search(&self, query: &[f32], k: usize, search_k: Option<usize>) -> Vec<Neighbor> {
        if k == 0 || self.ids.is_empty() {
            return Vec::new();
        }
        let search_k = search_k
            .unwrap_or_else(|| k.saturating_mul(self.roots.len()))
            .max(k);

        let mut queue: BinaryHeap<(OrderedFloat<f32>, u32)> = self
            .roots
            .iter()
            .map(|&root| (OrderedFloat(f32::INFINITY), root))
            .collect();
        let mut candidates: Vec<u32> = Vec::with_capacity(search_k.min(self.ids.len()));

        while candidates.len() < search_k {
            let Some((OrderedFloat(priority), node)) = queue.pop() else {
                break;
            };
            match &self.nodes[node as usize] {
                TreeNode::Leaf(items) => candidates.extend_from_slice(items),
                TreeNode::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => {
                    let margin = crate::simd::dot_product_simd(normal, query) - offset;
                    queue.push((OrderedFloat(priority.min(margin)), *right));
                    queue.push((OrderedFloat(priority.min(-margin)), *left));
                }
            }
        }

        candidates.sort_unstable();
        candidates.dedup();

        let metric = self.space.metric;
        let mut scored: Vec<(f32, u32)> = candidates
            .into_iter()
            .map(|pos| (metric.distance(query, self.vector_at(pos)), pos))
            .collect();
        scored.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(distance, pos)| Neighbor {
                id: self.ids[pos as usize],
                distance,
            })
            .collect()
    }

    pub fn parts(&self) -> ForestPartsRef<'_> {
        ForestPartsRef {
            space: self.space,
            ids: &self.ids,
            vectors: &self.vectors,
            nodes: &self.nodes,
            roots: &self.roots,
        }
    }

    /// Rebuild an index from decoded parts, validating its structure.
    pub fn from_parts(parts: ForestParts) -> Result<Self> {
        let ForestParts {
            space,
            ids,
            vectors,
            nodes,
            roots,
        } = parts;
        let corrupt = |msg: String| Err(Error::CorruptIndex(msg));

        if space.dim == 0 {
            return corrupt("zero dimensionality".into());
        }
        if vectors.len() != ids.len() * space.dim {
            return corrupt(format!(
                "{} floats for {} items of dimension {}",
                vectors.len(),
                ids.len(),
                space.dim
            ));
        }
        if !vectors.iter().all(|x| x.is_finite()) {
            return corrupt("non-finite vector component".into());
        }

        let mut positions = AHashMap::with_capacity(ids.len());
        for (pos, &id) in ids.iter().enumerate() {
            if positions.insert(id, pos as u32).is_some() {
                return corrupt(format!("duplicate item {}", id));
            }
        }

        if !ids.is_empty() && roots.is_empty() {
            return corrupt("items without trees".into());
        }
        if let Some(&root) = roots.iter().find(|&&r| r as usize >= nodes.len()) {
            return corrupt(format!("root {} out of bounds", root));
        }

        // Every node hangs under exactly one parent or is exactly one root.
        let mut reached = vec![false; nodes.len()];
        for &root in &roots {
            if std::mem::replace(&mut reached[root as usize], true) {
                return corrupt(format!("root {} listed twice", root));
            }
        }

        let n = ids.len();
        for (idx, node) in nodes.iter().enumerate() {
            match node {
                TreeNode::Leaf(items) => {
                    if let Some(&pos) = items.iter().find(|&&p| p as usize >= n) {
                        return corrupt(format!("leaf {} references position {}", idx, pos));
                    }
                }
                TreeNode::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => {
                    if normal.len() != space.dim {
                        return corrupt(format!("split {} has normal of length {}", idx, normal.len()));
                    }
                    if !offset.is_finite() || !normal.iter().all(|x| x.is_finite()) {
                        return corrupt(format!("split {} has non-finite hyperplane", idx));
                    }
                    for child in [*left, *right] {
                        let child = child as usize;
                        if child <= idx || child >= nodes.len() {
                            return corrupt(format!("split {} has invalid child {}", idx, child));
                        }
                        if std::mem::replace(&mut reached[child], true) {
                            return corrupt(format!("node {} reached twice, last from split {}", child, idx));
                        }
                    }
                }
            }
        }

        Ok(Self {
            space,
            ids,
            vectors,
            nodes,
            roots,
            positions,
        })
    }
}

struct ItemTable<'a> {
    dim: usize,
    vectors: &'a [f32],
}

impl ItemTable<'_> {
    #[inline]
    fn vector(&self, pos: u32) -> &[f32] {
        let start = pos as usize * self.dim;
        &self.vectors[start..start + self.dim]
    }
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[inline]
fn tree_seed(seed: u64, tree: u64) -> u64 {
    splitmix64(seed ^ splitmix64(tree))
}

fn grow_tree(
    table: &ItemTable<'_>,
    members: Vec<u32>,
    leaf_size: usize,
    rng: &mut StdRng,
    nodes: &mut Vec<TreeNode>,
    cancel: &CancelToken,
) -> Result<()> {
    nodes.push(TreeNode::placeholder());
    let mut pending = vec![(0usize, members)];

    while let Some((slot, members)) = pending.pop() {
        if cancel.is_cancelled() {
            return Err(Error::BuildCancelled);
        }
        if members.len() <= leaf_size {
            nodes[slot] = TreeNode::Leaf(members.into_iter().collect());
            continue;
        }

        let (normal, offset, left, right) = split(table, &members, rng);
        let left_slot = nodes.len();
        nodes.push(TreeNode::placeholder());
        let right_slot = nodes.len();
        nodes.push(TreeNode::placeholder());
        nodes[slot] = TreeNode::Split {
            normal,
            offset,
            left: left_slot as u32,
            right: right_slot as u32,
        };
        pending.push((right_slot, right));
        pending.push((left_slot, left));
    }
    Ok(())
}

fn split(table: &ItemTable<'_>, members: &[u32], rng: &mut StdRng) -> (Vec<f32>, f32, Vec<u32>, Vec<u32>) {
    let (normal, offset) = hyperplane(table, members, rng);
    let mut left = Vec::with_capacity(members.len() / 2);
    let mut right = Vec::with_capacity(members.len() / 2);
    for &pos in members {
        if crate::simd::dot_product_simd(&normal, table.vector(pos)) - offset > 0.0 {
            right.push(pos);
        } else {
            left.push(pos);
        }
    }

    if left.is_empty() || right.is_empty() {
        // Coincident points: halve arbitrarily under a zero normal, so every
        // query margin is 0 and both sides are explored.
        let mid = members.len() / 2;
        return (
            vec![0.0; table.dim],
            0.0,
            members[..mid].to_vec(),
            members[mid..].to_vec(),
        );
    }
    (normal, offset, left, right)
}

/// Hyperplane bisecting two centroids refined by sampled 2-means.
fn hyperplane(table: &ItemTable<'_>, members: &[u32], rng: &mut StdRng) -> (Vec<f32>, f32) {
    let n = members.len();
    let i = rng.random_range(0..n);
    let mut j = rng.random_range(0..n - 1);
    if j >= i {
        j += 1;
    }

    let mut p = table.vector(members[i]).to_vec();
    let mut q = table.vector(members[j]).to_vec();
    let (mut p_count, mut q_count) = (1.0f32, 1.0f32);

    for _ in 0..TWO_MEANS_STEPS {
        let v = table.vector(members[rng.random_range(0..n)]);
        let dp = p_count * crate::simd::squared_l2_simd(&p, v);
        let dq = q_count * crate::simd::squared_l2_simd(&q, v);
        let (centroid, count) = if dp < dq {
            (&mut p, &mut p_count)
        } else if dq < dp {
            (&mut q, &mut q_count)
        } else {
            continue;
        };
        for (c, x) in centroid.iter_mut().zip(v) {
            *c = (*c * *count + x) / (*count + 1.0);
        }
        *count += 1.0;
    }

    let mut normal: Vec<f32> = p.iter().zip(&q).map(|(a, b)| a - b).collect();
    // Unit normals keep margins comparable across the shared search queue.
    let norm = crate::simd::norm_simd(&normal);
    if norm > 0.0 {
        normal.iter_mut().for_each(|x| *x /= norm);
    }
    let midpoint: Vec<f32> = p.iter().zip(&q).map(|(a, b)| (a + b) * 0.5).collect();
    let offset = crate::simd::dot_product_simd(&normal, &midpoint);
    (normal, offset)
}
