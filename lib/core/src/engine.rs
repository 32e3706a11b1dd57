use crate::background::BuildPool;
use crate::category::MergedCategory;
use crate::forest::{ForestBuilder, ForestIndex, ForestParams, Neighbor};
use crate::item::{Corpus, ItemId};
use crate::neighbors::get_neighbors;
use crate::quota::{CategoryQuotaSelector, CategoryResults, GLOBAL_SCAN_BOUND, SUBSET_SCAN_BOUND};
use crate::space::SpaceId;
use crate::{Error, Result};
use ahash::AHashSet;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tunables of the recommendation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub global_scan_bound: usize,
    pub subset_scan_bound: usize,
    /// Forest parameters for per-request subset indexes.
    pub subset_forest: ForestParams,
    pub build_workers: usize,
    pub max_pending_builds: usize,
    pub build_timeout_ms: u64,
    /// Seed for the ensemble space pick; `None` seeds from the OS.
    pub ensemble_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_scan_bound: GLOBAL_SCAN_BOUND,
            subset_scan_bound: SUBSET_SCAN_BOUND,
            subset_forest: ForestParams::default(),
            build_workers: std::thread::available_parallelism()
                .map(|n| n.get().min(4))
                .unwrap_or(2),
            max_pending_builds: 64,
            build_timeout_ms: 10_000,
            ensemble_seed: None,
        }
    }
}

/// Which embedding space answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpaceSelector {
    Fixed(SpaceId),
    /// Uniform pick among the four mask spaces.
    #[default]
    Random,
}

impl SpaceSelector {
    pub fn resolve<R: Rng + ?Sized>(self, rng: &mut R) -> SpaceId {
        match self {
            SpaceSelector::Fixed(space) => space,
            SpaceSelector::Random => SpaceId::MASKS[rng.random_range(0..SpaceId::MASKS.len())],
        }
    }
}

/// The item population a request is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    #[default]
    Global,
    Subset(Vec<ItemId>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub query: ItemId,
    #[serde(default)]
    pub scope: Scope,
    pub quota_per_category: usize,
    #[serde(default)]
    pub space: SpaceSelector,
    /// Buckets to fill; empty means all seven.
    #[serde(default)]
    pub categories: Vec<MergedCategory>,
}

impl RecommendationRequest {
    pub fn global(query: ItemId, quota_per_category: usize) -> Self {
        Self {
            query,
            scope: Scope::Global,
            quota_per_category,
            space: SpaceSelector::Random,
            categories: Vec::new(),
        }
    }

    pub fn subset(query: ItemId, items: Vec<ItemId>, quota_per_category: usize) -> Self {
        Self {
            scope: Scope::Subset(items),
            ..Self::global(query, quota_per_category)
        }
    }

    #[must_use]
    pub fn in_space(mut self, space: SpaceId) -> Self {
        self.space = SpaceSelector::Fixed(space);
        self
    }

    #[must_use]
    pub fn with_categories(mut self, categories: Vec<MergedCategory>) -> Self {
        self.categories = categories;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendations {
    pub query: ItemId,
    pub space: SpaceId,
    /// Items the query was evaluated against.
    pub scope_size: usize,
    pub results: CategoryResults,
}

/// Plain and category-balanced neighbors of one item in one space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpaceInspection {
    pub space: SpaceId,
    pub neighbors: Vec<Neighbor>,
    pub by_category: CategoryResults,
}

/// The five whole-corpus indexes, one per space, all ready.
#[derive(Debug)]
pub struct PrimaryIndexes {
    indexes: [ForestIndex; SpaceId::COUNT],
}

impl PrimaryIndexes {
    /// `indexes` must be ordered like [`SpaceId::ALL`].
    pub fn new(indexes: Vec<ForestIndex>) -> Result<Self> {
        let indexes: [ForestIndex; SpaceId::COUNT] = indexes.try_into().map_err(|v: Vec<ForestIndex>| {
            Error::InvalidConfig(format!("expected {} primary indexes, got {}", SpaceId::COUNT, v.len()))
        })?;
        for (expected, index) in SpaceId::ALL.iter().zip(&indexes) {
            if index.space().id != *expected {
                return Err(Error::InvalidConfig(format!(
                    "primary index for {} found in slot {}",
                    index.space().id,
                    expected
                )));
            }
        }
        Ok(Self { indexes })
    }

    #[inline]
    pub fn get(&self, space: SpaceId) -> &ForestIndex {
        &self.indexes[space.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForestIndex> {
        self.indexes.iter()
    }
}

/// Answers recommendation requests against the corpus and its primary
/// indexes. Constructed once after startup; shared read-only across request
/// handlers.
pub struct RecommendationEngine {
    corpus: Arc<Corpus>,
    primary: PrimaryIndexes,
    config: EngineConfig,
    pool: BuildPool,
    rng: Mutex<StdRng>,
}

impl RecommendationEngine {
    pub fn new(corpus: Arc<Corpus>, primary: PrimaryIndexes, config: EngineConfig) -> Result<Self> {
        let pool = BuildPool::new(config.build_workers, config.max_pending_builds)?;
        let rng = match config.ensemble_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            corpus,
            primary,
            config,
            pool,
            rng: Mutex::new(rng),
        })
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn primary(&self) -> &PrimaryIndexes {
        &self.primary
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn recommend(&self, request: &RecommendationRequest) -> Result<Recommendations> {
        if self.corpus.get(request.query).is_none() {
            return Err(Error::ItemNotFound(request.query));
        }
        let space = request.space.resolve(&mut *self.rng.lock());
        let selector =
            CategoryQuotaSelector::new(request.quota_per_category).with_categories(&request.categories);

        let (results, scope_size) = match &request.scope {
            Scope::Global => {
                let index = self.primary.get(space);
                let k = self.config.global_scan_bound.min(index.len());
                let neighbors = get_neighbors(index, request.query, k)?;
                let results = selector
                    .with_scan_bound(k)
                    .select(neighbors, |id| self.corpus.category(id));
                (results, index.len())
            }
            Scope::Subset(ids) => {
                if !ids.is_empty() && !ids.contains(&request.query) {
                    return Err(Error::ItemNotFound(request.query));
                }
                let index = self.build_subset_index(ids, space)?;
                if index.is_empty() {
                    (CategoryResults::empty(selector.categories()), 0)
                } else {
                    let k = self.config.subset_scan_bound.min(index.len());
                    let neighbors = get_neighbors(&index, request.query, k)?;
                    let results = selector
                        .with_scan_bound(k)
                        .select(neighbors, |id| self.corpus.category(id));
                    (results, index.len())
                }
            }
        };

        debug!(
            query = %request.query,
            space = %space,
            scope_size,
            returned = results.total(),
            "recommendation served"
        );
        Ok(Recommendations {
            query: request.query,
            space,
            scope_size,
            results,
        })
    }

    /// Build an ephemeral index over `ids` on the worker pool.
    ///
    /// Ids missing from the corpus are skipped and duplicates collapsed. A
    /// build exceeding the configured timeout is cancelled and reported as
    /// [`Error::Unavailable`].
    pub fn build_subset_index(&self, ids: &[ItemId], space: SpaceId) -> Result<ForestIndex> {
        let embedding_space = self.primary.get(space).space();
        let mut seen = AHashSet::with_capacity(ids.len());
        let mut members = Vec::with_capacity(ids.len());
        let mut unknown = 0usize;
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.corpus.get(id) {
                Some(item) => members.push((id, item.embedding(space).clone())),
                None => unknown += 1,
            }
        }
        if unknown > 0 {
            warn!(unknown, "skipped subset members missing from the corpus");
        }

        let params = self.config.subset_forest;
        let started = Instant::now();
        let handle = self.pool.submit(move |cancel| {
            let mut builder = ForestBuilder::with_capacity(embedding_space, params, members.len());
            for (id, vector) in &members {
                builder.add_item(*id, vector.as_slice())?;
            }
            builder.build_cancellable(cancel)
        })?;
        debug!(space = %space, queued = self.pool.pending_jobs(), "subset index build submitted");
        let index = handle.wait_timeout(Duration::from_millis(self.config.build_timeout_ms))?;

        debug!(
            space = %space,
            items = index.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built subset index"
        );
        Ok(index)
    }

    /// Top-`k` neighbors and the one-per-category selection of `query` in
    /// every space, the full-image space included.
    pub fn inspect(&self, query: ItemId, k: usize) -> Result<Vec<SpaceInspection>> {
        if self.corpus.get(query).is_none() {
            return Err(Error::ItemNotFound(query));
        }
        SpaceId::ALL
            .iter()
            .map(|&space| {
                let index = self.primary.get(space);
                let bound = self.config.global_scan_bound.min(index.len());
                let ranked = get_neighbors(index, query, bound.max(k))?;
                let neighbors = ranked.iter().take(k).copied().collect();
                let by_category = CategoryQuotaSelector::new(1)
                    .with_scan_bound(bound)
                    .select(ranked, |id| self.corpus.category(id));
                Ok(SpaceInspection {
                    space,
                    neighbors,
                    by_category,
                })
            })
            .collect()
    }

    /// Stop the subset build workers. Requests with a subset scope fail
    /// with [`Error::Unavailable`] afterwards.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
