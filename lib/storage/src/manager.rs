use crate::persistence::{ArtifactKey, ArtifactLoad, ArtifactStore};
use fitx_core::{
    Corpus, EmbeddingSpace, Error, ForestBuilder, ForestIndex, ForestParams, Metric, PrimaryIndexes, Result,
    SpaceId,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

/// Primary index settings, shared by all five spaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub dir: PathBuf,
    pub num_trees: usize,
    pub max_leaf_size: usize,
    pub seed: Option<u64>,
    pub metric: Metric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let params = ForestParams::default();
        Self {
            dir: PathBuf::from("indexes"),
            num_trees: params.num_trees,
            max_leaf_size: params.max_leaf_size,
            seed: None,
            metric: Metric::default(),
        }
    }
}

impl IndexConfig {
    pub fn forest_params(&self) -> ForestParams {
        ForestParams {
            num_trees: self.num_trees,
            max_leaf_size: self.max_leaf_size,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexSource {
    Loaded,
    Built,
}

/// How one primary index became ready.
#[derive(Debug, Clone, Serialize)]
pub struct SpaceReport {
    pub space: SpaceId,
    pub source: IndexSource,
    /// Why the artifact could not be reused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild_reason: Option<String>,
    pub items: usize,
    pub elapsed_ms: u64,
    /// False when a freshly built index could not be persisted.
    pub saved: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheReport {
    pub spaces: Vec<SpaceReport>,
}

impl CacheReport {
    pub fn built(&self) -> usize {
        self.spaces.iter().filter(|s| s.source == IndexSource::Built).count()
    }

    pub fn loaded(&self) -> usize {
        self.spaces.iter().filter(|s| s.source == IndexSource::Loaded).count()
    }
}

/// Startup owner of the five primary indexes.
pub struct IndexCache {
    artifacts: ArtifactStore,
    config: IndexConfig,
    dim: usize,
}

impl IndexCache {
    pub fn new(config: IndexConfig, dim: usize) -> Self {
        Self {
            artifacts: ArtifactStore::new(&config.dir),
            config,
            dim,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Make every primary index ready: reuse its artifact when it matches
    /// `corpus` and the configuration, otherwise build and save it.
    ///
    /// A missing, stale or corrupt artifact only costs a rebuild, and a
    /// failed save only a warning. Errors come from building itself.
    pub fn initialize(&self, corpus: &Corpus) -> Result<(PrimaryIndexes, CacheReport)> {
        let params = self.config.forest_params();
        let mut indexes = Vec::with_capacity(SpaceId::COUNT);
        let mut report = CacheReport::default();

        for space_id in SpaceId::ALL {
            let started = Instant::now();
            let space = EmbeddingSpace::new(space_id, self.dim, self.config.metric);
            let key = ArtifactKey::for_corpus(corpus, space, &params);

            let rebuild_reason = match self.artifacts.load(&key) {
                Ok(ArtifactLoad::Ready(index)) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    info!(space = %space_id, items = index.len(), elapsed_ms, "loaded primary index");
                    report.spaces.push(SpaceReport {
                        space: space_id,
                        source: IndexSource::Loaded,
                        rebuild_reason: None,
                        items: index.len(),
                        elapsed_ms,
                        saved: true,
                    });
                    indexes.push(index);
                    continue;
                }
                Ok(ArtifactLoad::Missing) => "missing".to_string(),
                Ok(ArtifactLoad::Stale(reason)) => {
                    info!(space = %space_id, %reason, "primary index artifact is stale");
                    format!("stale: {}", reason)
                }
                Err(e) => {
                    warn!(space = %space_id, error = %format!("{:#}", e), "discarding corrupt primary index artifact");
                    format!("corrupt: {:#}", e)
                }
            };

            let index = build_index(corpus, space, params)?;
            let saved = match self.artifacts.save(&index, key) {
                Ok(_) => true,
                Err(e) => {
                    warn!(space = %space_id, error = %format!("{:#}", e), "failed to save primary index");
                    false
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!(space = %space_id, items = index.len(), elapsed_ms, saved, "built primary index");
            report.spaces.push(SpaceReport {
                space: space_id,
                source: IndexSource::Built,
                rebuild_reason: Some(rebuild_reason),
                items: index.len(),
                elapsed_ms,
                saved,
            });
            indexes.push(index);
        }

        Ok((PrimaryIndexes::new(indexes)?, report))
    }
}

fn build_index(corpus: &Corpus, space: EmbeddingSpace, params: ForestParams) -> Result<ForestIndex> {
    let mut builder = ForestBuilder::with_capacity(space, params, corpus.len());
    for (id, vector) in corpus.entries(space.id) {
        builder.add_item(id, vector).map_err(|e| match e {
            Error::InvalidDimension { .. } | Error::InvalidVector(_) => {
                Error::Storage(format!("{} vector of item {} rejected: {}", space.id, id, e))
            }
            other => other,
        })?;
    }
    builder.build()
}
