//! # fitx
//!
//! Category-balanced visual similarity recommendations for garments.
//!
//! Every garment carries five precomputed image embeddings: one of the full
//! image and four of masked variants. fitx indexes each space with a random
//! projection forest and answers "what looks like this item?" with a fixed
//! number of neighbors per merged garment category (hats, full-body, tops,
//! bottoms, shoes, bags, accessories), against either the whole catalog or a
//! caller-provided subset such as a wardrobe.
//!
//! ## Quick Start
//!
//! ### From the command line
//!
//! ```bash
//! fitx --data-dir ./data warm
//! fitx --data-dir ./data recommend --item 42 --quota 2
//! fitx --data-dir ./data recommend --item 42 --subset 3,9,17,42 --space mask-2
//! ```
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use fitx::prelude::*;
//!
//! let mut config = FitxConfig::default();
//! config.rebase(std::path::Path::new("./data"));
//! let fitx = fitx::bootstrap(&config).unwrap();
//!
//! let request = RecommendationRequest::global(ItemId(42), 2);
//! let recommendations = fitx.engine.recommend(&request).unwrap();
//! for (category, neighbors) in recommendations.results.iter() {
//!     println!("{}: {:?}", category.display_name(), neighbors);
//! }
//! ```
//!
//! ## Crate Structure
//!
//! - `fitx-core` - Items, embedding spaces, the ANN forest, category selection
//!   and the recommendation engine
//! - `fitx-storage` - Embedding export ingestion and persisted index artifacts

pub mod config;

use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub use config::{EngineSection, FitxConfig};

// Re-export core types
pub use fitx_core::{
    get_neighbors, CategoryQuotaSelector, CategoryResults, Corpus, EmbeddingSpace, EngineConfig, Error,
    ForestBuilder, ForestIndex, ForestParams, Item, ItemId, MergedCategory, Metric, Neighbor,
    PrimaryIndexes, RecommendationEngine, RecommendationRequest, Recommendations, Result, Scope,
    SpaceId, SpaceInspection, SpaceSelector, Vector,
};

// Re-export storage
pub use fitx_storage::{
    CacheReport, EmbeddingStore, IndexCache, IndexConfig, IndexSource, LoadReport, SkipReason, SpaceReport,
    StoreConfig,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CategoryResults, Error, FitxConfig, ItemId, MergedCategory, RecommendationEngine,
        RecommendationRequest, Recommendations, Result, Scope, SpaceId, SpaceSelector,
    };
}

/// A ready engine and the reports of the startup phase that produced it.
pub struct Fitx {
    pub engine: Arc<RecommendationEngine>,
    pub load_report: LoadReport,
    pub cache_report: CacheReport,
    pub default_quota: usize,
}

/// Run the initialization phase: ingest the catalog, then make all five
/// primary indexes ready. No engine exists before this returns.
pub fn bootstrap(config: &FitxConfig) -> Result<Fitx> {
    config.validate()?;
    let started = Instant::now();

    let loaded = EmbeddingStore::open(config.store.clone()).load()?;
    let cache = IndexCache::new(config.index.clone(), config.store.dim);
    let (primary, cache_report) = cache.initialize(&loaded.corpus)?;
    let engine = RecommendationEngine::new(Arc::new(loaded.corpus), primary, config.engine.config.clone())?;

    info!(
        items = loaded.report.items_loaded,
        indexes_loaded = cache_report.loaded(),
        indexes_built = cache_report.built(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "fitx ready"
    );
    Ok(Fitx {
        engine: Arc::new(engine),
        load_report: loaded.report,
        cache_report,
        default_quota: config.engine.default_quota,
    })
}
