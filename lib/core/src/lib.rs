//! # fitx Core
//!
//! Core library of the fitx garment recommendation engine.
//!
//! - [`Item`] / [`Corpus`] - Garments with one embedding per [`SpaceId`]
//! - [`ForestIndex`] - Random projection forest for approximate neighbors
//! - [`CategoryQuotaSelector`] - Per-category selection over ranked neighbors
//! - [`RecommendationEngine`] - Global and subset recommendations
//!
//! ## Example
//!
//! ```rust
//! use fitx_core::{
//!     EmbeddingSpace, ForestBuilder, ForestParams, ItemId, Metric, SpaceId,
//! };
//!
//! let space = EmbeddingSpace::new(SpaceId::Full, 2, Metric::Euclidean);
//! let mut builder = ForestBuilder::new(space, ForestParams::default());
//! builder.add_item(ItemId(0), &[0.0, 0.0]).unwrap();
//! builder.add_item(ItemId(1), &[1.0, 0.0]).unwrap();
//! builder.add_item(ItemId(2), &[5.0, 5.0]).unwrap();
//! let index = builder.build().unwrap();
//!
//! let nearest = fitx_core::get_neighbors(&index, ItemId(0), 1).unwrap();
//! assert_eq!(nearest[0].id, ItemId(1));
//! ```

pub mod error;
pub mod vector;
pub mod space;
pub mod category;
pub mod item;
pub mod forest;
pub mod neighbors;
pub mod quota;
pub mod background;
pub mod engine;

/// SIMD-optimized vector operations
///
/// Provides hardware-accelerated distance calculations:
/// - AVX2/FMA on x86_64
/// - NEON on ARM64/Apple Silicon
pub mod simd;

pub use error::{Error, Result};
pub use vector::Vector;
pub use space::{EmbeddingSpace, Metric, SpaceId};
pub use category::{merge_label, MergedCategory};
pub use item::{Corpus, Item, ItemId};
pub use forest::{ForestBuilder, ForestIndex, ForestParts, ForestPartsRef, ForestParams, Neighbor};
pub use neighbors::get_neighbors;
pub use quota::{CategoryQuotaSelector, CategoryResults, GLOBAL_SCAN_BOUND, SUBSET_SCAN_BOUND};
pub use background::{BuildPool, CancelToken, JobHandle};
pub use engine::{
    EngineConfig, PrimaryIndexes, RecommendationEngine, RecommendationRequest, Recommendations,
    Scope, SpaceInspection, SpaceSelector,
};
