pub mod embeddings;
pub mod persistence;
pub mod manager;

pub use embeddings::{
    EmbeddingStore, ItemMetadataSource, JsonMetadataSource, LoadReport, LoadedCorpus, MetadataRecord,
    RecordOutcome, SkipReason, StoreConfig,
};
pub use persistence::{ArtifactHeader, ArtifactKey, ArtifactLoad, ArtifactStore};
pub use manager::{CacheReport, IndexCache, IndexConfig, IndexSource, SpaceReport};
