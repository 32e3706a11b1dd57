// Ingestion of the item metadata and the per-space embedding exports.
//
// Loading is lenient: a bad record is skipped and counted under a
// `SkipReason`, never failing the load. Only unreadable inputs (a missing
// metadata file or export file) are errors.

use ahash::{AHashMap, AHashSet};
use anyhow::{anyhow, Context, Result};
use fitx_core::{Corpus, Item, ItemId, MergedCategory, SpaceId, Vector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_DIM: usize = 64;
pub const IMAGE_EXT: &str = ".jpg";

/// Where the store finds its inputs. Default paths are relative to the data
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub metadata_path: PathBuf,
    /// `<id>,<name>,<extra>` table resolving raw category ids to names.
    pub categories_path: Option<PathBuf>,
    pub embeddings_dir: PathBuf,
    /// Export file name per space, in [`SpaceId::ALL`] order.
    pub export_files: [String; SpaceId::COUNT],
    pub dim: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            metadata_path: PathBuf::from("item_metadata.json"),
            categories_path: Some(PathBuf::from("categories.csv")),
            embeddings_dir: PathBuf::from("embeddings"),
            export_files: SpaceId::ALL.map(|space| space.export_file_name().to_string()),
            dim: DEFAULT_DIM,
        }
    }
}

impl StoreConfig {
    pub fn export_path(&self, space: SpaceId) -> PathBuf {
        self.embeddings_dir.join(&self.export_files[space.index()])
    }
}

/// Labels of one item as read from the metadata source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub raw_category: String,
    pub semantic_category: String,
}

/// Supplies item labels keyed by item name.
pub trait ItemMetadataSource {
    fn load_metadata(&self) -> Result<BTreeMap<String, MetadataRecord>>;
}

/// `item_metadata.json` (object keyed by item name) plus the optional raw
/// category table.
#[derive(Debug, Clone)]
pub struct JsonMetadataSource {
    metadata_path: PathBuf,
    categories_path: Option<PathBuf>,
}

#[derive(Deserialize)]
struct RawMetadata {
    category_id: serde_json::Value,
    semantic_category: String,
}

impl JsonMetadataSource {
    pub fn new<P: AsRef<Path>>(metadata_path: P, categories_path: Option<PathBuf>) -> Self {
        Self {
            metadata_path: metadata_path.as_ref().to_path_buf(),
            categories_path,
        }
    }

    fn load_categories(&self) -> Result<AHashMap<String, String>> {
        let Some(path) = &self.categories_path else {
            return Ok(AHashMap::new());
        };
        if !path.exists() {
            warn!(path = %path.display(), "category table not found, using raw category ids");
            return Ok(AHashMap::new());
        }
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mut names = AHashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let mut fields = line.split(',');
            match (fields.next(), fields.next()) {
                (Some(id), Some(name)) if !id.trim().is_empty() => {
                    names.insert(id.trim().to_string(), name.trim().to_string());
                }
                _ => {}
            }
        }
        Ok(names)
    }
}

impl ItemMetadataSource for JsonMetadataSource {
    fn load_metadata(&self) -> Result<BTreeMap<String, MetadataRecord>> {
        let categories = self.load_categories()?;
        let file = File::open(&self.metadata_path)
            .with_context(|| format!("opening {}", self.metadata_path.display()))?;
        let raw: BTreeMap<String, RawMetadata> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", self.metadata_path.display()))?;

        Ok(raw
            .into_iter()
            .map(|(name, meta)| {
                let category_id = match meta.category_id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                let raw_category = categories.get(&category_id).cloned().unwrap_or(category_id);
                let record = MetadataRecord {
                    raw_category,
                    semantic_category: meta.semantic_category,
                };
                (strip_image_ext(&name).to_string(), record)
            })
            .collect())
    }
}

/// Why a record was left out of the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Vector line for an item absent from the metadata.
    MissingMetadata,
    /// Vector length differs from the configured dimensionality.
    WrongDimension,
    UnparsableValue,
    NonFiniteValue,
    /// Second vector line for the same item in one export.
    DuplicateRecord,
    /// Metadata item without a vector in some space.
    MissingEmbedding,
    /// Semantic label outside the merged category set.
    UnknownCategory,
}

/// Outcome of parsing one export line.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Accepted { name: String, vector: Vec<f32> },
    Skipped { name: String, reason: SkipReason },
    Blank,
}

/// Parse `<name>.jpg, f, f, ...`.
pub fn parse_record(line: &str, dim: usize) -> RecordOutcome {
    let line = line.trim();
    if line.is_empty() {
        return RecordOutcome::Blank;
    }
    let mut fields = line.split(',').map(str::trim);
    let name = strip_image_ext(fields.next().unwrap_or_default()).to_string();

    let mut vector = Vec::with_capacity(dim);
    for field in fields {
        match field.parse::<f32>() {
            Ok(value) if value.is_finite() => vector.push(value),
            Ok(_) => return RecordOutcome::Skipped { name, reason: SkipReason::NonFiniteValue },
            Err(_) => return RecordOutcome::Skipped { name, reason: SkipReason::UnparsableValue },
        }
    }
    if vector.len() != dim {
        return RecordOutcome::Skipped { name, reason: SkipReason::WrongDimension };
    }
    RecordOutcome::Accepted { name, vector }
}

#[inline]
fn strip_image_ext(name: &str) -> &str {
    name.strip_suffix(IMAGE_EXT).unwrap_or(name)
}

/// Aggregated ingestion counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub metadata_records: usize,
    pub items_loaded: usize,
    /// Accepted vector lines per space, in [`SpaceId::ALL`] order.
    pub vectors_per_space: [usize; SpaceId::COUNT],
    pub skipped: BTreeMap<SkipReason, usize>,
    pub category_counts: BTreeMap<MergedCategory, usize>,
}

impl LoadReport {
    fn skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason).or_insert(0) += 1;
    }

    pub fn skip_count(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }
}

#[derive(Debug)]
pub struct LoadedCorpus {
    pub corpus: Corpus,
    pub report: LoadReport,
}

/// Reads the whole catalog into a [`Corpus`].
pub struct EmbeddingStore<M = JsonMetadataSource> {
    config: StoreConfig,
    metadata: M,
}

impl EmbeddingStore<JsonMetadataSource> {
    pub fn open(config: StoreConfig) -> Self {
        let metadata = JsonMetadataSource::new(&config.metadata_path, config.categories_path.clone());
        Self { config, metadata }
    }
}

impl<M: ItemMetadataSource> EmbeddingStore<M> {
    pub fn with_metadata(config: StoreConfig, metadata: M) -> Self {
        Self { config, metadata }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Items get dense ids in ascending name order, so the same inputs
    /// always yield the same ids.
    pub fn load(&self) -> fitx_core::Result<LoadedCorpus> {
        self.load_inner()
            .map_err(|e| fitx_core::Error::Storage(format!("{:#}", e)))
    }

    fn load_inner(&self) -> Result<LoadedCorpus> {
        if self.config.dim == 0 {
            return Err(anyhow!("embedding dimensionality must be positive"));
        }
        let started = std::time::Instant::now();
        let metadata = self.metadata.load_metadata()?;
        let mut report = LoadReport {
            metadata_records: metadata.len(),
            ..LoadReport::default()
        };

        let mut spaces: Vec<AHashMap<String, Vec<f32>>> = Vec::with_capacity(SpaceId::COUNT);
        for space in SpaceId::ALL {
            let vectors = self.read_export(space, &metadata, &mut report)?;
            report.vectors_per_space[space.index()] = vectors.len();
            spaces.push(vectors);
        }

        let mut items = Vec::with_capacity(metadata.len());
        for (name, record) in metadata {
            if MergedCategory::from_label(&record.semantic_category).is_none() {
                debug!(item = %name, label = %record.semantic_category, "unknown semantic category");
                report.skip(SkipReason::UnknownCategory);
                continue;
            }
            let mut embeddings = Vec::with_capacity(SpaceId::COUNT);
            for vectors in spaces.iter_mut() {
                match vectors.remove(&name) {
                    Some(vector) => embeddings.push(Vector::new(vector)),
                    None => break,
                }
            }
            let Ok(embeddings) = <[Vector; SpaceId::COUNT]>::try_from(embeddings) else {
                report.skip(SkipReason::MissingEmbedding);
                continue;
            };
            let id = ItemId(items.len() as u32);
            let item = Item::new(id, name, record.raw_category, record.semantic_category, embeddings)?;
            items.push(item);
        }
        report.items_loaded = items.len();

        info!(
            items = report.items_loaded,
            metadata_records = report.metadata_records,
            skipped = report.total_skipped(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded embedding store"
        );
        for (reason, count) in &report.skipped {
            warn!(?reason, count, "skipped records during ingestion");
        }

        let corpus = Corpus::new(items)?;
        report.category_counts = MergedCategory::ALL
            .into_iter()
            .zip(corpus.category_counts())
            .filter(|&(_, count)| count > 0)
            .collect();
        Ok(LoadedCorpus { corpus, report })
    }

    fn read_export(
        &self,
        space: SpaceId,
        metadata: &BTreeMap<String, MetadataRecord>,
        report: &mut LoadReport,
    ) -> Result<AHashMap<String, Vec<f32>>> {
        let path = self.config.export_path(space);
        let file = File::open(&path)
            .with_context(|| format!("opening {} export {}", space, path.display()))?;

        let mut vectors = AHashMap::with_capacity(metadata.len());
        let mut seen = AHashSet::with_capacity(metadata.len());
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("reading {}", path.display()))?;
            match parse_record(&line, self.config.dim) {
                RecordOutcome::Blank => {}
                RecordOutcome::Skipped { name, reason } => {
                    if metadata.contains_key(&name) {
                        report.skip(reason);
                    } else {
                        report.skip(SkipReason::MissingMetadata);
                    }
                }
                RecordOutcome::Accepted { name, vector } => {
                    if !metadata.contains_key(&name) {
                        report.skip(SkipReason::MissingMetadata);
                    } else if !seen.insert(name.clone()) {
                        report.skip(SkipReason::DuplicateRecord);
                    } else {
                        vectors.insert(name, vector);
                    }
                }
            }
        }
        debug!(space = %space, vectors = vectors.len(), "read embedding export");
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_fixture(dir: &Path) -> StoreConfig {
        fs::write(dir.join("categories.csv"), "1,shirt,x\n2,jeans,x\n3,scarf,x\n").unwrap();
        fs::write(
            dir.join("item_metadata.json"),
            r#"{
                "b": {"category_id": 2, "semantic_category": "bottoms"},
                "a": {"category_id": 1, "semantic_category": "outerwear"},
                "c": {"category_id": "3", "semantic_category": "scarves"},
                "d": {"category_id": 9, "semantic_category": "capes"},
                "e": {"category_id": 1, "semantic_category": "tops"}
            }"#,
        )
        .unwrap();
        let emb = dir.join("embeddings");
        fs::create_dir_all(&emb).unwrap();
        for space in SpaceId::ALL {
            let s = space.index();
            let mut body = format!("a.jpg, 1.0, {}.0\nb.jpg, 2.0, {}.5\nc.jpg, 3.0, 0.0\nd.jpg, 1, 1\n", s, s);
            if space == SpaceId::Mask2 {
                // e lacks this space; a duplicate line for a and an orphan.
                body.push_str("a.jpg, 9.0, 9.0\nzzz.jpg, 0.0, 0.0\n");
            } else {
                body.push_str("e.jpg, 0.5, 0.5\n");
            }
            if space == SpaceId::Full {
                body.push_str("\nb.jpg, 1.0\nc.jpg, NaN, 1.0\nc.jpg, x, 1.0\n");
            }
            fs::write(emb.join(space.export_file_name()), body).unwrap();
        }
        StoreConfig {
            metadata_path: dir.join("item_metadata.json"),
            categories_path: Some(dir.join("categories.csv")),
            embeddings_dir: emb,
            dim: 2,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_parse_record() {
        assert_eq!(
            parse_record("x.jpg, 1.5, -2", 2),
            RecordOutcome::Accepted { name: "x".into(), vector: vec![1.5, -2.0] }
        );
        assert_eq!(parse_record("   ", 2), RecordOutcome::Blank);
        assert!(matches!(
            parse_record("x.jpg, 1.5", 2),
            RecordOutcome::Skipped { reason: SkipReason::WrongDimension, .. }
        ));
        assert!(matches!(
            parse_record("x.jpg, inf, 1", 2),
            RecordOutcome::Skipped { reason: SkipReason::NonFiniteValue, .. }
        ));
        assert!(matches!(
            parse_record("x.jpg, abc, 1", 2),
            RecordOutcome::Skipped { reason: SkipReason::UnparsableValue, .. }
        ));
    }

    #[test]
    fn test_load_is_lenient_and_counted() {
        let dir = TempDir::new().unwrap();
        let config = write_fixture(dir.path());
        let LoadedCorpus { corpus, report } = EmbeddingStore::open(config).load().unwrap();

        // a, b, c survive; d has an unknown label, e misses mask-2.
        assert_eq!(corpus.len(), 3);
        assert_eq!(report.items_loaded, 3);
        assert_eq!(report.metadata_records, 5);
        assert_eq!(report.skip_count(SkipReason::UnknownCategory), 1);
        assert_eq!(report.skip_count(SkipReason::MissingEmbedding), 1);
        assert_eq!(report.skip_count(SkipReason::MissingMetadata), 1);
        assert_eq!(report.skip_count(SkipReason::DuplicateRecord), 1);
        assert_eq!(report.skip_count(SkipReason::WrongDimension), 1);
        assert_eq!(report.skip_count(SkipReason::NonFiniteValue), 1);
        assert_eq!(report.skip_count(SkipReason::UnparsableValue), 1);

        let a = corpus.get(ItemId(0)).unwrap();
        assert_eq!(a.name, "a");
        assert_eq!(a.raw_category, "shirt");
        assert_eq!(a.category(), MergedCategory::Tops);
        assert_eq!(a.image_path(), "images/a.jpg");
        // The first line for a in mask-2 wins over the duplicate.
        assert_eq!(a.embedding(SpaceId::Mask2).as_slice(), &[1.0, 2.0]);

        let c = corpus.get(ItemId(2)).unwrap();
        assert_eq!(c.name, "c");
        assert_eq!(c.raw_category, "scarf");
        assert_eq!(c.category(), MergedCategory::Accessories);
        assert_eq!(report.category_counts[&MergedCategory::Bottoms], 1);
    }

    #[test]
    fn test_missing_category_table_keeps_raw_ids() {
        let dir = TempDir::new().unwrap();
        let mut config = write_fixture(dir.path());
        config.categories_path = Some(dir.path().join("absent.csv"));
        let loaded = EmbeddingStore::open(config).load().unwrap();
        assert_eq!(loaded.corpus.get(ItemId(1)).unwrap().raw_category, "2");
    }

    #[test]
    fn test_missing_export_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = write_fixture(dir.path());
        fs::remove_file(config.export_path(SpaceId::Mask4)).unwrap();
        let err = EmbeddingStore::open(config).load().unwrap_err();
        assert!(matches!(err, fitx_core::Error::Storage(msg) if msg.contains("mask-4")));
    }

    struct Fixed;

    impl ItemMetadataSource for Fixed {
        fn load_metadata(&self) -> Result<BTreeMap<String, MetadataRecord>> {
            let record = MetadataRecord {
                raw_category: "boot".into(),
                semantic_category: "shoes".into(),
            };
            Ok(BTreeMap::from([("b".to_string(), record)]))
        }
    }

    #[test]
    fn test_custom_metadata_source() {
        let dir = TempDir::new().unwrap();
        let config = write_fixture(dir.path());
        let loaded = EmbeddingStore::with_metadata(config, Fixed).load().unwrap();
        assert_eq!(loaded.corpus.len(), 1);
        assert_eq!(loaded.corpus.category(ItemId(0)), Some(MergedCategory::Shoes));
        // Every line not about b, malformed ones included.
        assert_eq!(loaded.report.skip_count(SkipReason::MissingMetadata), 23);
    }
}
