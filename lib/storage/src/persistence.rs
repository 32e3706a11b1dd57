// Persisted primary index artifacts: one `<space>_index.ann` file per space.
//
// File layout (bincode): an `ArtifactFile` holding a header and the bincode
// encoded forest as an opaque payload. The header carries a SHA-256 of the
// payload and an `ArtifactKey` describing what the forest was built from, so
// a truncated, corrupted or stale file is detected before the payload is
// decoded.

use anyhow::{anyhow, bail, Context, Result};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use chrono::{DateTime, Utc};
use fitx_core::{Corpus, EmbeddingSpace, ForestIndex, ForestParams, ForestParts, SpaceId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ARTIFACT_EXT: &str = "ann";
const MAGIC: [u8; 4] = *b"FITX";
const FORMAT_VERSION: u32 = 1;

/// Everything a stored forest must agree on with the current corpus and
/// configuration to be reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub space: EmbeddingSpace,
    pub num_trees: usize,
    pub max_leaf_size: usize,
    pub item_count: usize,
    /// SHA-256 over the `(id, vector)` pairs of the space, in id order.
    pub fingerprint: String,
}

impl ArtifactKey {
    pub fn for_corpus(corpus: &Corpus, space: EmbeddingSpace, params: &ForestParams) -> Self {
        Self {
            space,
            num_trees: params.num_trees,
            max_leaf_size: params.max_leaf_size,
            item_count: corpus.len(),
            fingerprint: fingerprint(corpus, space),
        }
    }

    /// First field that differs from `expected`, if any.
    fn mismatch(&self, expected: &ArtifactKey) -> Option<String> {
        if self.space != expected.space {
            Some(format!("space {:?}, expected {:?}", self.space, expected.space))
        } else if self.num_trees != expected.num_trees {
            Some(format!("{} trees, expected {}", self.num_trees, expected.num_trees))
        } else if self.max_leaf_size != expected.max_leaf_size {
            Some(format!("leaf size {}, expected {}", self.max_leaf_size, expected.max_leaf_size))
        } else if self.item_count != expected.item_count {
            Some(format!("{} items, expected {}", self.item_count, expected.item_count))
        } else if self.fingerprint != expected.fingerprint {
            Some("corpus fingerprint changed".to_string())
        } else {
            None
        }
    }
}

pub fn fingerprint(corpus: &Corpus, space: EmbeddingSpace) -> String {
    let mut hasher = Sha256::new();
    hasher.update((space.dim as u64).to_le_bytes());
    for (id, vector) in corpus.entries(space.id) {
        hasher.update(id.0.to_le_bytes());
        for value in vector {
            hasher.update(value.to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactHeader {
    magic: [u8; 4],
    pub format_version: u32,
    pub key: ArtifactKey,
    pub payload_len: u64,
    pub payload_checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct ArtifactFile {
    header: ArtifactHeader,
    payload: Vec<u8>,
}

/// Result of looking for a reusable artifact.
#[derive(Debug)]
pub enum ArtifactLoad {
    Ready(ForestIndex),
    Missing,
    /// Intact, but built from other inputs.
    Stale(String),
}

/// Directory of persisted primary indexes.
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, space: SpaceId) -> PathBuf {
        self.dir.join(format!("{}.{}", space.artifact_key(), ARTIFACT_EXT))
    }

    /// Write `index` atomically; readers never observe a partial file.
    pub fn save(&self, index: &ForestIndex, key: ArtifactKey) -> Result<ArtifactHeader> {
        if key.space != index.space() {
            bail!("artifact key for {:?} does not describe index over {:?}", key.space, index.space());
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let payload = bincode::serialize(&index.parts())
            .map_err(|e| anyhow!("Serialization error: {}", e))?;
        let header = ArtifactHeader {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            key,
            payload_len: payload.len() as u64,
            payload_checksum: format!("{:x}", Sha256::digest(&payload)),
            created_at: Utc::now(),
        };
        let file = ArtifactFile { header, payload };
        let data = bincode::serialize(&file)
            .map_err(|e| anyhow!("Serialization error: {}", e))?;

        let path = self.path_for(index.space().id);
        AtomicFile::new(&path, OverwriteBehavior::AllowOverwrite)
            .write(|f| f.write_all(&data))
            .map_err(|e| anyhow!("writing {}: {}", path.display(), e))?;
        Ok(file.header)
    }

    /// Load the artifact of `expected.space`.
    ///
    /// Errors mean the file exists but cannot be trusted (unreadable,
    /// truncated, checksum mismatch, invalid forest structure).
    pub fn load(&self, expected: &ArtifactKey) -> Result<ArtifactLoad> {
        let path = self.path_for(expected.space.id);
        if !path.exists() {
            return Ok(ArtifactLoad::Missing);
        }
        let data = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let file: ArtifactFile = bincode::deserialize(&data)
            .map_err(|e| anyhow!("Deserialization error: {}", e))?;
        let header = &file.header;

        if header.magic != MAGIC {
            bail!("not an index artifact");
        }
        if header.format_version != FORMAT_VERSION {
            return Ok(ArtifactLoad::Stale(format!(
                "format version {}, expected {}",
                header.format_version, FORMAT_VERSION
            )));
        }
        if header.payload_len != file.payload.len() as u64
            || header.payload_checksum != format!("{:x}", Sha256::digest(&file.payload))
        {
            bail!("payload checksum mismatch");
        }
        if let Some(reason) = header.key.mismatch(expected) {
            return Ok(ArtifactLoad::Stale(reason));
        }

        let parts: ForestParts = bincode::deserialize(&file.payload)
            .map_err(|e| anyhow!("Deserialization error: {}", e))?;
        let index = ForestIndex::from_parts(parts)?;
        if index.space() != expected.space || index.len() != expected.item_count {
            bail!("forest contents disagree with the artifact header");
        }
        Ok(ArtifactLoad::Ready(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitx_core::{ForestBuilder, Item, ItemId, Metric, Vector};
    use tempfile::TempDir;

    fn corpus(n: u32) -> Corpus {
        let items = (0..n)
            .map(|i| {
                let embeddings =
                    std::array::from_fn(|s| Vector::new(vec![i as f32, s as f32 + 1.0, (i % 4) as f32]));
                Item::new(ItemId(i), format!("item{}", i), "1", "shoes", embeddings).unwrap()
            })
            .collect();
        Corpus::new(items).unwrap()
    }

    fn params() -> ForestParams {
        ForestParams {
            num_trees: 3,
            max_leaf_size: 4,
            seed: Some(1),
        }
    }

    fn build(corpus: &Corpus, space: EmbeddingSpace) -> ForestIndex {
        let mut builder = ForestBuilder::new(space, params());
        for (id, vector) in corpus.entries(space.id) {
            builder.add_item(id, vector).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_save_load_is_query_equivalent() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("indexes"));
        let corpus = corpus(40);
        let space = EmbeddingSpace::new(SpaceId::Mask3, 3, Metric::Angular);
        let index = build(&corpus, space);
        let key = ArtifactKey::for_corpus(&corpus, space, &params());

        let header = store.save(&index, key.clone()).unwrap();
        assert_eq!(header.key, key);
        assert!(store.path_for(SpaceId::Mask3).ends_with("mask_3_index.ann"));

        let ArtifactLoad::Ready(loaded) = store.load(&key).unwrap() else {
            panic!("expected a reusable artifact");
        };
        for id in index.ids() {
            assert_eq!(index.query_item(*id, 5).unwrap(), loaded.query_item(*id, 5).unwrap());
        }
    }

    #[test]
    fn test_missing_and_stale() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let corpus = corpus(20);
        let space = EmbeddingSpace::new(SpaceId::Full, 3, Metric::Euclidean);
        let key = ArtifactKey::for_corpus(&corpus, space, &params());
        assert!(matches!(store.load(&key).unwrap(), ArtifactLoad::Missing));

        store.save(&build(&corpus, space), key.clone()).unwrap();

        let grown = self::corpus(21);
        let newer = ArtifactKey::for_corpus(&grown, space, &params());
        assert!(matches!(store.load(&newer).unwrap(), ArtifactLoad::Stale(_)));

        let more_trees = ArtifactKey { num_trees: 10, ..key.clone() };
        assert!(matches!(store.load(&more_trees).unwrap(), ArtifactLoad::Stale(r) if r.contains("trees")));
    }

    #[test]
    fn test_fingerprint_tracks_vectors() {
        let space = EmbeddingSpace::new(SpaceId::Mask1, 3, Metric::Angular);
        let a = fingerprint(&corpus(10), space);
        assert_eq!(a, fingerprint(&corpus(10), space));
        assert_ne!(a, fingerprint(&corpus(11), space));
        assert_ne!(a, fingerprint(&corpus(10), EmbeddingSpace::new(SpaceId::Mask2, 3, Metric::Angular)));
    }

    #[test]
    fn test_corrupt_artifacts_are_errors() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let corpus = corpus(30);
        let space = EmbeddingSpace::new(SpaceId::Mask4, 3, Metric::Angular);
        let key = ArtifactKey::for_corpus(&corpus, space, &params());
        store.save(&build(&corpus, space), key.clone()).unwrap();
        let path = store.path_for(SpaceId::Mask4);

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(store.load(&key).is_err());

        let mut flipped = bytes.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        fs::write(&path, &flipped).unwrap();
        assert!(store.load(&key).is_err());

        fs::write(&path, b"garbage").unwrap();
        assert!(store.load(&key).is_err());
    }
}
