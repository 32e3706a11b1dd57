//! Layered configuration: built-in defaults, an optional JSON file, then
//! command line overrides applied by the binary.

use anyhow::Context;
use fitx_core::{EngineConfig, Error, Result};
use fitx_storage::{IndexConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The `engine` section: core engine tunables plus request defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    #[serde(flatten)]
    pub config: EngineConfig,
    /// Quota used when a request does not name one.
    pub default_quota: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            default_quota: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FitxConfig {
    pub store: StoreConfig,
    pub index: IndexConfig,
    pub engine: EngineSection,
}

impl FitxConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Resolve every relative path against `data_dir`.
    pub fn rebase(&mut self, data_dir: &Path) {
        rebase_path(&mut self.store.metadata_path, data_dir);
        if let Some(path) = self.store.categories_path.as_mut() {
            rebase_path(path, data_dir);
        }
        rebase_path(&mut self.store.embeddings_dir, data_dir);
        rebase_path(&mut self.index.dir, data_dir);
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.store.dim > 0, "store.dim must be positive"),
            (self.index.num_trees > 0, "index.num_trees must be positive"),
            (self.index.max_leaf_size > 0, "index.max_leaf_size must be positive"),
            (self.engine.config.subset_forest.num_trees > 0, "engine.subset_forest.num_trees must be positive"),
            (self.engine.config.build_workers > 0, "engine.build_workers must be positive"),
            (self.engine.config.build_timeout_ms > 0, "engine.build_timeout_ms must be positive"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(Error::InvalidConfig((*message).to_string())),
            None => Ok(()),
        }
    }
}

fn rebase_path(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitx_core::Metric;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: FitxConfig = serde_json::from_str(
            r#"{
                "index": {"num_trees": 20, "metric": "euclidean"},
                "engine": {"default_quota": 3, "global_scan_bound": 500}
            }"#,
        )
        .unwrap();
        assert_eq!(config.index.num_trees, 20);
        assert_eq!(config.index.metric, Metric::Euclidean);
        assert_eq!(config.index.max_leaf_size, IndexConfig::default().max_leaf_size);
        assert_eq!(config.engine.default_quota, 3);
        assert_eq!(config.engine.config.global_scan_bound, 500);
        assert_eq!(config.engine.config.subset_scan_bound, fitx_core::SUBSET_SCAN_BOUND);
        assert_eq!(config.store.dim, 64);
        config.validate().unwrap();
    }

    #[test]
    fn test_rebase_only_touches_relative_paths() {
        let mut config = FitxConfig::default();
        config.index.dir = PathBuf::from("/var/lib/fitx/indexes");
        config.rebase(Path::new("/srv/data"));
        assert_eq!(config.store.metadata_path, Path::new("/srv/data/item_metadata.json"));
        assert_eq!(config.store.embeddings_dir, Path::new("/srv/data/embeddings"));
        assert_eq!(config.index.dir, Path::new("/var/lib/fitx/indexes"));
    }

    #[test]
    fn test_validate_rejects_zero_trees() {
        let mut config = FitxConfig::default();
        config.index.num_trees = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
