// Integration tests for fitx
use fitx::{
    bootstrap, CategoryResults, FitxConfig, IndexSource, ItemId, MergedCategory, RecommendationRequest, SkipReason,
    SpaceId,
};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const DIM: usize = 4;
const LABELS: [&str; 5] = ["hats", "outerwear", "bottoms", "shoes", "scarves"];

/// `n` items named `n00`, `n01`, ... cycling through `LABELS`, plus one
/// export line for an item the metadata does not know.
fn write_catalog(dir: &Path, n: usize) {
    fs::write(dir.join("categories.csv"), "1,cap,a\n2,coat,a\n3,jeans,a\n4,sneaker,a\n5,scarf,a\n").unwrap();

    let mut metadata = serde_json::Map::new();
    for i in 0..n {
        metadata.insert(
            format!("n{:02}.jpg", i),
            serde_json::json!({
                "category_id": i % LABELS.len() + 1,
                "semantic_category": LABELS[i % LABELS.len()],
                "source": "fixture",
            }),
        );
    }
    fs::write(
        dir.join("item_metadata.json"),
        serde_json::to_string(&metadata).unwrap(),
    )
    .unwrap();

    let embeddings = dir.join("embeddings");
    fs::create_dir_all(&embeddings).unwrap();
    for space in SpaceId::ALL {
        let mut body = String::new();
        for i in 0..n {
            let v = [
                1.0 + (i % 5) as f32,
                1.0 + (i / 5) as f32 * 0.3,
                0.5 + space.index() as f32 * 0.1,
                1.0,
            ];
            writeln!(body, "n{:02}.jpg, {}, {}, {}, {}", i, v[0], v[1], v[2], v[3]).unwrap();
        }
        body.push_str("ghost.jpg, 1.0, 1.0, 1.0, 1.0\n");
        fs::write(embeddings.join(space.export_file_name()), body).unwrap();
    }
}

fn config(dir: &Path) -> FitxConfig {
    let mut config = FitxConfig::default();
    config.store.dim = DIM;
    config.index.seed = Some(7);
    config.engine.config.ensemble_seed = Some(7);
    config.engine.config.build_workers = 2;
    config.rebase(dir);
    config
}

#[test]
fn test_ten_items_quota_one() {
    let dir = TempDir::new().unwrap();
    write_catalog(dir.path(), 10);
    let fitx = bootstrap(&config(dir.path())).unwrap();

    assert_eq!(fitx.load_report.items_loaded, 10);
    assert_eq!(fitx.load_report.skip_count(SkipReason::MissingMetadata), SpaceId::COUNT);
    assert_eq!(fitx.cache_report.built(), SpaceId::COUNT);

    for query in 0..10 {
        let request = RecommendationRequest::global(ItemId(query), 1);
        let recs = fitx.engine.recommend(&request).unwrap();
        assert!(SpaceId::MASKS.contains(&recs.space));
        assert!(!recs.results.contains(ItemId(query)));
        for (category, neighbors) in recs.results.iter() {
            let expected = match category {
                MergedCategory::AllBody | MergedCategory::Bags => 0,
                _ => 1,
            };
            assert_eq!(neighbors.len(), expected, "{} for query {}", category, query);
        }
    }
}

#[test]
fn test_empty_subset_and_unknown_query() {
    let dir = TempDir::new().unwrap();
    write_catalog(dir.path(), 10);
    let fitx = bootstrap(&config(dir.path())).unwrap();

    let recs = fitx
        .engine
        .recommend(&RecommendationRequest::subset(ItemId(3), Vec::new(), 4))
        .unwrap();
    assert_eq!(recs.results, CategoryResults::empty(&MergedCategory::ALL));

    // A wardrobe that does not hold the query item.
    let err = fitx
        .engine
        .recommend(&RecommendationRequest::subset(ItemId(3), vec![ItemId(1), ItemId(5)], 1))
        .unwrap_err();
    assert!(err.is_not_found());

    let err = fitx
        .engine
        .recommend(&RecommendationRequest::global(ItemId(500), 1))
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_subset_recommendations_stay_inside_subset() {
    let dir = TempDir::new().unwrap();
    write_catalog(dir.path(), 20);
    let fitx = bootstrap(&config(dir.path())).unwrap();

    let wardrobe: Vec<ItemId> = [0, 1, 2, 6, 7, 13].into_iter().map(ItemId).collect();
    let request = RecommendationRequest::subset(ItemId(0), wardrobe.clone(), 3).in_space(SpaceId::Mask1);
    let recs = fitx.engine.recommend(&request).unwrap();

    assert_eq!(recs.scope_size, wardrobe.len());
    assert_eq!(recs.results.total(), wardrobe.len() - 1);
    for (_, neighbors) in recs.results.iter() {
        for pair in neighbors.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
        assert!(neighbors.iter().all(|n| wardrobe.contains(&n.id) && n.id != ItemId(0)));
    }
    assert_eq!(recs.results.get(MergedCategory::Tops).len(), 2);
}

#[test]
fn test_artifacts_reused_then_rebuilt_when_stale_or_corrupt() {
    let dir = TempDir::new().unwrap();
    write_catalog(dir.path(), 15);
    let config = config(dir.path());

    let first = bootstrap(&config).unwrap();
    assert_eq!(first.cache_report.built(), SpaceId::COUNT);
    let request = RecommendationRequest::global(ItemId(4), 2).in_space(SpaceId::Mask3);
    let before = first.engine.recommend(&request).unwrap();

    let second = bootstrap(&config).unwrap();
    assert_eq!(second.cache_report.loaded(), SpaceId::COUNT);
    assert_eq!(second.engine.recommend(&request).unwrap().results, before.results);

    let artifact = dir.path().join("indexes").join("mask_3_index.ann");
    fs::write(&artifact, b"truncated").unwrap();
    let third = bootstrap(&config).unwrap();
    let mask3 = &third.cache_report.spaces[SpaceId::Mask3.index()];
    assert_eq!(mask3.source, IndexSource::Built);
    assert_eq!(third.cache_report.loaded(), SpaceId::COUNT - 1);
    assert_eq!(third.engine.recommend(&request).unwrap().results, before.results);

    write_catalog(dir.path(), 16);
    let fourth = bootstrap(&config).unwrap();
    assert_eq!(fourth.cache_report.built(), SpaceId::COUNT);
    assert!(fourth
        .cache_report
        .spaces
        .iter()
        .all(|s| s.rebuild_reason.as_deref().is_some_and(|r| r.starts_with("stale"))));
}

#[test]
fn test_inspect_covers_all_spaces() {
    let dir = TempDir::new().unwrap();
    write_catalog(dir.path(), 10);
    let fitx = bootstrap(&config(dir.path())).unwrap();

    let inspection = fitx.engine.inspect(ItemId(2), 4).unwrap();
    assert_eq!(
        inspection.iter().map(|s| s.space).collect::<Vec<_>>(),
        SpaceId::ALL.to_vec()
    );
    for entry in &inspection {
        assert_eq!(entry.neighbors.len(), 4);
        assert_eq!(entry.by_category.total(), 5);
    }
}

#[test]
fn test_config_file_and_invalid_config() {
    let dir = TempDir::new().unwrap();
    write_catalog(dir.path(), 10);
    let path = dir.path().join("fitx.json");
    fs::write(
        &path,
        r#"{"store": {"dim": 4}, "index": {"num_trees": 3, "dir": "artifacts"}, "engine": {"default_quota": 2}}"#,
    )
    .unwrap();

    let mut config = FitxConfig::from_file(&path).unwrap();
    config.rebase(dir.path());
    let fitx = bootstrap(&config).unwrap();
    assert_eq!(fitx.default_quota, 2);
    assert!(dir.path().join("artifacts").join("full_index.ann").exists());

    config.store.dim = 0;
    assert!(matches!(bootstrap(&config), Err(fitx::Error::InvalidConfig(_))));
}
