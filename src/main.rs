use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use fitx::{
    CategoryResults, Corpus, FitxConfig, ItemId, MergedCategory, RecommendationRequest, Scope, SpaceId,
    SpaceSelector,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Category-balanced visual similarity recommendations for garments
#[derive(Parser, Debug)]
#[command(name = "fitx")]
#[command(about = "Category-balanced garment recommendations", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the data directory; relative paths in the configuration are resolved against it
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the catalog, make all primary indexes ready and print the startup reports
    Warm,
    /// Recommend neighbors per category for one item
    Recommend {
        /// Query item id
        #[arg(long)]
        item: u32,
        /// Restrict the candidates to these item ids (comma separated)
        #[arg(long, value_delimiter = ',', num_args = 0..)]
        subset: Option<Vec<u32>>,
        /// Neighbors per category
        #[arg(long)]
        quota: Option<usize>,
        /// Embedding space (full, mask-1 .. mask-4) or "random"
        #[arg(long, default_value = "random")]
        space: String,
        /// Only fill these categories (comma separated)
        #[arg(long = "category", value_delimiter = ',')]
        categories: Vec<MergedCategory>,
    },
    /// Show neighbors of one item in every embedding space
    Inspect {
        #[arg(long)]
        item: u32,
        #[arg(short, default_value_t = 10)]
        k: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(log_level.into()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting fitx v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", args.data_dir);

    let mut config = match &args.config {
        Some(path) => FitxConfig::from_file(path)?,
        None => FitxConfig::default(),
    };
    config.rebase(&args.data_dir);

    let space_selector = match &args.command {
        Command::Recommend { space, .. } => Some(parse_space(space)?),
        _ => None,
    };

    let fitx = fitx::bootstrap(&config)?;
    let engine = &fitx.engine;

    let output = match args.command {
        Command::Warm => json!({
            "load": fitx.load_report,
            "indexes": fitx.cache_report,
        }),
        Command::Recommend {
            item,
            subset,
            quota,
            categories,
            ..
        } => {
            let request = RecommendationRequest {
                query: ItemId(item),
                scope: match subset {
                    Some(ids) => Scope::Subset(ids.into_iter().map(ItemId).collect()),
                    None => Scope::Global,
                },
                quota_per_category: quota.unwrap_or(fitx.default_quota),
                space: space_selector.unwrap_or_default(),
                categories,
            };
            let recs = engine.recommend(&request)?;
            json!({
                "query": describe_item(engine.corpus(), recs.query),
                "space": recs.space,
                "scope_size": recs.scope_size,
                "results": describe_results(engine.corpus(), &recs.results),
            })
        }
        Command::Inspect { item, k } => {
            let spaces = engine.inspect(ItemId(item), k)?;
            let spaces: Vec<Value> = spaces
                .iter()
                .map(|entry| {
                    json!({
                        "space": entry.space,
                        "neighbors": entry
                            .neighbors
                            .iter()
                            .map(|n| with_distance(engine.corpus(), n.id, n.distance))
                            .collect::<Vec<_>>(),
                        "by_category": describe_results(engine.corpus(), &entry.by_category),
                    })
                })
                .collect();
            json!({
                "query": describe_item(engine.corpus(), ItemId(item)),
                "spaces": spaces,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output).context("encoding output")?);
    engine.shutdown();
    Ok(())
}

fn parse_space(value: &str) -> anyhow::Result<SpaceSelector> {
    if value.eq_ignore_ascii_case("random") {
        return Ok(SpaceSelector::Random);
    }
    match value.parse::<SpaceId>() {
        Ok(space) => Ok(SpaceSelector::Fixed(space)),
        Err(e) => bail!("invalid --space {:?}: {}", value, e),
    }
}

fn describe_item(corpus: &Corpus, id: ItemId) -> Value {
    match corpus.get(id) {
        Some(item) => json!({
            "id": item.id,
            "name": item.name,
            "image": item.image_path(),
            "category": item.category(),
            "raw_category": item.raw_category,
        }),
        None => json!({ "id": id }),
    }
}

fn with_distance(corpus: &Corpus, id: ItemId, distance: f32) -> Value {
    let mut value = describe_item(corpus, id);
    value["distance"] = json!(distance);
    value
}

fn describe_results(corpus: &Corpus, results: &CategoryResults) -> Value {
    let buckets: serde_json::Map<String, Value> = results
        .iter()
        .map(|(category, neighbors)| {
            let list = neighbors
                .iter()
                .map(|n| with_distance(corpus, n.id, n.distance))
                .collect();
            (category.display_name().to_string(), Value::Array(list))
        })
        .collect();
    Value::Object(buckets)
}
