use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use miewid::annotation::{subset_with_resights, subset_with_resights_range};
use miewid::matcher::best_score;
use miewid::{config, storage, Aid, AnnotationSet, Identifier, Pipeline};

#[derive(Parser)]
#[command(name = "miewid")]
#[command(version, about = "Animal re-identification embeddings, matching and evaluation")]
struct Cli {
    /// Config file (defaults to the installed config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Source {
    /// COCO-style annotation file
    #[arg(short, long)]
    annotations: PathBuf,
    /// Image directory (defaults to data.images_dir)
    #[arg(long)]
    images: Option<PathBuf>,
    /// Checkpoint to load (defaults to checkpoint_path)
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute and store embeddings for every annotation
    Embed {
        #[command(flatten)]
        source: Source,
    },
    /// One-vs-all evaluation: mAP and Rank-k
    Evaluate {
        #[command(flatten)]
        source: Source,
        #[arg(long, value_delimiter = ',', default_value = "1,5,10,20")]
        ranks: Vec<usize>,
    },
    /// Score one annotation against every other annotation
    Match {
        #[command(flatten)]
        source: Source,
        #[arg(short, long)]
        query: Aid,
        #[arg(short, long, default_value_t = 5)]
        top: usize,
        /// Score each annotation by its own distance instead of by identity
        #[arg(long)]
        no_knn: bool,
    },
    /// Accuracy-at-k on identities within a sighting range
    Accuracy {
        #[command(flatten)]
        source: Source,
        #[arg(long, default_value_t = 3)]
        min_sights: usize,
        #[arg(long, default_value_t = 10)]
        max_sights: usize,
        #[arg(long, default_value_t = 10)]
        max_rank: usize,
    },
    /// Print the learning rate of every epoch
    Schedule,
    /// Remove stored embeddings
    Purge,
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    let store = storage::default_store_dir().join(&cfg.exp_name);

    match cli.command {
        Commands::Embed { source } => embed(&cfg, &source, &store),
        Commands::Evaluate { source, ranks } => evaluate(&cfg, &source, &store, &ranks),
        Commands::Match {
            source,
            query,
            top,
            no_knn,
        } => match_query(&cfg, &source, &store, query, top, !no_knn),
        Commands::Accuracy {
            source,
            min_sights,
            max_sights,
            max_rank,
        } => accuracy(&cfg, &source, &store, min_sights, max_sights, max_rank),
        Commands::Schedule => {
            for (epoch, lr) in cfg.scheduler_params.iter(cfg.engine.epochs) {
                info!("epoch {epoch:>3}: lr {lr:.3e}");
            }
            Ok(())
        }
        Commands::Purge => purge(&store),
        Commands::Config => open_config(cli.config.as_deref()),
    }
}

fn open_identifier(cfg: &config::Config, source: &Source, store: &Path) -> Result<Identifier<Pipeline>> {
    let images = source.images.as_deref().unwrap_or(&cfg.data.images_dir);
    let mut set = AnnotationSet::load_coco(&source.annotations, images)
        .context("Failed to load annotations")?;
    if let Some(viewpoints) = &cfg.data.viewpoint_list {
        set = set.filter_viewpoints(viewpoints)?;
        info!("{} annotations left after viewpoint filter", set.len());
    }

    let checkpoint = source.checkpoint.as_deref().or(cfg.checkpoint_path.as_deref());
    let mut identifier = Identifier::from_config(cfg, set, checkpoint)
        .context("Failed to initialize embedding model")?;
    identifier.restore_store(store)?;
    Ok(identifier)
}

fn embed(cfg: &config::Config, source: &Source, store: &Path) -> Result<()> {
    let mut identifier = open_identifier(cfg, source, store)?;
    let aids = identifier.annotations().aids();
    let embeddings = identifier.embeddings(&aids)?;
    identifier.persist_store(store).context("Failed to save embeddings")?;

    info!(
        "✓ {} embeddings of width {} stored in {}",
        embeddings.nrows(),
        embeddings.ncols(),
        store.display()
    );
    Ok(())
}

fn evaluate(cfg: &config::Config, source: &Source, store: &Path, ranks: &[usize]) -> Result<()> {
    let mut identifier = open_identifier(cfg, source, store)?;
    let all = identifier.annotations().aids();
    let min_sights = cfg.data.val_n_filter_min.unwrap_or(1);
    let aids = match cfg.data.val_n_subsample_max {
        Some(max) => subset_with_resights_range(identifier.annotations(), &all, min_sights, max, cfg.engine.seed)?,
        None => subset_with_resights(identifier.annotations(), &all, min_sights)?,
    };
    info!("evaluating {} of {} annotations", aids.len(), all.len());

    let report = identifier.evaluate_distmat(&aids, ranks)?;
    identifier.persist_store(store)?;
    if report.is_none() {
        anyhow::bail!("No identity in the annotation file has a resight");
    }
    Ok(())
}

fn match_query(
    cfg: &config::Config,
    source: &Source,
    store: &Path,
    query: Aid,
    top: usize,
    use_knn: bool,
) -> Result<()> {
    let mut identifier = open_identifier(cfg, source, store)?;
    let daids: Vec<Aid> = identifier
        .annotations()
        .aids()
        .into_iter()
        .filter(|&aid| aid != query)
        .collect();
    let qaids = vec![query; daids.len()];

    let mut scores = identifier.score_pairs(&qaids, &daids, use_knn)?;
    identifier.persist_store(store)?;
    let Some(best) = best_score(&scores) else {
        warn!("No other annotations to match against");
        return Ok(());
    };
    info!("best match for {query}: aid {} score {:.4}", best.daid, best.score);

    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
    for (i, pair) in scores.iter().take(top).enumerate() {
        let label = identifier
            .annotations()
            .get(pair.daid)
            .map(|a| a.db_label())
            .unwrap_or_default();
        info!("{:>2}. aid {} ({}) score {:.4}", i + 1, pair.daid, label, pair.score);
    }
    Ok(())
}

fn accuracy(
    cfg: &config::Config,
    source: &Source,
    store: &Path,
    min_sights: usize,
    max_sights: usize,
    max_rank: usize,
) -> Result<()> {
    let mut identifier = open_identifier(cfg, source, store)?;
    let aids = identifier.annotations().aids();
    let acc = identifier.new_accuracy(&aids, min_sights, max_sights, cfg.engine.seed, max_rank)?;
    identifier.persist_store(store)?;
    for (k, a) in acc.iter().enumerate() {
        info!("top-{:<3}: {:.1}%", k + 1, a * 100.0);
    }
    Ok(())
}

fn purge(store: &Path) -> Result<()> {
    info!("Purging stored embeddings in {}", store.display());

    storage::purge(store).context("Failed to purge embeddings")?;

    info!("✓ Embedding store removed");
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH).as_os_str();
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
