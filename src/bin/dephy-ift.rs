use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use dephy_ift::corpus::{clean, CorpusSource, JsonLinesSource};
use dephy_ift::trainer::StageObserver;
use dephy_ift::vocabulary::derive_vocabulary;
use dephy_ift::{
    ArtifactPaths, ArtifactStore, NumericScaling, PredictionService, SchemaPreset, Trainer,
    TrainerConfig, TrainingStage,
};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use serde_json::{json, Value};

const DEFAULT_BIND: &str = "127.0.0.1:8000";

#[derive(Parser, Debug)]
#[command(author, version, about = "DEPHY IFT regressor toolkit", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (-q, -qq)
    #[arg(short = 'q', long, global = true, action = ArgAction::Count)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fit a model on a corpus and write the artifact pair
    Train(TrainArgs),
    /// Predict one or more requests with a trained artifact
    Predict(PredictArgs),
    /// Serve predictions over HTTP
    Serve(ServeArgs),
    /// Summarise a trained artifact
    Info(InfoArgs),
    /// Print the vocabulary a training run would derive
    Vocab(VocabArgs),
}

#[derive(Args, Debug)]
struct ArtifactArgs {
    /// Pipeline blob path
    #[arg(long, env = "MODEL_PATH", value_name = "PATH")]
    model_path: Option<PathBuf>,

    /// Metrics sidecar path
    #[arg(long, env = "METRICS_PATH", value_name = "PATH")]
    metrics_path: Option<PathBuf>,
}

impl ArtifactArgs {
    fn store(&self) -> ArtifactStore {
        ArtifactStore::new(ArtifactPaths::resolve(
            self.model_path.clone(),
            self.metrics_path.clone(),
        ))
    }
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// JSON-lines files or directories holding the corpus
    inputs: Vec<PathBuf>,

    /// Read the corpus from PostgreSQL instead of files (requires the `postgres` feature)
    #[arg(long, env = "DATABASE_URL", value_name = "URL")]
    database_url: Option<String>,

    /// Deployment schema
    #[arg(long, default_value_t = SchemaPreset::RotationContext)]
    schema: SchemaPreset,

    #[command(flatten)]
    artifacts: ArtifactArgs,

    /// Held-out fraction
    #[arg(long, value_name = "FRACTION")]
    test_fraction: Option<f64>,

    /// Split seed
    #[arg(long)]
    seed: Option<u64>,

    /// Number of regression trees
    #[arg(long, value_name = "COUNT")]
    n_trees: Option<usize>,

    /// Maximum tree depth
    #[arg(long, value_name = "DEPTH")]
    max_depth: Option<u32>,

    /// Shrinkage per tree
    #[arg(long, value_name = "RATE")]
    learning_rate: Option<f32>,

    /// Minimum rows per leaf
    #[arg(long, value_name = "COUNT")]
    min_leaf_size: Option<usize>,

    /// Standardise numeric columns with training statistics
    #[arg(long)]
    standardize: bool,

    /// Drop exact duplicate rows while cleaning
    #[arg(long)]
    drop_duplicates: bool,

    /// Number of worker threads for assembly and encoding
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Disable the progress spinner
    #[arg(long)]
    no_progress: bool,

    /// Print the training report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct PredictArgs {
    /// Inline JSON request
    #[arg(long, value_name = "OBJECT", conflicts_with = "input")]
    json: Option<String>,

    /// JSON-lines file of requests
    #[arg(long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Refuse artifacts trained with a different schema
    #[arg(long)]
    schema: Option<SchemaPreset>,

    #[command(flatten)]
    artifacts: ArtifactArgs,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Socket address to bind
    #[arg(long, env = "IFT_BIND", default_value = DEFAULT_BIND)]
    bind: String,

    /// Refuse artifacts trained with a different schema
    #[arg(long)]
    schema: Option<SchemaPreset>,

    #[command(flatten)]
    artifacts: ArtifactArgs,
}

#[derive(Args, Debug)]
struct InfoArgs {
    #[command(flatten)]
    artifacts: ArtifactArgs,

    /// Emit JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct VocabArgs {
    /// JSON-lines files or directories holding the corpus
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Deployment schema
    #[arg(long, default_value_t = SchemaPreset::RotationContext)]
    schema: SchemaPreset,

    /// Drop exact duplicate rows while cleaning
    #[arg(long)]
    drop_duplicates: bool,

    /// Emit a JSON array
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Train(args) => run_train(args),
        Commands::Predict(args) => run_predict(args),
        Commands::Serve(args) => run_serve(args),
        Commands::Info(args) => run_info(args),
        Commands::Vocab(args) => run_vocab(args),
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    use log::LevelFilter;

    let level = match (quiet, verbose) {
        (0, 0) => LevelFilter::Info,
        (0, 1) => LevelFilter::Debug,
        (0, _) => LevelFilter::Trace,
        (1, _) => LevelFilter::Warn,
        _ => LevelFilter::Error,
    };

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    if verbose > 0 || quiet > 0 {
        builder.filter_level(level);
    }
    let _ = builder.try_init();
}

#[cfg(feature = "postgres")]
fn corpus_source(args: &TrainArgs) -> Result<Box<dyn CorpusSource>> {
    if !args.inputs.is_empty() {
        return Ok(Box::new(JsonLinesSource::new(args.inputs.clone())));
    }
    let schema = args.schema.schema();
    let source = match &args.database_url {
        Some(url) => dephy_ift::PostgresSource::new(url.clone(), &schema),
        None => dephy_ift::PostgresSource::from_env(&schema)?,
    };
    Ok(Box::new(source))
}

#[cfg(not(feature = "postgres"))]
fn corpus_source(args: &TrainArgs) -> Result<Box<dyn CorpusSource>> {
    if args.inputs.is_empty() {
        if args.database_url.is_some() {
            bail!("reading from PostgreSQL requires the `postgres` feature");
        }
        bail!("no corpus inputs given");
    }
    Ok(Box::new(JsonLinesSource::new(args.inputs.clone())))
}

fn run_train(args: TrainArgs) -> Result<()> {
    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("unable to configure Rayon thread pool")?;
    }

    let mut cfg = TrainerConfig::builder()
        .drop_duplicates(args.drop_duplicates)
        .show_progress(!args.no_progress);
    if let Some(fraction) = args.test_fraction {
        cfg = cfg.test_fraction(fraction);
    }
    if let Some(seed) = args.seed {
        cfg = cfg.seed(seed);
    }
    if let Some(n_trees) = args.n_trees {
        cfg = cfg.n_trees(n_trees);
    }
    if let Some(depth) = args.max_depth {
        cfg = cfg.max_depth(depth);
    }
    if let Some(rate) = args.learning_rate {
        cfg = cfg.learning_rate(rate);
    }
    if let Some(size) = args.min_leaf_size {
        cfg = cfg.min_leaf_size(size);
    }
    if args.standardize {
        cfg = cfg.numeric_scaling(NumericScaling::Standardize);
    }
    let trainer_cfg = cfg.build()?;

    let source = corpus_source(&args)?;
    let store = args.artifacts.store();
    let mut trainer = Trainer::new(trainer_cfg, args.schema.schema());

    let spinner = if args.no_progress {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner} {msg} {elapsed}")
            .context("invalid progress template")?
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(80));
        let handle = pb.clone();
        let observer: StageObserver =
            Arc::new(move |stage: TrainingStage| handle.set_message(stage.to_string()));
        trainer = trainer.with_stage_observer(observer);
        Some(pb)
    };

    let result = trainer.run(source.as_ref(), &store);
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let artifacts = result.with_context(|| format!("training on {} failed", source.describe()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&artifacts.report)?);
    } else {
        println!("Training metrics:");
        for line in artifacts.to_string().lines() {
            println!("  {line}");
        }
        println!("Saved model to {}", store.paths().model.display());
        println!("Saved metrics to {}", store.paths().metrics.display());
    }
    Ok(())
}

fn load_service(artifacts: &ArtifactArgs, schema: Option<SchemaPreset>) -> Result<PredictionService> {
    let store = artifacts.store();
    let expected = schema.map(SchemaPreset::schema);
    PredictionService::initialize(&store, expected.as_ref()).with_context(|| {
        format!(
            "failed to load model from {} / {}",
            store.paths().model.display(),
            store.paths().metrics.display()
        )
    })
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let service = load_service(&args.artifacts, args.schema)?;
    let bodies: Vec<(String, Value)> = match (&args.json, &args.input) {
        (Some(text), None) => vec![(
            "--json".to_string(),
            serde_json::from_str(text).context("--json is not valid JSON")?,
        )],
        (None, Some(path)) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            text.lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(index, line)| {
                    let label = format!("{}:{}", path.display(), index + 1);
                    serde_json::from_str(line)
                        .with_context(|| format!("{label} is not valid JSON"))
                        .map(|value| (label, value))
                })
                .collect::<Result<_>>()?
        }
        _ => bail!("provide either --json or --input"),
    };
    for (label, body) in bodies {
        let prediction = service
            .predict_json(body)
            .with_context(|| format!("prediction failed for {label}"))?;
        println!("{}", serde_json::to_string(&prediction)?);
    }
    Ok(())
}

#[cfg(feature = "server")]
fn run_serve(args: ServeArgs) -> Result<()> {
    let addr: std::net::SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", args.bind))?;
    let service = Arc::new(load_service(&args.artifacts, args.schema)?);
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime
        .block_on(dephy_ift::server::serve(service, addr))
        .context("server shutdown")?;
    Ok(())
}

#[cfg(not(feature = "server"))]
fn run_serve(_args: ServeArgs) -> Result<()> {
    bail!("this build of dephy-ift was compiled without the `server` feature")
}

fn run_info(args: InfoArgs) -> Result<()> {
    let store = args.artifacts.store();
    let metadata = store
        .load_metadata()
        .with_context(|| format!("failed to read {}", store.paths().metrics.display()))?;
    let summary = json!({
        "model_path": store.paths().model.display().to_string(),
        "metrics_path": store.paths().metrics.display().to_string(),
        "rows": metadata.metrics.rows,
        "train_rows": metadata.metrics.train_rows,
        "test_rows": metadata.metrics.test_rows,
        "mae": metadata.metrics.mae,
        "rmse": metadata.metrics.rmse,
        "r2": metadata.metrics.r2,
        "known_crops": metadata.known_crops.len(),
        "feature_columns": metadata.feature_columns.len(),
        "fingerprint": metadata.fingerprint,
        "trained_at": metadata.trained_at.to_rfc3339(),
        "crate_version": metadata.crate_version,
    });

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let m = &metadata.metrics;
        println!("Rows         : {} ({} train / {} test)", m.rows, m.train_rows, m.test_rows);
        println!("MAE          : {:.4}", m.mae);
        println!("RMSE         : {:.4}", m.rmse);
        println!("R2           : {:.4}", m.r2);
        println!("Known crops  : {}", metadata.known_crops.len());
        println!("Columns      : {}", metadata.feature_columns.len());
        println!("Fingerprint  : {}", metadata.fingerprint);
        println!("Trained at   : {}", metadata.trained_at.to_rfc3339());
    }
    Ok(())
}

fn run_vocab(args: VocabArgs) -> Result<()> {
    let schema = args.schema.schema();
    let records = JsonLinesSource::new(args.inputs.clone())
        .fetch()
        .context("failed to read corpus")?;
    let cleaned = clean(records, &schema, args.drop_duplicates).context("cleaning failed")?;
    let vocabulary = derive_vocabulary(&cleaned, &schema);
    info!(
        "{} crop tokens from {} cleaned rows",
        vocabulary.len(),
        cleaned.report.kept_rows
    );
    if args.json {
        println!("{}", serde_json::to_string(&vocabulary)?);
    } else {
        for token in &vocabulary {
            println!("{token}");
        }
    }
    Ok(())
}
