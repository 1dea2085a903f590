use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use ctr_storage::S3Location;
use ctr_sync::{
    BigQueryTarget, BronzeOptions, BronzePhase, LoadMode, PipelineConfig, SilverPhase,
    WarehouseTarget,
};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ctr-cli")]
#[command(about = "EU clinical trials register harvester and warehouse loader")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Pipeline state document (cursor and watermarks).
    #[arg(long, env = "CTR_STATE_FILE", global = true)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest search pages and download trial pages into the bronze store.
    Crawl(CrawlArgs),
    /// Parse new bronze pages and load them into the warehouse.
    Load(LoadArgs),
}

#[derive(Debug, Args)]
struct S3Args {
    #[arg(long, env = "CTR_S3_BUCKET")]
    s3_bucket: Option<String>,
    #[arg(long, env = "CTR_S3_PREFIX", default_value = "")]
    s3_prefix: String,
    #[arg(long, env = "CTR_S3_REGION")]
    s3_region: Option<String>,
    #[arg(long, env = "CTR_S3_ENDPOINT")]
    s3_endpoint: Option<String>,
}

impl S3Args {
    fn location(&self) -> Option<S3Location> {
        self.s3_bucket
            .as_ref()
            .filter(|bucket| !bucket.trim().is_empty())
            .map(|bucket| S3Location {
                bucket: bucket.clone(),
                prefix: self.s3_prefix.clone(),
                region: self.s3_region.clone(),
                endpoint: self.s3_endpoint.clone(),
            })
    }
}

#[derive(Debug, Args)]
struct CrawlArgs {
    #[arg(long, default_value_t = 1)]
    start_page: u32,
    #[arg(long, default_value_t = 1)]
    max_pages: u32,
    /// Crawl everything again, ignoring the saved high-water mark and cursor.
    #[arg(long)]
    ignore_hwm: bool,
    /// Upper bound for the search date filter (YYYY-MM-DD).
    #[arg(long)]
    date_to: Option<NaiveDate>,
    #[arg(long, env = "CTR_SLEEP_SECONDS")]
    sleep_seconds: Option<f64>,
    /// Source variants to try in order, e.g. `3rd GB DE`.
    #[arg(long, num_args = 1..)]
    country_priority: Option<Vec<String>>,
    #[arg(long, env = "CTR_BRONZE_DIR")]
    output_dir: Option<PathBuf>,
    #[command(flatten)]
    s3: S3Args,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Full,
    Upsert,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetArg {
    Postgres,
    Redshift,
    Bigquery,
}

#[derive(Debug, Args)]
struct BigQueryArgs {
    #[arg(long, env = "CTR_BQ_PROJECT")]
    bq_project: Option<String>,
    #[arg(long, env = "CTR_BQ_DATASET")]
    bq_dataset: Option<String>,
    #[arg(long, env = "CTR_BQ_LOCATION")]
    bq_location: Option<String>,
    /// Cloud Storage bucket for staged load files.
    #[arg(long, env = "CTR_GCS_BUCKET")]
    gcs_bucket: Option<String>,
    #[arg(long, env = "CTR_GCS_PREFIX")]
    gcs_prefix: Option<String>,
}

impl BigQueryArgs {
    fn apply(self, target: &mut BigQueryTarget) {
        if let Some(project) = self.bq_project {
            target.project_id = Some(project);
        }
        if let Some(dataset) = self.bq_dataset {
            target.dataset_id = dataset;
        }
        if let Some(location) = self.bq_location {
            target.location = location;
        }
        if let Some(bucket) = self.gcs_bucket {
            target.gcs_bucket = bucket;
        }
        if let Some(prefix) = self.gcs_prefix {
            target.gcs_prefix = prefix;
        }
    }
}

#[derive(Debug, Args)]
struct LoadArgs {
    #[arg(long, value_enum, default_value_t = ModeArg::Full)]
    mode: ModeArg,
    #[arg(long, value_enum, default_value_t = TargetArg::Postgres)]
    target_db: TargetArg,
    #[arg(long, env = "CTR_REDSHIFT_IAM_ROLE")]
    iam_role: Option<String>,
    #[arg(long, env = "CTR_BRONZE_DIR")]
    input_dir: Option<PathBuf>,
    #[arg(long, env = "CTR_WORKERS")]
    workers: Option<usize>,
    #[command(flatten)]
    s3: S3Args,
    #[command(flatten)]
    bigquery: BigQueryArgs,
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()?,
    }
    Ok(())
}

fn base_config(cli: &Cli) -> PipelineConfig {
    let mut config = PipelineConfig::from_env();
    if let Some(state_file) = &cli.state_file {
        config.state_file = state_file.clone();
    }
    config
}

async fn crawl(mut config: PipelineConfig, args: CrawlArgs) -> Result<()> {
    if let Some(secs) = args.sleep_seconds {
        config.sleep_seconds = secs;
    }
    if let Some(countries) = args.country_priority.filter(|c| !c.is_empty()) {
        config.country_priority = countries;
    }
    if let Some(dir) = args.output_dir {
        config.bronze_dir = dir;
    }
    if let Some(location) = args.s3.location() {
        config.s3 = Some(location);
    }

    info!(
        state_file = %config.state_file.display(),
        store = config.s3.as_ref().map_or("local", |_| "s3"),
        "starting crawl"
    );
    let phase = BronzePhase::from_config(&config).await?;
    let summary = phase
        .run(BronzeOptions {
            start_page: args.start_page,
            max_pages: args.max_pages,
            ignore_hwm: args.ignore_hwm,
            date_to: args.date_to,
        })
        .await?;
    println!(
        "crawl complete: pages={} identifiers={} written={} unchanged={} missing={}",
        summary.pages, summary.identifiers, summary.written, summary.unchanged, summary.missing
    );
    Ok(())
}

async fn load(mut config: PipelineConfig, args: LoadArgs) -> Result<()> {
    if let Some(dir) = args.input_dir {
        config.bronze_dir = dir;
    }
    if let Some(workers) = args.workers.filter(|n| *n > 0) {
        config.workers = workers;
    }
    if let Some(role) = args.iam_role {
        config.redshift_iam_role = Some(role);
    }
    if let Some(location) = args.s3.location() {
        config.s3 = Some(location);
    }
    args.bigquery.apply(&mut config.bigquery);

    let mode = match args.mode {
        ModeArg::Full => LoadMode::Full,
        ModeArg::Upsert => LoadMode::Upsert,
    };
    let target = match args.target_db {
        TargetArg::Postgres => WarehouseTarget::Postgres,
        TargetArg::Redshift => WarehouseTarget::Redshift,
        TargetArg::Bigquery => WarehouseTarget::BigQuery,
    };

    info!(?mode, ?target, workers = config.workers, "starting load");
    let mut loader = ctr_sync::build_loader(&config, target)?;
    let phase = SilverPhase::from_config(&config, mode).await?;
    let summary = phase.run(loader.as_mut()).await?;
    println!(
        "load complete: selected={} parsed={} failed={} loaded={} run_start={}",
        summary.selected,
        summary.parsed,
        summary.failed,
        summary.loaded,
        summary.run_start.to_rfc3339()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;
    let config = base_config(&cli);

    match cli.command {
        Commands::Crawl(args) => crawl(config, args).await,
        Commands::Load(args) => load(config, args).await,
    }
}
