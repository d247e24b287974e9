//! Datastream CLI
//!
//! Command-line interface for a local datastream data directory:
//! - Create and look up metrics
//! - Insert values and query ranges
//! - Trigger downsampling

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use datastream::config::generate_default_config;
use datastream::{
    Config, DataStream, Datapoint, EngineConfig, Granularity, LoggingConfig, MetricDescriptor,
    MetricId, StreamEngine, Tags,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "datastream")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tagged time-series data stream")]
#[command(long_about = "Datastream stores tagged metrics, downsamples them into minutes, hours and days,\nand answers range queries. Commands operate on the memory backend's data directory.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a metric unless one exists for the query tags
    Ensure {
        /// Identity tags in key=value format
        #[arg(short, long, required = true)]
        query: Vec<String>,
        /// Additional tags in key=value format
        #[arg(short = 'T', long)]
        tags: Vec<String>,
        /// Downsampler functions (mean, sum, min, max, count, sum_squares, std_dev, first, last)
        #[arg(short = 'D', long, default_value = "mean")]
        downsampler: Vec<String>,
        /// Highest granularity (seconds, minutes, hours, days)
        #[arg(short, long, default_value = "seconds")]
        granularity: String,
    },

    /// Show the tags of a metric
    Tags {
        metric: String,
    },

    /// Replace the tags of a metric
    UpdateTags {
        metric: String,
        /// New tags in key=value format
        tags: Vec<String>,
    },

    /// Find metrics carrying all of the given tags (none = all metrics)
    Find {
        tags: Vec<String>,
    },

    /// Insert a value
    Insert {
        metric: String,
        value: f64,
        /// Timestamp (default: now). Supports: "now", RFC 3339, Unix milliseconds
        #[arg(short, long)]
        at: Option<String>,
    },

    /// Query a time range
    Query {
        metric: String,
        /// Granularity (seconds, minutes, hours, days)
        #[arg(short, long, default_value = "seconds")]
        granularity: String,
        /// Range start (default: 24 hours ago)
        #[arg(short, long)]
        start: Option<String>,
        /// Range end (default: now)
        #[arg(short, long)]
        end: Option<String>,
    },

    /// Downsample metrics carrying all of the given tags
    Downsample {
        tags: Vec<String>,
        /// Drop and recompute all downsampled data
        #[arg(long)]
        rebuild: bool,
    },

    /// Show storage statistics
    Stats,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config.logging);

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("failed to write {:?}", path))?;
                println!("Config written to {:?}", path);
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| config.backend.data_dir.clone())
        .unwrap_or_else(Config::default_data_dir);
    tracing::debug!("Data directory: {:?}", data_dir);

    let engine = Arc::new(StreamEngine::open(EngineConfig::persistent(data_dir)).await?);
    let stream = DataStream::new(engine.clone());

    let result = run(&cli, &stream, &engine).await;
    stream.shutdown().await?;
    result
}

async fn run(cli: &Cli, stream: &DataStream, engine: &StreamEngine) -> anyhow::Result<()> {
    let json = cli.format == "json";

    match &cli.command {
        Commands::Ensure {
            query,
            tags,
            downsampler,
            granularity,
        } => {
            let granularity: Granularity = granularity.parse()?;
            let id = stream
                .ensure_metric(&parse_tags(query)?, &parse_tags(tags)?, downsampler, granularity)
                .await?
                .ok_or_else(|| anyhow!("no backend configured"))?;
            println!("{}", id);
        }

        Commands::Tags { metric } => {
            let tags = stream.get_tags(&parse_metric(metric)?).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tags)?);
            } else {
                for (key, value) in tags {
                    println!("{}={}", key, value);
                }
            }
        }

        Commands::UpdateTags { metric, tags } => {
            stream
                .update_tags(&parse_metric(metric)?, parse_tags(tags)?)
                .await?;
        }

        Commands::Find { tags } => {
            let metrics = stream.find_metrics(&parse_tags(tags)?).await?;
            print_metrics(&metrics, json)?;
        }

        Commands::Insert { metric, value, at } => {
            let id = parse_metric(metric)?;
            match at {
                Some(at) => engine.insert_at(&id, *value, parse_time(at)?).await?,
                None => stream.insert(&id, *value).await?,
            }
        }

        Commands::Query {
            metric,
            granularity,
            start,
            end,
        } => {
            let end = match end {
                Some(end) => parse_time(end)?,
                None => Utc::now().timestamp_millis(),
            };
            let start = match start {
                Some(start) => parse_time(start)?,
                None => end - Duration::hours(24).num_milliseconds(),
            };

            let points = stream
                .get_data(&parse_metric(metric)?, granularity.parse()?, start, end)
                .await?;
            print_points(&points, json)?;
        }

        Commands::Downsample { tags, rebuild } => {
            let query = parse_tags(tags)?;
            let written = if *rebuild {
                engine.rebuild_downsampled(&query).await?
            } else {
                engine.downsample_metrics(&query).await?
            };
            println!("Downsampled {} buckets", written);
        }

        Commands::Stats => {
            println!("{}", engine.stats().await);
        }

        Commands::Config { .. } => unreachable!("handled before the engine is opened"),
    }

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("datastream={}", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn parse_metric(s: &str) -> anyhow::Result<MetricId> {
    s.parse()
        .with_context(|| format!("invalid metric id '{}'", s))
}

fn parse_tags(pairs: &[String]) -> anyhow::Result<Tags> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("invalid tag '{}', expected key=value", pair),
        })
        .collect()
}

/// Parse "now", RFC 3339 or Unix milliseconds
fn parse_time(s: &str) -> anyhow::Result<i64> {
    if s == "now" {
        return Ok(Utc::now().timestamp_millis());
    }
    if let Ok(millis) = s.parse::<i64>() {
        return Ok(millis);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .with_context(|| format!("invalid time '{}'", s))
}

fn format_time(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn print_metrics(metrics: &[MetricDescriptor], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(metrics)?);
        return Ok(());
    }

    for metric in metrics {
        let tags: Vec<String> = metric
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!(
            "{}  {:<8} [{}]  {}",
            metric.id,
            metric.highest_granularity,
            metric.downsamplers.join(","),
            tags.join(" ")
        );
    }
    Ok(())
}

fn print_points(points: &[Datapoint], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(points)?);
        return Ok(());
    }

    for point in points {
        match point.v.as_raw() {
            Some(value) => println!("{}  {}", format_time(point.t), value),
            None => println!("{}  {}", format_time(point.t), serde_json::to_string(&point.v)?),
        }
    }
    Ok(())
}
