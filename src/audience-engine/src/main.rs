//! Audience Engine: batch audience segmentation over a JSON customer export.
//!
//! Reads an array of customer records, runs one pipeline and prints the
//! committed segments plus diagnostics as JSON on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use audience_core::types::{CustomerRecord, LifecycleStage};
use audience_core::{EngineConfig, FailureReport, SegmentationError};
use audience_segmentation::{
    DemographicOptions, InMemoryDataSource, LookalikeOptions, SegmentationEngine,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "audience-engine")]
#[command(about = "RFM, behavioral, demographic, lookalike and custom audience segmentation")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "AUDIENCE_ENGINE_CONFIG")]
    config: Option<String>,

    /// Minimum customers per segment (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__MIN_SEGMENT_SIZE")]
    min_segment_size: Option<usize>,

    /// Per-pipeline timeout in milliseconds (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__PIPELINE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Client identifier attached to logs
    #[arg(long, default_value = "cli")]
    client_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score recency, frequency and monetary value and group by lifecycle stage
    Rfm {
        #[arg(long)]
        input: PathBuf,
        /// Reference time for recency (RFC 3339); defaults to now
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
    /// Cluster customers by engagement
    Behavioral {
        #[arg(long)]
        input: PathBuf,
    },
    /// Break performance down by age, gender, country and interest
    Demographic {
        #[arg(long)]
        input: PathBuf,
        /// Leave out the country breakdown
        #[arg(long)]
        skip_geographic: bool,
        /// Leave out the interest category breakdown
        #[arg(long)]
        skip_interests: bool,
    },
    /// Filter customers with a JSON criteria object
    Custom {
        #[arg(long)]
        input: PathBuf,
        /// e.g. '{"platform": "meta", "revenue": {"min": 100}}'
        #[arg(long)]
        criteria: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Run RFM, then build lookalikes of one lifecycle stage's segment
    Lookalike {
        #[arg(long)]
        input: PathBuf,
        /// Lifecycle stage used as the seed, e.g. `champions`
        #[arg(long)]
        seed_stage: LifecycleStage,
        #[arg(long)]
        max_audience_size: Option<usize>,
        #[arg(long)]
        similarity_threshold: Option<f64>,
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
}

impl Command {
    fn input(&self) -> &Path {
        match self {
            Command::Rfm { input, .. }
            | Command::Behavioral { input }
            | Command::Demographic { input, .. }
            | Command::Custom { input, .. }
            | Command::Lookalike { input, .. } => input,
        }
    }
}

fn read_records(path: &Path) -> anyhow::Result<Vec<CustomerRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let records: Vec<CustomerRecord> = serde_json::from_str(&raw)
        .with_context(|| format!("{} must hold a JSON array of objects", path.display()))?;
    Ok(records)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn execute(
    engine: &SegmentationEngine,
    command: Command,
    records: Vec<CustomerRecord>,
    client_id: &str,
) -> Result<Value, SegmentationError> {
    let value = match command {
        Command::Rfm { as_of, .. } => {
            let as_of = as_of.unwrap_or_else(Utc::now);
            let output = engine
                .create_rfm_segments_as_of(records, as_of, client_id)
                .await?;
            serde_json::to_value(output)?
        }
        Command::Behavioral { .. } => {
            let output = engine
                .create_behavioral_segments(records, client_id)
                .await?;
            serde_json::to_value(output)?
        }
        Command::Demographic {
            skip_geographic,
            skip_interests,
            ..
        } => {
            let options = DemographicOptions {
                include_geographic: !skip_geographic,
                include_interests: !skip_interests,
            };
            let output = engine
                .create_demographic_segments(records, options, client_id)
                .await?;
            serde_json::to_value(output)?
        }
        Command::Custom {
            criteria,
            name,
            description,
            ..
        } => {
            let criteria: Map<String, Value> = serde_json::from_str(&criteria).map_err(|e| {
                SegmentationError::validation(format!("--criteria must be a JSON object: {e}"))
            })?;
            let output = engine
                .create_custom_segment(criteria, &name, description.as_deref(), client_id)
                .await?;
            serde_json::to_value(output)?
        }
        Command::Lookalike {
            seed_stage,
            max_audience_size,
            similarity_threshold,
            as_of,
            ..
        } => {
            let as_of = as_of.unwrap_or_else(Utc::now);
            let rfm = engine
                .create_rfm_segments_as_of(records, as_of, client_id)
                .await?;
            let seed = rfm
                .segments
                .iter()
                .find(|s| s.lifecycle_stage == Some(seed_stage))
                .ok_or_else(|| {
                    SegmentationError::insufficient(format!(
                        "no RFM segment for stage '{seed_stage}' (stage below minimum size?)"
                    ))
                })?;
            info!(seed_segment_id = %seed.id, seed_size = seed.size, "Using RFM seed segment");
            let output = engine
                .create_lookalike_segments(
                    seed.id,
                    LookalikeOptions {
                        max_audience_size,
                        similarity_threshold,
                    },
                )
                .await?;
            json!({ "seed_segment": seed, "lookalike": output })
        }
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audience_engine=info,audience_segmentation=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    if let Some(min) = cli.min_segment_size {
        config.min_segment_size = min;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.pipeline_timeout_ms = timeout_ms;
    }

    info!(
        min_segment_size = config.min_segment_size,
        timeout_ms = config.pipeline_timeout_ms,
        "Configuration loaded"
    );

    let records = read_records(cli.command.input())?;
    info!(records = records.len(), "Customer records loaded");

    let source = Arc::new(InMemoryDataSource::new(records.clone()));
    let engine = SegmentationEngine::new(config, source)?;

    match execute(&engine, cli.command, records, &cli.client_id).await {
        Ok(value) => print_json(&value),
        Err(err) => {
            error!(error = %err, "Segmentation failed");
            print_json(&json!({ "error": FailureReport::from(&err) }))?;
            std::process::exit(1);
        }
    }
}
