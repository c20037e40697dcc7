mod config;
mod dynamo;
mod jsonl;
mod sns;

use crate::config::Config;
use crate::dynamo::{DynamoStore, RetryPolicy};
use crate::jsonl::JsonLinesStore;
use crate::sns::SnsNotifier;
use anyhow::Context;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, SdkConfig};
use clap::Parser;
use lonlat::{BatchWriter, Catalog, Driver, ErrorLog, ProgressReporter, RecordStore};
use std::fs::File;
use std::io::{self, BufWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing_subscriber::{fmt, EnvFilter};

/// Shared AWS plumbing: one current-thread runtime drives every SDK call.
struct Aws {
    rt: Arc<Runtime>,
    sdk: SdkConfig,
}

impl Aws {
    fn connect(config: &Config) -> anyhow::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;

        let timeouts = TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(config.request_timeout_secs))
            .build();
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).timeout_config(timeouts);
        if let Some(region) = &config.region {
            loader = loader.region(aws_sdk_dynamodb::config::Region::new(region.clone()));
        }
        let sdk = rt.block_on(loader.load());

        tracing::info!(region = ?sdk.region(), "AWS configuration loaded");
        Ok(Self {
            rt: Arc::new(rt),
            sdk,
        })
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &Config, aws: Option<&Aws>) -> anyhow::Result<Box<dyn RecordStore>> {
    match &config.jsonl {
        Some(path) if path.as_os_str() == "-" => {
            tracing::info!("Writing records to stdout");
            Ok(Box::new(JsonLinesStore::new(BufWriter::new(io::stdout()))))
        }
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            tracing::info!(path = %path.display(), "Writing records to JSON lines file");
            Ok(Box::new(JsonLinesStore::new(BufWriter::new(file))))
        }
        None => {
            let aws = aws.context("DynamoDB output requires AWS configuration")?;
            tracing::info!(table = %config.table, "Writing records to DynamoDB");
            let retry = RetryPolicy {
                max_attempts: config.max_write_attempts,
                ..RetryPolicy::default()
            };
            Ok(Box::new(
                DynamoStore::new(aws.rt.clone(), aws_sdk_dynamodb::Client::new(&aws.sdk), &config.table)
                    .with_retry(retry),
            ))
        }
    }
}

fn main() -> anyhow::Result<()> {
    // --- 1. Initialization ---
    let config = Config::parse();
    init_tracing(config.log_json);

    let run_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("run", %run_id, label = %config.process_label);
    let _entered = span.enter();
    tracing::info!(config = ?config, "Starting with configuration");

    let region = config.grid_region().context("invalid grid region")?;
    let error_log = ErrorLog::open(&config.error_log)
        .with_context(|| format!("cannot open error log {}", config.error_log.display()))?;

    // --- 2. Reference data ---
    tracing::info!("Loading reference data into memory...");
    let catalog = Catalog::load(&config.catalog_paths(), !config.no_spatial_index)
        .context("failed to load reference shapefiles")?;

    // --- 3. Outputs ---
    let aws = if config.jsonl.is_none() || config.topic_arn.is_some() {
        Some(Aws::connect(&config)?)
    } else {
        None
    };

    let store = open_store(&config, aws.as_ref())?;
    let writer = BatchWriter::new(store, error_log);

    let mut reporter = ProgressReporter::new(&config.process_label, region, config.report_every);
    match (&config.topic_arn, &aws) {
        (Some(topic), Some(aws)) => {
            reporter = reporter.with_notifier(Box::new(SnsNotifier::new(
                aws.rt.clone(),
                aws_sdk_sns::Client::new(&aws.sdk),
                topic,
            )));
        }
        _ => tracing::info!("No SNS topic configured; progress goes to the log only"),
    }

    // --- 4. Walk the grid ---
    let summary = Driver::new(region, &catalog, writer, reporter)
        .run()
        .context("writing to the record store failed")?;

    if summary.dropped > 0 {
        tracing::warn!(
            dropped = summary.dropped,
            error_log = %config.error_log.display(),
            "Some grid points have no stored row"
        );
    }
    tracing::info!("All done with {}!", config.process_label);

    Ok(())
}
