//! handoff CLI: run stage workers, submit work, or demo the pipeline in
//! process.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use handoff::channel::HandoffChannel;
use handoff::config::secrets::ExposeSecret;
use handoff::config::{Config, PipelineSettings};
use handoff::db::{Db, PgmqChannel};
use handoff::engine::{Disposition, IngressRequest, Pipeline, PipelineChannels, StageConfig};
use handoff::model::Stage;
use handoff::telemetry::carrier::W3cPropagator;
use handoff::telemetry::metrics::{MetricsSink, OtelMetrics};
use handoff::telemetry::{TelemetryConfig, init_telemetry};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "handoff", about = "Three-stage traced queue pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run stage workers against pgmq until Ctrl-C
    Serve {
        /// Stage to run (1, 2, 3 or stage1..stage3). Repeatable; all when omitted
        #[arg(long = "stage")]
        stages: Vec<Stage>,
    },
    /// Push one item through stage 1 and print the receipt
    Submit {
        /// Correlation id to use instead of a generated one
        #[arg(long)]
        correlation_id: Option<String>,
        /// Tag the item invalid so later stages skip it
        #[arg(long)]
        inject_error: bool,
        /// Initial payload
        #[arg(long, default_value = "")]
        data: String,
    },
    /// Run all three stages over in-memory queues
    Demo {
        /// Number of items to push through
        #[arg(long, default_value_t = 5)]
        items: usize,
        /// Inject an error into every K-th item (0 = never)
        #[arg(long, default_value_t = 0)]
        inject_error_every: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "handoff".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let result = match cli.command {
        Command::Serve { stages } => cmd_serve(&config, stages).await,
        Command::Submit {
            correlation_id,
            inject_error,
            data,
        } => {
            let request = IngressRequest {
                correlation_id,
                payload: data,
                inject_error,
            };
            cmd_submit(&config, request).await
        }
        Command::Demo {
            items,
            inject_error_every,
        } => cmd_demo(&config.pipeline, items, inject_error_every).await,
    };

    guard.force_flush();
    result
}

/// Build a pipeline over the configured pgmq queues.
async fn pgmq_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    let settings = &config.pipeline;
    let db = Arc::new(Db::connect(config.require_database_url()?.expose_secret()).await?);
    db.health_check().await?;

    let metrics: Arc<dyn MetricsSink> = Arc::new(OtelMetrics);
    let queue = |name: &str| -> Arc<dyn HandoffChannel> {
        Arc::new(PgmqChannel::new(
            Arc::clone(&db),
            name,
            settings.visibility_timeout,
            Arc::clone(&metrics),
        ))
    };
    let channels = PipelineChannels {
        ingress: queue(&settings.ingress_queue),
        step1: queue(&settings.step1_queue),
        step2: queue(&settings.step2_queue),
    };

    let pipeline = Pipeline::new(
        &channels,
        &settings.stage_profiles()?,
        Arc::new(W3cPropagator::new()),
        Arc::clone(&metrics),
        StageConfig::from(settings),
    )?;
    Ok(pipeline)
}

async fn cmd_serve(config: &Config, stages: Vec<Stage>) -> anyhow::Result<()> {
    let pipeline = pgmq_pipeline(config).await?;
    let handles = pipeline.spawn(&stages)?;

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested, finishing in-flight items");
        shutdown.trigger();
    });

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "stage worker ended abnormally");
        }
    }
    Ok(())
}

async fn cmd_submit(config: &Config, request: IngressRequest) -> anyhow::Result<()> {
    let pipeline = pgmq_pipeline(config).await?;
    let receipt = pipeline.ingest(request).await?;

    let out = json!({
        "correlation_id": receipt.correlation_id,
        "stage1_duration_ms": receipt.stage1_duration.as_secs_f64() * 1000.0,
        "message_id": receipt.message_id.0,
        "error_injected": receipt.error_injected,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn cmd_demo(
    settings: &PipelineSettings,
    items: usize,
    inject_error_every: usize,
) -> anyhow::Result<()> {
    let channels = PipelineChannels::in_memory(settings);
    let stage_config = StageConfig {
        receive_wait: Duration::from_millis(200),
        send_timeout: Duration::from_millis(100),
        retry_backoff: Duration::from_millis(100),
    };
    let pipeline = Pipeline::new(
        &channels,
        &settings.stage_profiles()?,
        Arc::new(W3cPropagator::new()),
        Arc::new(OtelMetrics),
        stage_config,
    )?;

    for n in 1..=items {
        let request = IngressRequest {
            correlation_id: None,
            payload: String::new(),
            inject_error: inject_error_every > 0 && n % inject_error_every == 0,
        };
        let receipt = pipeline.ingest(request).await?;
        info!(
            correlation_id = %receipt.correlation_id,
            error_injected = receipt.error_injected,
            "demo item submitted"
        );
    }

    // Drain stage 2 first so every item reaches stage 3's queue.
    for stage in [Stage::Two, Stage::Three] {
        let processor = pipeline.processor(stage);
        while let Some(disposition) = processor.run_once().await? {
            if let Some(line) = outcome(stage, &disposition) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// One JSON line for an item that left the pipeline at `stage`.
fn outcome(stage: Stage, disposition: &Disposition) -> Option<String> {
    let (result, item) = match disposition {
        Disposition::Completed { item } if item.has_error() => ("failed", item),
        Disposition::Completed { item } => ("success", item),
        Disposition::ShortCircuited { item, .. } => ("short_circuited", item),
        Disposition::Retained { item, .. } => ("retained", item),
        Disposition::Dropped { message_id, reason } => {
            let line = json!({
                "stage": stage.label(),
                "result": "dropped",
                "message_id": message_id.0,
                "reason": reason,
            });
            return Some(line.to_string());
        }
        Disposition::Forwarded { .. } => return None,
    };

    let meta = item.metadata();
    Some(
        json!({
            "stage": stage.label(),
            "result": result,
            "correlation_id": item.correlation_id(),
            "data": item.payload(),
            "error_type": item.error_type(),
            "start_time": meta.start_time(),
            "step1_complete": meta.completed(Stage::One),
            "step2_complete": meta.completed(Stage::Two),
            "step3_complete": meta.completed(Stage::Three),
        })
        .to_string(),
    )
}
