//! Compliance pipeline binary
//!
//! Reads newline-delimited JSON event envelopes from stdin, processes them
//! through the worker pool and writes audit, dead-letter, notification and
//! ack records to stdout as JSON lines. Envelopes that fail to parse are
//! dead-lettered and audited with the raw line attached. Stops at EOF (after
//! draining) or on Ctrl-C (leaving queued events unacknowledged).

use anyhow::Context;
use compliance_pipeline::handlers::RecordingDomainService;
use compliance_pipeline::sinks::JsonLinesSink;
use compliance_pipeline::{
    EventFamily, HandlerRegistry, InboundEvent, LogFormat, Pipeline, PipelineConfig,
    PipelineMetrics, SlaMonitor, WorkerPool,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    // stdout carries the record stream, logs go to stderr
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_format);

    info!(service = %config.service_name, "Starting compliance pipeline");

    let cancel = CancellationToken::new();
    let records = Arc::new(JsonLinesSink::stdout());
    let metrics = PipelineMetrics::new().context("Failed to register metrics")?;

    let pipeline = Arc::new(
        Pipeline::builder(config.clone())
            .handlers(HandlerRegistry::standard(Arc::new(
                RecordingDomainService::new(),
            )))
            .dead_letters(records.clone())
            .audit(records.clone())
            .notifications(records.clone())
            .acknowledger(records.clone())
            .metrics(metrics.clone())
            .cancel_token(cancel.clone())
            .build()?,
    );

    let (breach_tx, breach_rx) = mpsc::channel(1_024);
    let monitor = SlaMonitor::spawn(
        pipeline.sla().clone(),
        config.sla.sweep_interval(),
        breach_tx,
        cancel.clone(),
    );
    let escalation = pipeline.clone().spawn_breach_escalation(breach_rx);

    let topics: Vec<&str> = EventFamily::ALL.iter().map(|f| f.topic()).collect();
    let pool = WorkerPool::start(
        pipeline.clone(),
        config.workers.clone(),
        &topics,
        cancel.clone(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut interrupted = false;
    let mut line_number = 0u64;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupt received");
                interrupted = true;
                break;
            }
            line = lines.next_line() => {
                let line = match line.context("Failed to read stdin")? {
                    Some(line) => line,
                    None => break,
                };
                line_number += 1;
                if line.trim().is_empty() {
                    continue;
                }

                let mut event = match InboundEvent::from_bytes(line.as_bytes()) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(line = line_number, "Malformed envelope: {}", e);
                        pipeline.reject(line.as_bytes(), e).await;
                        continue;
                    }
                };

                if event.source_topic.is_empty() {
                    if let Ok(event_type) = event.parsed_type() {
                        event.source_topic = event_type.family().topic().to_string();
                    }
                }

                pool.submit(event).await?;
            }
        }
    }

    if interrupted {
        pool.shutdown().await;
    } else {
        info!(lines = line_number, "Input exhausted, draining workers");
        pool.close().await;
    }

    cancel.cancel();
    monitor.await.context("SLA monitor task failed")?;
    escalation.await.context("Breach escalation task failed")?;

    metrics.set_ledger_entries(pipeline.ledger().len());
    info!("Final metrics:\n{}", metrics.render()?);
    metrics.teardown()?;

    info!("Compliance pipeline stopped");
    Ok(())
}
