//! CLI command implementations

use crate::output::{format_bytes, print_transfer_summary};
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Result};
use console::style;
use segdl_core::{HttpRangeSource, RangeSource, SegdlCore};
use segdl_types::{CoreEvent, EngineConfig, TransferState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

// ============================================================================
// Transfer Commands
// ============================================================================

pub async fn fetch(
    config: EngineConfig,
    urls: Vec<String>,
    dest: Option<PathBuf>,
    size: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    if size.is_some() && urls.len() != 1 {
        bail!("--size can only be used with a single URL");
    }

    let core = SegdlCore::new(config)?;
    let logger = tokio::spawn(log_events(core.subscribe()));

    let mut rejected = 0usize;
    let mut transfers = Vec::new();
    for url in &urls {
        match core.add_transfer(url, size, dest.clone()).await {
            Ok(transfer) => transfers.push(transfer),
            Err(e) => {
                error!("Could not queue {}: {}", url, e);
                rejected += 1;
            }
        }
    }

    tokio::select! {
        _ = core.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, finishing the current transfer before exiting");
        }
    }
    core.shutdown().await;
    logger.abort();

    let snapshots: Vec<_> = transfers.iter().map(|t| t.snapshot()).collect();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshots)?),
        OutputFormat::Human => {
            for snapshot in &snapshots {
                print_transfer_summary(snapshot);
            }
        }
    }

    let failed = snapshots
        .iter()
        .filter(|s| s.state != TransferState::Completed)
        .count()
        + rejected;
    if failed > 0 {
        bail!("{} of {} transfers did not complete", failed, urls.len());
    }
    Ok(())
}

/// Log core events until the channel closes; progress is logged per 10%
async fn log_events(mut events: tokio::sync::broadcast::Receiver<CoreEvent>) {
    let mut deciles: HashMap<uuid::Uuid, u64> = HashMap::new();

    loop {
        match events.recv().await {
            Ok(CoreEvent::TransferQueued { transfer }) => {
                info!("Queued {} ({})", transfer.resource.name, format_bytes(transfer.total_size));
            }
            Ok(CoreEvent::TransferStarted { transfer }) => {
                info!("Downloading {} to {}", transfer.resource.name, transfer.destination.display());
            }
            Ok(CoreEvent::TransferProgress { id, transferred, total }) => {
                let decile = if total == 0 { 10 } else { transferred * 10 / total };
                let last = deciles.entry(id).or_insert(0);
                if decile > *last {
                    *last = decile;
                    info!("{}: {}% ({} / {})", id, decile * 10, format_bytes(transferred), format_bytes(total));
                }
            }
            Ok(CoreEvent::TransferCompleted { transfer }) => {
                deciles.remove(&transfer.id);
                info!("Finished {}", transfer.destination.display());
            }
            Ok(CoreEvent::TransferFailed { transfer, error }) => {
                deciles.remove(&transfer.id);
                error!("Failed {}: {}", transfer.resource.name, error);
            }
            Err(RecvError::Lagged(skipped)) => debug!("Event log skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

pub async fn probe_urls(config: &EngineConfig, urls: Vec<String>, format: OutputFormat) -> Result<()> {
    let source = HttpRangeSource::new(config)?;

    let mut results = Vec::new();
    for url in urls {
        match source.probe(&url, &config.extra_params).await {
            Ok(resource) => results.push(resource),
            Err(e) => eprintln!("{} {}: {}", style("✗").red().bold(), url, e),
        }
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Human => {
            for resource in &results {
                println!("{} {}", style("✓").green().bold(), style(&resource.name).cyan());
                println!("  URL: {}", resource.url);
                println!("  Size: {}", format_bytes(resource.size));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    path: &Path,
    config: EngineConfig,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
            OutputFormat::Human => {
                println!("segdl Configuration ({}):", path.display());
                println!();
                println!("  Default destination: {}", config.default_destination.display());
                println!("  Workers per transfer: {}", config.worker_count);
                println!("  Segment size: {}", format_bytes(config.segment_size));
                println!("  Read chunk size: {}", format_bytes(config.read_chunk_size as u64));
                println!("  Segment retries: {}", config.max_segment_retries);
                println!("  Partial suffix: .{}", config.partial_suffix);
            }
        },

        Some(ConfigAction::Path) => println!("{}", path.display()),

        Some(ConfigAction::Get { key }) => {
            let value = match key.as_str() {
                "default_destination" => config.default_destination.display().to_string(),
                "worker_count" => config.worker_count.to_string(),
                "segment_size" => config.segment_size.to_string(),
                "read_chunk_size" => config.read_chunk_size.to_string(),
                "max_segment_retries" => config.max_segment_retries.to_string(),
                "retry_delay_ms" => config.retry_delay_ms.to_string(),
                "partial_suffix" => config.partial_suffix.clone(),
                "user_agent" => config.user_agent.clone(),
                _ => return Err(anyhow!("Unknown config key: {}", key)),
            };
            println!("{}", value);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut config = config;
            match key.as_str() {
                "default_destination" => config.default_destination = PathBuf::from(value),
                "worker_count" => config.worker_count = value.parse()?,
                "segment_size" => config.segment_size = value.parse()?,
                "read_chunk_size" => config.read_chunk_size = value.parse()?,
                "max_segment_retries" => config.max_segment_retries = value.parse()?,
                "retry_delay_ms" => config.retry_delay_ms = value.parse()?,
                "partial_suffix" => config.partial_suffix = value,
                "user_agent" => config.user_agent = value,
                _ => return Err(anyhow!("Unknown config key: {}", key)),
            }
            segdl_core::save_config(path, &config).await?;
            println!("{} Updated {}", style("✓").green().bold(), style(&key).cyan());
        }

        Some(ConfigAction::Reset) => {
            segdl_core::save_config(path, &EngineConfig::default()).await?;
            println!("{} Configuration reset to defaults", style("✓").green().bold());
        }
    }

    Ok(())
}
