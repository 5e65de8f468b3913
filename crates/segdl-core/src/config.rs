//! Configuration storage (JSON file)

use crate::error::SegdlError;
use segdl_types::EngineConfig;
use std::path::Path;
use tokio::fs;
use tracing::info;

/// Load the engine configuration, falling back to defaults when the file is absent
pub async fn load_config(path: &Path) -> Result<EngineConfig, SegdlError> {
    if !path.exists() {
        info!("No config at {:?}, using defaults", path);
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path).await?;
    let config: EngineConfig =
        serde_json::from_str(&content).map_err(|e| SegdlError::Serialization(e.to_string()))?;
    validate_config(&config)?;

    Ok(config)
}

/// Save the engine configuration
pub async fn save_config(path: &Path, config: &EngineConfig) -> Result<(), SegdlError> {
    validate_config(config)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let content =
        serde_json::to_string_pretty(config).map_err(|e| SegdlError::Serialization(e.to_string()))?;
    fs::write(path, content).await?;

    Ok(())
}

/// Reject values the planner cannot work with
pub fn validate_config(config: &EngineConfig) -> Result<(), SegdlError> {
    if config.worker_count == 0 {
        return Err(SegdlError::InvalidConfig("worker_count must be at least 1".into()));
    }
    if config.segment_size == 0 {
        return Err(SegdlError::InvalidConfig("segment_size must be at least 1".into()));
    }
    if config.read_chunk_size == 0 {
        return Err(SegdlError::InvalidConfig("read_chunk_size must be at least 1".into()));
    }
    if config.partial_suffix.is_empty() {
        return Err(SegdlError::InvalidConfig("partial_suffix must not be empty".into()));
    }
    Ok(())
}
