#[cfg(test)]
use std::fs;
#[cfg(test)]
use std::path::{Path, PathBuf};

mod env_parsing;
mod loader;
mod schema;

pub use self::loader::{load_from_env_or_default, load_from_path};
pub use self::schema::{
    AppConfig, EnrichmentConfig, IngestionConfig, OutputConfig, PipelineConfig, SystemConfig,
};

pub use self::env_parsing::{BATCH_INTERVAL_MIN_MS, BATCH_SIZE_MAX};
