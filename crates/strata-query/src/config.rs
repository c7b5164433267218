use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{QueryError, Result};
use crate::mapping::QueryMappingLoader;
use crate::model::Query;
use crate::script::TEMPLATE_DIALECT;

pub const MAX_SELECT_SIZE_PROPERTY: &str = "max-select-size";
pub const DEFAULT_LIMIT_PROPERTY: &str = "default-limit";
pub const MAX_LIMIT_PROPERTY: &str = "max-limit";
pub const STREAM_BATCH_SIZE_PROPERTY: &str = "stream-batch-size";

/// Settings shared by every named query service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Mapping files, or directories scanned for `*.xml`
    pub mapping_paths: Vec<PathBuf>,
    /// Ceiling on rows returned by `select`
    pub max_select_size: usize,
    /// Page size used when a parameter carries no limit
    pub default_limit: u64,
    /// Upper bound applied to caller limits
    pub max_limit: u64,
    /// Batch size of streams without a native cursor
    pub stream_batch_size: u64,
    /// Dialect of scripts that declare none
    pub default_dialect: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            mapping_paths: Vec::new(),
            max_select_size: 128,
            default_limit: 16,
            max_limit: 1024,
            stream_batch_size: 64,
            default_dialect: TEMPLATE_DIALECT.to_string(),
        }
    }
}

impl QueryConfig {
    /// Parse from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| QueryError::invalid_configuration(format!("Invalid query config: {}", e)))
    }

    /// Load from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            QueryError::Io(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Loader over the configured mapping paths
    pub fn mapping_loader(&self) -> QueryMappingLoader {
        self.mapping_paths
            .iter()
            .fold(
                QueryMappingLoader::new().with_default_dialect(&self.default_dialect),
                |loader, path| loader.with_path(path),
            )
    }

    /// Effective settings for one query after property overrides
    pub fn for_query(&self, query: &Query) -> QuerySettings {
        QuerySettings {
            max_select_size: query
                .property(MAX_SELECT_SIZE_PROPERTY)
                .unwrap_or(self.max_select_size),
            default_limit: query
                .property(DEFAULT_LIMIT_PROPERTY)
                .unwrap_or(self.default_limit),
            max_limit: query.property(MAX_LIMIT_PROPERTY).unwrap_or(self.max_limit),
            stream_batch_size: query
                .property::<u64>(STREAM_BATCH_SIZE_PROPERTY)
                .unwrap_or(self.stream_batch_size)
                .max(1),
        }
    }
}

/// Per-query view of [`QueryConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySettings {
    pub max_select_size: usize,
    pub default_limit: u64,
    pub max_limit: u64,
    pub stream_batch_size: u64,
}

impl QuerySettings {
    /// Caller limit, defaulted and clamped to `max_limit`
    pub fn effective_limit(&self, requested: Option<u64>) -> u64 {
        requested
            .filter(|l| *l > 0)
            .unwrap_or(self.default_limit)
            .min(self.max_limit)
    }
}
