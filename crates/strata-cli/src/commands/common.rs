use anyhow::Context;
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata_query::{
    BackendDialect, ConnectionConfig, QueryConfig, QueryMappingService, QueryParameter,
};
use strata_query_http::HttpDialect;
use strata_query_postgres::PostgresDialect;
use strata_query_search::SearchDialect;

/// Where mapping sources come from
#[derive(Args, Debug, Clone)]
pub struct MappingArgs {
    /// YAML configuration file (mapping paths, limits)
    #[arg(long, short = 'c', env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Mapping files or directories, in addition to the configured ones
    #[arg(
        long = "mappings",
        short = 'm',
        env = "STRATA_MAPPINGS",
        value_delimiter = ','
    )]
    pub mappings: Vec<PathBuf>,
}

impl MappingArgs {
    pub fn query_config(&self) -> anyhow::Result<QueryConfig> {
        let mut config = match &self.config {
            Some(path) => QueryConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?,
            None => QueryConfig::default(),
        };
        config.mapping_paths.extend(self.mappings.iter().cloned());
        if config.mapping_paths.is_empty() {
            anyhow::bail!("No mapping sources given; pass --mappings or a configuration file");
        }
        Ok(config)
    }

    pub fn mapping_service(&self) -> anyhow::Result<(QueryConfig, Arc<QueryMappingService>)> {
        let config = self.query_config()?;
        let mappings = QueryMappingService::new(config.mapping_loader())?;
        Ok((config, Arc::new(mappings)))
    }
}

/// Caller parameter of a named query
#[derive(Args, Debug, Clone)]
pub struct ParameterArgs {
    /// Criteria as a JSON object
    #[arg(long, short = 'p', default_value = "{}")]
    pub param: String,

    /// Rows to skip (page, forward, stream)
    #[arg(long)]
    pub offset: Option<u64>,

    /// Rows to return (page, forward)
    #[arg(long)]
    pub limit: Option<u64>,

    /// Context values as key=value; values are parsed as JSON when they can be
    #[arg(long = "context", value_parser = parse_key_value)]
    pub context: Vec<(String, String)>,
}

impl ParameterArgs {
    pub fn parameter(&self) -> anyhow::Result<QueryParameter> {
        let criteria: serde_json::Value =
            serde_json::from_str(&self.param).context("--param must be valid JSON")?;
        if !criteria.is_object() {
            anyhow::bail!("--param must be a JSON object");
        }

        let mut parameter = QueryParameter::new().with_criteria(criteria);
        parameter.offset = self.offset;
        parameter.limit = self.limit;
        for (key, value) in &self.context {
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
            parameter = parameter.with_context(key.clone(), value);
        }
        Ok(parameter)
    }
}

/// Supported backend types
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Search,
    Http,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Postgres => "postgres",
            Backend::Search => "search",
            Backend::Http => "http",
        }
    }

    pub fn dialect(self) -> Box<dyn BackendDialect> {
        match self {
            Backend::Postgres => Box::new(PostgresDialect),
            Backend::Search => Box::new(SearchDialect),
            Backend::Http => Box::new(HttpDialect),
        }
    }
}

/// Connection settings of the target backend
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Full endpoint URL (postgresql://..., http://...)
    #[arg(long, env = "STRATA_URL")]
    pub url: Option<String>,

    #[arg(long, env = "STRATA_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "STRATA_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "STRATA_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "STRATA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Database name, or default index for the search backend
    #[arg(long, env = "STRATA_DATABASE")]
    pub database: Option<String>,

    /// Client timeout in milliseconds
    #[arg(long, env = "STRATA_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Backend-specific options as key=value (e.g. sslmode=disable, header.X-Api-Key=...)
    #[arg(long = "option", value_parser = parse_key_value)]
    pub options: Vec<(String, String)>,
}

impl ConnectionArgs {
    pub fn connection_config(&self, backend: Backend) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(backend.name());
        config.url = self.url.clone();
        config.host = self.host.clone();
        config.port = self.port;
        config.username = self.username.clone();
        config.password = self.password.clone();
        config.database = self.database.clone();
        config.timeout = self.timeout_ms.map(Duration::from_millis);
        for (key, value) in &self.options {
            config = config.with_option(key.clone(), value.clone());
        }
        config
    }
}

pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}
