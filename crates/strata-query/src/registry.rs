use crate::config::QueryConfig;
use crate::error::{QueryError, Result};
use crate::hint::HintRegistry;
use crate::mapping::QueryMappingService;
use crate::script::RendererRegistry;
use crate::service::{NamedQueryService, PeerDirectory};
use crate::traits::QueryExecutor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Connection configuration for creating executors
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Backend type identifier (postgres, search, http)
    pub backend: String,
    /// Full endpoint URL, used instead of host/port when set
    pub url: Option<String>,
    /// Host or connection endpoint
    pub host: Option<String>,
    /// Port number
    pub port: Option<u16>,
    /// Username or access key
    pub username: Option<String>,
    /// Password or secret key
    pub password: Option<String>,
    /// Database name or index
    pub database: Option<String>,
    /// Client-side request timeout
    pub timeout: Option<Duration>,
    /// Additional options as key-value pairs
    pub options: HashMap<String, String>,
}

impl ConnectionConfig {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            url: None,
            host: None,
            port: None,
            username: None,
            password: None,
            database: None,
            timeout: None,
            options: HashMap::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Get connection string for display purposes (without password)
    pub fn connection_string(&self) -> String {
        if let Some(url) = &self.url {
            return format!("{} {}", self.backend, url);
        }

        let mut parts = vec![format!("{}://", self.backend)];

        if let Some(username) = &self.username {
            parts.push(format!("{}@", username));
        }

        if let Some(host) = &self.host {
            parts.push(host.clone());

            if let Some(port) = self.port {
                parts.push(format!(":{}", port));
            }
        }

        if let Some(database) = &self.database {
            parts.push(format!("/{}", database));
        }

        parts.join("")
    }
}

/// Factory trait for creating executors from configurations
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    /// Get the backend type this factory handles
    fn backend_type(&self) -> &'static str;

    /// Connect an executor for the given configuration
    async fn create_executor(&self, config: ConnectionConfig) -> Result<Arc<dyn QueryExecutor>>;
}

/// Registry of executor factories and the named query services built on them.
///
/// Every service shares the registry's mapping table, renderers, hints and
/// configuration, and reaches the others through a common peer directory.
pub struct QueryRegistry {
    mappings: Arc<QueryMappingService>,
    renderers: Arc<RendererRegistry>,
    hints: Arc<HintRegistry>,
    config: Arc<QueryConfig>,
    peers: Arc<PeerDirectory>,
    factories: Arc<RwLock<HashMap<String, Arc<dyn ExecutorFactory>>>>,
    services: Arc<RwLock<HashMap<String, NamedQueryService>>>,
}

impl QueryRegistry {
    /// Load the configured mapping paths and create an empty registry
    pub fn new(config: QueryConfig) -> Result<Self> {
        let mappings = Arc::new(QueryMappingService::new(config.mapping_loader())?);
        Ok(Self::with_mappings(config, mappings))
    }

    pub fn with_mappings(config: QueryConfig, mappings: Arc<QueryMappingService>) -> Self {
        Self {
            mappings,
            renderers: Arc::new(RendererRegistry::with_defaults()),
            hints: Arc::new(HintRegistry::with_defaults()),
            config: Arc::new(config),
            peers: Arc::new(PeerDirectory::new()),
            factories: Arc::new(RwLock::new(HashMap::new())),
            services: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Renderers used by services created after this call
    pub fn with_renderers(mut self, renderers: RendererRegistry) -> Self {
        self.renderers = Arc::new(renderers);
        self
    }

    /// Hint handlers used by services created after this call
    pub fn with_hints(mut self, hints: HintRegistry) -> Self {
        self.hints = Arc::new(hints);
        self
    }

    pub fn mappings(&self) -> &Arc<QueryMappingService> {
        &self.mappings
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Register a factory for a backend type
    pub async fn register_factory(&self, factory: Arc<dyn ExecutorFactory>) -> Result<()> {
        let backend = factory.backend_type();
        let mut factories = self.factories.write().await;

        if factories.contains_key(backend) {
            warn!("Overwriting existing factory for backend: {}", backend);
        }

        factories.insert(backend.to_string(), factory);
        debug!("Registered factory for backend: {}", backend);
        Ok(())
    }

    /// Connect an executor through its factory and start a service named `name`
    pub async fn create_service(
        &self,
        name: &str,
        config: ConnectionConfig,
    ) -> Result<NamedQueryService> {
        let factories = self.factories.read().await;

        let factory = factories
            .get(&config.backend)
            .ok_or_else(|| {
                QueryError::InvalidConfiguration(format!(
                    "No factory registered for backend: {}",
                    config.backend
                ))
            })?
            .clone();

        drop(factories);

        debug!(
            "Creating service {} for backend: {}",
            name,
            config.connection_string()
        );

        let executor = factory.create_executor(config).await?;
        Ok(self.register_executor(name, executor).await)
    }

    /// Start a service named `name` over an existing executor
    pub async fn register_executor(
        &self,
        name: &str,
        executor: Arc<dyn QueryExecutor>,
    ) -> NamedQueryService {
        let service = NamedQueryService::builder(name, executor, self.mappings.clone())
            .renderers(self.renderers.clone())
            .hints(self.hints.clone())
            .config(self.config.clone())
            .peers(self.peers.clone())
            .build();

        let displaced = self
            .services
            .write()
            .await
            .insert(name.to_string(), service.clone());
        if let Some(old) = displaced {
            warn!("Replaced existing named query service: {}", name);
            if let Err(e) = old.close().await {
                warn!("Failed to close replaced service {}: {}", name, e);
            }
        }
        info!("Registered named query service: {}", name);
        service
    }

    /// Get a running service
    pub async fn get_service(&self, name: &str) -> Option<NamedQueryService> {
        let services = self.services.read().await;
        services.get(name).cloned()
    }

    /// Stop and remove a service
    pub async fn remove_service(&self, name: &str) -> Result<()> {
        let mut services = self.services.write().await;

        if let Some(service) = services.remove(name) {
            debug!("Closing service: {}", name);
            service.close().await?;
        }

        Ok(())
    }

    /// List all running services
    pub async fn list_services(&self) -> Vec<String> {
        let services = self.services.read().await;
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every service
    pub async fn clear_services(&self) -> Result<()> {
        let drained: Vec<_> = self.services.write().await.drain().collect();

        let mut first_error = None;
        for (name, service) in drained {
            if let Err(e) = service.close().await {
                warn!("Failed to close service {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// List registered backend types
    pub async fn list_backends(&self) -> Vec<String> {
        let factories = self.factories.read().await;
        factories.keys().cloned().collect()
    }

    /// Check if a backend is registered
    pub async fn has_backend(&self, backend: &str) -> bool {
        let factories = self.factories.read().await;
        factories.contains_key(backend)
    }

    /// Reload the shared mapping table
    pub fn reload(&self) -> Result<usize> {
        self.mappings.reload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::querier::Querier;
    use crate::script::BindStyle;
    use crate::traits::BackendDialect;
    use crate::types::{Capability, Record};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PlainDialect;

    impl BackendDialect for PlainDialect {
        fn bind_style(&self) -> BindStyle {
            BindStyle::Inline
        }

        fn limit(&self, querier: Querier, _offset: u64, _limit: u64) -> Result<Querier> {
            Ok(querier)
        }

        fn count(&self, querier: &Querier) -> Result<Querier> {
            Ok(querier.clone())
        }
    }

    /// Executor that only counts how often it is closed
    struct ClosingExecutor {
        closes: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ClosingExecutor {
        fn new(closes: &Arc<AtomicUsize>) -> Arc<dyn QueryExecutor> {
            Arc::new(Self {
                closes: closes.clone(),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl QueryExecutor for ClosingExecutor {
        fn backend(&self) -> &str {
            "memory"
        }

        fn dialect(&self) -> &dyn BackendDialect {
            &PlainDialect
        }

        fn capabilities(&self) -> Vec<Capability> {
            vec![]
        }

        async fn execute(&self, _querier: &Querier) -> Result<Vec<Record>> {
            Ok(vec![])
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(QueryError::ConnectionFailed("already gone".to_string()));
            }
            Ok(())
        }
    }

    fn empty_registry() -> QueryRegistry {
        let mappings = Arc::new(QueryMappingService::from_queries(vec![]).unwrap());
        QueryRegistry::with_mappings(QueryConfig::default(), mappings)
    }

    #[tokio::test]
    async fn test_register_executor_closes_replaced_service() {
        let registry = empty_registry();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry.register_executor("main", ClosingExecutor::new(&first)).await;
        registry.register_executor("main", ClosingExecutor::new(&second)).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(registry.list_services().await, vec!["main".to_string()]);
        assert!(registry.peers.get("main").is_some());

        registry.clear_services().await.unwrap();
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(registry.list_services().await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_services_reports_close_failure() {
        let registry = empty_registry();
        let healthy = Arc::new(AtomicUsize::new(0));
        let broken = Arc::new(AtomicUsize::new(0));

        registry.register_executor("healthy", ClosingExecutor::new(&healthy)).await;
        registry
            .register_executor(
                "broken",
                Arc::new(ClosingExecutor {
                    closes: broken.clone(),
                    fail: true,
                }),
            )
            .await;

        let err = registry.clear_services().await.unwrap_err();
        assert!(matches!(err, QueryError::ConnectionFailed(_)));
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
        assert_eq!(broken.load(Ordering::SeqCst), 1);
        assert!(registry.list_services().await.is_empty());
    }

    #[test]
    fn test_connection_config_creation() {
        let config = ConnectionConfig::new("postgres")
            .with_host("localhost")
            .with_port(5432)
            .with_database("mydb")
            .with_option("sslmode", "disable");

        assert_eq!(config.backend, "postgres");
        assert_eq!(config.host, Some("localhost".to_string()));
        assert_eq!(config.port, Some(5432));
        assert_eq!(config.database, Some("mydb".to_string()));
        assert_eq!(config.option("sslmode"), Some("disable"));
    }

    #[test]
    fn test_connection_string() {
        let config = ConnectionConfig::new("postgres")
            .with_username("app")
            .with_password("secret")
            .with_host("localhost")
            .with_port(5432)
            .with_database("mydb");

        let conn_str = config.connection_string();
        assert_eq!(conn_str, "postgres://app@localhost:5432/mydb");
        assert!(!conn_str.contains("secret"));

        let search = ConnectionConfig::new("search").with_url("http://localhost:9200");
        assert_eq!(search.connection_string(), "search http://localhost:9200");
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let mappings = Arc::new(QueryMappingService::from_queries(vec![]).unwrap());
        let registry = QueryRegistry::with_mappings(QueryConfig::default(), mappings);
        assert!(registry.list_services().await.is_empty());
        assert!(!registry.has_backend("postgres").await);
    }

    #[tokio::test]
    async fn test_unknown_backend_factory() {
        let mappings = Arc::new(QueryMappingService::from_queries(vec![]).unwrap());
        let registry = QueryRegistry::with_mappings(QueryConfig::default(), mappings);
        let err = registry
            .create_service("main", ConnectionConfig::new("oracle"))
            .await
            .err()
            .expect("no factory registered");
        assert!(matches!(err, QueryError::InvalidConfiguration(_)));
    }
}
