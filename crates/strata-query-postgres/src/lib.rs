//! PostgreSQL backend for strata-query
//!
//! Runs rendered SQL through `tokio-postgres`. Bind values are typed from the
//! parameter types the server infers for the prepared statement, and
//! `stream` reads rows off the connection as they arrive.

mod convert;
mod dialect;

pub use convert::{bind_all, bind_value, row_to_record, PgBind};
pub use dialect::PostgresDialect;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use strata_query::{
    BackendDialect, Capability, ConnectionConfig, ExecutorFactory, Querier, QueryError,
    QueryExecutor, Record, RecordStream, Result,
};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Statement};
use tracing::{debug, error};

use convert::describe_error;

/// PostgreSQL query executor
pub struct PostgresExecutor {
    client: Arc<Client>,
    database_name: String,
    dialect: PostgresDialect,
}

impl PostgresExecutor {
    /// Connect to a PostgreSQL server
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self> {
        let config = format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, username, password, database
        );

        debug!(
            "Connecting to PostgreSQL: {}@{}:{}/{}",
            username, host, port, database
        );
        Self::connect_with(&config, database).await
    }

    /// Connect with a libpq-style key/value string or a `postgresql://` URL
    pub async fn connect_with(config: &str, database: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(config, NoTls).await.map_err(|e| {
            QueryError::ConnectionFailed(format!("PostgreSQL connection failed: {}", e))
        })?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        debug!("Successfully connected to PostgreSQL database: {}", database);

        Ok(Self {
            client: Arc::new(client),
            database_name: database.to_string(),
            dialect: PostgresDialect,
        })
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    async fn prepare(&self, querier: &Querier) -> Result<(Statement, Vec<PgBind>)> {
        let statement = self
            .client
            .prepare(querier.body())
            .await
            .map_err(|e| failed(querier, &e))?;
        let binds = bind_all(querier.binds(), statement.params())?;
        Ok((statement, binds))
    }

    async fn query(&self, querier: &Querier) -> Result<Vec<tokio_postgres::Row>> {
        let (statement, binds) = self.prepare(querier).await?;
        let params: Vec<&(dyn ToSql + Sync)> =
            binds.iter().map(|b| b as &(dyn ToSql + Sync)).collect();

        debug!("Executing {}: {}", querier.name(), querier.body());
        self.client
            .query(&statement, &params)
            .await
            .map_err(|e| failed(querier, &e))
    }
}

fn failed(querier: &Querier, e: &tokio_postgres::Error) -> QueryError {
    error!("PostgreSQL query failed: {}", e);
    error!("Failed SQL: {}", querier.body());
    QueryError::QueryFailed(format!(
        "{}\n\nQuery: {}",
        describe_error(e),
        querier.body()
    ))
}

/// Apply the querier's `timeout` property, if any
async fn within_timeout<T>(querier: &Querier, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match querier.timeout() {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| QueryError::QueryTimeout(limit.as_millis() as u64))?,
        None => fut.await,
    }
}

fn boxed_stream<S>(stream: S) -> RecordStream
where
    S: Stream<Item = Result<Record>> + Send + 'static,
{
    Box::pin(stream)
}

#[async_trait]
impl QueryExecutor for PostgresExecutor {
    fn backend(&self) -> &str {
        "postgres"
    }

    fn dialect(&self) -> &dyn BackendDialect {
        &self.dialect
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Sql, Capability::Count, Capability::Cursor]
    }

    async fn execute(&self, querier: &Querier) -> Result<Vec<Record>> {
        let start = std::time::Instant::now();
        let rows = within_timeout(querier, self.query(querier)).await?;
        let records = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Query {} returned {} rows in {}ms",
            querier.name(),
            records.len(),
            start.elapsed().as_millis()
        );
        Ok(records)
    }

    async fn count(&self, querier: &Querier) -> Result<u64> {
        let rows = within_timeout(querier, self.query(querier)).await?;
        let row = rows
            .first()
            .ok_or_else(|| QueryError::QueryFailed("Count query returned no rows".to_string()))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| QueryError::QueryFailed(format!("Count query failed: {}", e)))?;
        Ok(count as u64)
    }

    async fn stream(&self, querier: Querier) -> Result<RecordStream> {
        let rows = within_timeout(&querier, async {
            let (statement, binds) = self.prepare(&querier).await?;
            self.client
                .query_raw(&statement, binds)
                .await
                .map_err(|e| failed(&querier, &e))
        })
        .await?;
        debug!("Opened row stream for {}", querier.name());

        let client = self.client.clone();
        Ok(boxed_stream(async_stream::try_stream! {
            // the connection stays open until the stream is dropped
            let _client = client;
            let mut rows = Box::pin(rows);
            while let Some(row) = rows.next().await {
                let row = row.map_err(|e| failed(&querier, &e))?;
                yield row_to_record(&row)?;
            }
        }))
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing PostgreSQL executor for {}", self.database_name);
        Ok(())
    }
}

/// Creates [`PostgresExecutor`]s from connection configurations
#[derive(Debug, Default)]
pub struct PostgresExecutorFactory;

impl PostgresExecutorFactory {
    pub fn new() -> Self {
        Self
    }

    /// libpq key/value string for a configuration without a URL
    fn connection_params(config: &ConnectionConfig) -> (String, String) {
        let database = config
            .database
            .clone()
            .unwrap_or_else(|| "postgres".to_string());
        let mut params = format!(
            "host={} port={} user={} dbname={}",
            config.host.as_deref().unwrap_or("localhost"),
            config.port.unwrap_or(5432),
            config.username.as_deref().unwrap_or("postgres"),
            database
        );
        if let Some(password) = &config.password {
            params.push_str(&format!(" password={}", password));
        }
        if let Some(timeout) = config.timeout {
            params.push_str(&format!(" connect_timeout={}", timeout.as_secs().max(1)));
        }
        if let Some(sslmode) = config.option("sslmode") {
            params.push_str(&format!(" sslmode={}", sslmode));
        }
        (params, database)
    }
}

#[async_trait]
impl ExecutorFactory for PostgresExecutorFactory {
    fn backend_type(&self) -> &'static str {
        "postgres"
    }

    async fn create_executor(&self, config: ConnectionConfig) -> Result<Arc<dyn QueryExecutor>> {
        debug!("Creating PostgreSQL executor for {}", config.connection_string());
        let executor = match &config.url {
            Some(url) => {
                let database = config.database.clone().unwrap_or_default();
                PostgresExecutor::connect_with(url, &database).await?
            }
            None => {
                let (params, database) = Self::connection_params(&config);
                PostgresExecutor::connect_with(&params, &database).await?
            }
        };
        Ok(Arc::new(executor))
    }
}
