//! HTTP backend for strata-query
//!
//! Each query renders a JSON [`RequestDescriptor`]:
//!
//! ```json
//! {"method": "GET", "path": "/customers/{id}/orders",
//!  "variables": {"id": ${customerId}}, "query": {"status": ${status}}}
//! ```
//!
//! Rows are read from the response at the query's `result-pointer` (a JSON
//! pointer, default the whole document); `total-pointer` enables counting.

mod request;

pub use request::{HttpDialect, RequestDescriptor, LIMIT_PARAM_PROPERTY, OFFSET_PARAM_PROPERTY};

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strata_query::{
    BackendDialect, Capability, ConnectionConfig, ExecutorFactory, Querier, QueryError,
    QueryExecutor, Record, Result,
};
use tracing::{debug, error};

/// Query property holding the JSON pointer of the result rows
pub const RESULT_POINTER_PROPERTY: &str = "result-pointer";
/// Query property holding the JSON pointer of the total row count
pub const TOTAL_POINTER_PROPERTY: &str = "total-pointer";

/// Executor for remote JSON resources
pub struct HttpExecutor {
    client: Client,
    base_url: String,
    headers: BTreeMap<String, String>,
    credentials: Option<(String, Option<String>)>,
    dialect: HttpDialect,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            QueryError::InvalidConfiguration(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: BTreeMap::new(),
            credentials: None,
            dialect: HttpDialect,
        })
    }

    /// Header sent with every request, ahead of descriptor headers
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.credentials = Some((username.into(), password));
        self
    }

    async fn send(&self, querier: &Querier) -> Result<Value> {
        let request = RequestDescriptor::parse(querier)?;
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(|_| {
            QueryError::QueryFailed(format!("Unsupported method: {}", request.method))
        })?;
        let url = format!("{}{}", self.base_url, request.resolved_path()?);

        debug!("HTTP request for {}: {} {}", querier.name(), method, url);

        let mut builder = self.client.request(method, &url).query(&request.query_pairs());
        for (name, value) in self.headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((username, password)) = &self.credentials {
            builder = builder.basic_auth(username, password.as_ref());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = querier.timeout() {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| match querier.timeout() {
            Some(timeout) if e.is_timeout() => QueryError::QueryTimeout(timeout.as_millis() as u64),
            _ => QueryError::ConnectionFailed(format!("HTTP request failed: {}", e)),
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| QueryError::QueryFailed(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            error!("HTTP request for {} returned {}", querier.name(), status);
            return Err(QueryError::QueryFailed(format!(
                "HTTP request returned status {}: {}",
                status, text
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| {
            QueryError::Serialization(format!("Failed to parse response: {} - Body: {}", e, text))
        })
    }
}

/// Rows at `pointer`: an array of objects, a single object, or nothing
fn records_at(response: &Value, pointer: &str) -> Result<Vec<Record>> {
    let target = if pointer.is_empty() {
        Some(response)
    } else {
        response.pointer(pointer)
    };

    match target {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(record)) => Ok(vec![record.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Object(record) => Ok(record.clone()),
                other => Err(QueryError::QueryFailed(format!(
                    "Expected an object row at {}, got {}",
                    pointer, other
                ))),
            })
            .collect(),
        Some(other) => Err(QueryError::QueryFailed(format!(
            "Expected rows at '{}', got {}",
            pointer, other
        ))),
    }
}

#[async_trait]
impl QueryExecutor for HttpExecutor {
    fn backend(&self) -> &str {
        "http"
    }

    fn dialect(&self) -> &dyn BackendDialect {
        &self.dialect
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Http, Capability::Count]
    }

    async fn execute(&self, querier: &Querier) -> Result<Vec<Record>> {
        let response = self.send(querier).await?;
        let pointer = querier
            .property::<String>(RESULT_POINTER_PROPERTY)
            .unwrap_or_default();
        records_at(&response, &pointer)
    }

    async fn count(&self, querier: &Querier) -> Result<u64> {
        let Some(pointer) = querier.property::<String>(TOTAL_POINTER_PROPERTY) else {
            return Err(QueryError::operation_not_supported(format!(
                "{} declares no {}",
                querier.name(),
                TOTAL_POINTER_PROPERTY
            )));
        };
        let response = self.send(querier).await?;
        match response.pointer(&pointer) {
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
                QueryError::QueryFailed(format!("Total at {} is not a count: {}", pointer, n))
            }),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| {
                QueryError::QueryFailed(format!("Total at {} is not a count: {}", pointer, s))
            }),
            other => Err(QueryError::QueryFailed(format!(
                "No total at {}: {:?}",
                pointer, other
            ))),
        }
    }
}

/// Creates [`HttpExecutor`]s from connection configurations.
///
/// Options named `header.<Name>` become default request headers.
#[derive(Debug, Default)]
pub struct HttpExecutorFactory;

impl HttpExecutorFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutorFactory for HttpExecutorFactory {
    fn backend_type(&self) -> &'static str {
        "http"
    }

    async fn create_executor(&self, config: ConnectionConfig) -> Result<Arc<dyn QueryExecutor>> {
        let base_url = match (&config.url, &config.host) {
            (Some(url), _) => url.clone(),
            (None, Some(host)) => match config.port {
                Some(port) => format!("http://{}:{}", host, port),
                None => format!("http://{}", host),
            },
            (None, None) => {
                return Err(QueryError::InvalidConfiguration(
                    "HTTP backend requires a url or host".to_string(),
                ))
            }
        };
        debug!("Creating HTTP executor for {}", base_url);

        let mut executor = HttpExecutor::new(base_url, config.timeout)?;
        for (key, value) in &config.options {
            if let Some(name) = key.strip_prefix("header.") {
                executor = executor.with_header(name, value.clone());
            }
        }
        if let Some(username) = &config.username {
            executor = executor.with_credentials(username.clone(), config.password.clone());
        }
        Ok(Arc::new(executor))
    }
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;
    use strata_query::{
        NamedQueryService, Query, QueryMappingService, QueryParameter, Script,
    };
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(mock_server: &MockServer, queries: Vec<Query>) -> NamedQueryService {
        let executor = HttpExecutor::new(mock_server.uri(), Some(Duration::from_secs(5)))
            .unwrap()
            .with_header("Authorization", "Bearer test_token_12345");
        let mappings = Arc::new(QueryMappingService::from_queries(queries).unwrap());
        NamedQueryService::builder("http", Arc::new(executor), mappings).build()
    }

    fn customer_orders() -> Query {
        Query::new(
            "customer-orders",
            Script::template(
                r#"{"path": "/customers/{id}/orders", "variables": {"id": ${customerId}}[[, "query": {"status": ${status}}]]}"#,
            ),
        )
        .with_property(RESULT_POINTER_PROPERTY, "/data")
        .with_property(TOTAL_POINTER_PROPERTY, "/meta/total")
        .with_property(OFFSET_PARAM_PROPERTY, "offset")
        .with_property(LIMIT_PARAM_PROPERTY, "limit")
    }

    #[tokio::test]
    async fn test_select_with_path_variables() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/customers/7/orders"))
            .and(query_param("status", "open"))
            .and(header("Authorization", "Bearer test_token_12345"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": 1}, {"id": 2}],
                "meta": {"total": 2}
            })))
            .mount(&mock_server)
            .await;

        let rows = service(&mock_server, vec![customer_orders()])
            .select(
                "customer-orders",
                &QueryParameter::new().with_criteria(json!({"customerId": 7, "status": "open"})),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["id"], json!(2));
    }

    #[tokio::test]
    async fn test_page_pushes_window_and_counts() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/customers/7/orders"))
            .and(query_param("offset", "0"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": 1}, {"id": 2}],
                "meta": {"total": 9}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
        // count request carries no window parameters
        Mock::given(method("GET"))
            .and(path("/customers/7/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [],
                "meta": {"total": 9}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let page = service(&mock_server, vec![customer_orders()])
            .page(
                "customer-orders",
                &QueryParameter::new()
                    .with_criteria(json!({"customerId": 7}))
                    .with_limit(2),
            )
            .await
            .unwrap();
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.total, 9);
    }

    #[tokio::test]
    async fn test_page_offset_without_offset_param_windows_in_memory() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}, {"id": 5}],
                "meta": {"total": 5}
            })))
            .expect(2)
            .mount(&mock_server)
            .await;

        let orders = Query::new("orders", Script::template(r#"{"path": "/orders"}"#))
            .with_property(RESULT_POINTER_PROPERTY, "/data")
            .with_property(TOTAL_POINTER_PROPERTY, "/meta/total")
            .with_property(LIMIT_PARAM_PROPERTY, "per_page");

        let page = service(&mock_server, vec![orders])
            .page("orders", &QueryParameter::new().with_offset(2).with_limit(2))
            .await
            .unwrap();
        let ids: Vec<_> = page.results.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(3), json!(4)]);
        assert_eq!(page.offset, 2);
        assert_eq!(page.total, 5);

        let requests = mock_server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.url.query().is_none()));
    }

    #[tokio::test]
    async fn test_post_body_and_error_status() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_json(json!({"term": "ada"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&mock_server)
            .await;

        let svc = service(
            &mock_server,
            vec![
                Query::new(
                    "search",
                    Script::template(r#"{"method": "post", "path": "/search", "body": {"term": ${term}}}"#),
                ),
                Query::new("broken", Script::template(r#"{"path": "/broken"}"#)),
            ],
        );

        let row = svc
            .get("search", &QueryParameter::new().with_criteria(json!({"term": "ada"})))
            .await
            .unwrap();
        assert_eq!(row.unwrap()["id"], json!(1));

        let err = svc.select("broken", &QueryParameter::new()).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
