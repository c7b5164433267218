use reqwest::{Client, Method};
use serde_json::Value;
use strata_query::{QueryError, Record, Result};
use tracing::{debug, warn};

/// Thin REST client for an Elasticsearch/OpenSearch cluster
#[derive(Clone)]
pub struct SearchClient {
    client: Client,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
}

impl SearchClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.credentials = Some((username.into(), password));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a JSON request and parse the JSON response
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Search API request: {} {}", method, path);

        let mut request = self
            .client
            .request(method, &url)
            .header("Content-Type", "application/json");
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, password.as_ref());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| QueryError::ConnectionFailed(format!("Search request failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            QueryError::QueryFailed(format!("Failed to read search response: {}", e))
        })?;

        if !status.is_success() {
            return Err(QueryError::QueryFailed(error_message(status.as_u16(), &text)));
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| {
            QueryError::Serialization(format!(
                "Failed to parse search response: {} - Body: {}",
                e, text
            ))
        })
    }

    /// Release a scroll context; failures are only logged
    pub async fn clear_scroll(&self, scroll_id: &str) {
        let body = serde_json::json!({ "scroll_id": [scroll_id] });
        match self.send(Method::DELETE, "/_search/scroll", Some(&body)).await {
            Ok(_) => debug!("Cleared scroll context"),
            Err(e) => warn!("Failed to clear scroll context: {}", e),
        }
    }
}

/// `error.type`/`error.reason` of an error response, else the raw body
fn error_message(status: u16, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    match error {
        Some(Value::Object(error)) => {
            let kind = error.get("type").and_then(Value::as_str).unwrap_or("error");
            let reason = error
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown reason");
            format!("Search error ({}) [{}]: {}", status, kind, reason)
        }
        Some(Value::String(reason)) => format!("Search error ({}): {}", status, reason),
        _ => format!("Search API returned status {}: {}", status, body),
    }
}

/// `_source` of every hit, in response order
pub fn hits(response: &Value) -> Vec<Record> {
    response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| hit.get("_source").and_then(Value::as_object).cloned())
                .collect()
        })
        .unwrap_or_default()
}
