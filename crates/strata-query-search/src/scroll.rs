use reqwest::Method;
use serde_json::{json, Value};
use strata_query::{QueryError, Record, Result};
use tracing::debug;

use crate::client::{hits, SearchClient};

/// An open scroll context.
///
/// The context is cleared exactly once: by [`Scroll::close`] after the last
/// page, or on drop when the consumer stops early.
pub struct Scroll {
    client: SearchClient,
    keep_alive: String,
    scroll_id: Option<String>,
}

impl Scroll {
    /// Take the scroll id of an initial `?scroll=` search response
    pub fn open(client: SearchClient, keep_alive: impl Into<String>, response: &Value) -> Self {
        let scroll_id = response
            .get("_scroll_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            client,
            keep_alive: keep_alive.into(),
            scroll_id,
        }
    }

    /// Fetch the next page; an empty page means the scroll is exhausted
    pub async fn next_page(&mut self) -> Result<Vec<Record>> {
        let Some(scroll_id) = self.scroll_id.as_deref() else {
            return Ok(Vec::new());
        };
        let body = json!({ "scroll": self.keep_alive, "scroll_id": scroll_id });
        let response = self
            .client
            .send(Method::POST, "/_search/scroll", Some(&body))
            .await?;

        match response.get("_scroll_id").and_then(Value::as_str) {
            Some(next) => self.scroll_id = Some(next.to_string()),
            None => {
                return Err(QueryError::QueryFailed(
                    "Scroll response carried no _scroll_id".to_string(),
                ))
            }
        }
        Ok(hits(&response))
    }

    pub async fn close(&mut self) {
        if let Some(scroll_id) = self.scroll_id.take() {
            self.client.clear_scroll(&scroll_id).await;
        }
    }
}

impl Drop for Scroll {
    fn drop(&mut self) {
        let Some(scroll_id) = self.scroll_id.take() else {
            return;
        };
        debug!("Scroll dropped before exhaustion, clearing context");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = self.client.clone();
            handle.spawn(async move {
                client.clear_scroll(&scroll_id).await;
            });
        }
    }
}
