use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::value;

/// A row of data as ordered key-value pairs
pub type Record = serde_json::Map<String, Value>;

/// Capabilities an executor may offer beyond plain execution
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// SQL-based statements (Postgres, MySQL, etc.)
    Sql,
    /// Search engine request bodies
    Search,
    /// Remote HTTP resources
    Http,
    /// Derived count queries for paging
    Count,
    /// Native cursor or scroll streaming
    Cursor,
    /// Raw search and aggregation pass-through
    Aggregation,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Sql => write!(f, "sql"),
            Capability::Search => write!(f, "search"),
            Capability::Http => write!(f, "http"),
            Capability::Count => write!(f, "count"),
            Capability::Cursor => write!(f, "cursor"),
            Capability::Aggregation => write!(f, "aggregation"),
        }
    }
}

/// Public operation being served, used to tag errors
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Get,
    Select,
    Page,
    Forward,
    Stream,
    Aggregate,
    Search,
    Count,
    Fetch,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Get => write!(f, "get"),
            Operation::Select => write!(f, "select"),
            Operation::Page => write!(f, "page"),
            Operation::Forward => write!(f, "forward"),
            Operation::Stream => write!(f, "stream"),
            Operation::Aggregate => write!(f, "aggregate"),
            Operation::Search => write!(f, "search"),
            Operation::Count => write!(f, "count"),
            Operation::Fetch => write!(f, "fetch"),
        }
    }
}

/// Caller input for a named query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    /// Number of rows to skip (paging and forwarding)
    #[serde(default)]
    pub offset: Option<u64>,
    /// Maximum rows to return (paging and forwarding)
    #[serde(default)]
    pub limit: Option<u64>,
    /// Renderer-interpreted criteria object
    #[serde(default)]
    pub criteria: Value,
    /// Free-form context, also read by parent-parameter fetch sources
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl QueryParameter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_criteria(mut self, criteria: Value) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Look a dotted path up in the criteria first, then in the context
    pub fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(found) = value::resolve_path(&self.criteria, path) {
            return Some(found);
        }

        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let root = self.context.get(head)?;
        match rest {
            Some(rest) => value::resolve_path(root, rest),
            None => Some(root.clone()),
        }
    }
}

/// One page of results with the total row count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedList<T = Record> {
    pub offset: u64,
    pub page_size: u64,
    pub total: u64,
    pub results: Vec<T>,
}

impl<T> PagedList<T> {
    /// Convert every result, keeping the paging envelope
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<PagedList<U>, E> {
        Ok(PagedList {
            offset: self.offset,
            page_size: self.page_size,
            total: self.total,
            results: self.results.into_iter().map(f).collect::<Result<_, _>>()?,
        })
    }
}

/// A window of results that knows whether more rows follow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardList<T = Record> {
    pub results: Vec<T>,
    pub has_next: bool,
}

impl<T> ForwardList<T> {
    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<ForwardList<U>, E> {
        Ok(ForwardList {
            results: self.results.into_iter().map(f).collect::<Result<_, _>>()?,
            has_next: self.has_next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_display() {
        assert_eq!(Operation::Get.to_string(), "get");
        assert_eq!(Operation::Forward.to_string(), "forward");
        assert_eq!(Capability::Cursor.to_string(), "cursor");
    }

    #[test]
    fn test_parameter_lookup_prefers_criteria() {
        let param = QueryParameter::new()
            .with_criteria(json!({"customer": {"id": 7}, "status": "open"}))
            .with_context("status", json!("ignored"))
            .with_context("tenant", json!({"code": "acme"}));

        assert_eq!(param.lookup("customer.id"), Some(json!(7)));
        assert_eq!(param.lookup("status"), Some(json!("open")));
        assert_eq!(param.lookup("tenant.code"), Some(json!("acme")));
        assert_eq!(param.lookup("missing"), None);
    }

    #[test]
    fn test_paged_list_try_map() {
        let page = PagedList {
            offset: 10,
            page_size: 2,
            total: 12,
            results: vec![1, 2],
        };
        let mapped: PagedList<String> = page
            .try_map(|n| Ok::<_, ()>(n.to_string()))
            .unwrap();
        assert_eq!(mapped.results, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(mapped.total, 12);
    }
}
