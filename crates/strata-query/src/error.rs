use crate::types::Operation;
use thiserror::Error;

/// Unified error type for mapping, resolution, rendering and execution
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// Two queries share the same versioned name
    #[error("Duplicate query: {0}")]
    DuplicateQuery(String),

    /// A fetch query points at a query that is not loaded
    #[error("Query '{query}' fetches unknown query '{reference}'")]
    MissingFetchReference { query: String, reference: String },

    /// The fetch reference graph contains a cycle
    #[error("Circular fetch reference: {}", .path.join(" -> "))]
    CircularFetch { path: Vec<String> },

    /// A mapping source could not be parsed or is structurally invalid
    #[error("Malformed mapping {origin}: {message}")]
    MalformedMapping { origin: String, message: String },

    /// Reading a mapping source failed
    #[error("IO error: {0}")]
    Io(String),

    /// No query is registered under the requested versioned name
    #[error("Query not found: {0}")]
    QueryNotFound(String),

    /// No script renderer is registered for the declared dialect
    #[error("Unsupported script dialect '{dialect}' for query '{query}'")]
    UnsupportedDialect { query: String, dialect: String },

    /// Template rendering or script compilation failed
    #[error("Render failed for query '{query}'{}: {message}", position_suffix(.position))]
    Render {
        query: String,
        message: String,
        position: Option<usize>,
    },

    /// A parameter could not be coerced to its declared type
    #[error("Invalid parameter '{name}' for query '{query}': {message}")]
    InvalidParameter {
        query: String,
        name: String,
        message: String,
    },

    /// Backend failure while serving a public operation
    #[error("{operation} failed for query '{query}': {source}")]
    Execution {
        query: String,
        operation: Operation,
        #[source]
        source: Box<QueryError>,
    },

    /// More records than the select ceiling allows
    #[error("Query '{query}' exceeded the maximum of {ceiling} records during {operation}")]
    Overflow {
        query: String,
        operation: Operation,
        ceiling: usize,
    },

    /// A result hint handler failed
    #[error("Hint '{key}' failed for query '{query}': {message}")]
    Hint {
        query: String,
        key: String,
        message: String,
    },

    /// A fetch query failed somewhere below this level of the fetch chain
    #[error("Fetch '{fetch}' of query '{query}' failed: {source}")]
    Fetch {
        query: String,
        fetch: String,
        #[source]
        source: Box<QueryError>,
    },

    /// Connection failed (authentication, network, etc.)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed in the backend
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Query timeout
    #[error("Query timeout after {0}ms")]
    QueryTimeout(u64),

    /// Operation not supported by this backend
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic backend error
    #[error("Backend error: {0}")]
    Backend(String),
}

fn position_suffix(position: &Option<usize>) -> String {
    position
        .map(|p| format!(" at position {}", p))
        .unwrap_or_default()
}

impl QueryError {
    /// Create a render error with an optional script position
    pub fn render(
        query: impl Into<String>,
        message: impl Into<String>,
        position: Option<usize>,
    ) -> Self {
        QueryError::Render {
            query: query.into(),
            message: message.into(),
            position,
        }
    }

    /// Create an operation not supported error
    pub fn operation_not_supported(msg: impl Into<String>) -> Self {
        QueryError::OperationNotSupported(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        QueryError::InvalidConfiguration(msg.into())
    }

    /// Create a malformed mapping error
    pub fn malformed(origin: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::MalformedMapping {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// Tag a backend failure with the query and operation it surfaced from.
    ///
    /// Errors that already identify their query pass through untouched.
    pub fn in_operation(self, query: &str, operation: Operation) -> Self {
        match self {
            QueryError::ConnectionFailed(_)
            | QueryError::QueryFailed(_)
            | QueryError::QueryTimeout(_)
            | QueryError::OperationNotSupported(_)
            | QueryError::InvalidConfiguration(_)
            | QueryError::Serialization(_)
            | QueryError::Backend(_)
            | QueryError::Io(_) => QueryError::Execution {
                query: query.to_string(),
                operation,
                source: Box::new(self),
            },
            other => other,
        }
    }

    /// Whether this error was raised while loading mappings
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            QueryError::DuplicateQuery(_)
                | QueryError::MissingFetchReference { .. }
                | QueryError::CircularFetch { .. }
                | QueryError::MalformedMapping { .. }
                | QueryError::Io(_)
        )
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = QueryError::CircularFetch {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Circular fetch reference: a -> b -> a");
    }

    #[test]
    fn test_render_message_includes_position() {
        let err = QueryError::render("orders", "unterminated placeholder", Some(12));
        assert_eq!(
            err.to_string(),
            "Render failed for query 'orders' at position 12: unterminated placeholder"
        );

        let err = QueryError::render("orders", "boom", None);
        assert_eq!(err.to_string(), "Render failed for query 'orders': boom");
    }

    #[test]
    fn test_in_operation_wraps_backend_errors_only() {
        let wrapped = QueryError::QueryFailed("syntax".into()).in_operation("orders", Operation::Page);
        match wrapped {
            QueryError::Execution {
                query, operation, ..
            } => {
                assert_eq!(query, "orders");
                assert_eq!(operation, Operation::Page);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let untouched =
            QueryError::QueryNotFound("orders".into()).in_operation("orders", Operation::Get);
        assert!(matches!(untouched, QueryError::QueryNotFound(_)));
    }
}
