//! In-memory executor for exercising the shared service control flow.
//!
//! Rendered bodies are JSON documents: `{"table": "orders", "where": {...}}`.
//! A `where` value that is an array matches any of its elements.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strata_query::value::loosely_equal;
use strata_query::{
    BackendDialect, BindStyle, Capability, Querier, QueryError, QueryExecutor, Record,
    RecordStream, RenderedScript, Result,
};

pub struct MemoryDialect {
    pushdown: bool,
}

fn body_of(querier: &Querier) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_str(querier.body())? {
        Value::Object(map) => Ok(map),
        other => Err(QueryError::QueryFailed(format!("not an object: {}", other))),
    }
}

impl BackendDialect for MemoryDialect {
    fn bind_style(&self) -> BindStyle {
        BindStyle::Inline
    }

    fn supports_limit(&self, _querier: &Querier) -> bool {
        self.pushdown
    }

    fn limit(&self, querier: Querier, offset: u64, limit: u64) -> Result<Querier> {
        let mut body = body_of(&querier)?;
        body.insert("offset".into(), json!(offset));
        body.insert("limit".into(), json!(limit));
        let script = RenderedScript::new(serde_json::to_string(&body)?);
        Ok(querier.with_script(script))
    }

    fn count(&self, querier: &Querier) -> Result<Querier> {
        let mut body = body_of(querier)?;
        body.remove("offset");
        body.remove("limit");
        let script = RenderedScript::new(serde_json::to_string(&body)?);
        Ok(querier.clone().with_script(script))
    }
}

pub struct MemoryExecutor {
    tables: HashMap<String, Vec<Record>>,
    dialect: MemoryDialect,
    cursor: bool,
    pub executions: AtomicUsize,
    pub counts: AtomicUsize,
    pub bodies: parking_lot::Mutex<Vec<String>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            dialect: MemoryDialect { pushdown: true },
            cursor: false,
            executions: AtomicUsize::new(0),
            counts: AtomicUsize::new(0),
            bodies: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn with_table(mut self, name: &str, rows: Value) -> Self {
        let rows: Vec<Record> = serde_json::from_value(rows).expect("rows must be objects");
        self.tables.insert(name.to_string(), rows);
        self
    }

    /// Dialect that cannot push offset/limit down
    pub fn without_pushdown(mut self) -> Self {
        self.dialect.pushdown = false;
        self
    }

    pub fn with_cursor(mut self) -> Self {
        self.cursor = true;
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn counts(&self) -> usize {
        self.counts.load(Ordering::SeqCst)
    }

    fn matching(&self, querier: &Querier) -> Result<(Vec<Record>, serde_json::Map<String, Value>)> {
        let body = body_of(querier)?;
        self.bodies.lock().push(querier.body().to_string());

        let table = body
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::QueryFailed("missing table".into()))?;
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| QueryError::QueryFailed(format!("relation \"{}\" does not exist", table)))?;

        let filter = body.get("where").and_then(Value::as_object).cloned().unwrap_or_default();
        let matched = rows
            .iter()
            .filter(|row| {
                filter.iter().all(|(field, expected)| {
                    let actual = row.get(field).unwrap_or(&Value::Null);
                    match expected {
                        Value::Array(options) => options.iter().any(|o| loosely_equal(actual, o)),
                        other => loosely_equal(actual, other),
                    }
                })
            })
            .cloned()
            .collect();
        Ok((matched, body))
    }
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    fn backend(&self) -> &str {
        "memory"
    }

    fn dialect(&self) -> &dyn BackendDialect {
        &self.dialect
    }

    fn capabilities(&self) -> Vec<Capability> {
        let mut capabilities = vec![Capability::Count];
        if self.cursor {
            capabilities.push(Capability::Cursor);
        }
        capabilities
    }

    async fn execute(&self, querier: &Querier) -> Result<Vec<Record>> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let (rows, body) = self.matching(querier)?;
        let offset = body.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = body
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self, querier: &Querier) -> Result<u64> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        let (rows, _) = self.matching(querier)?;
        Ok(rows.len() as u64)
    }

    async fn stream(&self, querier: Querier) -> Result<RecordStream> {
        if !self.cursor {
            return Err(QueryError::operation_not_supported("no cursor"));
        }
        self.executions.fetch_add(1, Ordering::SeqCst);
        let (rows, _) = self.matching(&querier)?;
        Ok(Box::pin(futures::stream::iter(rows.into_iter().map(Ok))))
    }
}

pub fn orders() -> Value {
    json!([
        {"id": 10, "customerId": 1, "status": "open", "total": "12.50"},
        {"id": 11, "customerId": 2, "status": "open", "total": "3.00"},
        {"id": 12, "customerId": 1, "status": "closed", "total": "8.25"},
        {"id": 13, "customerId": 2, "status": "open", "total": "1.00"},
        {"id": 14, "customerId": 1, "status": "open", "total": "99.99"}
    ])
}

pub fn customers() -> Value {
    json!([
        {"id": 1, "name": "Ada", "email": "ada@example.com", "regionId": 7},
        {"id": 2, "name": "Grace", "email": "grace@example.com", "regionId": 8}
    ])
}

pub fn regions() -> Value {
    json!([
        {"id": 7, "name": "North"},
        {"id": 8, "name": "South"}
    ])
}

pub fn fixture() -> MemoryExecutor {
    MemoryExecutor::new()
        .with_table("orders", orders())
        .with_table("customers", customers())
        .with_table("regions", regions())
}

pub fn shared(executor: MemoryExecutor) -> Arc<MemoryExecutor> {
    Arc::new(executor)
}

pub const ORDERS_MAPPING: &str = r#"
<query-mappings>
  <param-entry name="customerId" type="long"/>

  <query name="orders">
    <script><![CDATA[{"table": "orders"[[, "where": {"status": ${status}}]]}]]></script>
  </query>

  <query name="orders-with-customer">
    <script><![CDATA[{"table": "orders"[[, "where": {"status": ${status}}]]}]]></script>
    <fetch-query reference-query="customers" inject-property-name="customer" multi-records="false">
      <param name="id" source="R" source-name="customerId" type="long"/>
    </fetch-query>
  </query>

  <query name="customers">
    <script><![CDATA[{"table": "customers", "where": {"id": ${id}}}]]></script>
    <fetch-query reference-query="regions" inject-property-name="region" multi-records="false">
      <param name="id" source="R" source-name="regionId"/>
    </fetch-query>
  </query>

  <query name="customers-with-orders">
    <script><![CDATA[{"table": "customers"}]]></script>
    <fetch-query reference-query="orders-by-customer" inject-property-name="orders" max-size="2">
      <param name="customerId" source="R" source-name="id"/>
      <param name="status" source="P" source-name="status"/>
    </fetch-query>
  </query>

  <query name="orders-by-customer">
    <script><![CDATA[{"table": "orders", "where": {"customerId": ${customerId}[[, "status": ${status}]]}}]]></script>
  </query>

  <query name="regions">
    <script><![CDATA[{"table": "regions", "where": {"id": ${id}}}]]></script>
  </query>

  <query name="broken">
    <script><![CDATA[{"table": "nowhere"}]]></script>
  </query>
</query-mappings>
"#;
