use strata_query::{BackendDialect, BindStyle, Querier, RenderedScript, Result};

/// PostgreSQL syntax: `$n` binds, `LIMIT/OFFSET`, counts over a subselect
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

fn statement(querier: &Querier) -> &str {
    querier.body().trim().trim_end_matches(';').trim_end()
}

impl BackendDialect for PostgresDialect {
    fn bind_style(&self) -> BindStyle {
        BindStyle::Dollar
    }

    fn limit(&self, querier: Querier, offset: u64, limit: u64) -> Result<Querier> {
        let mut sql = format!("{} LIMIT {}", statement(&querier), limit);
        if offset > 0 {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        let script = RenderedScript::new(sql).with_binds(querier.binds().to_vec());
        Ok(querier.with_script(script))
    }

    fn count(&self, querier: &Querier) -> Result<Querier> {
        let sql = format!("SELECT COUNT(1) FROM ({}) AS _count_", statement(querier));
        let script = RenderedScript::new(sql).with_binds(querier.binds().to_vec());
        Ok(querier.clone().with_script(script))
    }
}
