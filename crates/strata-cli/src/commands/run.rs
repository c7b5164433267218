use super::common::{Backend, ConnectionArgs, MappingArgs, ParameterArgs};
use anyhow::Context;
use clap::{Args, ValueEnum};
use colored::Colorize;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use strata_query::{NamedQueryService, QueryParameter, QueryRegistry};
use strata_query_http::HttpExecutorFactory;
use strata_query_postgres::PostgresExecutorFactory;
use strata_query_search::SearchExecutorFactory;
use tracing::info;

/// How the named query is invoked
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Get,
    Select,
    Page,
    Forward,
    Stream,
    Search,
    Aggregate,
}

#[derive(Args)]
pub struct RunCommand {
    /// Versioned query name
    query: String,

    /// Backend to connect to
    #[arg(long, short = 'b', value_enum)]
    backend: Backend,

    #[arg(long, value_enum, default_value = "select")]
    mode: Mode,

    /// Print one compact JSON document per line
    #[arg(long)]
    compact: bool,

    #[command(flatten)]
    mappings: MappingArgs,

    #[command(flatten)]
    parameter: ParameterArgs,

    #[command(flatten)]
    connection: ConnectionArgs,
}

impl RunCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(self.execute_async())
    }

    async fn execute_async(self) -> anyhow::Result<()> {
        let (config, mappings) = self.mappings.mapping_service()?;
        let parameter = self.parameter.parameter()?;

        let registry = QueryRegistry::with_mappings(config, mappings);
        registry
            .register_factory(Arc::new(PostgresExecutorFactory))
            .await?;
        registry
            .register_factory(Arc::new(SearchExecutorFactory))
            .await?;
        registry.register_factory(Arc::new(HttpExecutorFactory)).await?;

        let connection = self.connection.connection_config(self.backend);
        info!("Connecting to {}", connection.connection_string());
        let service = registry
            .create_service(self.backend.name(), connection)
            .await
            .with_context(|| format!("Failed to connect to {} backend", self.backend.name()))?;

        let outcome = self.run(&service, &parameter).await;
        registry.clear_services().await?;
        outcome
    }

    async fn run(
        &self,
        service: &NamedQueryService,
        parameter: &QueryParameter,
    ) -> anyhow::Result<()> {
        let name = self.query.as_str();
        match self.mode {
            Mode::Get => match service.get(name, parameter).await? {
                Some(record) => self.print(&record)?,
                None => println!("{} {} returned no row", "∅".bright_yellow(), name),
            },
            Mode::Select => {
                let rows = service.select(name, parameter).await?;
                self.print(&rows)?;
                self.summary(rows.len(), None);
            }
            Mode::Page => {
                let page = service.page(name, parameter).await?;
                self.print(&page)?;
                self.summary(page.results.len(), Some(page.total));
            }
            Mode::Forward => {
                let window = service.forward(name, parameter).await?;
                self.print(&window)?;
                if window.has_next {
                    println!("{} more rows follow", "→".bright_blue());
                }
            }
            Mode::Stream => {
                let mut stream = service.stream(name, parameter).await?;
                let mut rows = 0usize;
                while let Some(record) = stream.next().await {
                    println!("{}", serde_json::to_string(&record?)?);
                    rows += 1;
                }
                self.summary(rows, None);
            }
            Mode::Search => self.print(&service.search(name, parameter).await?)?,
            Mode::Aggregate => self.print(&service.aggregate(name, parameter).await?)?,
        }
        Ok(())
    }

    fn print<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        let rendered = if self.compact {
            serde_json::to_string(value)?
        } else {
            serde_json::to_string_pretty(value)?
        };
        println!("{}", rendered);
        Ok(())
    }

    fn summary(&self, rows: usize, total: Option<u64>) {
        if self.compact {
            return;
        }
        match total {
            Some(total) => eprintln!(
                "{} {} rows of {}",
                "✓".bright_green(),
                rows.to_string().bright_white().bold(),
                total
            ),
            None => eprintln!(
                "{} {} rows",
                "✓".bright_green(),
                rows.to_string().bright_white().bold()
            ),
        }
    }
}
