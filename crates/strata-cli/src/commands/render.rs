use super::common::{Backend, MappingArgs, ParameterArgs};
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use strata_query::{Querier, QuerierCache, RendererRegistry};

#[derive(Args)]
pub struct RenderCommand {
    /// Versioned query name
    query: String,

    /// Backend whose dialect renders the script
    #[arg(long = "dialect-backend", value_enum, default_value = "postgres")]
    backend: Backend,

    /// Render the counting script instead of the row script
    #[arg(long)]
    count: bool,

    #[command(flatten)]
    mappings: MappingArgs,

    #[command(flatten)]
    parameter: ParameterArgs,
}

impl RenderCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let (config, mappings) = self.mappings.mapping_service()?;
        let dialect = self.backend.dialect();
        let cache = QuerierCache::new(
            mappings,
            Arc::new(RendererRegistry::with_defaults()),
            dialect.bind_style(),
        );

        let parameter = self.parameter.parameter()?;
        let mut querier = cache.resolve(&self.query, &parameter)?;

        if self.count {
            querier = dialect.count(&querier)?;
        } else if parameter.offset.is_some() || parameter.limit.is_some() {
            if dialect.supports_limit(&querier) {
                let offset = parameter.offset.unwrap_or(0);
                let limit = config
                    .for_query(querier.query())
                    .effective_limit(parameter.limit);
                querier = dialect.limit(querier, offset, limit)?;
            } else {
                println!(
                    "{} {} cannot push a window into {}; it is applied after execution",
                    "!".bright_yellow(),
                    self.backend.name(),
                    self.query
                );
            }
        }

        print_querier(&querier);
        Ok(())
    }
}

fn print_querier(querier: &Querier) {
    println!(
        "{} {}",
        "Query:".bright_white().bold(),
        querier.name().bright_cyan()
    );
    println!("{}", "Script:".bright_white().bold());
    println!("{}", querier.body());

    if !querier.binds().is_empty() {
        println!("{}", "Binds:".bright_white().bold());
        for (index, value) in querier.binds().iter().enumerate() {
            println!("  ${} = {}", index + 1, value);
        }
    }

    if !querier.fetch_queries().is_empty() {
        println!("{}", "Fetches:".bright_white().bold());
        for fetch in querier.fetch_queries() {
            println!(
                "  {} -> {}",
                fetch.fetch.reference_versioned_name(),
                fetch.fetch.inject_property
            );
        }
    }
}
