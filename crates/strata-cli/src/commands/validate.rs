use super::common::MappingArgs;
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use tracing::debug;

#[derive(Args)]
pub struct ValidateCommand {
    /// Mapping files or directories to load
    #[arg(required_unless_present = "config")]
    paths: Vec<PathBuf>,

    /// YAML configuration file whose mapping paths are loaded too
    #[arg(long, short = 'c', env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Print fetch, hint and property details of every query
    #[arg(long, short = 'v')]
    verbose: bool,
}

impl ValidateCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let args = MappingArgs {
            config: self.config.clone(),
            mappings: self.paths.clone(),
        };
        let config = args.query_config()?;
        debug!("Validating mapping paths {:?}", config.mapping_paths);

        let (_, mappings) = match args.mapping_service() {
            Ok(loaded) => loaded,
            Err(e) => {
                println!(
                    "{} {}",
                    "✗".bright_red(),
                    "Mapping sources are invalid".bright_red().bold()
                );
                println!("  {}", e);
                return Err(e);
            }
        };

        let snapshot = mappings.snapshot();
        let mut names = snapshot.names();
        names.sort();

        println!(
            "{} Loaded {} queries from {} source(s)",
            "✓".bright_green(),
            snapshot.len().to_string().bright_white().bold(),
            config.mapping_paths.len()
        );

        for name in names {
            let Some(query) = snapshot.get(&name) else {
                continue;
            };
            println!(
                "  {} {} {}",
                "•".bright_blue(),
                name.bright_white().bold(),
                format!("[{}]", query.script.dialect).bright_black()
            );
            if !self.verbose {
                continue;
            }
            if let Some(origin) = &query.origin {
                println!("      origin: {}", origin);
            }
            if let Some(description) = &query.description {
                println!("      {}", description.italic());
            }
            for fetch in &query.fetch_queries {
                println!(
                    "      fetch {} -> {}{}",
                    fetch.reference_versioned_name().bright_cyan(),
                    fetch.inject_property,
                    fetch
                        .reference_backend
                        .as_deref()
                        .map(|b| format!(" (backend {})", b))
                        .unwrap_or_default()
                );
            }
            for hint in &query.hints {
                println!("      hint {}", hint.key.bright_yellow());
            }
            let mut properties: Vec<_> = query.properties.iter().collect();
            properties.sort();
            for (key, value) in properties {
                println!("      {} = {}", key, value);
            }
        }

        Ok(())
    }
}
