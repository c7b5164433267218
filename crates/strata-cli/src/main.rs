//! Strata CLI - validate, render and run named queries
//!
//! Mapping sources and limits come from an optional YAML configuration file;
//! backend connections are described with flags or environment variables.

mod commands;

use clap::{Parser, Subcommand};
use commands::{RenderCommand, RunCommand, ValidateCommand};
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "STRATA_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "STRATA_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load mapping sources and report every load-time error
    Validate(ValidateCommand),
    /// Render a named query for a backend without executing it
    Render(RenderCommand),
    /// Run a named query against a backend
    Run(RunCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // If RUST_LOG is set, use it directly; otherwise filter the strata crates
    // at the requested level and keep the HTTP stack quiet
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) if std::env::var("RUST_LOG").is_ok() => filter,
        _ => tracing_subscriber::EnvFilter::new(format!(
            "strata={level},\
             strata_query={level},\
             strata_query_postgres={level},\
             strata_query_search={level},\
             strata_query_http={level},\
             tokio_postgres=warn,\
             h2=warn,\
             hyper=warn,\
             reqwest=warn,\
             rustls=warn",
            level = cli.log_level
        )),
    };

    let fmt_layer = match cli.log_format.as_str() {
        "full" => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer() // "compact" or any other value
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Validate(cmd) => cmd.execute(),
        Commands::Render(cmd) => cmd.execute(),
        Commands::Run(cmd) => cmd.execute(),
    }
}
