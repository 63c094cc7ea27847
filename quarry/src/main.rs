//! Entrypoint of the quarry binary
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::future_not_send
)]

use dotenvy::dotenv;
use quarry_logging::cli::LoggingConfig;

mod commands {
    pub(crate) mod catalog;
    pub(crate) mod dispatch;
    pub(crate) mod worker;
    pub(crate) mod workflow;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "quarry",
    version,
    about = "Event triggered object ingest",
    long_about = r#"Event triggered object ingest

Objects landing in the raw bucket under `tenant_id=<tenant>/table=<table>/<path>` are
transformed into partitions of the lake and recorded in the metadata catalog.

Examples:
    # Create or upgrade the catalog and workflow schemas
    quarry catalog migrate --catalog-dsn postgresql://postgres@localhost:5432/postgres \
        --workflow-dsn postgresql://postgres@localhost:5432/postgres

    # Run the catalog gRPC service
    quarry catalog serve --catalog-dsn postgresql://postgres@localhost:5432/postgres

    # Run an ingest worker against the catalog service
    quarry worker --catalog-dsn http://localhost:8082 \
        --workflow-dsn postgresql://postgres@localhost:5432/postgres \
        --transform-binary /usr/local/bin/transform

    # Start ingest runs for the notifications read from stdin
    quarry dispatch --workflow-dsn postgresql://postgres@localhost:5432/postgres \
        --destination-bucket lake < messages.jsonl

    # Run with full debug logging specified with LOG_FILTER
    LOG_FILTER=debug quarry worker ...
"#
)]
struct Config {
    #[clap(flatten)]
    logging_config: LoggingConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Serve or migrate the metadata catalog
    Catalog(commands::catalog::Config),

    /// Claim and execute ingest runs
    Worker(commands::worker::Config),

    /// Start ingest runs for object storage notifications
    Dispatch(commands::dispatch::Config),

    /// Inspect or cancel ingest runs
    Workflow(commands::workflow::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("quarry")
        .build()?;

    tokio_runtime.block_on(async move {
        if let Err(e) = config.logging_config.install_global_subscriber() {
            eprintln!("Initializing logs failed: {e}");
            std::process::exit(ReturnCode::Failure as _);
        }

        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Catalog(config)) => {
                if let Err(e) = commands::catalog::command(config).await {
                    eprintln!("Catalog command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Worker(config)) => {
                if let Err(e) = commands::worker::command(config).await {
                    eprintln!("Worker command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Dispatch(config)) => {
                if let Err(e) = commands::dispatch::command(config).await {
                    eprintln!("Dispatch command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Workflow(config)) => {
                if let Err(e) = commands::workflow::command(config).await {
                    eprintln!("Workflow command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // Ignore this - a missing env file is not an error, defaults will
            // be applied when initialising the Config struct.
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}
