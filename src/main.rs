//! azurite-engine: runs the blob storage engine until Ctrl-C.

use clap::Parser;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use azurite_engine::{Args, BlobServerBuilder, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let log_level = if args.debug {
        Level::DEBUG
    } else if args.silent {
        Level::ERROR
    } else {
        Level::INFO
    };

    // RUST_LOG, when set, overrides the level picked from the flags.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from(args);
    let server = BlobServerBuilder::new().config(config).build().await?;

    println!(
        r#"
Azurite blob engine is running

Default account: {}
Workspace: {}

Press Ctrl+C to stop.
"#,
        server.config().account,
        server
            .config()
            .workspace()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in memory".to_string())
    );

    server.run().await
}
