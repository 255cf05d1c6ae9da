use carehook_server::CarehookServer;
use carehook_server::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use clap::Parser;

/// Webhook dispatch service.
#[derive(Debug, Parser)]
#[command(name = "carehook-server", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "CAREHOOK_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let args = Args::parse();

    let cfg = match load_config(Some(&args.config)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    carehook_server::observability::init_tracing(&cfg.logging);
    tracing::info!(
        path = %args.config,
        backend = ?cfg.storage.backend,
        "Configuration loaded"
    );

    let server = CarehookServer::build(&cfg).await?;
    server.run().await
}
