use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (FOUNDRY_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("FOUNDRY_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("foundry_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = foundry_server::config::ServerConfig::parse();
    tracing::info!("Starting broker on {}", config.listen_addr);
    if config.no_git {
        tracing::info!("Git disabled, files are written without commits");
    }

    let server = foundry_server::server::Server::new(config);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}
