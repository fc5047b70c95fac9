//! Broker configuration (CLI flags with environment fallbacks).

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "foundry-server", about = "Task broker for foundry workers")]
pub struct ServerConfig {
    /// Address to serve the HTTP API on.
    #[arg(long, env = "FOUNDRY_LISTEN_ADDR", default_value = "127.0.0.1:7860")]
    pub listen_addr: String,

    /// Repository working tree that reports are written and committed into.
    #[arg(long, env = "FOUNDRY_REPO_DIR", default_value = "repo")]
    pub repo_dir: PathBuf,

    /// SQLite database for queue and ledger persistence (in-memory only if unset).
    #[arg(long, env = "FOUNDRY_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Write files without committing them to git.
    #[arg(long, env = "FOUNDRY_NO_GIT")]
    pub no_git: bool,

    /// Capacity of the in-process broker event channel.
    #[arg(long, default_value_t = 256)]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7860".to_string(),
            repo_dir: PathBuf::from("repo"),
            db_path: None,
            no_git: false,
            event_capacity: 256,
        }
    }
}
