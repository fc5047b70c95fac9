//! Broker server: wires configuration, repository, persistence and HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::config::ServerConfig;
use crate::db::Db;
use crate::repo::{GitRepository, PlainDirectory, VersionControl};
use crate::web;

pub struct Server {
    config: ServerConfig,
    repository: Option<Arc<dyn VersionControl>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            repository: None,
        }
    }

    /// Use a caller-supplied repository instead of opening `repo_dir`.
    pub fn with_repository(config: ServerConfig, repository: Arc<dyn VersionControl>) -> Self {
        Self {
            config,
            repository: Some(repository),
        }
    }

    fn build_broker(&self) -> Result<Arc<Broker>> {
        let repository: Arc<dyn VersionControl> = match &self.repository {
            Some(repo) => Arc::clone(repo),
            None if self.config.no_git => Arc::new(
                PlainDirectory::create(&self.config.repo_dir)
                    .with_context(|| format!("Failed to create {}", self.config.repo_dir.display()))?,
            ),
            None => Arc::new(
                GitRepository::open_or_init(&self.config.repo_dir).with_context(|| {
                    format!("Failed to open repository {}", self.config.repo_dir.display())
                })?,
            ),
        };
        tracing::info!("Repository root: {}", repository.root().display());

        let mut broker = Broker::new(repository).with_event_capacity(self.config.event_capacity);
        if let Some(path) = &self.config.db_path {
            let db = Db::open(path)
                .with_context(|| format!("Failed to open database {}", path.display()))?;
            broker = broker.with_database(db).context("Failed to restore broker state")?;
            tracing::info!("Persistence enabled at {}", path.display());
        }
        Ok(Arc::new(broker))
    }

    /// Serve until the listener fails.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!("Broker listening on {}", listener.local_addr()?);
        let broker = self.build_broker()?;
        axum::serve(listener, web::router(broker)).await?;
        Ok(())
    }

    /// Start serving in the background (for testing).
    /// Returns the bound address, the broker and the server task handle.
    pub async fn start(self) -> Result<(SocketAddr, Arc<Broker>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let broker = self.build_broker()?;
        let app = web::router(Arc::clone(&broker));
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await?;
            Ok(())
        });

        Ok((addr, broker, handle))
    }
}
