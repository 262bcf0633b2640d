//! Ingestion service wiring
//!
//! Connects to the database, prepares the schema and runs one
//! [`DirectoryPipeline`] per inbox. Inboxes are independent and run
//! concurrently; a shared [`CancellationToken`] stops all of them.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::IngestConfig;
use crate::db::create_pool;
use crate::loader::Loader;
use crate::pipeline::{DirectoryPipeline, FileOutcome, PipelineSettings};

pub struct IngestService {
    config: IngestConfig,
    loader: Arc<Loader>,
}

impl IngestService {
    /// Connect and create the schema. Any failure here is fatal at startup.
    pub async fn connect(config: IngestConfig) -> Result<Self> {
        let pool = create_pool(&config.database)
            .await
            .context("Failed to connect to the database")?;

        let loader = Loader::new(pool, config.tables.clone(), config.db_timeout());
        loader
            .ensure_schema()
            .await
            .context("Failed to prepare the database schema")?;

        Ok(Self::with_loader(config, Arc::new(loader)))
    }

    pub fn with_loader(config: IngestConfig, loader: Arc<Loader>) -> Self {
        Self { config, loader }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    /// Verify every inbox can be listed and the quarantine can be created
    pub fn check_directories(&self) -> Result<()> {
        for inbox in &self.config.inbox_paths {
            std::fs::read_dir(inbox)
                .with_context(|| format!("Cannot open inbox {}", inbox.display()))?;
        }
        std::fs::create_dir_all(&self.config.quarantine_path).with_context(|| {
            format!(
                "Cannot create quarantine directory {}",
                self.config.quarantine_path.display()
            )
        })?;
        Ok(())
    }

    fn pipelines(&self) -> Vec<DirectoryPipeline<Loader>> {
        self.config
            .inbox_paths
            .iter()
            .map(|inbox| {
                DirectoryPipeline::new(
                    PipelineSettings::for_inbox(&self.config, inbox),
                    self.loader.clone(),
                )
            })
            .collect()
    }

    /// Drain the current backlog of every inbox once
    pub async fn run_backlog(&self, token: CancellationToken) -> Result<Vec<FileOutcome>> {
        self.check_directories()?;

        let mut tasks = JoinSet::new();
        for mut pipeline in self.pipelines() {
            let token = token.clone();
            tasks.spawn(async move { pipeline.process_backlog(&token).await });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let processed = joined.context("Inbox task panicked")??;
            outcomes.extend(processed);
        }

        info!(files = outcomes.len(), "Backlog processed");
        Ok(outcomes)
    }

    /// Watch every inbox until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        self.check_directories()?;

        let mut tasks = JoinSet::new();
        for pipeline in self.pipelines() {
            info!(inbox = %pipeline.settings().inbox.display(), "Starting inbox pipeline");
            tasks.spawn(pipeline.run(token.clone()));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result.context("Inbox pipeline failed"),
                Err(e) => Err(anyhow::Error::new(e).context("Inbox task panicked")),
            };
            if let Err(e) = result {
                error!(error = %format!("{e:#}"), "Stopping all inboxes");
                token.cancel();
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("All inbox pipelines stopped");
                Ok(())
            },
        }
    }
}
