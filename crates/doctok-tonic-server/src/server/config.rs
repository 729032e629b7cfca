//! Command-line and environment configuration.
//!
//! Every flag can also be set through the environment variable named next to
//! it (a `.env` file is loaded first). [`CliArgs`] is the raw input;
//! [`ServerConfig`] is the validated form the server runs with.

use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use doctok_tonic_core::doctok::{
    OrchestratorConfig, PipelineSettings, ProgressStrategy, ServiceConfig,
};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "gRPC server for project tokenization")]
pub struct CliArgs {
    /// Address to bind the gRPC server to.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:50051")]
    pub server_addr: String,

    /// Maximum number of concurrently running background tasks.
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Seconds to let running tasks drain on shutdown before cancelling them.
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout: u64,

    /// Records tokenized and committed per batch chunk.
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 500)]
    pub chunk_size: usize,

    /// Push non-text data to blob storage every n-th chunk.
    #[arg(long, env = "SYNC_EVERY", default_value_t = 10)]
    pub sync_every: usize,

    /// Refresh the batch session (and re-read the task) every n-th chunk.
    #[arg(long, env = "REFRESH_EVERY", default_value_t = 10)]
    pub refresh_every: usize,

    /// Records per statistics page.
    #[arg(long, env = "STATS_PAGE_SIZE", default_value_t = 100)]
    pub stats_page_size: usize,

    /// Refresh the statistics session every n-th page.
    #[arg(long, env = "STATS_REFRESH_EVERY", default_value_t = 20)]
    pub stats_refresh_every: usize,

    /// Blob visibility checks before a statistics task fails.
    #[arg(long, env = "BLOB_WAIT_RETRIES", default_value_t = 10)]
    pub blob_wait_retries: u32,

    /// Milliseconds between two blob visibility checks.
    #[arg(long, env = "BLOB_WAIT_INTERVAL_MS", default_value_t = 1_000)]
    pub blob_wait_interval_ms: u64,

    /// Batch progress strategy: `fixed` or `remaining`.
    #[arg(long, env = "BATCH_PROGRESS", default_value = "fixed")]
    pub batch_progress: String,

    /// Minimum seconds between two progress events of one task kind.
    #[arg(long, env = "THROTTLE_SECS", default_value_t = 5)]
    pub throttle_secs: u64,

    /// Comma-separated tokenizer configuration identifiers that may be loaded.
    #[arg(
        long,
        env = "TOKENIZER_ALLOW_LIST",
        value_delimiter = ',',
        default_value = "en_core_web_sm"
    )]
    pub tokenizer_allow_list: Vec<String>,

    /// Persist a tokenizer descriptor per project for the inference side.
    #[arg(long, env = "IS_MANAGED", default_value_t = false)]
    pub is_managed: bool,

    /// Directory receiving the exported non-text data per project.
    #[arg(long, env = "EXPORT_DIR", default_value = "./data/export")]
    pub export_dir: PathBuf,

    /// Directory receiving per-project tokenizer descriptors in managed mode.
    #[arg(long, env = "INFERENCE_DIR", default_value = "./data/inference")]
    pub inference_dir: PathBuf,

    /// JSON file with projects, attributes and records to start from.
    #[arg(long, env = "SEED_FILE")]
    pub seed_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub num_workers: usize,
    pub shutdown_timeout: Duration,
    pub throttle_period: Duration,
    pub pipeline: PipelineSettings,
    pub service: ServiceConfig,
    pub export_dir: PathBuf,
    pub inference_dir: PathBuf,
    pub seed_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            num_workers: self.num_workers,
            shutdown_timeout: self.shutdown_timeout,
            throttle_period: self.throttle_period,
            inference_dir: self.service.is_managed.then(|| self.inference_dir.clone()),
            pipeline: self.pipeline.clone(),
            ..OrchestratorConfig::default()
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        for (name, value) in [
            ("num-workers", args.num_workers),
            ("chunk-size", args.chunk_size),
            ("sync-every", args.sync_every),
            ("refresh-every", args.refresh_every),
            ("stats-page-size", args.stats_page_size),
            ("stats-refresh-every", args.stats_refresh_every),
        ] {
            if value == 0 {
                bail!("{name} must be greater than 0");
            }
        }

        let tokenizer_allow_list: Vec<String> = args
            .tokenizer_allow_list
            .into_iter()
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty())
            .collect();
        if tokenizer_allow_list.is_empty() {
            bail!("tokenizer-allow-list must name at least one tokenizer");
        }

        let batch_progress: ProgressStrategy = args
            .batch_progress
            .parse()
            .context("invalid batch-progress")?;

        Ok(Self {
            server_addr: args.server_addr,
            num_workers: args.num_workers,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            throttle_period: Duration::from_secs(args.throttle_secs),
            pipeline: PipelineSettings {
                chunk_size: args.chunk_size,
                sync_every: args.sync_every,
                refresh_every: args.refresh_every,
                statistics_page_size: args.stats_page_size,
                statistics_refresh_every: args.stats_refresh_every,
                blob_wait_retries: args.blob_wait_retries,
                blob_wait_interval: Duration::from_millis(args.blob_wait_interval_ms),
                batch_progress,
            },
            service: ServiceConfig {
                tokenizer_allow_list,
                is_managed: args.is_managed,
            },
            export_dir: args.export_dir,
            inference_dir: args.inference_dir,
            seed_file: args.seed_file,
        })
    }
}
