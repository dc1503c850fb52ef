use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;

mod cli;
mod config;
mod coordinator;
mod db;
mod embedding;
mod protocol;
mod remote;
mod replicate;
#[cfg(test)]
mod tests;
mod worker;

use config::Config;
use coordinator::Coordinator;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = cli::Args::parse();

    let mut config = Config::load_with(Path::new(&args.data_dir));
    if let Some(url) = args.url {
        config.remote.url = url;
    }
    if let Some(anon_key) = args.anon_key {
        config.remote.anon_key = anon_key;
    }

    if config.remote.url.is_empty() {
        bail!("remote url is not configured; set remote.url in config.yaml or pass --url");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(args.command, config))
}

async fn run(command: cli::Command, config: Config) -> anyhow::Result<()> {
    let rest = Arc::new(remote::RestClient::new(
        &config.remote.url,
        &config.remote.anon_key,
    )?);

    let deps = worker::WorkerDeps {
        tuning: config.search.clone(),
        dimensions: db::EMBEDDING_DIM,
        connect: remote::rest_factory(),
        embedder: embedding::fastembed_factory(
            config.search.model.clone(),
            config.cache_dir(),
            Duration::from_secs(config.search.download_timeout_secs),
        ),
    };

    match command {
        cli::Command::Search {
            query,
            wait_ready,
            ready_timeout_secs,
        } => {
            let coordinator = Coordinator::new(deps, rest);
            coordinator.init(&config.remote.url, &config.remote.anon_key)?;

            if wait_ready
                && !coordinator
                    .wait_ready(Duration::from_secs(ready_timeout_secs))
                    .await
            {
                log::warn!("local search database is not ready, falling back to server-side search");
            }

            let matches = coordinator.search(&query).await?;
            println!("{}", serde_json::to_string_pretty(&matches)?);

            coordinator.shutdown().await;
        }

        cli::Command::Replicate { timeout_secs } => {
            let coordinator = Coordinator::new(deps, rest);
            coordinator.init(&config.remote.url, &config.remote.anon_key)?;

            if !coordinator
                .wait_ready(Duration::from_secs(timeout_secs))
                .await
            {
                coordinator.shutdown().await;
                bail!("replication did not complete");
            }

            let (pages, sections) = coordinator.replica_stats().unwrap_or((0, 0));
            println!("replicated {pages} pages, {sections} sections");

            coordinator.shutdown().await;
        }
    }

    Ok(())
}
