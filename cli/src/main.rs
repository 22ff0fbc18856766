use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use partlog_kernel::broker::{Broker, ErrorReply, Request, Response};
use partlog_kernel::config::BrokerConfig;
use partlog_kernel::store::{DocumentStore, InMemoryStore};

/// Partlog broker driver
#[derive(Parser, Debug)]
#[command(name = "partlog")]
#[command(about = "Partitioned event log broker (batch mode)", long_about = None)]
struct Cli {
    /// Path to broker config JSON
    #[arg(long)]
    config: Option<String>,

    /// Path to a JSON array of requests
    #[arg(long)]
    requests: String,

    /// Path to a store snapshot, loaded if present and rewritten on exit
    #[arg(long)]
    store: Option<String>,

    /// Run every request as its own task
    #[arg(long)]
    concurrent: bool,
}

/// Outcome of one request, in input order.
#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum Outcome {
    Ok(Response),
    Error(ErrorReply),
}

async fn execute(broker: &Broker, raw: serde_json::Value) -> Outcome {
    let result = match Request::from_value(raw) {
        Ok(request) => broker.handle(request).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(response) => Outcome::Ok(response),
        Err(e) => {
            warn!(code = e.code(), error = %e, "request failed");
            Outcome::Error(e.reply())
        }
    }
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    // ----------------------------
    // Load config
    // ----------------------------
    let config = if let Some(path) = &cli.config {
        let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        serde_json::from_str::<BrokerConfig>(&data)?
    } else {
        BrokerConfig::default_config()
    };

    // ----------------------------
    // Open store
    // ----------------------------
    let store = match &cli.store {
        Some(path) if Path::new(path).exists() => {
            let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            info!(path = %path, "restoring store snapshot");
            InMemoryStore::from_snapshot(&data)?
        }
        _ => InMemoryStore::new(),
    };
    let store = Arc::new(store);

    // ----------------------------
    // Bootstrap (fatal on failure)
    // ----------------------------
    let (broker, report) = Broker::start(Arc::clone(&store) as Arc<dyn DocumentStore>, config)
        .await
        .context("broker bootstrap failed")?;
    for raise in &report.raised {
        info!(partition = %raise.partition, from = raise.from, to = raise.to, "recovered offset");
    }
    let broker = Arc::new(broker);

    // ----------------------------
    // Serve requests
    // ----------------------------
    let data = fs::read_to_string(&cli.requests)
        .with_context(|| format!("reading {}", cli.requests))?;
    let requests: Vec<serde_json::Value> = serde_json::from_str(&data)?;

    let outcomes = if cli.concurrent {
        let mut tasks = JoinSet::new();
        for (index, raw) in requests.into_iter().enumerate() {
            let broker = Arc::clone(&broker);
            tasks.spawn(async move { (index, execute(&broker, raw).await) });
        }
        let mut indexed = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            indexed.push(joined?);
        }
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, outcome)| outcome).collect()
    } else {
        let mut outcomes = Vec::with_capacity(requests.len());
        for raw in requests {
            outcomes.push(execute(&broker, raw).await);
        }
        outcomes
    };

    // ----------------------------
    // Shutdown
    // ----------------------------
    broker.checkpoint().await?;
    if let Some(path) = &cli.store {
        fs::write(path, store.snapshot()?).with_context(|| format!("writing {path}"))?;
    }

    println!("{}", serde_json::to_string_pretty(&outcomes)?);

    Ok(())
}
