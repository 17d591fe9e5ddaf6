//! converge-sim: runs the convergence engine against an in-memory cloud.
//!
//! The simulated control plane throttles requests, drops create responses
//! after applying them and moves resources through intermediate statuses,
//! so every retry, poll and paging path of the engine gets exercised.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use converge::{ConvergeConfig, Converger, TagSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cloud;
mod error;
mod resource;
mod scenario;

use cloud::{InstanceSpec, SimCloud, SimOptions};
use resource::{Instances, Paging};
use scenario::EventCounter;

/// Convergence engine simulator
#[derive(Parser, Debug)]
#[command(name = "converge-sim", version, about)]
struct Args {
    /// Engine config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed for fault injection
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Probability that a request is throttled
    #[arg(long, default_value = "0.1")]
    throttle_rate: f64,

    /// Probability that an applied create loses its response
    #[arg(long, default_value = "0.2")]
    ambiguous_rate: f64,

    /// Describe calls per status transition
    #[arg(long, default_value = "2")]
    settle_polls: u32,

    /// Simulated API latency in milliseconds
    #[arg(long, default_value = "20")]
    latency_ms: u64,

    /// Make new instances end up Failed
    #[arg(long)]
    fail_creates: bool,

    /// Override the poll interval (ms)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Override the delay before the first poll (ms)
    #[arg(long)]
    poll_delay_ms: Option<u64>,

    /// Override the list page size
    #[arg(long)]
    page_size: Option<u32>,

    /// Override every operation timeout (seconds)
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an instance, optionally resize it, then delete it
    Lifecycle {
        /// Instance name
        #[arg(short, long, default_value = "web")]
        name: String,

        /// Instance type
        #[arg(long, default_value = "ecs.g7.large")]
        instance_type: String,

        /// Resize to this instance type before deleting
        #[arg(long)]
        resize_to: Option<String>,
    },

    /// Seed instances and list them back
    List {
        /// Number of instances to seed
        #[arg(long, default_value = "237")]
        count: usize,

        /// List API to page through
        #[arg(long, value_enum, default_value = "index")]
        paging: Paging,

        /// Keep only instances whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Create an instance and converge its tags twice
    Tags {
        /// First declared tag set (key=value, repeatable)
        #[arg(long = "tag", value_parser = parse_tag)]
        first: Vec<(String, String)>,

        /// Second declared tag set (key=value, repeatable)
        #[arg(long = "then", value_parser = parse_tag)]
        second: Vec<(String, String)>,
    },
}

fn parse_tag(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("expected key=value, got {s:?}"),
    }
}

fn load_config(args: &Args) -> Result<ConvergeConfig> {
    let mut config = match &args.config {
        Some(path) => ConvergeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ConvergeConfig::default(),
    };

    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(ms) = args.poll_delay_ms {
        config.poll_delay_ms = ms;
    }
    if let Some(size) = args.page_size {
        config.page_size = size;
    }
    if let Some(secs) = args.timeout_secs {
        config.timeouts.create_secs = secs;
        config.timeouts.update_secs = secs;
        config.timeouts.delete_secs = secs;
        config.timeouts.read_secs = secs;
    }
    config.validate().context("invalid engine config")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "converge=info,converge_sim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!(
        seed = args.seed,
        throttle_rate = args.throttle_rate,
        ambiguous_rate = args.ambiguous_rate,
        poll_interval_ms = config.poll_interval_ms,
        "Starting simulator"
    );

    let paging = match &args.command {
        Command::List { paging, .. } => *paging,
        _ => Paging::Index,
    };
    let cloud = Arc::new(SimCloud::new(SimOptions {
        seed: args.seed,
        throttle_rate: args.throttle_rate,
        ambiguous_rate: args.ambiguous_rate,
        settle_polls: args.settle_polls,
        fail_creates: args.fail_creates,
        latency: Duration::from_millis(args.latency_ms),
    }));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pending waits");
            on_signal.cancel();
        }
    });

    let counter = Arc::new(EventCounter::default());
    let converger = Converger::new(Arc::new(Instances::new(cloud.clone(), paging)), config)?
        .with_observer(counter.clone())
        .with_cancellation(cancel);

    let report = match args.command {
        Command::Lifecycle {
            name,
            instance_type,
            resize_to,
        } => {
            let spec = InstanceSpec { name, instance_type };
            scenario::lifecycle(&converger, &cloud, &counter, spec, resize_to).await?
        }
        Command::List { count, prefix, .. } => {
            scenario::list(&converger, &cloud, &counter, count, prefix).await?
        }
        Command::Tags { first, second } => {
            let spec = InstanceSpec {
                name: "tagged".to_string(),
                instance_type: "ecs.g7.large".to_string(),
            };
            let first: TagSet = first.into_iter().collect();
            let second: TagSet = second.into_iter().collect();
            scenario::tags(&converger, &cloud, &counter, spec, first, second).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
