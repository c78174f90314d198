use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use common::config::{ConfigFile, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coordinator", about = "partitioned in-memory transaction engine")]
struct Args {
    /// worker threads per coordinator
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// semicolon-separated host:port list, one entry per coordinator
    #[arg(long, default_value = "127.0.0.1:20000")]
    servers: String,

    /// Silo | Scar | TwoPL | RStore | Aria
    #[arg(long, default_value = "Silo")]
    protocol: String,

    #[arg(long, default_value_t = 4)]
    partition_num: usize,

    #[arg(long, default_value_t = 1)]
    replica_num: usize,

    /// seconds to run
    #[arg(long, default_value_t = 10)]
    time: u64,

    #[arg(long, default_value_t = 200_000)]
    keys_per_partition: u64,

    #[arg(long, default_value_t = 10)]
    keys_per_transaction: usize,

    /// percentage of operations that are reads
    #[arg(long, default_value_t = 80)]
    read_ratio: u64,

    /// percentage of accesses that leave the home partition
    #[arg(long, default_value_t = 10)]
    cross_ratio: u64,

    #[arg(long, default_value_t = 0.0)]
    zipf_theta: f64,

    #[arg(long)]
    operation_replication: bool,

    /// optional yaml file with overrides
    #[arg(long)]
    config: Option<PathBuf>,

    /// log to stderr instead of stdout
    #[arg(long)]
    logtostderr: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.logtostderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let server_addrs: Vec<String> = args
        .servers
        .split(';')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let mut context = Context {
        protocol: args.protocol,
        coordinator_num: server_addrs.len(),
        partition_num: args.partition_num,
        worker_num: args.threads,
        replica_num: args.replica_num,
        server_addrs,
        exec_time: args.time,
        keys_per_partition: args.keys_per_partition,
        keys_per_transaction: args.keys_per_transaction,
        read_ratio: args.read_ratio,
        cross_ratio: args.cross_ratio,
        zipf_theta: args.zipf_theta,
        operation_replication: args.operation_replication,
        ..Default::default()
    };

    if let Some(path) = &args.config {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening config file {}", path.display()))?;
        let overrides: ConfigFile = serde_yaml::from_reader(file).context("parsing config file")?;
        overrides.apply(&mut context);
    }

    info!("coordinator starting: {:?}", context.server_addrs);
    let summary = server::run(context)?;
    info!("done, {} transactions committed", summary.n_commit);
    Ok(())
}
