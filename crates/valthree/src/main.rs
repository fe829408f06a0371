//! Valthree CLI entry point.
//!
//! `serve` runs a node; `workload` exercises a cluster continuously and
//! checks the recorded histories for strong serializability.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use antithesis_sdk::{assert_unreachable, lifecycle};
use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Barrier;

use valthree::client::Client;
use valthree::proptest;
use valthree::server::{Config, Server};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "valthree", about = "A key-value database backed by object storage")]
struct Args {
    /// Emit logs in JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Emit debug logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Serve(ServeArgs),
    Workload(WorkloadArgs),
}

/// CLI options for running a node.
#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:6379")]
    addr: String,

    /// Database name.
    #[arg(long, default_value = "valthree")]
    name: String,

    /// Maximum number of stored keys.
    #[arg(long, default_value_t = 16384)]
    max_keys: usize,

    /// Object storage address.
    #[arg(long, default_value = "http://minio:9000")]
    s3_addr: String,

    /// Object storage region.
    #[arg(long, default_value = "us-east-1")]
    s3_region: String,

    /// Object storage bucket.
    #[arg(long, default_value = "valthree")]
    s3_bucket: String,

    /// Object storage user.
    #[arg(long, default_value = "admin")]
    s3_user: String,

    /// Object storage password.
    #[arg(long, default_value = "password")]
    s3_pass: String,

    /// Object storage timeout.
    #[arg(long, default_value = "1m")]
    s3_timeout: humantime::Duration,
}

/// CLI options for running the continuous workload.
#[derive(Parser, Debug)]
struct WorkloadArgs {
    /// Valthree cluster address(es).
    #[arg(long, default_value = "127.0.0.1:6379", value_delimiter = ',')]
    addrs: Vec<String>,

    /// Model checking timeout.
    #[arg(long, default_value = "1h")]
    check_timeout: humantime::Duration,

    /// Directory for storing debugging artifacts.
    #[arg(long, default_value = ".")]
    artifacts: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    antithesis_sdk::antithesis_init();
    let args = Args::parse();
    init_logging(args.json, args.verbose);
    match args.cmd {
        Command::Serve(args) => serve(args).await,
        Command::Workload(args) => workload(args).await,
    }
}

fn init_logging(json: bool, verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default.into());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Run a node until SIGINT/SIGTERM.
async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let server = Arc::new(
        Server::new(Config {
            database_name: args.name,
            max_items: args.max_keys,
            s3_endpoint: args.s3_addr,
            s3_region: args.s3_region,
            s3_bucket: args.s3_bucket,
            s3_user: args.s3_user,
            s3_password: args.s3_pass,
            s3_timeout: args.s3_timeout.into(),
        })
        .await,
    );

    let listener = TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("listen on {}", args.addr))?;
    tracing::info!(addr = %args.addr, "starting server");

    let task = tokio::spawn({
        let server = server.clone();
        async move {
            if let Err(err) = server.serve(listener).await {
                tracing::error!(error = ?err, "serve failed");
            }
        }
    });

    shutdown_signal().await?;
    server.close();
    task.await.context("server task panicked")?;
    Ok(())
}

/// Run the continuous workload: ping the cluster, signal readiness, then
/// exercise and verify forever.
async fn workload(args: WorkloadArgs) -> anyhow::Result<()> {
    anyhow::ensure!(!args.addrs.is_empty(), "--addrs must not be empty");

    // Before faults are injected, the platform lets us verify that the
    // system is up and running: wait for every server to answer a PING.
    for addr in &args.addrs {
        let client = dial(addr).await;
        tracing::debug!(server_addr = %addr, "pinged server");
        drop(client);
    }
    tracing::info!(cluster_addrs = ?args.addrs, "setup complete");
    lifecycle::setup_complete(&json!({ "cluster_addrs": &args.addrs }));

    tokio::spawn(async {
        if shutdown_signal().await.is_ok() {
            std::process::exit(0);
        }
    });

    let check_timeout: Duration = args.check_timeout.into();
    let mut iterations = 0usize;
    loop {
        exercise_and_verify(iterations, &args.addrs, check_timeout, &args.artifacts).await?;
        iterations += 1;
    }
}

/// One workload iteration: flush, generate, run concurrently, verify.
async fn exercise_and_verify(
    iteration: usize,
    addrs: &[String],
    check_timeout: Duration,
    artifact_dir: &Path,
) -> anyhow::Result<()> {
    let seed: u64 = rand::thread_rng().gen();

    // Return the cluster to a known state before this run, so an unclean
    // shutdown cannot poison subsequent runs.
    tracing::debug!(seed, cluster_addrs = ?addrs, "flushing cluster");
    loop {
        let mut client = dial(&addrs[0]).await;
        match client.flush_all().await {
            Ok(()) => break,
            Err(err) => {
                tracing::debug!(error = %err, retry_after = "1s", "flush failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    // Generate a concurrent, randomized workload: a set of instructions
    // telling each client to run a series of GET, SET, and DEL commands on a
    // small set of keys.
    tracing::debug!(seed, "generating new workload");
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut workloads = proptest::gen_workloads(&mut rng);
    // Early iterations run without concurrency, purely for demonstration.
    const SERIAL_ITERATIONS: usize = 16;
    if iteration < SERIAL_ITERATIONS && workloads.len() > 1 {
        workloads.truncate(1);
    }
    if iteration == SERIAL_ITERATIONS {
        tracing::info!("allowing concurrent workloads");
    }

    // Run the workload, recording the timing and result of each operation.
    // To maximize concurrent work, block each client until all the clients
    // are ready to begin.
    tracing::debug!(seed, clients = workloads.len(), "running workload");
    let barrier = Arc::new(Barrier::new(workloads.len()));
    let mut tasks = Vec::with_capacity(workloads.len());
    for (i, mut workload) in workloads.into_iter().enumerate() {
        let addr = addrs[i % addrs.len()].clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = dial(&addr).await;
            barrier.wait().await;
            proptest::run_workload(&mut client, &mut workload).await;
            workload
        }));
    }
    let mut completed = Vec::with_capacity(tasks.len());
    for task in tasks {
        completed.push(task.await.context("client task panicked")?);
    }
    tracing::debug!(seed, "workload complete");

    // Verify that the operations on each key are linearizable - and
    // therefore that the store as a whole is strong serializable. Checking
    // is CPU-bound, so keep it off the runtime workers.
    let result =
        tokio::task::spawn_blocking(move || proptest::check_workloads(check_timeout, &completed))
            .await
            .context("check task panicked")?;

    match result {
        Ok(progress) => {
            tracing::info!(
                seed,
                percent_success = %format!("{:.1}", progress * 100.0),
                "strong serializability verified"
            );
        }
        Err(err) if err.timed_out => {
            // A model-checking timeout is not a system failure.
            tracing::warn!(seed, error = %err, "model checking timed out");
        }
        Err(err) => {
            let fname = format!("consistency-failure-{}.html", err.key);
            let fpath = artifact_dir.join(fname);
            if let Err(write_err) = std::fs::write(&fpath, &err.visualization) {
                tracing::error!(error = %write_err, key = %err.key, "write model visualization failed");
            } else {
                tracing::info!(path = %fpath.display(), key = %err.key, "wrote model visualization");
            }
            assert_unreachable!(
                "Database is strong serializable",
                &json!({ "error": err.to_string() })
            );
            tracing::error!(seed, error = %err, "strong serializability violated");
        }
    }
    Ok(())
}

/// Dial an address, retrying until the server answers a PING.
async fn dial(addr: &str) -> Client {
    loop {
        match Client::dial(addr).await {
            Ok(mut client) => match client.ping().await {
                Ok(()) => return client,
                Err(err) => {
                    tracing::debug!(server_addr = %addr, error = %err, retry_after = "1s", "ping failed");
                }
            },
            Err(err) => {
                tracing::debug!(server_addr = %addr, error = %err, retry_after = "1s", "dial failed");
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("install SIGINT handler")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("install SIGINT handler")?;
    Ok(())
}
