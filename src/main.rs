//! qdb-sim: run a quiesce round trip on a simulated cluster.
//!
//! Starts `--ranks` managers on one in-process network, quiesces `--roots`
//! as one set, holds it, then releases it and prints every response.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use quiesce_db::config::QuiesceDbConfig;
use quiesce_db::{InstantAgent, QuiesceDbRequest, QuiesceDbResponse, Rank, SimCluster};

/// CLI options for the simulation.
#[derive(Parser, Debug)]
#[command(name = "qdb-sim")]
struct Args {
    /// Number of ranks in the cluster.
    #[arg(long, env = "QDB_RANKS", default_value_t = 3)]
    ranks: u32,

    /// Rank that leads the cluster.
    #[arg(long, env = "QDB_LEADER", default_value_t = 0)]
    leader: Rank,

    /// Comma-separated roots to quiesce.
    #[arg(long, env = "QDB_ROOTS", value_delimiter = ',', default_value = "/volumes/a,/volumes/b")]
    roots: Vec<String>,

    /// Set id; the leader picks one when empty.
    #[arg(long, env = "QDB_SET_ID")]
    set_id: Option<String>,

    /// Quiesce timeout in milliseconds.
    #[arg(long, env = "QDB_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,

    /// Quiesce expiration in milliseconds.
    #[arg(long, env = "QDB_EXPIRATION_MS", default_value_t = 30_000)]
    expiration_ms: u64,

    /// How long each request waits for its outcome, in milliseconds.
    #[arg(long, env = "QDB_AWAIT_MS", default_value_t = 5_000)]
    await_ms: u64,

    /// How long to hold the set quiesced before releasing it, in milliseconds.
    #[arg(long, env = "QDB_HOLD_MS", default_value_t = 100)]
    hold_ms: u64,

    /// A rank that runs without an agent and so never quiesces.
    #[arg(long, env = "QDB_STUCK_RANK")]
    stuck_rank: Option<Rank>,
}

fn report(label: &str, response: &QuiesceDbResponse) {
    let outcome = match response.result {
        Ok(()) => "ok".to_string(),
        Err(err) => format!("{err} ({})", response.result_code()),
    };
    println!("{label}: {outcome} (db version {}, epoch {})", response.db_version, response.epoch);
    for (set_id, set) in &response.sets {
        println!("  set {set_id}: {} v{}", set.state(), set.db_version);
        for (root, member) in &set.members {
            let excluded = if member.excluded { " (excluded)" } else { "" };
            println!("    {root}: {}{excluded}", member.rstate.state);
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if args.ranks == 0 {
        bail!("--ranks must be at least 1");
    }
    if args.leader >= args.ranks {
        bail!("--leader {} is not one of the {} ranks", args.leader, args.ranks);
    }

    let config = QuiesceDbConfig::default()
        .with_default_timeout(Duration::from_millis(args.timeout_ms))
        .with_default_expiration(Duration::from_millis(args.expiration_ms));
    let mut cluster = SimCluster::new(args.ranks, config);

    let agent = InstantAgent::new();
    for rank in 0..args.ranks {
        if Some(rank) != args.stuck_rank {
            cluster.attach_agent_to(rank, &agent);
        }
    }
    cluster.start(args.leader);
    let leader = Arc::clone(cluster.leader().context("no leader after start")?);

    let await_for = Duration::from_millis(args.await_ms);
    let mut quiesce = QuiesceDbRequest::include(args.roots.iter().map(String::as_str))
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_expiration(Duration::from_millis(args.expiration_ms))
        .with_await(await_for);
    if let Some(set_id) = &args.set_id {
        quiesce = quiesce.with_set_id(set_id.as_str());
    }

    let response = leader.submit_and_wait(quiesce);
    report("quiesce", &response);
    let set_id = response
        .set()
        .map(|(set_id, _)| set_id.clone())
        .context("the leader returned no set")?;

    thread::sleep(Duration::from_millis(args.hold_ms));

    let response = leader.submit_and_wait(QuiesceDbRequest::release(set_id).with_await(await_for));
    report("release", &response);

    println!(
        "agent notifications: {}, payloads delivered: {}",
        agent.notifications(),
        cluster.network().delivered()
    );
    cluster.shutdown();
    Ok(())
}
