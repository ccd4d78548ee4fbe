//! Single-binary demo harness: parses the `test_cluster`-style CLI flags,
//! spins up one worker over the in-process transport, and runs the
//! allocation/transaction workload against it. A real deployment runs one
//! of these per node talking over a real [`farm_net::Transport`]
//! implementation; that transport is out of scope here (spec §1), so this
//! binary demonstrates the worker and protocol logic end to end on a single
//! process instead of standing up a cluster.

use std::env;

use farm::{parse_config, run_workload};

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let (config, workload) = parse_config(&args);

    tracing::info!(?config.no_node_id, is_master = config.is_master, "starting farm node");

    let net = farm_net::InProcessNetwork::new();
    let mut transport = net.transport_for(config.no_node_id);
    let mut worker = farm_worker::Worker::new(&config, config.no_node_id);

    let committed = run_workload(&mut worker, &mut transport, config.no_node_id, &workload);
    println!("committed {committed}/{} transactions", workload.iterations);
}
