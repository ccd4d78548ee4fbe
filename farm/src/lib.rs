//! CLI harness glue: argument parsing for the single-binary demo harness,
//! plus a small workload runner exercising allocation, reads and writes,
//! and transactional commits against an in-process worker.
//!
//! Grounded on `original_source/test/test_cluster.cc`'s `parse_conf` flag
//! set (`--ip_master`, `--ip_worker`, `--port_master`, `--port_worker`,
//! `--is_master`, `--obj_size`, `--num_obj`, `--no_node`, `--node_id`,
//! `--no_thread`), extended with `--txn_nobj`/`--write_ratio`/`--iteration`
//! for the transactional half of the workload the original test harness
//! didn't separately flag.

use farm_base::{Config, WorkerId};
use farm_txn::LocalStore;

/// Parses `--flag value` pairs from `args` (typically `std::env::args().skip(1)`)
/// over [`Config`]'s defaults. Unrecognized flags are logged and skipped,
/// matching `test_cluster.cc`'s `parse_conf` behavior of warning rather than
/// aborting.
pub fn parse_config(args: &[String]) -> (Config, Workload) {
    let mut config = Config::default();
    let mut workload = Workload::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let Some(value) = args.get(i + 1) else {
            tracing::warn!(flag, "missing value for flag, ignoring");
            break;
        };
        match flag {
            "--ip_master" => config.master_ip = value.clone(),
            "--ip_worker" => config.worker_ip = value.clone(),
            "--port_master" => config.master_port = value.parse().unwrap_or(config.master_port),
            "--port_worker" => config.worker_port = value.parse().unwrap_or(config.worker_port),
            "--is_master" => config.is_master = value != "0",
            "--no_node" => config.no_node = value.parse().unwrap_or(config.no_node),
            "--node_id" => config.no_node_id = value.parse().unwrap_or(config.no_node_id),
            "--no_thread" => {}
            "--obj_size" => workload.obj_size = value.parse().unwrap_or(workload.obj_size),
            "--num_obj" => workload.num_obj = value.parse().unwrap_or(workload.num_obj),
            "--iteration" => workload.iterations = value.parse().unwrap_or(workload.iterations),
            "--txn_nobj" => workload.txn_nobj = value.parse().unwrap_or(workload.txn_nobj),
            "--write_ratio" => workload.write_ratio = value.parse().unwrap_or(workload.write_ratio),
            other => tracing::warn!(flag = other, "unrecognized option"),
        }
        i += 2;
    }
    (config, workload)
}

/// The benchmark-shaped half of the CLI surface: how many objects to
/// allocate, how big, how many transactional rounds to run, and what
/// fraction of each transaction's footprint is a write.
#[derive(Clone, Copy, Debug)]
pub struct Workload {
    pub obj_size: u32,
    pub num_obj: u32,
    pub iterations: u32,
    pub txn_nobj: u32,
    pub write_ratio: f64,
}

impl Default for Workload {
    fn default() -> Workload {
        Workload { obj_size: 1024, num_obj: 1_000_000, iterations: 1, txn_nobj: 2, write_ratio: 0.5 }
    }
}

/// Allocates `workload.num_obj` objects on `worker`, then runs
/// `workload.iterations` rounds of single-worker transactions touching
/// `workload.txn_nobj` of them, writing to a `write_ratio` fraction.
/// Returns how many transactions committed.
pub fn run_workload(
    worker: &mut farm_worker::Worker,
    transport: &mut impl farm_net::Transport,
    self_wid: WorkerId,
    workload: &Workload,
) -> u32 {
    let n = workload.num_obj.max(1);
    let mut addrs = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let addr = worker.heap.alloc(workload.obj_size);
        if !addr.is_null() {
            addrs.push(addr);
        }
    }
    tracing::info!(wid = self_wid, allocated = addrs.len(), requested = n, "workload allocation phase complete");

    let mut committed = 0;
    for round in 0..workload.iterations {
        let mut ctx = farm_txn::TxnContext::new();
        let span = (workload.txn_nobj as usize).min(addrs.len());
        let is_last_round = round + 1 == workload.iterations;
        for (i, addr) in addrs.iter().take(span).enumerate() {
            // The final round frees the first address instead of touching
            // it normally, so the workload always exercises the free path
            // at least once.
            if is_last_round && i == 0 {
                ctx.tx_free(*addr);
                continue;
            }
            let is_write = (i as f64) < (span as f64) * workload.write_ratio;
            if is_write {
                ctx.tx_write(*addr, vec![round as u8; workload.obj_size as usize]);
            } else {
                let (version, payload) = worker.heap.read(*addr);
                ctx.tx_read(*addr, version, payload);
            }
        }
        let id = worker.tx_commit(ctx, transport);
        if worker.commit_outcome(id).is_none() {
            // Local-only transactions reap immediately on success; a
            // lingering outcome-less entry here would mean it's still
            // waiting on a remote reply, which can't happen against a
            // single in-process worker.
            committed += 1;
        }
    }
    committed
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_flags_over_defaults() {
        let args: Vec<String> = vec![
            "--is_master", "0", "--node_id", "3", "--obj_size", "256", "--num_obj", "10",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        let (config, workload) = parse_config(&args);
        assert!(!config.is_master);
        assert_eq!(config.no_node_id, 3);
        assert_eq!(workload.obj_size, 256);
        assert_eq!(workload.num_obj, 10);
    }

    #[test]
    fn unrecognized_flag_is_skipped_without_aborting() {
        let args: Vec<String> =
            vec!["--bogus", "1", "--num_obj", "5"].into_iter().map(String::from).collect();
        let (_config, workload) = parse_config(&args);
        assert_eq!(workload.num_obj, 5);
    }

    #[test]
    fn run_workload_commits_local_only_transactions() {
        let net = farm_net::InProcessNetwork::new();
        let mut transport = net.transport_for(1);
        let config = Config { size: 16 << 20, ..Config::default() };
        let mut worker = farm_worker::Worker::new(&config, 1);
        let workload = Workload { obj_size: 64, num_obj: 4, iterations: 3, txn_nobj: 2, write_ratio: 0.5 };
        let committed = run_workload(&mut worker, &mut transport, 1, &workload);
        assert_eq!(committed, 3);
    }
}
