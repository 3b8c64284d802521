use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::Parser;

use sdk::layout::REGION_NAME;
use sdk::shm::SharedRegion;
use worker::{ComputeServer, ServerConfig};

/// NUMA compute worker. One process per NUMA node; the launcher is expected
/// to pin it, the worker does not re-pin itself.
#[derive(Parser, Debug)]
#[command(name = "numa-worker", version)]
struct Args {
    /// This worker's partition id.
    #[arg(long)]
    part_id: usize,

    /// Total worker count.
    #[arg(long)]
    part_cnt: usize,

    /// Compute threads; defaults to the logical CPU count.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Shared region name under /dev/shm.
    #[arg(long, default_value = REGION_NAME)]
    shm_name: String,

    /// Seconds a KV cache may idle before the sweep drops it.
    #[arg(long, default_value_t = 120)]
    kv_idle_secs: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.part_id >= args.part_cnt {
        log::error!("part id {} out of range for {} parts", args.part_id, args.part_cnt);
        std::process::exit(2);
    }

    let threads = if args.threads == 0 {
        num_cpus::get()
    } else {
        args.threads
    };
    let config = ServerConfig {
        part_id: args.part_id,
        part_cnt: args.part_cnt,
        threads,
        kv_idle: Duration::from_secs(args.kv_idle_secs),
    };

    let region = match SharedRegion::open(&args.shm_name) {
        Ok(region) => region,
        Err(e) => {
            log::error!("cannot open shared region: {}", e);
            std::process::exit(1);
        }
    };

    let mut server = match ComputeServer::new(region, config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("cannot start compute server: {}", e);
            std::process::exit(1);
        }
    };

    let stop = AtomicBool::new(false);
    match server.run(&stop) {
        Ok(()) => {}
        Err(worker::ServerError::ParentExited) => {
            log::info!("numa worker {} exit", args.part_id);
        }
        Err(e) => {
            log::error!("compute server terminated: {}", e);
            std::process::exit(1);
        }
    }
}
