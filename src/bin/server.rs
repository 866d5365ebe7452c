//! Standalone receiver binary: reads config from the well-known user
//! config directory, opens the RDMA device, and serves connections until
//! killed (§4.6).

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use rftp::device::{DeviceContext, PoolBudget};
use rftp::Config;

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("rftp")
}

fn main() {
    env_logger::init();

    let dir = config_dir();
    let config_path = dir.join("config.toml");
    let settings_path = dir.join("settings.txt");

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config from {}: {err}", config_path.display());
            process::exit(1);
        }
    };

    let per_connection_bytes = config.block_size_bytes() * config.block_num as usize;
    let device = match DeviceContext::init(
        config.rdma_gid_index,
        1,
        PoolBudget::Bounded(per_connection_bytes * config.max_thread_num as usize),
    ) {
        Ok(device) => Arc::new(device),
        Err(err) => {
            eprintln!("failed to open RDMA device: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = rftp::server::serve(device, Arc::new(config), settings_path) {
        eprintln!("server exited: {err}");
        process::exit(1);
    }
}
