//! Standalone sender binary: `rftp-client <ip> <port> <filepath>` connects
//! out, streams one file, and exits (§2 item 6).

use std::env;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use rftp::Config;

fn usage(program: &str) -> ! {
    eprintln!("usage: {program} <ip> <port> <filepath>");
    process::exit(2);
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("rftp-client");
    let [_, ip, port, filepath] = &args[..] else {
        usage(program);
    };

    let port: u16 = match port.parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("invalid port: {port}");
            process::exit(2);
        }
    };

    let config_dir = dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("rftp");
    let config = match Config::load(&config_dir.join("config.toml")) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            process::exit(1);
        }
    };

    let path = PathBuf::from(filepath);
    let file_size = match path.metadata() {
        Ok(metadata) => metadata.len(),
        Err(err) => {
            eprintln!("failed to stat {}: {err}", path.display());
            process::exit(1);
        }
    };

    let started = Instant::now();
    if let Err(err) = rftp::client::send_file(ip, port, &path, &config) {
        eprintln!("transfer failed: {err}");
        process::exit(1);
    }
    let elapsed = started.elapsed();

    println!(
        "transfer complete: {file_size} bytes in {:.3}s",
        elapsed.as_secs_f64()
    );
}
