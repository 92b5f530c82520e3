//! Reference storage daemon. Spawned by the cluster controller with
//! `--config <node.json>`; logs to `<node dir>/logs/system.log`.

use std::fs::OpenOptions;
use std::sync::Mutex;

use cuttle::config::NodeConfig;
use cuttle::runtime::CuttleRuntime;
use cuttle::sim::SimNode;

fn main() {
    let mut args = std::env::args().skip(1);
    let config_path = match (args.next().as_deref(), args.next()) {
        (Some("--config"), Some(path)) => path,
        _ => {
            eprintln!("usage: cuttled --config <node.json>");
            std::process::exit(2);
        }
    };

    let config = match NodeConfig::load(std::path::Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cuttled: failed to load {config_path}: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("cuttled: failed to open log file: {e}");
        std::process::exit(2);
    }

    let runtime = CuttleRuntime::new(config.worker_threads.max(1));
    if let Err(e) = runtime.block_on(SimNode::run(config)) {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}

fn init_logging(config: &NodeConfig) -> std::io::Result<()> {
    let log_path = config.log_file();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Append across restarts so a rolling upgrade keeps one log history.
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    let filter = tracing_subscriber::EnvFilter::try_from_env("CUTTLE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}
