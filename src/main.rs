use clap::Parser;
use tracing::info;

use minuet::{Config, Server};

fn main() -> minuet::ServerResult<()> {
    let cfg = Config::parse();
    cfg.validate()?;

    let _log_guard = minuet::logging::init(&cfg);
    info!(
        port = cfg.port,
        trig_mode = cfg.trig_mode,
        timeout_ms = cfg.timeout_ms,
        linger = cfg.linger,
        sql_pool = cfg.sql_pool_size,
        workers = cfg.resolved_workers(),
        "starting"
    );

    Server::new(cfg)?.run()
}
