// src/config.rs
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::error::{ServerError, ServerResult};

/// Server construction parameters. Every flag can also come from a
/// `MINUET_*` environment variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "minuet")]
#[command(about = "Epoll-driven static file server with form login", version)]
pub struct Config {
    /// Listen port (1024-65535)
    #[arg(long, env = "MINUET_PORT", default_value_t = 1316)]
    pub port: u16,

    /// Trigger mode: 0 = LT/LT, 1 = conn ET, 2 = listen ET, 3 = ET/ET
    #[arg(long, env = "MINUET_TRIG_MODE", default_value_t = 3)]
    pub trig_mode: u8,

    /// Idle connection timeout in milliseconds; 0 disables reaping
    #[arg(long, env = "MINUET_TIMEOUT_MS", default_value_t = 60000)]
    pub timeout_ms: u64,

    /// Enable SO_LINGER on the listener
    #[arg(long, env = "MINUET_LINGER", default_value_t = false)]
    pub linger: bool,

    /// Credential database host
    #[arg(long, env = "MINUET_DB_HOST", default_value = "127.0.0.1")]
    pub db_host: String,

    /// Credential database port
    #[arg(long, env = "MINUET_DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// Credential database user
    #[arg(long, env = "MINUET_DB_USER", default_value = "minuet")]
    pub db_user: String,

    /// Credential database password
    #[arg(long, env = "MINUET_DB_PASSWORD", default_value = "", hide_env_values = true)]
    pub db_password: String,

    /// Credential database name
    #[arg(long, env = "MINUET_DB_NAME", default_value = "minuet")]
    pub db_name: String,

    /// SQL connection pool size; 0 disables the pool (auth always fails)
    #[arg(long, env = "MINUET_SQL_POOL_SIZE", default_value_t = 8)]
    pub sql_pool_size: usize,

    /// Worker thread count; 0 uses the number of CPUs
    #[arg(long, env = "MINUET_WORKERS", default_value_t = 6)]
    pub workers: usize,

    /// Enable logging
    #[arg(long, env = "MINUET_LOG", default_value_t = true, action = ArgAction::Set)]
    pub log_enabled: bool,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = "MINUET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Buffered-line capacity of the async log writer
    #[arg(long, env = "MINUET_LOG_QUEUE", default_value_t = 1024)]
    pub log_queue_capacity: usize,

    /// Static file root; defaults to <cwd>/resources
    #[arg(long, env = "MINUET_SRC_DIR")]
    pub src_dir: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> ServerResult<()> {
        if self.port < 1024 {
            return Err(ServerError::InvalidConfig(format!(
                "port {} is below 1024",
                self.port
            )));
        }
        Ok(())
    }

    pub fn resolved_src_dir(&self) -> PathBuf {
        match &self.src_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("resources"),
        }
    }

    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1316,
            trig_mode: 3,
            timeout_ms: 60000,
            linger: false,
            db_host: "127.0.0.1".to_string(),
            db_port: 5432,
            db_user: "minuet".to_string(),
            db_password: String::new(),
            db_name: "minuet".to_string(),
            sql_pool_size: 8,
            workers: 6,
            log_enabled: true,
            log_level: "info".to_string(),
            log_queue_capacity: 1024,
            src_dir: None,
        }
    }
}
