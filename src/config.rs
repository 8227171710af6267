//! Command-line surface and derived runtime configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::telemetry::{LogConfig, LogFormat};

/// GPU-backed inference serving node.
#[derive(Debug, Parser)]
#[command(name = "infernode", version, about)]
pub struct Cli {
    /// Port for frontend and peer-backend connections.
    #[arg(long, default_value_t = 8001, env = "INFERNODE_PORT")]
    pub port: u16,

    /// Port for scheduler RPCs (UpdateModelTable, CheckAlive).
    #[arg(long, default_value_t = 8002, env = "INFERNODE_RPC_PORT")]
    pub rpc_port: u16,

    /// Scheduler address, host[:port]; the default scheduler port is
    /// appended when missing.
    #[arg(long, default_value = "127.0.0.1", env = "INFERNODE_SCH_ADDR")]
    pub sch_addr: String,

    /// GPU device id to serve from.
    #[arg(long, default_value_t = 0)]
    pub gpu: u32,

    /// Number of pre/postprocess workers (0 = auto).
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Cores to pin onto: the last one goes to the GPU driver thread, the
    /// rest round-robin to workers.
    #[arg(long, value_delimiter = ',')]
    pub cores: Vec<usize>,

    /// Enable multi batching.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub multi_batch: bool,

    /// Backup backend occupancy valid time in ms.
    #[arg(long, default_value_t = 10)]
    pub occupancy_valid: u64,

    /// Model database file (TOML).
    #[arg(long)]
    pub model_db: Option<PathBuf>,

    /// Log output format: json or pretty.
    #[arg(long, default_value = "json")]
    pub log_format: String,

    /// Log level filter.
    #[arg(long, default_value = "info", env = "INFERNODE_LOG")]
    pub log_level: String,
}

/// Validated node configuration derived from the CLI.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub port: u16,
    pub rpc_port: u16,
    pub sch_addr: String,
    pub gpu: u32,
    pub workers: usize,
    pub cores: Vec<usize>,
    pub multi_batch: bool,
    pub occupancy_valid_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: 8001,
            rpc_port: 8002,
            sch_addr: "127.0.0.1".to_string(),
            gpu: 0,
            workers: 0,
            cores: Vec::new(),
            multi_batch: true,
            occupancy_valid_ms: 10,
        }
    }
}

impl Cli {
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            port: self.port,
            rpc_port: self.rpc_port,
            sch_addr: self.sch_addr.clone(),
            gpu: self.gpu,
            workers: self.workers,
            cores: self.cores.clone(),
            multi_batch: self.multi_batch,
            occupancy_valid_ms: self.occupancy_valid.max(1),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        let format = match self.log_format.as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        LogConfig { format, level: self.log_level.clone() }
    }
}

impl BackendConfig {
    /// Core assignment: the last listed core is the GPU driver's, the rest
    /// are the workers'.
    pub fn split_cores(&self) -> (Option<usize>, Vec<usize>) {
        let mut cores = self.cores.clone();
        let gpu_core = cores.pop();
        (gpu_core, cores)
    }

    /// Worker count: explicit, or 4 with no core list, or one per
    /// remaining pinned core.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        let (_, worker_cores) = self.split_cores();
        if worker_cores.is_empty() {
            4
        } else {
            worker_cores.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["infernode"]);
        let cfg = cli.backend_config();
        assert_eq!(cfg.port, 8001);
        assert_eq!(cfg.rpc_port, 8002);
        assert!(cfg.multi_batch);
        assert_eq!(cfg.occupancy_valid_ms, 10);
        assert_eq!(cfg.effective_workers(), 4);
    }

    #[test]
    fn core_list_feeds_gpu_then_workers() {
        let cli = Cli::parse_from(["infernode", "--cores", "2,3,4,7"]);
        let cfg = cli.backend_config();
        let (gpu_core, worker_cores) = cfg.split_cores();
        assert_eq!(gpu_core, Some(7));
        assert_eq!(worker_cores, vec![2, 3, 4]);
        assert_eq!(cfg.effective_workers(), 3);
    }

    #[test]
    fn multi_batch_can_be_disabled() {
        let cli = Cli::parse_from(["infernode", "--multi-batch", "false"]);
        assert!(!cli.backend_config().multi_batch);
    }

    #[test]
    fn explicit_worker_count_wins() {
        let cli = Cli::parse_from(["infernode", "--workers", "8", "--cores", "1,2"]);
        assert_eq!(cli.backend_config().effective_workers(), 8);
    }
}
