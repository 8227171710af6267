//! Backend node entry point.
//!
//! Parses the CLI, loads the model database, registers with the scheduler
//! and serves until interrupted. A fatal registration failure exits
//! non-zero.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use infernode::config::Cli;
use infernode::ctrl::TcpSchedulerClient;
use infernode::env::{BackendEnvironment, GpuDevice};
use infernode::model::ModelDatabase;
use infernode::node::BackendNode;
use infernode::telemetry::init_logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_config()) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let model_db = match &cli.model_db {
        Some(path) => match ModelDatabase::load(path) {
            Ok(db) => db,
            Err(e) => {
                error!(error = %e, "failed to load model database");
                return ExitCode::FAILURE;
            }
        },
        None => ModelDatabase::new(),
    };

    let config = cli.backend_config();
    let device = GpuDevice::probe(config.gpu);
    let env = BackendEnvironment::new(device, model_db);
    let scheduler = Arc::new(TcpSchedulerClient::new(&config.sch_addr));

    let node = BackendNode::new(config, env, scheduler);
    if let Err(e) = node.run().await {
        error!(error = %e, "backend node failed to start");
        return ExitCode::FAILURE;
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
    node.stop().await;
    ExitCode::SUCCESS
}
