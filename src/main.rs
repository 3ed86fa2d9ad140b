use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use jwt_blacklist_node::config::Config;
use jwt_blacklist_node::error::NodeError;
use jwt_blacklist_node::master::MasterSession;
use jwt_blacklist_node::scheduler::Scheduler;
use jwt_blacklist_node::server::QueryServer;

#[derive(Parser, Debug)]
#[command(name = "jwt-blacklist-node", about = "Distributed JWT revocation blacklist node")]
struct Args {
    /// Path to the node's configuration file.
    #[arg(short = 'c', long = "config", default_value = "./config.txt")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), NodeError> {
    let config = Config::from_file(&args.config)?;

    let master = Arc::new(MasterSession::connect(config.clone()).await?);
    let (scheduler, _engine) = Scheduler::start(config.clone(), master).await?;
    let server = QueryServer::new(&config, scheduler);

    server.run().await
}
