use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    client,
    group::BroadcastPolicy,
    registry::Registry,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let policy = if args.no_echo {
                BroadcastPolicy::ExcludeSender
            } else {
                BroadcastPolicy::IncludeSender
            };
            let registry = Arc::new(Registry::new(policy));
            let server = Server::new(listener, registry, args.max_queue);
            info!("relay listening on {}", server.local_addr()?);
            if let Err(error) = server.run_until_ctrl_c().await {
                warn!("relay exited with error: {error:?}");
                return Err(error);
            }
        }
        Command::Client(args) => client::run(args).await?,
        Command::CreateGroup(args) => client::create_group(args).await?,
    }

    Ok(())
}
