use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use line_relay::{
    cli::{Cli, Command},
    client,
    server::{Server, Stopped},
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
            let server = Server::new(listener, args.relay_config());
            let relay = server.relay();
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);

            let Stopped {
                supervisor,
                listener_error,
            } = server.run_until_ctrl_c().await;
            supervisor.shutdown(&relay, args.shutdown_grace()).await;

            if let Some(err) = listener_error {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
