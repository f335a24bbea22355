use anyhow::Result;
use clap::Parser;
use tracing::warn;

use chat_file_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    config::RelayConfig,
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
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    args.apply(&mut config);

    let server = Server::bind(config).await?;
    let addr = server.local_addr()?;
    println!("relay listening on {addr}");

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!(code = err.error_code(), "relay exited with error: {err:?}");
        return Err(err.into());
    }
    Ok(())
}
