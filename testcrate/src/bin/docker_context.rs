//! Shows which endpoint a client resolves to and where published ports are
//! reachable. `DOCKER_HOST` wins over `--context`, so with
//! `DOCKER_HOST=tcp://foobar:2375` this fails the health check.

use clap::Parser;
use docker_sdk::{
    context::{ContextStore, DEFAULT_CONTEXT},
    env::ProcessEnv,
    Client, ClientOption,
};
use stacked_errors::{Result, StackableErr};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about)]
struct Args {
    /// Context to resolve the endpoint from
    #[arg(long, env = "DOCKER_CONTEXT", default_value_t = String::from(DEFAULT_CONTEXT))]
    context: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let store = ContextStore::with_env(&ProcessEnv).stack()?;
    let context = store.inspect(&args.context).await.stack()?;
    info!(
        "context {} points at {} (tls: {:?})",
        context.name, context.host, context.tls_dir
    );
    info!(
        "current context: {:?}",
        store.current_context().await.stack()?
    );

    let client = Client::new([ClientOption::DockerContext(args.context.clone())])
        .await
        .stack_err("building the client")?;
    info!(
        "connected to {} ({:?})",
        client.endpoint().host(),
        client.endpoint_source()
    );
    info!("daemon host: {}", client.daemon_host().await.stack()?);
    for (key, value) in client.headers() {
        info!("header {key}: {value}");
    }
    client.close().await.stack()?;
    Ok(())
}
