//! Hammers one client from many tasks: pings, cached info, and closing while
//! other tasks are still using it

use std::sync::Arc;

use clap::Parser;
use docker_sdk::{default_client, Client, ClientOption, ErrorKind};
use futures::future::try_join_all;
use stacked_errors::{bail, ensure, Result, StackableErr};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about)]
struct Args {
    #[arg(long, default_value_t = 32)]
    tasks: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let client = Client::new([ClientOption::Logger(Some(tracing::info_span!(
        "client_concurrency"
    )))])
    .await
    .stack()?;

    let mut handles = vec![];
    for _ in 0..args.tasks {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.ping().await?;
            client.info().await
        }));
    }
    let infos = try_join_all(handles)
        .await
        .stack()?
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .stack()?;
    // one fetch, every task got the cached snapshot
    ensure!(infos.iter().all(|info| Arc::ptr_eq(info, &infos[0])));
    info!(
        "{} tasks saw daemon {:?}",
        args.tasks,
        infos.first().and_then(|info| info.server_version.clone())
    );

    client.close().await.stack()?;
    match client.info().await {
        Err(e) if e.kind() == ErrorKind::Closed => (),
        other => bail!("expected a closed client, got {other:?}"),
    }
    for _ in 0..3 {
        client.close().await.stack()?;
    }

    // the singleton initializes once for everyone
    let clients = try_join_all((0..args.tasks).map(|_| tokio::spawn(default_client())))
        .await
        .stack()?;
    for client in clients {
        client.stack()?.ping().await.stack()?;
    }
    info!("client concurrency done");
    Ok(())
}
