//! Creates, inspects, lists, and tears down a network against the local
//! daemon. Run with `RUST_LOG=debug` to see the "not inspected yet" warning
//! on the first inspect only.

use clap::Parser;
use docker_sdk::{
    cleanup::TestCleanup,
    labels::{is_sdk_created, LABEL_NETWORK},
    resources::network,
    Client, ListOptions, Network, NetworkCreateOptions, NetworkInspectOptions, ResourceKind,
};
use stacked_errors::{bail, ensure, ensure_eq, Result, StackableErr};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about)]
struct Args {
    /// Prefix of the network name, a random suffix is added
    #[arg(long, default_value_t = String::from("docker_sdk_test"))]
    prefix: String,
}

fn random_name(prefix: &str) -> String {
    format!("{prefix}_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let client = Client::new([]).await.stack()?;
    let mut cleanup = TestCleanup::new();

    let name = random_name(&args.prefix);
    let net = Network::create(
        NetworkCreateOptions::new(&name)
            .label("purpose", "lifecycle")
            .client(client.clone()),
    )
    .await
    .stack()?;
    cleanup.register(&net);
    info!("created network {} ({})", net.name(), net.id());

    // cache contract, one round trip for both calls
    let first = net.inspect(NetworkInspectOptions::default()).await.stack()?;
    let second = net.inspect(NetworkInspectOptions::default()).await.stack()?;
    ensure!(std::sync::Arc::ptr_eq(&first, &second));
    let labels = first.labels.clone().unwrap_or_default();
    ensure!(is_sdk_created(&labels));
    ensure!(labels.contains_key(LABEL_NETWORK));
    ensure_eq!(labels.get("purpose").map(String::as_str), Some("lifecycle"));

    let found = network::find_by_name(&name, ListOptions::default().client(client.clone()))
        .await
        .stack()?;
    ensure_eq!(found.id.as_deref(), Some(net.id()));
    let found = network::find_by_id(net.id(), ListOptions::default().client(client.clone()))
        .await
        .stack()?;
    ensure_eq!(found.name.as_deref(), Some(name.as_str()));

    // a duplicate name is a conflict
    let err = Network::create(NetworkCreateOptions::new(&name).client(client.clone()))
        .await
        .unwrap_err();
    if !err.is_conflict() {
        bail!("expected a conflict, got {err}")
    }

    // terminating before the cleanup runs must not fail the cleanup
    net.terminate().await.stack()?;
    let err = network::find_by_name(&name, ListOptions::default().client(client.clone()))
        .await
        .unwrap_err();
    ensure!(err.is_not_found());
    let listed = network::list(
        ListOptions::default()
            .filter("name", &name)
            .client(client.clone()),
    )
    .await
    .stack()?;
    ensure!(listed.is_empty());

    // a second network torn down by ID through an ephemeral client
    let other = Network::create(NetworkCreateOptions::new(random_name(&args.prefix)))
        .await
        .stack()?;
    cleanup
        .cleanup_by_id(ResourceKind::Network, other.id())
        .await
        .stack()?;

    cleanup.run().await;
    client.close().await.stack()?;
    client.close().await.stack()?;
    info!("network lifecycle done");
    Ok(())
}
