//! Creates named and daemon named volumes, inspects and lists them, and tears
//! them down, once with `force`

use clap::Parser;
use docker_sdk::{
    cleanup::{try_cleanup, TestCleanup},
    labels::{is_sdk_created, LABEL_VOLUME},
    resources::volume,
    Client, ListOptions, Volume, VolumeCreateOptions, VolumeInspectOptions,
    VolumeTerminateOptions,
};
use stacked_errors::{ensure, ensure_eq, Result, StackableErr};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about)]
struct Args {
    #[arg(long, default_value_t = String::from("docker_sdk_test"))]
    prefix: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let client = Client::new([]).await.stack()?;
    let mut cleanup = TestCleanup::new();

    let name = format!("{}_{}", args.prefix, uuid::Uuid::new_v4().simple());
    let vol = Volume::create(
        VolumeCreateOptions::new(&name)
            .label("purpose", "lifecycle")
            .client(client.clone()),
    )
    .await
    .stack()?;
    cleanup.register(&vol);
    ensure_eq!(vol.name(), name.as_str());
    ensure!(is_sdk_created(&vol.create_response().labels));

    let first = vol.inspect(VolumeInspectOptions::default()).await.stack()?;
    let second = vol.inspect(VolumeInspectOptions::default()).await.stack()?;
    ensure!(std::sync::Arc::ptr_eq(&first, &second));
    ensure!(first.labels.contains_key(LABEL_VOLUME));
    let fresh = vol
        .inspect(VolumeInspectOptions { use_cache: false })
        .await
        .stack()?;
    ensure!(!std::sync::Arc::ptr_eq(&first, &fresh));

    let found = volume::find_by_id(&name, ListOptions::default().client(client.clone()))
        .await
        .stack()?;
    ensure_eq!(found.name, name);
    let labelled = volume::list(
        ListOptions::default()
            .filter("label", "purpose=lifecycle")
            .client(client.clone()),
    )
    .await
    .stack()?;
    ensure!(labelled.iter().any(|v| v.name == name));

    // the daemon picks the name when none is given
    let anonymous = Volume::create(VolumeCreateOptions::default().client(client.clone()))
        .await
        .stack()?;
    ensure!(!anonymous.name().is_empty());
    info!("daemon named volume {}", anonymous.name());
    anonymous
        .terminate_with(VolumeTerminateOptions { force: true })
        .await
        .stack()?;
    // gone already, so this is a no-op
    try_cleanup(&anonymous).await.stack()?;

    cleanup.run().await;
    let err = volume::find_by_id(&name, ListOptions::default().client(client.clone()))
        .await
        .unwrap_err();
    ensure!(err.is_not_found());

    client.close().await.stack()?;
    info!("volume lifecycle done");
    Ok(())
}
