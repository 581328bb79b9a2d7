//! Resolves the registry credentials for images the way a pull would, using
//! the current user's docker config and credential helpers. Secrets are not
//! printed.

use clap::Parser;
use docker_sdk::{credentials_for_image, ImageReference};
use stacked_errors::{Result, StackableErr};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about)]
struct Args {
    #[arg(default_values_t = [String::from("nginx:latest"), String::from("ghcr.io/owner/repo:v1")])]
    images: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    for image in &args.images {
        let reference = ImageReference::parse(image).stack()?;
        let (host, creds) = credentials_for_image(image)
            .await
            .stack_err_with(|| format!("resolving credentials for {reference}"))?;
        let kind = match (&creds.username, &creds.identitytoken) {
            (Some(_), _) => "username and password",
            (None, Some(_)) => "identity token",
            (None, None) => "anonymous",
        };
        info!("{reference} -> {host}: {kind}");
    }
    Ok(())
}
