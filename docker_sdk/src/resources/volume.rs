use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use async_trait::async_trait;
pub use bollard::secret::Volume as VolumeInspect;
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};

use crate::{
    client::WeakClient,
    labels::{merge_labels, LABEL_VOLUME, SDK_VERSION},
    resources::{client_or_default, ListOptions, ResourceKind, TerminableResource},
    Client, Error, Result,
};

pub const DEFAULT_DRIVER: &str = "local";

/// Options for the API equivalent of `docker volume create`
#[derive(Debug, Clone, Default)]
pub struct VolumeCreateOptions {
    /// The daemon generates a name if this is empty
    pub name: String,
    /// [DEFAULT_DRIVER] if not set
    pub driver: Option<String>,
    pub driver_opts: HashMap<String, String>,
    /// Provenance labels are merged into these
    pub labels: HashMap<String, String>,
    /// Uses the default client if not set
    pub client: Option<Client>,
}

impl VolumeCreateOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }
}

#[derive(Debug, Clone)]
pub struct VolumeInspectOptions {
    /// Return the cached record if there is one
    pub use_cache: bool,
}

impl Default for VolumeInspectOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeTerminateOptions {
    /// Remove the volume even if it is in use
    pub force: bool,
}

/// A volume created through [Volume::create], addressed by its name. Clones
/// share the inspect cache.
#[derive(Debug, Clone)]
pub struct Volume {
    name: String,
    create_response: Arc<VolumeInspect>,
    cache: Arc<RwLock<Option<Arc<VolumeInspect>>>>,
    warned_uncached: Arc<AtomicBool>,
    client: WeakClient,
}

impl Volume {
    /// Creates the volume, merging the provenance labels into the labels of
    /// `opts`
    #[tracing::instrument(skip_all,
        fields(
            volume.name = %opts.name,
        )
    )]
    pub async fn create(mut opts: VolumeCreateOptions) -> Result<Self> {
        let client = client_or_default(opts.client.take()).await?;
        let docker = client.docker().await?;

        let response = docker
            .create_volume(CreateVolumeOptions {
                name: opts.name,
                driver: opts.driver.unwrap_or_else(|| DEFAULT_DRIVER.to_owned()),
                driver_opts: opts.driver_opts,
                labels: merge_labels(&opts.labels, LABEL_VOLUME, SDK_VERSION),
            })
            .await?;
        tracing::debug!(volume.name = %response.name, "created volume");

        Ok(Self {
            name: response.name.clone(),
            create_response: Arc::new(response),
            cache: Default::default(),
            warned_uncached: Default::default(),
            client: client.downgrade(),
        })
    }

    /// The name, which is also the ID of a volume
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the daemon returned on creation
    pub fn create_response(&self) -> &VolumeInspect {
        &self.create_response
    }

    pub fn client(&self) -> Result<Client> {
        self.client.upgrade()
    }

    fn cached(&self) -> Option<Arc<VolumeInspect>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Same caching as [crate::resources::network::Network::inspect]
    #[tracing::instrument(skip_all,
        fields(
            volume.name = %self.name,
        )
    )]
    pub async fn inspect(&self, opts: VolumeInspectOptions) -> Result<Arc<VolumeInspect>> {
        let cached = self.cached();
        if opts.use_cache {
            if let Some(cached) = &cached {
                if !cached.name.is_empty() {
                    return Ok(Arc::clone(cached))
                }
            }
        }
        if cached.is_none() && !self.warned_uncached.swap(true, Ordering::Relaxed) {
            tracing::warn!("resource not inspected yet, inspecting now");
        }

        let docker = self.client()?.docker().await?;
        let record = Arc::new(docker.inspect_volume(&self.name).await?);
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&record));
        Ok(record)
    }

    pub async fn terminate(&self) -> Result<()> {
        self.terminate_with(VolumeTerminateOptions::default()).await
    }

    pub async fn terminate_with(&self, opts: VolumeTerminateOptions) -> Result<()> {
        let client = self.client()?;
        terminate_volume(&client, &self.name, opts).await
    }
}

#[async_trait]
impl TerminableResource for Volume {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Volume
    }

    fn id(&self) -> &str {
        &self.name
    }

    async fn terminate(&self) -> Result<()> {
        Volume::terminate(self).await
    }
}

#[tracing::instrument(skip_all, fields(volume.name = %name, force = opts.force))]
pub async fn terminate_volume(
    client: &Client,
    name: &str,
    opts: VolumeTerminateOptions,
) -> Result<()> {
    let docker = client.docker().await?;
    docker
        .remove_volume(name, Some(RemoveVolumeOptions { force: opts.force }))
        .await
        .map_err(|e| Error::from(e).context(format!("terminating volume {name}")))?;
    tracing::debug!("terminated volume");
    Ok(())
}

/// Lists the volumes matching `opts.filters`, an empty result is not an
/// error. Warnings from the daemon are logged.
pub async fn list(opts: ListOptions) -> Result<Vec<VolumeInspect>> {
    let client = client_or_default(opts.client).await?;
    let docker = client.docker().await?;
    let response = docker
        .list_volumes(Some(ListVolumesOptions {
            filters: opts.filters,
        }))
        .await?;
    for warning in response.warnings.unwrap_or_default() {
        tracing::warn!("listing volumes: {warning}");
    }
    Ok(response.volumes.unwrap_or_default())
}

/// Finds the volume named `name`, [Error::NotFound] if there is none
pub async fn find_by_id(name: &str, opts: ListOptions) -> Result<VolumeInspect> {
    let volumes = list(opts.filter("name", name)).await?;
    volumes
        .into_iter()
        .find(|volume| volume.name == name)
        .ok_or_else(|| Error::NotFound(format!("volume {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::unreachable_client, ErrorKind};

    fn handle(client: &Client, cached: Option<VolumeInspect>) -> Volume {
        Volume {
            name: "vol".to_owned(),
            create_response: Default::default(),
            cache: Arc::new(RwLock::new(cached.map(Arc::new))),
            warned_uncached: Default::default(),
            client: client.downgrade(),
        }
    }

    #[tokio::test]
    async fn cached_inspect() {
        let client = unreachable_client().await;
        let volume = handle(
            &client,
            Some(VolumeInspect {
                name: "vol".to_owned(),
                ..Default::default()
            }),
        );
        let first = volume.inspect(Default::default()).await.unwrap();
        let second = volume.clone().inspect(Default::default()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let err = volume
            .inspect(VolumeInspectOptions { use_cache: false })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(!volume.warned_uncached.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn terminate_errors() {
        let client = unreachable_client().await;
        let volume = handle(&client, None);
        let err = volume
            .terminate_with(VolumeTerminateOptions { force: true })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(!crate::is_cleanup_safe(Some(&err)));

        client.close().await.unwrap();
        let err = volume.terminate().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert_eq!(TerminableResource::id(&volume), "vol");
    }
}
