use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use async_trait::async_trait;
// `IpamConfig` is reexported because it is part of `Ipam`
pub use bollard::secret::{Ipam, IpamConfig, Network as NetworkInspect, NetworkCreateResponse};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions};

use crate::{
    client::WeakClient,
    labels::{merge_labels, LABEL_NETWORK, SDK_VERSION},
    resources::{client_or_default, ListOptions, ResourceKind, TerminableResource},
    Client, Error, Result,
};

pub const DEFAULT_DRIVER: &str = "bridge";

/// Options for the API equivalent of `docker network create`
#[derive(Debug, Clone, Default)]
pub struct NetworkCreateOptions {
    /// Required, the daemon would otherwise make one up
    pub name: String,
    /// [DEFAULT_DRIVER] if not set
    pub driver: Option<String>,
    pub internal: bool,
    pub attachable: bool,
    pub enable_ipv6: bool,
    /// Driver specific options
    pub options: HashMap<String, String>,
    /// Provenance labels are merged into these
    pub labels: HashMap<String, String>,
    pub ipam: Ipam,
    /// Uses the default client if not set
    pub client: Option<Client>,
}

impl NetworkCreateOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn attachable(mut self, attachable: bool) -> Self {
        self.attachable = attachable;
        self
    }

    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }
}

#[derive(Debug, Clone)]
pub struct NetworkInspectOptions {
    /// Return the cached record if there is one
    pub use_cache: bool,
    /// Include service and task details of swarm networks
    pub verbose: bool,
    /// `swarm`, `global`, or `local`
    pub scope: Option<String>,
}

impl Default for NetworkInspectOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            verbose: false,
            scope: None,
        }
    }
}

impl NetworkInspectOptions {
    /// Always queries the daemon
    pub fn no_cache() -> Self {
        Self {
            use_cache: false,
            ..Default::default()
        }
    }
}

/// A network created through [Network::create]. Clones share the inspect
/// cache.
#[derive(Debug, Clone)]
pub struct Network {
    id: String,
    name: String,
    create_response: NetworkCreateResponse,
    cache: Arc<RwLock<Option<Arc<NetworkInspect>>>>,
    warned_uncached: Arc<AtomicBool>,
    client: WeakClient,
    // what the network was created with, the client is taken out
    opts: NetworkCreateOptions,
}

impl Network {
    /// Creates the network, merging the provenance labels into
    /// `opts.labels`. A warning from the daemon is logged and does not fail
    /// the creation.
    #[tracing::instrument(skip_all,
        fields(
            network.name = %opts.name,
        )
    )]
    pub async fn create(mut opts: NetworkCreateOptions) -> Result<Self> {
        if opts.name.is_empty() {
            return Err(Error::InvalidArgument(
                "network name must not be empty".to_owned(),
            ))
        }
        let client = client_or_default(opts.client.take()).await?;
        let docker = client.docker().await?;

        opts.labels = merge_labels(&opts.labels, LABEL_NETWORK, SDK_VERSION);
        let response = docker
            .create_network(CreateNetworkOptions {
                name: opts.name.clone(),
                check_duplicate: true,
                driver: opts
                    .driver
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DRIVER.to_owned()),
                internal: opts.internal,
                attachable: opts.attachable,
                enable_ipv6: opts.enable_ipv6,
                options: opts.options.clone(),
                labels: opts.labels.clone(),
                ipam: opts.ipam.clone(),
                ..Default::default()
            })
            .await?;

        if !response.warning.is_empty() {
            tracing::warn!(network.id = %response.id, "{}", response.warning);
        }
        tracing::debug!(network.id = %response.id, "created network");

        Ok(Self {
            id: response.id.clone(),
            name: opts.name.clone(),
            create_response: response,
            cache: Default::default(),
            warned_uncached: Default::default(),
            client: client.downgrade(),
            opts,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_response(&self) -> &NetworkCreateResponse {
        &self.create_response
    }

    /// The options the network was created with, labels included
    pub fn create_options(&self) -> &NetworkCreateOptions {
        &self.opts
    }

    pub fn client(&self) -> Result<Client> {
        self.client.upgrade()
    }

    fn cached(&self) -> Option<Arc<NetworkInspect>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the inspect record of the network. With `opts.use_cache` a
    /// previously fetched record is returned as is. Otherwise (or if nothing
    /// was fetched yet) the daemon is queried and the cache replaced.
    #[tracing::instrument(skip_all,
        fields(
            network.id = %self.id,
        )
    )]
    pub async fn inspect(&self, opts: NetworkInspectOptions) -> Result<Arc<NetworkInspect>> {
        let cached = self.cached();
        if opts.use_cache {
            if let Some(cached) = &cached {
                if cached.id.as_deref().is_some_and(|id| !id.is_empty()) {
                    return Ok(Arc::clone(cached))
                }
            }
        }
        if cached.is_none() && !self.warned_uncached.swap(true, Ordering::Relaxed) {
            tracing::warn!("resource not inspected yet, inspecting now");
        }

        let docker = self.client()?.docker().await?;
        let record = docker
            .inspect_network(
                &self.id,
                Some(InspectNetworkOptions {
                    verbose: opts.verbose,
                    scope: opts.scope.unwrap_or_default(),
                }),
            )
            .await?;
        let record = Arc::new(record);
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&record));
        Ok(record)
    }

    /// Removes the network. A "not found" or "removal already in progress"
    /// error is returned, [crate::is_cleanup_safe] tells them apart.
    pub async fn terminate(&self) -> Result<()> {
        let client = self.client()?;
        terminate_network(&client, &self.id).await
    }
}

#[async_trait]
impl TerminableResource for Network {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn terminate(&self) -> Result<()> {
        Network::terminate(self).await
    }
}

/// Removes the network with `id` (or name)
#[tracing::instrument(skip_all, fields(network.id = %id))]
pub async fn terminate_network(client: &Client, id: &str) -> Result<()> {
    let docker = client.docker().await?;
    docker
        .remove_network(id)
        .await
        .map_err(|e| Error::from(e).context(format!("terminating network {id}")))?;
    tracing::debug!("terminated network");
    Ok(())
}

/// Lists the networks matching `opts.filters`, an empty result is not an
/// error
pub async fn list(opts: ListOptions) -> Result<Vec<NetworkInspect>> {
    let client = client_or_default(opts.client).await?;
    let docker = client.docker().await?;
    let networks = docker
        .list_networks(Some(ListNetworksOptions {
            filters: opts.filters,
        }))
        .await?;
    Ok(networks)
}

/// Finds the network with the ID `id`, [Error::NotFound] if there is none
pub async fn find_by_id(id: &str, opts: ListOptions) -> Result<NetworkInspect> {
    // the daemon matches ID prefixes
    let networks = list(opts.filter("id", id)).await?;
    networks
        .into_iter()
        .find(|network| network.id.as_deref().is_some_and(|nid| nid.starts_with(id)))
        .ok_or_else(|| Error::NotFound(format!("network with ID {id}")))
}

/// Finds the network named `name`, [Error::NotFound] if there is none
pub async fn find_by_name(name: &str, opts: ListOptions) -> Result<NetworkInspect> {
    // the daemon matches substrings of names
    let networks = list(opts.filter("name", name)).await?;
    networks
        .into_iter()
        .find(|network| network.name.as_deref() == Some(name))
        .ok_or_else(|| Error::NotFound(format!("network named {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::unreachable_client, ErrorKind};

    fn handle(client: &Client, cached: Option<NetworkInspect>) -> Network {
        Network {
            id: "abc123".to_owned(),
            name: "net".to_owned(),
            create_response: NetworkCreateResponse {
                id: "abc123".to_owned(),
                ..Default::default()
            },
            cache: Arc::new(RwLock::new(cached.map(Arc::new))),
            warned_uncached: Default::default(),
            client: client.downgrade(),
            opts: NetworkCreateOptions::new("net"),
        }
    }

    #[tokio::test]
    async fn empty_name() {
        let err = Network::create(NetworkCreateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn cached_inspect() {
        let client = unreachable_client().await;
        let network = handle(
            &client,
            Some(NetworkInspect {
                id: Some("abc123".to_owned()),
                name: Some("net".to_owned()),
                ..Default::default()
            }),
        );
        let first = network.inspect(Default::default()).await.unwrap();
        let second = network.clone().inspect(Default::default()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // bypassing reaches the daemon, and a failure keeps the cache
        let err = network
            .inspect(NetworkInspectOptions::no_cache())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(!network.warned_uncached.load(Ordering::Relaxed));
        let third = network.inspect(Default::default()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn uncached_inspect() {
        let client = unreachable_client().await;
        let network = handle(&client, None);
        network.inspect(Default::default()).await.unwrap_err();
        assert!(network.warned_uncached.load(Ordering::Relaxed));

        // a record without an ID does not count as cached
        let network = handle(&client, Some(NetworkInspect::default()));
        network.inspect(Default::default()).await.unwrap_err();
        assert!(!network.warned_uncached.load(Ordering::Relaxed));

        drop(client);
        let err = network.terminate().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
