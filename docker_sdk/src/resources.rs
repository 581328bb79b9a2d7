//! Handles to daemon resources this crate creates

use std::{collections::HashMap, fmt};

use async_trait::async_trait;

use crate::{client::default_client, Client, Result};

pub mod network;
pub mod volume;

/// Multi-valued list filters, e.g. `label` -> `["a=b", "c"]`
pub type Filters = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Network,
    Volume,
}

impl ResourceKind {
    /// The name the daemon uses for the kind in its messages
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource that can be removed from the daemon
#[async_trait]
pub trait TerminableResource: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// The identifier [TerminableResource::terminate] removes by
    fn id(&self) -> &str;

    async fn terminate(&self) -> Result<()>;
}

/// Options for listing resources
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub filters: Filters,
    /// Uses the default client if not set
    pub client: Option<Client>,
}

impl ListOptions {
    /// Adds `value` to the values of the filter `key`
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.entry(key.into()).or_default().push(value.into());
        self
    }

    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }
}

pub(crate) async fn client_or_default(client: Option<Client>) -> Result<Client> {
    match client {
        Some(client) => Ok(client),
        None => default_client().await,
    }
}

/// Removes the resource of `kind` with `id` without needing a handle
pub async fn terminate_by_id(client: &Client, kind: ResourceKind, id: &str) -> Result<()> {
    match kind {
        ResourceKind::Network => network::terminate_network(client, id).await,
        ResourceKind::Volume => {
            volume::terminate_volume(client, id, volume::VolumeTerminateOptions::default()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_filters_accumulate() {
        let opts = ListOptions::default()
            .filter("label", "a=b")
            .filter("label", "c")
            .filter("name", "n");
        assert_eq!(opts.filters["label"], ["a=b", "c"]);
        assert_eq!(opts.filters["name"], ["n"]);
        assert!(opts.client.is_none());
        assert_eq!(ResourceKind::Volume.to_string(), "volume");
    }
}
