//! See README.md for more

mod error;
pub use error::*;

/// Environment variables the client reads, behind a seam for tests
pub mod env;
/// Image reference parsing
pub mod image_ref;
/// The docker CLI `config.json`
pub mod config;
/// The docker CLI context store and endpoint resolution
pub mod context;
/// Child processes with recorded output, used to run credential helpers
pub mod command;
pub mod credentials;
/// The [Client] handle
pub mod client;
/// Transports that attach the client headers to every request
pub mod transport;
pub mod labels;
pub mod resources;
pub mod cleanup;

pub use client::{default_client, Client, ClientOption, WeakClient};
pub use credentials::{credentials_for_host, credentials_for_image, CredentialResolver, Credentials};
pub use image_ref::ImageReference;
pub use resources::{
    network::{Network, NetworkCreateOptions, NetworkInspectOptions},
    volume::{Volume, VolumeCreateOptions, VolumeInspectOptions, VolumeTerminateOptions},
    ListOptions, ResourceKind, TerminableResource,
};
// reexport because [Client::docker] hands out the transport
pub use bollard;
