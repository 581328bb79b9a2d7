//! Registry credential resolution
//!
//! For a registry host, the sources are consulted in order and the first
//! non-empty `(username, secret)` pair wins:
//!
//! 1. the per-host helper from `credHelpers`
//! 2. the `credsStore` helper
//! 3. the inline `auths` entry
//! 4. the platform default helper, only when no `credsStore` is configured
//!
//! An empty pair is not an error, anonymous pulls need it.

use std::ffi::OsString;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use serde::Deserialize;

use crate::{
    command::Command,
    config::{normalize_auth_key, ConfigFile},
    image_ref::{ImageReference, DEFAULT_REGISTRY},
    Error, Result,
};

pub const HELPER_PREFIX: &str = "docker-credential-";
/// The username a helper returns when the secret is an identity token
pub const TOKEN_USERNAME: &str = "<token>";
/// Helper output meaning there are no credentials for the host
pub const CREDENTIALS_NOT_FOUND: &str = "credentials not found";
/// Helper output meaning the request had no server URL
pub const MISSING_SERVER_URL: &str = "no server URL";
/// The key the docker CLI stores docker hub credentials under
pub const DOCKER_HUB_SERVER_URL: &str = "https://index.docker.io/v1/";

#[cfg(target_os = "macos")]
pub const PLATFORM_DEFAULT_HELPER: &str = "osxkeychain";
#[cfg(windows)]
pub const PLATFORM_DEFAULT_HELPER: &str = "wincred";
#[cfg(not(any(target_os = "macos", windows)))]
pub const PLATFORM_DEFAULT_HELPER: &str = "secretservice";

/// A `(username, secret)` pair. An empty username with a secret means the
/// secret is an identity token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.secret.is_empty()
    }

    /// Converts to what the image endpoints of the daemon take
    pub fn to_docker_credentials(&self, server_address: &str) -> DockerCredentials {
        let nonempty = |s: &str| (!s.is_empty()).then(|| s.to_owned());
        if self.username.is_empty() {
            DockerCredentials {
                identitytoken: nonempty(&self.secret),
                serveraddress: Some(server_address.to_owned()),
                ..Default::default()
            }
        } else {
            DockerCredentials {
                username: nonempty(&self.username),
                password: nonempty(&self.secret),
                serveraddress: Some(server_address.to_owned()),
                ..Default::default()
            }
        }
    }
}

/// What a helper process produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelperOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` if the process was killed by a signal
    pub exit_code: Option<i32>,
}

impl HelperOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs credential helper executables. Implementations return
/// [Error::HelperNotFound] when `program` can not be found.
#[async_trait]
pub trait HelperRunner: Send + Sync {
    async fn run(&self, program: &str, verb: &str, stdin: &[u8]) -> Result<HelperOutput>;
}

/// Runs helpers as child processes found on `PATH` (or on an explicit search
/// path). Dropping the future kills the helper.
#[derive(Debug, Clone, Default)]
pub struct ProcessHelperRunner {
    search_path: Option<OsString>,
}

impl ProcessHelperRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Searches `search_path` (in `PATH` format) instead of `PATH`
    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
        }
    }
}

#[async_trait]
impl HelperRunner for ProcessHelperRunner {
    async fn run(&self, program: &str, verb: &str, stdin: &[u8]) -> Result<HelperOutput> {
        let found = match &self.search_path {
            Some(search_path) => {
                let cwd = std::env::current_dir().map_err(|e| Error::Spawn {
                    program: program.to_owned(),
                    source: e,
                })?;
                which::which_in(program, Some(search_path), cwd)
            }
            None => which::which(program),
        };
        let path = found.map_err(|_| Error::HelperNotFound {
            helper: program.to_owned(),
        })?;
        tracing::debug!(helper = %path.display(), verb, "running credential helper");
        let comres = Command::new_os_str(&path)
            .arg(verb)
            .run_with_input_to_completion(stdin)
            .await?;
        Ok(HelperOutput {
            exit_code: comres.code(),
            stdout: comres.stdout,
            stderr: comres.stderr,
        })
    }
}

#[derive(Deserialize)]
struct HelperResponse {
    #[serde(rename = "Username", default)]
    username: String,
    #[serde(rename = "Secret", default)]
    secret: String,
}

/// The server URL a helper is asked about for a normalized host
pub fn helper_server_url(host: &str) -> &str {
    if host == DEFAULT_REGISTRY {
        DOCKER_HUB_SERVER_URL
    } else {
        host
    }
}

/// Resolves credentials for registry hosts from a [ConfigFile]
#[derive(Debug, Clone)]
pub struct CredentialResolver<R = ProcessHelperRunner> {
    config: ConfigFile,
    runner: R,
}

impl CredentialResolver<ProcessHelperRunner> {
    pub fn new(config: ConfigFile) -> Self {
        Self::with_runner(config, ProcessHelperRunner::new())
    }
}

impl<R: HelperRunner> CredentialResolver<R> {
    pub fn with_runner(config: ConfigFile, runner: R) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// Returns the credentials for `host`, an empty pair if there are none
    #[tracing::instrument(skip_all, fields(registry.host = %host))]
    pub async fn credentials(&self, host: &str) -> Result<Credentials> {
        let host = normalize_auth_key(host);

        if let Some(helper) = self.config.helper_for_host(&host) {
            let creds = self.query_helper(helper, &host).await?;
            if !creds.is_empty() {
                return Ok(creds)
            }
        }

        if !self.config.credentials_store.is_empty() {
            let creds = self
                .query_helper(&self.config.credentials_store, &host)
                .await?;
            if !creds.is_empty() {
                return Ok(creds)
            }
        }

        if let Some(entry) = self.config.auth_for_host(&host) {
            let (username, secret) = entry.credentials()?;
            let creds = Credentials::new(username, secret);
            if !creds.is_empty() {
                return Ok(creds)
            }
        }

        if self.config.credentials_store.is_empty() {
            match self.query_helper(PLATFORM_DEFAULT_HELPER, &host).await {
                Err(Error::HelperNotFound { .. }) => {
                    tracing::debug!("platform default credential helper is not installed");
                }
                res => return res,
            }
        }

        Ok(Credentials::default())
    }

    /// Runs `docker-credential-<store> get` for `host`
    pub async fn query_helper(&self, store: &str, host: &str) -> Result<Credentials> {
        let helper = format!("{HELPER_PREFIX}{store}");
        let server_url = helper_server_url(host);
        let output = self
            .runner
            .run(&helper, "get", server_url.as_bytes())
            .await?;

        if output.success() {
            let response: HelperResponse = serde_json::from_slice(&output.stdout)
                .map_err(|source| Error::HelperDecodeFailed {
                    helper: helper.clone(),
                    source,
                })?;
            if response.username == TOKEN_USERNAME {
                return Ok(Credentials::new("", response.secret))
            }
            return Ok(Credentials::new(response.username, response.secret))
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        match stdout.as_str() {
            CREDENTIALS_NOT_FOUND => {
                tracing::debug!(helper, "no credentials for {server_url}");
                Ok(Credentials::default())
            }
            MISSING_SERVER_URL => Err(Error::MissingServerUrl { helper }),
            _ => Err(Error::HelperExecutionFailed {
                helper,
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                code: output.exit_code,
            }),
        }
    }
}

/// Loads the current user's config and resolves credentials for `host`. A
/// missing config file behaves like an empty one.
pub async fn credentials_for_host(host: &str) -> Result<Credentials> {
    let config = match ConfigFile::load().await {
        Ok(config) => config,
        Err(Error::NotExist { .. }) => ConfigFile::default(),
        Err(e) => return Err(e),
    };
    CredentialResolver::new(config).credentials(host).await
}

/// Parses `image`, then resolves the credentials for its registry. Returns
/// the registry host with the credentials in the form the daemon's image
/// endpoints take.
pub async fn credentials_for_image(image: &str) -> Result<(String, DockerCredentials)> {
    let reference = ImageReference::parse(image)?;
    let host = reference.registry_host().to_owned();
    let creds = credentials_for_host(&host).await?;
    let docker_creds = creds.to_docker_credentials(helper_server_url(&host));
    Ok((host, docker_creds))
}
