//! Daemon endpoint resolution from the docker CLI context store
//!
//! ```text
//! <config-dir>/
//! ├── config.json                 # currentContext
//! └── contexts/
//!     ├── meta/<sha256(name)>/meta.json
//!     └── tls/<sha256(name)>/docker/{ca,cert,key}.pem
//! ```

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{
    config::{config_dir_with_env, ConfigFile, CONFIG_FILE_NAME},
    env::{EnvSource, DOCKER_CERT_PATH, DOCKER_CONTEXT, DOCKER_HOST, DOCKER_TLS_VERIFY},
    Error, Result,
};

/// The context that always exists and is never stored on disk
pub const DEFAULT_CONTEXT: &str = "default";

#[cfg(not(windows))]
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
#[cfg(windows)]
pub const DEFAULT_DOCKER_HOST: &str = "npipe:////./pipe/docker_engine";

const DOCKER_ENDPOINT: &str = "docker";
const META_FILE: &str = "meta.json";
pub const CA_FILE: &str = "ca.pem";
pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContextMeta {
    name: String,
    #[serde(default)]
    endpoints: HashMap<String, EndpointMeta>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointMeta {
    host: String,
    #[serde(rename = "SkipTLSVerify", default)]
    skip_tls_verify: bool,
}

/// A context read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerContext {
    pub name: String,
    pub host: String,
    pub skip_tls_verify: bool,
    /// Set if the context has TLS material stored next to it
    pub tls_dir: Option<PathBuf>,
}

/// Read access to `<config-dir>/contexts`
#[derive(Debug, Clone)]
pub struct ContextStore {
    config_dir: PathBuf,
}

/// The directory name the CLI uses for a context
pub fn context_dir_name(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl ContextStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn with_env(env: &dyn EnvSource) -> Result<Self> {
        Ok(Self::new(config_dir_with_env(env)?))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn meta_dir(&self, name: &str) -> PathBuf {
        self.config_dir
            .join("contexts")
            .join("meta")
            .join(context_dir_name(name))
    }

    pub fn tls_dir(&self, name: &str) -> PathBuf {
        self.config_dir
            .join("contexts")
            .join("tls")
            .join(context_dir_name(name))
            .join(DOCKER_ENDPOINT)
    }

    /// Reads a context. `default` is not stored and resolves to
    /// [DEFAULT_DOCKER_HOST].
    pub async fn inspect(&self, name: &str) -> Result<DockerContext> {
        if name == DEFAULT_CONTEXT {
            return Ok(DockerContext {
                name: name.to_owned(),
                host: DEFAULT_DOCKER_HOST.to_owned(),
                skip_tls_verify: false,
                tls_dir: None,
            })
        }

        let meta_dir = self.meta_dir(name);
        let meta_path = meta_dir.join(META_FILE);
        let json = match tokio::fs::read(&meta_path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ContextNotFound {
                    name: name.to_owned(),
                    path: meta_dir,
                })
            }
            Err(e) => {
                return Err(Error::Io {
                    path: meta_path,
                    source: e,
                })
            }
        };
        let origin = || meta_path.to_string_lossy().into_owned();
        let meta: ContextMeta = serde_json::from_slice(&json).map_err(|e| Error::ConfigInvalid {
            origin: origin(),
            reason: e.to_string(),
        })?;
        if meta.name != name {
            return Err(Error::ConfigInvalid {
                origin: origin(),
                reason: format!("context is named \"{}\", expected \"{name}\"", meta.name),
            })
        }
        let Some(endpoint) = meta.endpoints.get(DOCKER_ENDPOINT) else {
            return Err(Error::ConfigInvalid {
                origin: origin(),
                reason: "context has no docker endpoint".to_owned(),
            })
        };
        if endpoint.host.is_empty() {
            return Err(Error::ConfigInvalid {
                origin: origin(),
                reason: "context docker endpoint has an empty host".to_owned(),
            })
        }

        let tls_dir = self.tls_dir(name);
        let tls_dir = tokio::fs::try_exists(tls_dir.join(CA_FILE))
            .await
            .unwrap_or(false)
            .then_some(tls_dir);

        Ok(DockerContext {
            name: meta.name,
            host: endpoint.host.clone(),
            skip_tls_verify: endpoint.skip_tls_verify,
            tls_dir,
        })
    }

    /// The `currentContext` of `config.json`, `None` if unset or if there is no
    /// config file
    pub async fn current_context(&self) -> Result<Option<String>> {
        match ConfigFile::load_file(self.config_dir.join(CONFIG_FILE_NAME)).await {
            Ok(config) => Ok(Some(config.current_context).filter(|c| !c.is_empty())),
            Err(Error::NotExist { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Where a resolved endpoint came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSource {
    /// An explicit host given to the client
    Override,
    /// `DOCKER_HOST`
    EnvHost,
    /// A named context, from an option, `DOCKER_CONTEXT`, or `currentContext`
    Context(String),
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub host: String,
    pub source: EndpointSource,
    /// TLS material stored with the context, if any
    pub context_tls_dir: Option<PathBuf>,
}

/// Picks the daemon endpoint. Highest precedence first:
///
/// 1. `host_override`
/// 2. `DOCKER_HOST`
/// 3. `context_override`, then `DOCKER_CONTEXT`
/// 4. `currentContext` from `config.json`
/// 5. [DEFAULT_DOCKER_HOST]
pub async fn resolve_endpoint(
    env: &dyn EnvSource,
    host_override: Option<&str>,
    context_override: Option<&str>,
) -> Result<ResolvedEndpoint> {
    if let Some(host) = host_override {
        return Ok(ResolvedEndpoint {
            host: host.to_owned(),
            source: EndpointSource::Override,
            context_tls_dir: None,
        })
    }
    if let Some(host) = env.var(DOCKER_HOST) {
        return Ok(ResolvedEndpoint {
            host,
            source: EndpointSource::EnvHost,
            context_tls_dir: None,
        })
    }

    let store = ContextStore::with_env(env)?;
    let name = match context_override
        .map(ToOwned::to_owned)
        .or_else(|| env.var(DOCKER_CONTEXT))
    {
        Some(name) => Some(name),
        None => store.current_context().await?,
    };
    match name {
        Some(name) => {
            let context = store.inspect(&name).await?;
            tracing::debug!(context.name = %name, context.host = %context.host, "using docker context");
            Ok(ResolvedEndpoint {
                host: context.host,
                source: EndpointSource::Context(name),
                context_tls_dir: context.tls_dir,
            })
        }
        None => Ok(ResolvedEndpoint {
            host: DEFAULT_DOCKER_HOST.to_owned(),
            source: EndpointSource::Default,
            context_tls_dir: None,
        }),
    }
}

/// Paths of the client TLS material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// The daemon endpoint together with its TLS settings. `tls_verify` implies
/// that `cert_path` is set, the constructors enforce this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    host: String,
    tls_verify: bool,
    cert_path: Option<PathBuf>,
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, tls_verify: bool, cert_path: Option<PathBuf>) -> Result<Self> {
        let host = host.into();
        let cert_path = cert_path.filter(|p| !p.as_os_str().is_empty());
        if tls_verify && cert_path.is_none() {
            return Err(Error::ConfigInvalid {
                origin: DOCKER_CERT_PATH.to_owned(),
                reason: format!("TLS verification is enabled for {host} but no cert path is set"),
            })
        }
        Ok(Self {
            host,
            tls_verify,
            cert_path,
        })
    }

    /// TLS settings from `DOCKER_TLS_VERIFY` and `DOCKER_CERT_PATH`
    pub fn with_env(env: &dyn EnvSource, host: impl Into<String>) -> Result<Self> {
        Self::new(
            host,
            env.var_truthy(DOCKER_TLS_VERIFY),
            env.var(DOCKER_CERT_PATH).map(PathBuf::from),
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    pub fn cert_path(&self) -> Option<&Path> {
        self.cert_path.as_deref()
    }

    /// The TLS files to present, if TLS is enabled
    pub fn tls_files(&self) -> Option<TlsFiles> {
        let dir = self.cert_path.as_ref().filter(|_| self.tls_verify)?;
        Some(TlsFiles {
            ca: dir.join(CA_FILE),
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::DOCKER_CONFIG, ErrorKind};

    async fn write_context(config_dir: &Path, name: &str, meta: &str) {
        let store = ContextStore::new(config_dir);
        let dir = store.meta_dir(name);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(META_FILE), meta).await.unwrap();
    }

    fn meta_json(name: &str, host: &str) -> String {
        format!(
            r#"{{"Name":"{name}","Metadata":{{"Description":"test"}},"Endpoints":{{"docker":{{"Host":"{host}","SkipTLSVerify":false}}}}}}"#
        )
    }

    #[test]
    fn dir_name_is_sha256() {
        assert_eq!(
            context_dir_name("default"),
            "37a8eec1ce19687d132fe29051dca629d164e2c4958ba141d5f4133a33f0688f"
        );
    }

    #[tokio::test]
    async fn precedence() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().to_str().unwrap().to_owned();
        write_context(dir.path(), "remote", &meta_json("remote", "tcp://remote:2375")).await;
        write_context(dir.path(), "current", &meta_json("current", "tcp://current:2375")).await;
        tokio::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"currentContext": "current"}"#,
        )
        .await
        .unwrap();

        // DOCKER_HOST beats an explicit context
        let env: HashMap<&str, String> = [
            (DOCKER_CONFIG, config_dir.clone()),
            (DOCKER_HOST, "tcp://foobar:2375".to_owned()),
            (DOCKER_CONTEXT, "remote".to_owned()),
        ]
        .into_iter()
        .collect();
        let resolved = resolve_endpoint(&env, None, Some("default")).await.unwrap();
        assert_eq!(resolved.host, "tcp://foobar:2375");
        assert_eq!(resolved.source, EndpointSource::EnvHost);

        // the host override beats everything
        let resolved = resolve_endpoint(&env, Some("unix:///tmp/d.sock"), None)
            .await
            .unwrap();
        assert_eq!(resolved.source, EndpointSource::Override);

        let mut env = env;
        env.remove(DOCKER_HOST);
        let resolved = resolve_endpoint(&env, None, None).await.unwrap();
        assert_eq!(resolved.host, "tcp://remote:2375");
        assert_eq!(resolved.source, EndpointSource::Context("remote".to_owned()));

        // the option beats DOCKER_CONTEXT
        let resolved = resolve_endpoint(&env, None, Some("default")).await.unwrap();
        assert_eq!(resolved.host, DEFAULT_DOCKER_HOST);

        env.remove(DOCKER_CONTEXT);
        let resolved = resolve_endpoint(&env, None, None).await.unwrap();
        assert_eq!(resolved.host, "tcp://current:2375");

        tokio::fs::remove_file(dir.path().join(CONFIG_FILE_NAME))
            .await
            .unwrap();
        let resolved = resolve_endpoint(&env, None, None).await.unwrap();
        assert_eq!(resolved.source, EndpointSource::Default);
        assert_eq!(resolved.host, DEFAULT_DOCKER_HOST);
    }

    #[tokio::test]
    async fn context_failures() {
        let dir = tempfile::tempdir().unwrap();
        let env: HashMap<&str, String> = [
            (DOCKER_CONFIG, dir.path().to_str().unwrap().to_owned()),
            (DOCKER_CONTEXT, "missing".to_owned()),
        ]
        .into_iter()
        .collect();
        let err = resolve_endpoint(&env, None, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContextNotFound);

        write_context(dir.path(), "broken", "{\"Name\": ").await;
        let store = ContextStore::new(dir.path());
        assert_eq!(
            store.inspect("broken").await.unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );

        write_context(
            dir.path(),
            "no-docker",
            r#"{"Name":"no-docker","Endpoints":{"kubernetes":{"Host":"x"}}}"#,
        )
        .await;
        assert_eq!(
            store.inspect("no-docker").await.unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );
    }

    #[tokio::test]
    async fn context_tls_material() {
        let dir = tempfile::tempdir().unwrap();
        write_context(dir.path(), "secure", &meta_json("secure", "tcp://secure:2376")).await;
        let store = ContextStore::new(dir.path());
        assert_eq!(store.inspect("secure").await.unwrap().tls_dir, None);

        let tls_dir = store.tls_dir("secure");
        tokio::fs::create_dir_all(&tls_dir).await.unwrap();
        tokio::fs::write(tls_dir.join(CA_FILE), "ca").await.unwrap();
        assert_eq!(store.inspect("secure").await.unwrap().tls_dir, Some(tls_dir));
    }

    #[test]
    fn endpoint_tls_invariant() {
        let env: HashMap<&str, &str> = [(DOCKER_TLS_VERIFY, "1")].into_iter().collect();
        let err = EndpointConfig::with_env(&env, "tcp://h:2376").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);

        let env: HashMap<&str, &str> = [(DOCKER_TLS_VERIFY, "1"), (DOCKER_CERT_PATH, "/certs")]
            .into_iter()
            .collect();
        let config = EndpointConfig::with_env(&env, "tcp://h:2376").unwrap();
        assert_eq!(config.tls_files().unwrap().key, PathBuf::from("/certs/key.pem"));

        let config = EndpointConfig::new("tcp://h:2375", false, Some("/certs".into())).unwrap();
        assert_eq!(config.tls_files(), None);
    }
}
