use std::{
    collections::HashMap,
    fmt,
    future::Future,
    path::PathBuf,
    sync::{Arc, LazyLock, OnceLock, Weak},
    time::Duration,
};

use bollard::{secret::SystemInfo, Docker};
use futures::{future::BoxFuture, FutureExt};
use tokio::sync::RwLock;
use tracing::{Instrument, Span};

use crate::{
    context::{resolve_endpoint, EndpointConfig, EndpointSource},
    env::{EnvSource, ProcessEnv},
    labels::SDK_VERSION,
    transport, Error, Result,
};

/// Timeout in seconds handed to the bollard transport
pub const TRANSPORT_TIMEOUT_SECS: u64 = 120;
/// How many times the default health check pings the daemon
pub const PING_ATTEMPTS: u32 = 3;
const DOCKER_ENV_FILE: &str = "/.dockerenv";
const BRIDGE_NETWORK: &str = "bridge";

/// The `User-Agent` this crate identifies itself with
pub fn user_agent() -> String {
    format!("docker-rust-sdk/{SDK_VERSION}")
}

/// Probes the daemon after the transport is built, an `Err` fails client
/// construction
pub type HealthCheck = Arc<dyn Fn(Docker) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps an async closure into a [HealthCheck]
pub fn health_check<F, Fut>(f: F) -> HealthCheck
where
    F: Fn(Docker) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |docker: Docker| f(docker).boxed())
}

/// Pings up to [PING_ATTEMPTS] times, backing off 100 ms, 200 ms, then
/// 300 ms after each failed ping. The last error is returned if no ping
/// succeeds.
pub async fn default_health_check(docker: Docker) -> Result<()> {
    let mut attempt = 1;
    loop {
        let e = match docker.ping().await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        tracing::debug!(attempt, "daemon ping failed: {e}");
        tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
        if attempt == PING_ATTEMPTS {
            return Err(Error::from(e).context(format!(
                "daemon did not respond to {PING_ATTEMPTS} pings"
            )))
        }
        attempt += 1;
    }
}

/// Runs `fut` with a deadline, returning [Error::Timeout] if it elapses.
/// The future is dropped on timeout, which cancels it.
pub async fn with_timeout<T>(
    duration: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| Error::Timeout(format!("operation did not finish within {duration:?}")))?
}

/// Construction options of a [Client], applied in order. Later options of
/// the same kind replace earlier ones, except for `ExtraHeaders` which
/// accumulate.
#[derive(Clone)]
pub enum ClientOption {
    /// Use this endpoint instead of resolving one
    DockerHost(String),
    /// Resolve the endpoint from this context instead of `DOCKER_CONTEXT`
    DockerContext(String),
    /// Overrides the TLS settings from the environment
    Tls {
        verify: bool,
        cert_path: Option<PathBuf>,
    },
    /// Headers sent with every request, in addition to the `User-Agent`
    ExtraHeaders(HashMap<String, String>),
    /// Parent span for everything the client logs. `None` keeps the default.
    Logger(Option<Span>),
    /// Replaces the default health check. `None` is an invalid argument.
    HealthCheck(Option<HealthCheck>),
    /// Use an already built transport, no endpoint is connected to. The
    /// client headers can not be attached to its requests.
    Transport(Docker),
}

impl fmt::Debug for ClientOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DockerHost(host) => f.debug_tuple("DockerHost").field(host).finish(),
            Self::DockerContext(name) => f.debug_tuple("DockerContext").field(name).finish(),
            Self::Tls { verify, cert_path } => f
                .debug_struct("Tls")
                .field("verify", verify)
                .field("cert_path", cert_path)
                .finish(),
            Self::ExtraHeaders(headers) => {
                let keys: Vec<_> = headers.keys().collect();
                f.debug_tuple("ExtraHeaders").field(&keys).finish()
            }
            Self::Logger(span) => f.debug_tuple("Logger").field(span).finish(),
            Self::HealthCheck(check) => f
                .debug_tuple("HealthCheck")
                .field(&check.as_ref().map(|_| ".."))
                .finish(),
            Self::Transport(_) => f.write_str("Transport(..)"),
        }
    }
}

#[derive(Default)]
struct ClientState {
    docker: Option<Docker>,
    info: Option<Arc<SystemInfo>>,
}

struct ClientInner {
    span: Span,
    endpoint: EndpointConfig,
    source: EndpointSource,
    headers: Vec<(String, String)>,
    state: RwLock<ClientState>,
}

/// A handle to a docker daemon. Cloning is cheap and clones share the
/// transport and the cached daemon info.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// A [Client] reference that does not keep the client alive
#[derive(Debug, Clone)]
pub struct WeakClient(Weak<ClientInner>);

impl WeakClient {
    /// Returns [Error::Closed] if every [Client] was dropped
    pub fn upgrade(&self) -> Result<Client> {
        self.0
            .upgrade()
            .map(|inner| Client { inner })
            .ok_or(Error::Closed)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint)
            .field("source", &self.inner.source)
            .finish_non_exhaustive()
    }
}

/// The hostname part of a `host[:port]` authority
fn authority_host(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host)
    }
    authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
}

impl Client {
    /// Builds a client from `opts`, see [ClientOption]. The endpoint is
    /// resolved from the process environment and the docker CLI config
    /// unless overridden, then the health check has to pass.
    pub async fn new(opts: impl IntoIterator<Item = ClientOption>) -> Result<Self> {
        Self::new_with_env(opts, &ProcessEnv).await
    }

    pub(crate) async fn new_with_env(
        opts: impl IntoIterator<Item = ClientOption>,
        env: &dyn EnvSource,
    ) -> Result<Self> {
        let mut host_override = None;
        let mut context_override = None;
        let mut tls_override = None;
        let mut extra_headers = Vec::new();
        let mut span = None;
        let mut check: HealthCheck =
            Arc::new(|docker: Docker| default_health_check(docker).boxed());
        let mut given_transport = None;
        for opt in opts {
            match opt {
                ClientOption::DockerHost(host) => host_override = Some(host),
                ClientOption::DockerContext(name) => context_override = Some(name),
                ClientOption::Tls { verify, cert_path } => tls_override = Some((verify, cert_path)),
                ClientOption::ExtraHeaders(headers) => {
                    let mut headers: Vec<_> = headers.into_iter().collect();
                    headers.sort();
                    extra_headers.extend(headers);
                }
                ClientOption::Logger(logger) => {
                    if logger.is_some() {
                        span = logger;
                    }
                }
                ClientOption::HealthCheck(Some(f)) => check = f,
                ClientOption::HealthCheck(None) => {
                    return Err(Error::InvalidArgument(
                        "health check must not be None".to_owned(),
                    ))
                }
                ClientOption::Transport(docker) => given_transport = Some(docker),
            }
        }

        let resolved =
            resolve_endpoint(env, host_override.as_deref(), context_override.as_deref()).await?;
        let endpoint = match tls_override {
            Some((verify, cert_path)) => EndpointConfig::new(resolved.host, verify, cert_path)?,
            None => {
                let from_env = EndpointConfig::with_env(env, resolved.host.clone())?;
                match resolved.context_tls_dir {
                    Some(dir) if !from_env.tls_verify() => {
                        EndpointConfig::new(resolved.host, true, Some(dir))?
                    }
                    _ => from_env,
                }
            }
        };
        let span = span.unwrap_or_else(|| {
            tracing::debug_span!("docker_client", docker.host = %endpoint.host())
        });

        // the user agent goes last so that nothing can overwrite it
        let mut headers: Vec<(String, String)> = extra_headers
            .into_iter()
            .filter(|(key, _)| !key.eq_ignore_ascii_case("user-agent"))
            .collect();
        headers.push(("User-Agent".to_owned(), user_agent()));

        let docker = match given_transport {
            Some(docker) => {
                tracing::debug!(parent: &span, "using the given transport, headers are not attached");
                docker
            }
            None => transport::connect(&endpoint, &headers)?,
        };
        check(docker.clone()).instrument(span.clone()).await?;
        let docker = match docker.clone().negotiate_version().await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::debug!(parent: &span, "API version negotiation failed, keeping the default: {e}");
                docker
            }
        };
        tracing::debug!(parent: &span, source = ?resolved.source, "docker client ready");

        Ok(Self {
            inner: Arc::new(ClientInner {
                span,
                endpoint,
                source: resolved.source,
                headers,
                state: RwLock::new(ClientState {
                    docker: Some(docker),
                    info: None,
                }),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient(Arc::downgrade(&self.inner))
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.inner.endpoint
    }

    pub fn endpoint_source(&self) -> &EndpointSource {
        &self.inner.source
    }

    /// The headers sent with every request, caller extras first and the
    /// `User-Agent` last
    pub fn headers(&self) -> &[(String, String)] {
        &self.inner.headers
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// The underlying transport, [Error::Closed] after [Client::close]
    pub async fn docker(&self) -> Result<Docker> {
        self.inner.state.read().await.docker.clone().ok_or(Error::Closed)
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.read().await.docker.is_none()
    }

    pub async fn ping(&self) -> Result<()> {
        let docker = self.docker().await?;
        docker.ping().instrument(self.inner.span.clone()).await?;
        Ok(())
    }

    /// Daemon information, fetched on the first call and cached until
    /// [Client::close]. A failed fetch is not cached.
    pub async fn info(&self) -> Result<Arc<SystemInfo>> {
        {
            let state = self.inner.state.read().await;
            if state.docker.is_none() {
                return Err(Error::Closed)
            }
            if let Some(info) = &state.info {
                return Ok(Arc::clone(info))
            }
        }
        let mut state = self.inner.state.write().await;
        // another task may have populated it while we waited
        if let Some(info) = &state.info {
            return Ok(Arc::clone(info))
        }
        let docker = state.docker.clone().ok_or(Error::Closed)?;
        let info = Arc::new(docker.info().instrument(self.inner.span.clone()).await?);
        state.info = Some(Arc::clone(&info));
        Ok(info)
    }

    /// Releases the transport and clears the cached info. Calling this again
    /// is a no-op. Calls already in flight keep their transport clone and
    /// run to completion.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        if state.docker.take().is_some() {
            tracing::debug!(parent: &self.inner.span, "docker client closed");
        }
        state.info = None;
        Ok(())
    }

    /// The host where ports published by the daemon are reachable. For
    /// socket endpoints this is `localhost`, or the gateway of the bridge
    /// network when running inside a container.
    pub async fn daemon_host(&self) -> Result<String> {
        let host = self.inner.endpoint.host();
        let (scheme, rest) = host.split_once("://").unwrap_or(("", host));
        match scheme {
            "tcp" | "http" | "https" => {
                let authority = rest.split('/').next().unwrap_or_default();
                Ok(authority_host(authority).to_owned())
            }
            "unix" | "npipe" => {
                if !tokio::fs::try_exists(DOCKER_ENV_FILE)
                    .await
                    .unwrap_or(false)
                {
                    return Ok("localhost".to_owned())
                }
                let docker = self.docker().await?;
                let bridge = docker
                    .inspect_network::<String>(BRIDGE_NETWORK, None)
                    .await
                    .map_err(|e| Error::from(e).context("inspecting the bridge network"))?;
                let gateway = bridge
                    .ipam
                    .and_then(|ipam| ipam.config)
                    .and_then(|configs| configs.into_iter().find_map(|config| config.gateway));
                match gateway {
                    Some(gateway) if !gateway.is_empty() => Ok(gateway),
                    _ => {
                        tracing::warn!(
                            parent: &self.inner.span,
                            "bridge network has no gateway, using localhost"
                        );
                        Ok("localhost".to_owned())
                    }
                }
            }
            _ => Err(Error::InvalidArgument(format!(
                "can not determine the daemon host of \"{host}\""
            ))),
        }
    }
}

/// Returns the process-wide client built from the environment. The first
/// call initializes it, and if that fails every call returns the same
/// captured error.
pub async fn default_client() -> Result<Client> {
    static DEFAULT_CLIENT: OnceLock<Result<Client, Arc<Error>>> = OnceLock::new();
    static INIT_LOCK: LazyLock<tokio::sync::Mutex<()>> = LazyLock::new(Default::default);

    fn shared(res: &Result<Client, Arc<Error>>) -> Result<Client> {
        match res {
            Ok(client) => Ok(client.clone()),
            Err(e) => Err(Error::Init(Arc::clone(e))),
        }
    }

    // fast path, then a slow path that does not block the runtime
    if let Some(res) = DEFAULT_CLIENT.get() {
        return shared(res)
    }
    let _init_lock = INIT_LOCK.lock().await;
    if let Some(res) = DEFAULT_CLIENT.get() {
        return shared(res)
    }
    let res = Client::new([]).await.map_err(Arc::new);
    if let Err(e) = &res {
        tracing::warn!("default docker client failed to initialize: {e}");
    }
    shared(DEFAULT_CLIENT.get_or_init(|| res))
}

/// A client for a dead endpoint that skips the health check
#[cfg(test)]
pub(crate) async fn unreachable_client() -> Client {
    Client::new_with_env(
        [
            ClientOption::DockerHost("tcp://127.0.0.1:1".to_owned()),
            ClientOption::HealthCheck(Some(health_check(|_| async { Ok(()) }))),
        ],
        &HashMap::<String, String>::new(),
    )
    .await
    .unwrap()
}
