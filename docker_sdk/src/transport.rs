//! Connections to the daemon. Every transport built here stamps the client
//! headers onto each request before it is sent.

use std::{path::Path, sync::Arc};

use bollard::{BollardRequest, Docker, API_DEFAULT_VERSION};
use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use hyper_util::{
    client::legacy::{
        connect::{Connect, HttpConnector},
        Client as HttpClient,
    },
    rt::TokioExecutor,
};

use crate::{
    client::TRANSPORT_TIMEOUT_SECS,
    context::{EndpointConfig, TlsFiles},
    Error, Result,
};

/// Validates `headers` into a map. Later entries replace earlier ones with
/// the same name.
pub fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| Error::InvalidArgument(format!("invalid header name \"{key}\": {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidArgument(format!("invalid value for header {key}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn header_transport<C, R>(
    connector: C,
    headers: HeaderMap,
    rewrite_uri: R,
    client_addr: &str,
) -> Result<Docker>
where
    C: Connect + Clone + Send + Sync + 'static,
    R: Fn(&Uri) -> std::result::Result<Uri, bollard::errors::Error> + Send + Sync + 'static,
{
    let mut builder = HttpClient::builder(TokioExecutor::new());
    builder.pool_max_idle_per_host(0);
    let client = Arc::new(builder.build(connector));
    let headers = Arc::new(headers);
    let rewrite_uri = Arc::new(rewrite_uri);
    let docker = Docker::connect_with_custom_transport(
        move |req: BollardRequest| {
            let client = Arc::clone(&client);
            let headers = Arc::clone(&headers);
            let rewrite_uri = Arc::clone(&rewrite_uri);
            async move {
                let (mut parts, body) = req.into_parts();
                parts.uri = rewrite_uri(&parts.uri)?;
                for (name, value) in headers.iter() {
                    parts.headers.insert(name.clone(), value.clone());
                }
                client
                    .request(BollardRequest::from_parts(parts, body))
                    .await
                    .map_err(bollard::errors::Error::from)
            }
        },
        Some(client_addr),
        TRANSPORT_TIMEOUT_SECS,
        API_DEFAULT_VERSION,
    )?;
    Ok(docker)
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map_or("/", |pq| pq.as_str())
}

fn invalid_tls(path: &Path, reason: impl ToString) -> Error {
    Error::ConfigInvalid {
        origin: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })
}

/// Client TLS config trusting only `ca.pem` and presenting `cert.pem` with
/// `key.pem`
fn tls_config(tls: &TlsFiles) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    let ca = read_pem(&tls.ca)?;
    let mut reader = ca.as_slice();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| invalid_tls(&tls.ca, e))?;
        roots.add(cert).map_err(|e| invalid_tls(&tls.ca, e))?;
    }
    if roots.is_empty() {
        return Err(invalid_tls(&tls.ca, "no CA certificate found"))
    }

    let cert = read_pem(&tls.cert)?;
    let mut reader = cert.as_slice();
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| invalid_tls(&tls.cert, e))?;

    let key = read_pem(&tls.key)?;
    let mut reader = key.as_slice();
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| invalid_tls(&tls.key, e))?
        .ok_or_else(|| invalid_tls(&tls.key, "no private key found"))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .and_then(|builder| {
            builder
                .with_root_certificates(roots)
                .with_client_auth_cert(chain, key)
        })
        .map_err(|e| invalid_tls(&tls.cert, e))
}

/// Builds the transport for `endpoint` by its scheme
pub fn connect(endpoint: &EndpointConfig, headers: &[(String, String)]) -> Result<Docker> {
    let headers = header_map(headers)?;
    let host = endpoint.host();
    let Some((scheme, rest)) = host.split_once("://") else {
        return Err(Error::InvalidArgument(format!(
            "docker host \"{host}\" has no scheme"
        )))
    };
    match scheme {
        #[cfg(unix)]
        "unix" => {
            let socket = rest.to_owned();
            if !Path::new(&socket).exists() {
                return Err(bollard::errors::Error::SocketNotFoundError(socket).into())
            }
            // the authority is replaced by the hex encoded socket path
            header_transport(
                hyperlocal::UnixConnector,
                headers,
                move |uri: &Uri| Ok(hyperlocal::Uri::new(&socket, path_and_query(uri)).into()),
                "unix://localhost",
            )
        }
        #[cfg(windows)]
        "npipe" => {
            let pipe = hex::encode(rest);
            header_transport(
                hyper_named_pipe::NamedPipeConnector,
                headers,
                move |uri: &Uri| {
                    Ok(Uri::builder()
                        .scheme(hyper_named_pipe::NAMED_PIPE_SCHEME)
                        .authority(pipe.as_str())
                        .path_and_query(path_and_query(uri))
                        .build()?)
                },
                "npipe://localhost",
            )
        }
        "tcp" | "http" | "https" => {
            let authority = rest.trim_end_matches('/');
            match endpoint.tls_files() {
                Some(tls) => {
                    let mut http = HttpConnector::new();
                    http.enforce_http(false);
                    let https =
                        hyper_rustls::HttpsConnector::from((http, tls_config(&tls)?));
                    header_transport(
                        https,
                        headers,
                        |uri: &Uri| Ok(uri.clone()),
                        &format!("https://{authority}"),
                    )
                }
                None if scheme == "https" => Err(Error::ConfigInvalid {
                    origin: host.to_owned(),
                    reason: "an https endpoint needs TLS material from a cert path".to_owned(),
                }),
                None => header_transport(
                    HttpConnector::new(),
                    headers,
                    |uri: &Uri| Ok(uri.clone()),
                    &format!("http://{authority}"),
                ),
            }
        }
        _ => Err(Error::InvalidArgument(format!(
            "docker host \"{host}\" has an unsupported scheme"
        ))),
    }
}

/// A daemon stand-in that answers every request with `OK` and sends the
/// lowercased request head
#[cfg(test)]
pub(crate) async fn recording_daemon() -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("tcp://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut head = vec![];
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&head).to_lowercase());
            let _ = stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nOK",
                )
                .await;
        }
    });
    (host, rx)
}
