use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{
    env::{EnvSource, ProcessEnv, DOCKER_AUTH_CONFIG, DOCKER_CONFIG},
    image_ref::normalize_registry,
    Error, Result,
};

pub const CONFIG_FILE_NAME: &str = "config.json";
const CONFIG_DIR_NAME: &str = ".docker";

/// One entry of the `auths` map in `config.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// base64 of `username:password`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(
        rename = "identitytoken",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub identity_token: String,
    #[serde(
        rename = "registrytoken",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub registry_token: String,
    #[serde(
        rename = "serveraddress",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub server_address: String,
}

/// Decodes a base64 `user:pass` pair, splitting on the first `:`
pub fn decode_auth(auth: &str) -> Result<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth.trim())
        .map_err(|e| Error::InvalidArgument(format!("auth is not valid base64: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| Error::InvalidArgument("decoded auth is not valid UTF-8".to_owned()))?;
    match decoded.split_once(':') {
        Some((user, pass)) => Ok((user.to_owned(), pass.to_owned())),
        None => Err(Error::InvalidArgument(
            "decoded auth is not of the form user:password".to_owned(),
        )),
    }
}

impl AuthEntry {
    /// Returns the `(username, secret)` pair this entry holds. An identity
    /// token takes precedence and is returned with an empty username. An
    /// entry with nothing in it returns an empty pair.
    pub fn credentials(&self) -> Result<(String, String)> {
        if !self.identity_token.is_empty() {
            return Ok((String::new(), self.identity_token.clone()))
        }
        if !(self.username.is_empty() || self.password.is_empty()) {
            return Ok((self.username.clone(), self.password.clone()))
        }
        if !self.auth.is_empty() {
            return decode_auth(&self.auth)
        }
        Ok(Default::default())
    }
}

/// The `proxies` entry for one daemon
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_proxy: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub https_proxy: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub no_proxy: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ftp_proxy: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub all_proxy: String,
}

/// The docker CLI `config.json`. Keys of `auth_configs` and
/// `credential_helpers` are normalized registry hostnames after loading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(rename = "auths", default, skip_serializing_if = "HashMap::is_empty")]
    pub auth_configs: HashMap<String, AuthEntry>,
    #[serde(rename = "credsStore", default, skip_serializing_if = "String::is_empty")]
    pub credentials_store: String,
    #[serde(rename = "credHelpers", default, skip_serializing_if = "HashMap::is_empty")]
    pub credential_helpers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub proxies: HashMap<String, ProxyConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_context: String,
    #[serde(rename = "HttpHeaders", default, skip_serializing_if = "HashMap::is_empty")]
    pub http_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ps_format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub images_format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub networks_format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volumes_format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stats_format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detach_keys: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub experimental: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cli_plugins_extra_dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub aliases: HashMap<String, String>,
    /// Keys this type does not model, kept so nothing is lost
    #[serde(flatten)]
    pub other: HashMap<String, serde_json::Value>,
}

/// Normalizes an `auths` or `credHelpers` key: `https://index.docker.io/v1/`
/// becomes `index.docker.io`, `https://ghcr.io` becomes `ghcr.io`.
pub fn normalize_auth_key(key: &str) -> String {
    let host = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = host.split('/').next().unwrap_or_default();
    normalize_registry(host)
}

/// Rekeys `map` with [normalize_auth_key]. When several keys normalize to
/// the same host, a key that is already normalized wins, then the smallest
/// key.
fn normalize_keys<V>(map: &mut HashMap<String, V>) {
    let mut entries: Vec<(String, String, V)> = map
        .drain()
        .map(|(key, value)| (normalize_auth_key(&key), key, value))
        .collect();
    entries.sort_by(|(norm_a, key_a, _), (norm_b, key_b, _)| {
        norm_a
            .cmp(norm_b)
            .then_with(|| (key_a != norm_a).cmp(&(key_b != norm_b)))
            .then_with(|| key_a.cmp(key_b))
    });
    for (normalized, _, value) in entries {
        map.entry(normalized).or_insert(value);
    }
}

impl ConfigFile {
    /// Parses config JSON. `origin` names the source in errors.
    pub fn from_json(json: &[u8], origin: &str) -> Result<Self> {
        let mut config: ConfigFile =
            serde_json::from_slice(json).map_err(|e| Error::ConfigInvalid {
                origin: origin.to_owned(),
                reason: e.to_string(),
            })?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        for entry in self.auth_configs.values_mut() {
            // a malformed `auth` is left in place, `AuthEntry::credentials` reports it
            if entry.username.is_empty() && entry.password.is_empty() && !entry.auth.is_empty() {
                if let Ok((username, password)) = decode_auth(&entry.auth) {
                    entry.username = username;
                    entry.password = password;
                }
            }
        }
        normalize_keys(&mut self.auth_configs);
        normalize_keys(&mut self.credential_helpers);
    }

    /// Reads a config file, returning [Error::NotExist] if it is absent
    pub async fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(json) => Self::from_json(&json, &path.to_string_lossy()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotExist {
                path: path.to_owned(),
            }),
            Err(e) => Err(Error::Io {
                path: path.to_owned(),
                source: e,
            }),
        }
    }

    /// Loads the config of the current user, see [ConfigFile::load_with_env]
    pub async fn load() -> Result<Self> {
        Self::load_with_env(&ProcessEnv).await
    }

    /// Loads `config.json` from [config_dir_with_env]. If `DOCKER_AUTH_CONFIG`
    /// is set, its inline JSON is used instead of the file, even when the
    /// file exists.
    pub async fn load_with_env(env: &dyn EnvSource) -> Result<Self> {
        if let Some(inline) = env.var(DOCKER_AUTH_CONFIG) {
            tracing::debug!("using config from {DOCKER_AUTH_CONFIG}");
            return Self::from_json(inline.as_bytes(), DOCKER_AUTH_CONFIG)
        }
        let dir = config_dir_with_env(env)?;
        Self::load_file(dir.join(CONFIG_FILE_NAME)).await
    }

    /// Returns the auth entry for a registry host, normalizing `host` first
    pub fn auth_for_host(&self, host: &str) -> Option<&AuthEntry> {
        self.auth_configs.get(&normalize_auth_key(host))
    }

    /// Returns the credential helper configured for a registry host
    pub fn helper_for_host(&self, host: &str) -> Option<&str> {
        self.credential_helpers
            .get(&normalize_auth_key(host))
            .map(String::as_str)
    }
}

/// Returns `$DOCKER_CONFIG` if set, otherwise `~/.docker`
pub fn config_dir() -> Result<PathBuf> {
    config_dir_with_env(&ProcessEnv)
}

pub fn config_dir_with_env(env: &dyn EnvSource) -> Result<PathBuf> {
    if let Some(dir) = env.var(DOCKER_CONFIG) {
        return Ok(PathBuf::from(dir))
    }
    let home = dirs::home_dir().ok_or_else(|| Error::ConfigInvalid {
        origin: "home directory".to_owned(),
        reason: "could not determine the home directory of the current user".to_owned(),
    })?;
    Ok(home.join(CONFIG_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn auth_entry_credentials() {
        let entry = AuthEntry {
            auth: b64("user:pass"),
            ..Default::default()
        };
        assert_eq!(entry.credentials().unwrap(), ("user".into(), "pass".into()));

        // only the first colon splits
        let entry = AuthEntry {
            auth: b64("user:pa:ss"),
            ..Default::default()
        };
        assert_eq!(entry.credentials().unwrap(), ("user".into(), "pa:ss".into()));

        let entry = AuthEntry {
            auth: b64("invalidformat"),
            ..Default::default()
        };
        assert_eq!(
            entry.credentials().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let entry = AuthEntry {
            username: "u".into(),
            password: "p".into(),
            identity_token: "tok".into(),
            ..Default::default()
        };
        assert_eq!(entry.credentials().unwrap(), ("".into(), "tok".into()));

        assert_eq!(
            AuthEntry::default().credentials().unwrap(),
            (String::new(), String::new())
        );
    }

    #[test]
    fn parse_and_normalize() {
        let json = format!(
            r#"{{
                "auths": {{
                    "https://index.docker.io/v1/": {{ "auth": "{}" }},
                    "ghcr.io": {{ "username": "g", "password": "h" }},
                    "quay.io": {{ "auth": "not base64!" }}
                }},
                "credsStore": "desktop",
                "credHelpers": {{ "https://gcr.io": "gcloud" }},
                "currentContext": "remote",
                "proxies": {{ "default": {{ "httpProxy": "http://proxy:3128" }} }},
                "psFormat": "table {{{{.ID}}}}",
                "somethingNew": {{ "x": 1 }}
            }}"#,
            b64("hub:secret")
        );
        let config = ConfigFile::from_json(json.as_bytes(), "test").unwrap();
        let hub = config.auth_for_host("index.docker.io").unwrap();
        assert_eq!((hub.username.as_str(), hub.password.as_str()), ("hub", "secret"));
        assert_eq!(config.auth_for_host("docker.io"), Some(hub));
        assert_eq!(config.auth_configs["ghcr.io"].username, "g");
        // left for `credentials` to report
        assert!(config.auth_configs["quay.io"].credentials().is_err());
        assert_eq!(config.credentials_store, "desktop");
        assert_eq!(config.helper_for_host("gcr.io"), Some("gcloud"));
        assert_eq!(config.current_context, "remote");
        assert_eq!(config.proxies["default"].http_proxy, "http://proxy:3128");
        assert_eq!(config.ps_format, "table {{.ID}}");
        assert!(config.other.contains_key("somethingNew"));
    }

    #[test]
    fn alias_keys_resolve_the_same_way() {
        let json = r#"{
            "auths": {
                "https://index.docker.io/v1/": { "username": "legacy", "password": "a" },
                "index.docker.io": { "username": "canonical", "password": "b" },
                "registry-1.docker.io": { "username": "alias", "password": "c" },
                "https://ghcr.io/v2/": { "username": "second", "password": "d" },
                "http://ghcr.io": { "username": "first", "password": "e" }
            },
            "credHelpers": { "https://quay.io": "b-helper", "http://quay.io": "a-helper" }
        }"#;
        // hash order differs between parses, the winner must not
        for _ in 0..16 {
            let config = ConfigFile::from_json(json.as_bytes(), "test").unwrap();
            assert_eq!(config.auth_configs.len(), 2);
            assert_eq!(config.auth_for_host("docker.io").unwrap().username, "canonical");
            assert_eq!(config.auth_for_host("ghcr.io").unwrap().username, "first");
            assert_eq!(config.helper_for_host("quay.io"), Some("a-helper"));
        }
    }

    #[test]
    fn invalid_config() {
        for json in [r#"{"auths": "#, r#"{"credsStore": 5}"#, r#"{"auths": []}"#] {
            let err = ConfigFile::from_json(json.as_bytes(), "test").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConfigInvalid, "{json}");
        }
    }

    #[tokio::test]
    async fn load_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap().to_owned();

        // absent file
        let env: HashMap<&str, String> = [(DOCKER_CONFIG, dir_str.clone())].into_iter().collect();
        let err = ConfigFile::load_with_env(&env).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);

        tokio::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"credsStore": "from-file"}"#,
        )
        .await
        .unwrap();
        let config = ConfigFile::load_with_env(&env).await.unwrap();
        assert_eq!(config.credentials_store, "from-file");

        // the inline blob wins over the file
        let env: HashMap<&str, String> = [
            (DOCKER_CONFIG, dir_str),
            (DOCKER_AUTH_CONFIG, r#"{"credsStore": "inline"}"#.to_owned()),
        ]
        .into_iter()
        .collect();
        let config = ConfigFile::load_with_env(&env).await.unwrap();
        assert_eq!(config.credentials_store, "inline");

        // malformed file
        tokio::fs::write(dir.path().join(CONFIG_FILE_NAME), "{")
            .await
            .unwrap();
        let err = ConfigFile::load_file(dir.path().join(CONFIG_FILE_NAME))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }
}
