use std::{borrow::Borrow, collections::HashMap, hash::Hash};

/// Overrides the daemon endpoint, taking precedence over everything else
pub const DOCKER_HOST: &str = "DOCKER_HOST";
/// Names a context in the context store
pub const DOCKER_CONTEXT: &str = "DOCKER_CONTEXT";
/// Overrides the config directory (`~/.docker` by default)
pub const DOCKER_CONFIG: &str = "DOCKER_CONFIG";
/// Inline JSON that replaces the contents of `config.json`
pub const DOCKER_AUTH_CONFIG: &str = "DOCKER_AUTH_CONFIG";
/// When truthy, TLS is used with the certificates from `DOCKER_CERT_PATH`
pub const DOCKER_TLS_VERIFY: &str = "DOCKER_TLS_VERIFY";
/// Directory containing `ca.pem`, `cert.pem`, and `key.pem`
pub const DOCKER_CERT_PATH: &str = "DOCKER_CERT_PATH";

/// Where environment variables are read from. The process environment is
/// used outside of tests.
pub trait EnvSource: Send + Sync {
    /// Returns the value of `key`, with empty values treated as unset
    fn var(&self, key: &str) -> Option<String>;

    /// Like the docker CLI, any value other than "0" or "false" is truthy
    fn var_truthy(&self, key: &str) -> bool {
        self.var(key)
            .is_some_and(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
    }
}

/// Reads from `std::env`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl<K, V> EnvSource for HashMap<K, V>
where
    K: Borrow<str> + Hash + Eq + Send + Sync,
    V: AsRef<str> + Send + Sync,
{
    fn var(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.as_ref().to_owned())
            .filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        let env: HashMap<&str, &str> = [
            ("A", "1"),
            ("B", "0"),
            ("C", "FALSE"),
            ("D", ""),
            ("E", "yes"),
        ]
        .into_iter()
        .collect();
        assert!(env.var_truthy("A"));
        assert!(!env.var_truthy("B"));
        assert!(!env.var_truthy("C"));
        assert!(!env.var_truthy("D"));
        assert!(env.var_truthy("E"));
        assert!(!env.var_truthy("F"));
        assert_eq!(env.var("D"), None);
    }
}
