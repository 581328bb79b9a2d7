//! Parsing of `[registry/]repository[:tag][@digest]` image references
//!
//! - `nginx` -> registry `index.docker.io`, repository `nginx`
//! - `registry-1.docker.io/library/nginx` -> registry `index.docker.io`
//! - `localhost:5000/app:v1`
//! - `ghcr.io/owner/repo@sha256:<64 hex>`

use std::{fmt, str::FromStr};

use crate::{Error, Result};

/// The registry used when a reference has none, and the canonical form of the
/// docker hub aliases
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

const DOCKER_HUB_ALIASES: [&str; 3] = ["docker.io", "index.docker.io", "registry-1.docker.io"];

/// A parsed image reference. `tag` and `digest` are independent of each
/// other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry, possibly with a scheme and port. Always set, docker hub
    /// aliases are collapsed to [DEFAULT_REGISTRY].
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    /// Validated `sha256:<64 hex>` or `sha512:<128 hex>`
    pub digest: Option<String>,
}

fn strip_scheme(s: &str) -> (Option<&str>, &str) {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = s.strip_prefix(scheme) {
            return (Some(scheme), rest)
        }
    }
    (None, s)
}

/// Returns the host part of a registry, without scheme
pub fn registry_host(registry: &str) -> &str {
    strip_scheme(registry).1
}

/// Collapses `docker.io`, `index.docker.io`, and `registry-1.docker.io`
/// (with or without a scheme) to [DEFAULT_REGISTRY]. Other registries are
/// returned unchanged.
pub fn normalize_registry(registry: &str) -> String {
    if DOCKER_HUB_ALIASES.contains(&registry_host(registry)) {
        DEFAULT_REGISTRY.to_owned()
    } else {
        registry.to_owned()
    }
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Checks `algo:hex` with the hex length matching the algorithm
pub fn validate_digest(digest: &str) -> Result<()> {
    let Some((algo, hex)) = digest.split_once(':') else {
        return Err(Error::InvalidArgument(format!(
            "digest \"{digest}\" is not of the form algo:hex"
        )))
    };
    let expected_len = match algo {
        "sha256" => 64,
        "sha512" => 128,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "digest algorithm \"{algo}\" is not supported"
            )))
        }
    };
    if hex.len() != expected_len {
        return Err(Error::InvalidArgument(format!(
            "{algo} digest must have {expected_len} hex characters, got {}",
            hex.len()
        )))
    }
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidArgument(format!(
            "digest \"{digest}\" contains non hex characters"
        )))
    }
    Ok(())
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidArgument(
                "image reference is empty".to_owned(),
            ))
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest)?;
                (name, Some(digest.to_owned()))
            }
            None => (s, None),
        };

        let (scheme, rest) = strip_scheme(name);
        let (registry, remainder) = match rest.split_once('/') {
            Some((first, tail)) if scheme.is_some() || looks_like_registry(first) => {
                (format!("{}{first}", scheme.unwrap_or_default()), tail)
            }
            _ => {
                if scheme.is_some() {
                    return Err(Error::InvalidArgument(format!(
                        "image reference \"{s}\" has a scheme but no repository"
                    )))
                }
                (DEFAULT_REGISTRY.to_owned(), rest)
            }
        };

        // the tag can only be in the last path segment
        let last_segment_start = remainder.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match remainder[last_segment_start..].find(':') {
            Some(i) => {
                let colon = last_segment_start + i;
                (&remainder[..colon], Some(&remainder[(colon + 1)..]))
            }
            None => (remainder, None),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(Error::InvalidArgument(format!(
                "image reference \"{s}\" has an invalid repository"
            )))
        }
        if tag.is_some_and(str::is_empty) {
            return Err(Error::InvalidArgument(format!(
                "image reference \"{s}\" has an empty tag"
            )))
        }

        Ok(Self {
            registry: normalize_registry(&registry),
            repository: repository.to_owned(),
            tag: tag.map(ToOwned::to_owned),
            digest,
        })
    }

    /// The registry without its scheme, this is the key used for credential
    /// lookups
    pub fn registry_host(&self) -> &str {
        registry_host(&self.registry)
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
