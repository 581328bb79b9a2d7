use std::{
    fmt::Write,
    path::PathBuf,
    sync::{Arc, LazyLock},
};

use regex::Regex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of an [Error], independent of where it came from. Daemon
/// responses are classified by their HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotImplemented,
    Internal,
    Conflict,
    Unavailable,
    Cancelled,
    DeadlineExceeded,
    HelperNotFound,
    HelperExecutionFailed,
    HelperDecodeFailed,
    MissingServerUrl,
    ContextNotFound,
    ConfigInvalid,
    /// The config file is absent
    NotExist,
    /// The client handle was closed
    Closed,
    Unknown,
}

/// Error type for everything in `docker_sdk`
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config file {} does not exist", path.display())]
    NotExist { path: PathBuf },
    #[error("invalid config in {origin}: {reason}")]
    ConfigInvalid { origin: String, reason: String },
    #[error("docker context \"{name}\" not found at {}", path.display())]
    ContextNotFound { name: String, path: PathBuf },
    #[error("credential helper `{helper}` not found in PATH")]
    HelperNotFound { helper: String },
    #[error(
        "credential helper `{helper}` failed with exit code {code:?}, stdout: \"{stdout}\", \
         stderr: \"{stderr}\""
    )]
    HelperExecutionFailed {
        helper: String,
        stdout: String,
        stderr: String,
        code: Option<i32>,
    },
    #[error("credential helper `{helper}` returned output that is not valid JSON")]
    HelperDecodeFailed {
        helper: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("credential helper `{helper}` reported no server URL")]
    MissingServerUrl { helper: String },
    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("docker client is closed")]
    Closed,
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    Daemon(#[from] bollard::errors::Error),
    #[error("docker client initialization failed: {0}")]
    Init(#[source] Arc<Error>),
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),
}

fn join_errors(errs: &[Error]) -> String {
    let mut s = String::new();
    for (i, err) in errs.iter().enumerate() {
        if i != 0 {
            s.push_str("; ");
        }
        let _ = write!(s, "{err}");
    }
    s
}

// the daemon has no distinct code for this, its message is the only signal
static REMOVAL_IN_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"removal of (\S+) .* is already in progress").expect("valid regex")
});

/// Returns if `message` is the daemon's "removal of <kind> ... is already in
/// progress" conflict. If `kind` is `Some`, the kind in the message must
/// match it.
pub fn is_removal_in_progress(kind: Option<&str>, message: &str) -> bool {
    match REMOVAL_IN_PROGRESS.captures(message) {
        Some(captures) => kind.is_none_or(|kind| &captures[1] == kind),
        None => false,
    }
}

// transport failures are wrapped a varying number of times by the client
// stack, an io error anywhere in the chain means the daemon was unreachable
fn has_io_source(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(err) = source {
        if err.is::<std::io::Error>() {
            return true
        }
        source = err.source();
    }
    false
}

fn kind_from_status(status_code: u16) -> ErrorKind {
    match status_code {
        400 => ErrorKind::InvalidArgument,
        401 => ErrorKind::Unauthenticated,
        403 => ErrorKind::PermissionDenied,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        500 => ErrorKind::Internal,
        501 => ErrorKind::NotImplemented,
        503 => ErrorKind::Unavailable,
        _ => ErrorKind::Unknown,
    }
}

impl Error {
    /// Wraps `self` with a context message, keeping `self` as the source
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The kind of the innermost classified error. Wrapping layers
    /// ([Error::Context] and [Error::Init]) are looked through.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotExist { .. } => ErrorKind::NotExist,
            Error::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            Error::ContextNotFound { .. } => ErrorKind::ContextNotFound,
            Error::HelperNotFound { .. } => ErrorKind::HelperNotFound,
            Error::HelperExecutionFailed { .. } => ErrorKind::HelperExecutionFailed,
            Error::HelperDecodeFailed { .. } => ErrorKind::HelperDecodeFailed,
            Error::MissingServerUrl { .. } => ErrorKind::MissingServerUrl,
            Error::Spawn { .. } | Error::Io { .. } => ErrorKind::Internal,
            Error::Closed => ErrorKind::Closed,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Timeout(_) => ErrorKind::DeadlineExceeded,
            Error::Daemon(err) => match err {
                bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
                    kind_from_status(*status_code)
                }
                bollard::errors::Error::RequestTimeoutError => ErrorKind::DeadlineExceeded,
                bollard::errors::Error::IOError { .. }
                | bollard::errors::Error::HyperResponseError { .. }
                | bollard::errors::Error::SocketNotFoundError(..) => ErrorKind::Unavailable,
                other if has_io_source(other) => ErrorKind::Unavailable,
                _ => ErrorKind::Unknown,
            },
            Error::Init(err) => err.kind(),
            Error::Context { source, .. } => source.kind(),
            Error::Multiple(_) => ErrorKind::Unknown,
        }
    }

    /// The message the daemon responded with, if this is (or wraps) a daemon
    /// response error
    pub fn daemon_message(&self) -> Option<&str> {
        match self {
            Error::Daemon(bollard::errors::Error::DockerResponseServerError { message, .. }) => {
                Some(message)
            }
            Error::Init(err) => err.daemon_message(),
            Error::Context { source, .. } => source.daemon_message(),
            _ => None,
        }
    }

    /// Returns if any error in the chain (including every member of a
    /// [Error::Multiple]) is of `kind`
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        match self {
            Error::Multiple(errs) => errs.iter().any(|err| err.has_kind(kind)),
            _ => self.kind() == kind,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.has_kind(ErrorKind::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        self.has_kind(ErrorKind::Conflict)
    }
}

/// Returns `true` for errors that retrying can not fix: `NotFound`,
/// `InvalidArgument`, `Unauthenticated`, `PermissionDenied`,
/// `NotImplemented`, and `Internal`.
pub fn is_permanent_client_error(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotFound
            | ErrorKind::InvalidArgument
            | ErrorKind::Unauthenticated
            | ErrorKind::PermissionDenied
            | ErrorKind::NotImplemented
            | ErrorKind::Internal
    )
}

/// Returns if `err` may be ignored when tearing down a resource: no error,
/// a `NotFound`, or a `Conflict` saying that removal is already in progress.
///
/// Wrapping layers are unwrapped one at a time, and a [Error::Multiple] is
/// safe only if all of its members are.
pub fn is_cleanup_safe(err: Option<&Error>) -> bool {
    let Some(err) = err else { return true };
    match err {
        Error::Multiple(errs) => errs.iter().all(|err| is_cleanup_safe(Some(err))),
        Error::Context { source, .. } => is_cleanup_safe(Some(source)),
        Error::Init(source) => is_cleanup_safe(Some(source)),
        _ => match err.kind() {
            ErrorKind::NotFound => true,
            ErrorKind::Conflict => err
                .daemon_message()
                .is_some_and(|message| is_removal_in_progress(None, message)),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon_err(status_code: u16, message: &str) -> Error {
        Error::Daemon(bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: message.to_owned(),
        })
    }

    #[test]
    fn daemon_status_kinds() {
        assert_eq!(daemon_err(404, "no such network").kind(), ErrorKind::NotFound);
        assert_eq!(daemon_err(409, "name taken").kind(), ErrorKind::Conflict);
        assert_eq!(daemon_err(400, "bad scope").kind(), ErrorKind::InvalidArgument);
        assert_eq!(daemon_err(503, "down").kind(), ErrorKind::Unavailable);
        assert_eq!(daemon_err(418, "teapot").kind(), ErrorKind::Unknown);
    }

    #[test]
    fn permanent_errors() {
        assert!(is_permanent_client_error(&daemon_err(404, "gone")));
        assert!(is_permanent_client_error(&Error::InvalidArgument("x".into())));
        assert!(is_permanent_client_error(
            &daemon_err(401, "who are you").context("pulling")
        ));
        assert!(is_permanent_client_error(&daemon_err(500, "oops")));
        assert!(!is_permanent_client_error(&daemon_err(409, "busy")));
        assert!(!is_permanent_client_error(&daemon_err(503, "down")));
        assert!(!is_permanent_client_error(&Error::Cancelled("ctrl-c".into())));
    }

    #[test]
    fn removal_in_progress_matching() {
        let msg = "removal of network abc123 is already in progress";
        assert!(is_removal_in_progress(None, msg));
        assert!(is_removal_in_progress(Some("network"), msg));
        assert!(!is_removal_in_progress(Some("volume"), msg));
        assert!(!is_removal_in_progress(None, "network abc123 is in use"));
    }

    #[test]
    fn cleanup_safety() {
        assert!(is_cleanup_safe(None));
        assert!(is_cleanup_safe(Some(&daemon_err(404, "no such volume"))));
        assert!(is_cleanup_safe(Some(&daemon_err(
            409,
            "removal of volume v1 is already in progress"
        ))));
        assert!(!is_cleanup_safe(Some(&daemon_err(409, "volume is in use"))));
        assert!(!is_cleanup_safe(Some(&daemon_err(500, "oops"))));
        // single unwrap
        assert!(is_cleanup_safe(Some(
            &daemon_err(404, "no such network").context("terminating network")
        )));
        // multi unwrap
        assert!(is_cleanup_safe(Some(&Error::Multiple(vec![
            daemon_err(404, "a"),
            daemon_err(409, "removal of network b is already in progress").context("b"),
        ]))));
        assert!(!is_cleanup_safe(Some(&Error::Multiple(vec![
            daemon_err(404, "a"),
            Error::Closed,
        ]))));
    }

    #[test]
    fn display_chains() {
        let err = Error::Multiple(vec![
            Error::NotFound("a".into()),
            Error::Closed.context("while closing"),
        ]);
        assert_eq!(err.to_string(), "not found: a; while closing");
        let err = Error::Closed.context("while closing");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "docker client is closed");
    }
}
