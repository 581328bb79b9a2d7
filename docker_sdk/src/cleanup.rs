//! Teardown of resources created by tests
//!
//! Teardown errors that only mean the resource is already gone (or going)
//! are swallowed, see [is_cleanup_safe]. Anything else fails the test.

use std::{fmt, panic::AssertUnwindSafe};

use futures::{future::BoxFuture, FutureExt};

use crate::{
    is_cleanup_safe,
    resources::{terminate_by_id, ResourceKind, TerminableResource},
    Client, Result,
};

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Terminates `resource`, treating cleanup safe errors as success
pub async fn try_cleanup(resource: &(impl TerminableResource + ?Sized)) -> Result<()> {
    match resource.terminate().await {
        Err(e) if is_cleanup_safe(Some(&e)) => {
            tracing::debug!(
                resource.kind = %resource.kind(),
                resource.id = resource.id(),
                "ignoring teardown error: {e}"
            );
            Ok(())
        }
        res => res,
    }
}

/// Deferred teardown steps, run last registered first by [TestCleanup::run]
#[derive(Default)]
pub struct TestCleanup {
    steps: Vec<(String, CleanupFn)>,
}

impl fmt::Debug for TestCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<_> = self.steps.iter().map(|(name, _)| name).collect();
        f.debug_struct("TestCleanup").field("steps", &steps).finish()
    }
}

impl TestCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Defers an arbitrary step. Its errors are subject to the same cleanup
    /// safety check as terminations.
    pub fn defer<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.steps
            .push((name.into(), Box::new(move || f().boxed())));
    }

    /// Defers the termination of `resource`
    pub fn register<R>(&mut self, resource: &R)
    where
        R: TerminableResource + Clone + 'static,
    {
        let resource = resource.clone();
        let name = format!("terminate {} {}", resource.kind(), resource.id());
        self.defer(name, move || async move { resource.terminate().await });
    }

    /// Defers the termination of the resource of `kind` with `id` through a
    /// client of its own, which is closed after the termination
    pub async fn cleanup_by_id(&mut self, kind: ResourceKind, id: impl Into<String>) -> Result<()> {
        let client = Client::new([]).await?;
        let id = id.into();

        let closing = client.clone();
        self.defer(format!("close client for {kind} {id}"), move || async move {
            closing.close().await
        });
        let name = format!("terminate {kind} {id}");
        self.defer(name, move || async move {
            terminate_by_id(&client, kind, &id).await
        });
        Ok(())
    }

    /// Runs `body` with a fresh registry, then its steps. The steps also run
    /// when `body` panics, after which the panic is resumed.
    ///
    /// ```ignore
    /// TestCleanup::scope(|cleanup| {
    ///     async move {
    ///         let net = Network::create(NetworkCreateOptions::new("net")).await.unwrap();
    ///         cleanup.register(&net);
    ///         assert!(net.inspect(Default::default()).await.is_ok());
    ///     }
    ///     .boxed()
    /// })
    /// .await;
    /// ```
    pub async fn scope<T, F>(body: F) -> T
    where
        F: for<'a> FnOnce(&'a mut TestCleanup) -> BoxFuture<'a, T>,
    {
        let mut cleanup = TestCleanup::new();
        let res = AssertUnwindSafe(body(&mut cleanup)).catch_unwind().await;
        match res {
            Ok(value) => {
                cleanup.run().await;
                value
            }
            Err(panic) => {
                let failures = cleanup.run_steps().await;
                if !failures.is_empty() {
                    tracing::error!(
                        "{} cleanup steps failed after the test body panicked",
                        failures.len()
                    );
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Runs every step, last registered first. All steps run even if some
    /// fail.
    ///
    /// # Panics
    ///
    /// If any step returned an error that is not cleanup safe
    pub async fn run(mut self) {
        let failures = self.run_steps().await;
        if !failures.is_empty() {
            panic!("cleanup failed:\n{}", failures.join("\n"));
        }
    }

    async fn run_steps(&mut self) -> Vec<String> {
        let mut failures = vec![];
        while let Some((name, step)) = self.steps.pop() {
            match step().await {
                Ok(()) => tracing::debug!("cleanup step `{name}` done"),
                Err(e) if is_cleanup_safe(Some(&e)) => {
                    tracing::debug!("cleanup step `{name}` ignored error: {e}");
                }
                Err(e) => {
                    tracing::error!("cleanup step `{name}` failed: {e}");
                    failures.push(format!("{name}: {e}"));
                }
            }
        }
        failures
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if !self.steps.is_empty() && !std::thread::panicking() {
            tracing::warn!(
                "TestCleanup dropped with {} steps that never ran",
                self.steps.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::Error;

    #[derive(Clone)]
    struct Fake {
        id: String,
        status: u16,
        message: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Fake {
        fn new(id: &str, status: u16, message: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                id: id.to_owned(),
                status,
                message,
                log: Arc::clone(log),
            }
        }
    }

    #[async_trait]
    impl TerminableResource for Fake {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Network
        }

        fn id(&self) -> &str {
            &self.id
        }

        async fn terminate(&self) -> Result<()> {
            self.log.lock().unwrap().push(self.id.clone());
            if self.status == 0 {
                return Ok(())
            }
            Err(Error::Daemon(
                bollard::errors::Error::DockerResponseServerError {
                    status_code: self.status,
                    message: self.message.to_owned(),
                },
            )
            .context(format!("terminating network {}", self.id)))
        }
    }

    #[tokio::test]
    async fn safe_errors_are_swallowed() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut cleanup = TestCleanup::new();
        cleanup.register(&Fake::new("a", 0, "", &log));
        cleanup.register(&Fake::new("b", 404, "network b not found", &log));
        cleanup.register(&Fake::new(
            "c",
            409,
            "removal of network c is already in progress",
            &log,
        ));
        assert_eq!(cleanup.len(), 3);
        cleanup.run().await;
        assert_eq!(*log.lock().unwrap(), ["c", "b", "a"]);

        let fake = Fake::new("d", 404, "gone", &log);
        try_cleanup(&fake).await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "terminate network e")]
    async fn unsafe_errors_fail() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut cleanup = TestCleanup::new();
        cleanup.register(&Fake::new("e", 409, "network e has active endpoints", &log));
        cleanup.run().await;
    }

    #[tokio::test]
    async fn every_step_runs() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut cleanup = TestCleanup::new();
        cleanup.register(&Fake::new("first", 0, "", &log));
        cleanup.register(&Fake::new("failing", 500, "boom", &log));
        let res = tokio::spawn(cleanup.run()).await;
        assert!(res.unwrap_err().is_panic());
        assert_eq!(*log.lock().unwrap(), ["failing", "first"]);

        let fake = Fake::new("g", 500, "boom", &log);
        assert!(try_cleanup(&fake).await.is_err());
    }

    #[tokio::test]
    async fn scope_runs_steps_after_a_failing_body() {
        let log = Arc::new(Mutex::new(vec![]));
        let log1 = Arc::clone(&log);
        let res = tokio::spawn(TestCleanup::scope(move |cleanup| {
            async move {
                cleanup.register(&Fake::new("kept", 0, "", &log1));
                cleanup.register(&Fake::new("gone", 404, "no such network", &log1));
                assert_eq!(cleanup.len(), 0, "the test body fails here");
            }
            .boxed()
        }))
        .await;
        let panic = res.unwrap_err().into_panic();
        let msg = panic.downcast_ref::<String>().unwrap();
        assert!(msg.contains("the test body fails here"), "{msg}");
        assert_eq!(*log.lock().unwrap(), ["gone", "kept"]);
    }

    #[tokio::test]
    async fn scope_returns_the_body_value() {
        let log = Arc::new(Mutex::new(vec![]));
        let log1 = Arc::clone(&log);
        let x = TestCleanup::scope(move |cleanup| {
            async move {
                cleanup.register(&Fake::new("a", 0, "", &log1));
                7
            }
            .boxed()
        })
        .await;
        assert_eq!(x, 7);
        assert_eq!(*log.lock().unwrap(), ["a"]);
    }
}
