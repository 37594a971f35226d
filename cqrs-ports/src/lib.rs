//! A `Port` is any blocking entry point into the system — the durable
//! queue's subscribe loop, the event store's competing-consumer subscribe
//! loop, the background job controller's tick loop, or any adapter a
//! dependent crate hangs off this trait. [`Ports`] runs a collection of them
//! concurrently with coordinated shutdown: the first port error, OS signal,
//! or external cancellation stops every other port, and the whole thing
//! forcibly gives up after a fixed deadline rather than hanging forever on a
//! straggler.
//!
//! Grounded on the reference `ports.Ports.Run`: goroutines gated by a shared
//! start channel, an `errgroup` bound to a derived context, OS signal
//! handling, and a 10-second forced-exit timeout. The two-phase
//! register-then-release gate is realized here with a [`tokio::sync::Barrier`]
//! rather than a channel close, since a barrier can't be raced the way a
//! `Notify` can (a waiter that hasn't subscribed yet when `notify_waiters`
//! fires would simply hang).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long [`Ports::run`] waits for every port to return once shutdown has
/// started before forcibly giving up.
pub const FORCED_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors a port, or the supervisor itself, can produce.
#[derive(Error, Debug)]
pub enum PortError {
    /// A port returned an error from its `run` loop.
    #[error("port failed: {0}")]
    Failed(String),

    /// A port panicked; the panic was caught at the task boundary rather
    /// than propagating and taking down the whole process.
    #[error("port panicked: {0}")]
    Panicked(String),

    /// Not every port returned within [`FORCED_EXIT_TIMEOUT`] of shutdown
    /// starting. Stragglers are abandoned rather than awaited further — a
    /// documented hazard, not a recovered one.
    #[error("ports failed to exit within {FORCED_EXIT_TIMEOUT:?} of shutdown starting")]
    Timeout,
}

/// A blocking entry point into the system.
///
/// `run` must block until `cancellation` is cancelled (or it decides it
/// cannot continue, in which case it returns an error forcing every other
/// port to shut down too).
///
/// # Dyn Compatibility
///
/// Uses an explicit `Pin<Box<dyn Future>>` return instead of `async fn` so
/// `Ports` can hold a heterogeneous `Vec<Arc<dyn Port>>`.
pub trait Port: Send + Sync {
    /// Run this port until `cancellation` fires or it fails.
    ///
    /// # Errors
    ///
    /// Any error forces the whole supervisor to shut down; only return one
    /// when this port genuinely cannot continue.
    fn run(
        &self,
        cancellation: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), PortError>> + Send + '_>>;
}

/// Wraps a plain async closure as a [`Port`], for ports that don't warrant a
/// dedicated type.
pub struct PortFn<F> {
    f: F,
}

impl<F, Fut> Port for PortFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), PortError>> + Send + 'static,
{
    fn run(
        &self,
        cancellation: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), PortError>> + Send + '_>> {
        Box::pin((self.f)(cancellation))
    }
}

/// A collection of [`Port`]s to supervise together.
#[derive(Default)]
pub struct Ports {
    ports: Vec<Arc<dyn Port>>,
}

impl Ports {
    /// An empty port collection.
    #[must_use]
    pub fn new() -> Self {
        Self { ports: Vec::new() }
    }

    /// Add a port.
    #[must_use]
    pub fn push(mut self, port: impl Port + 'static) -> Self {
        self.ports.push(Arc::new(port));
        self
    }

    /// Add a port built from a plain async closure.
    #[must_use]
    pub fn push_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PortError>> + Send + 'static,
    {
        self.push(PortFn { f })
    }

    /// How many ports are registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether no ports are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Run every port concurrently until one fails, an OS interrupt/terminate
    /// signal arrives, or the process is otherwise done — with its own fresh
    /// [`CancellationToken`].
    ///
    /// # Errors
    ///
    /// The first port error or panic encountered, or [`PortError::Timeout`]
    /// if ports are still running [`FORCED_EXIT_TIMEOUT`] after shutdown
    /// started.
    pub async fn run(self) -> Result<(), PortError> {
        self.run_with_token(CancellationToken::new()).await
    }

    /// Run every port concurrently, sharing a caller-supplied
    /// [`CancellationToken`] — cancelling it from outside triggers the same
    /// shutdown sequence as a port failing.
    ///
    /// # Errors
    ///
    /// See [`Ports::run`].
    pub async fn run_with_token(self, token: CancellationToken) -> Result<(), PortError> {
        if self.ports.is_empty() {
            return Ok(());
        }

        let barrier = Arc::new(Barrier::new(self.ports.len()));
        let mut set = JoinSet::new();
        for port in self.ports {
            let port_token = token.clone();
            let barrier = Arc::clone(&barrier);
            set.spawn(async move {
                // Every port reaches this point — and so has been polled at
                // least once — before any of them can observe cancellation.
                barrier.wait().await;
                port.run(port_token).await
            });
        }

        let signal_token = token.clone();
        let signal_task = tokio::spawn(async move {
            wait_for_signal().await;
            signal_token.cancel();
        });

        let mut first_error: Option<PortError> = None;
        let mut shutdown_started: Option<Instant> = None;

        loop {
            if shutdown_started.is_none() && token.is_cancelled() {
                shutdown_started = Some(Instant::now());
            }

            let next = if let Some(started) = shutdown_started {
                let remaining = FORCED_EXIT_TIMEOUT.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        error!(
                            remaining_ports = set.len(),
                            "ports did not exit within the forced-exit timeout; abandoning them"
                        );
                        signal_task.abort();
                        return Err(first_error.unwrap_or(PortError::Timeout));
                    }
                }
            } else {
                tokio::select! {
                    next = set.join_next() => next,
                    () = token.cancelled() => {
                        shutdown_started = Some(Instant::now());
                        continue;
                    }
                }
            };

            match next {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(port_error))) => {
                    warn!(error = %port_error, "port returned an error, cancelling the rest");
                    token.cancel();
                    if first_error.is_none() {
                        first_error = Some(port_error);
                    }
                }
                Some(Err(join_error)) => {
                    let message = join_error.to_string();
                    error!(error = %message, "port panicked, cancelling the rest");
                    token.cancel();
                    if first_error.is_none() {
                        first_error = Some(PortError::Panicked(message));
                    }
                }
            }
        }

        signal_task.abort();
        info!("all ports exited");
        first_error.map_or(Ok(()), Err)
    }
}

/// Wait for an OS interrupt (`SIGINT`/Ctrl-C) or termination (`SIGTERM`)
/// signal.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
                    _ = sigterm.recv() => info!("received sigterm"),
                }
            }
            Err(error) => {
                warn!(%error, "failed to register a sigterm handler, watching ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                info!("received ctrl-c");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_port() -> impl Fn(CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), PortError>> + Send>>
           + Send
           + Sync
           + 'static {
        |token: CancellationToken| Box::pin(async move {
            token.cancelled().await;
            Ok(())
        })
    }

    #[tokio::test]
    async fn empty_ports_returns_immediately() {
        let result = Ports::new().run().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancelling_the_shared_token_stops_every_port() {
        let started = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&started);
        let b = Arc::clone(&started);

        let ports = Ports::new()
            .push_fn(move |token| {
                let started = Arc::clone(&a);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    token.cancelled().await;
                    Ok(())
                }
            })
            .push_fn(move |token| {
                let started = Arc::clone(&b);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    token.cancelled().await;
                    Ok(())
                }
            });

        let token = CancellationToken::new();
        let cancel_token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_token.cancel();
        });

        let result = ports.run_with_token(token).await;
        assert!(result.is_ok());
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_failing_port_cancels_the_others_and_surfaces_its_error() {
        let other_saw_cancellation = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&other_saw_cancellation);

        let ports = Ports::new()
            .push_fn(|_token| async move { Err(PortError::Failed("boom".to_string())) })
            .push_fn(move |token| {
                let flag = Arc::clone(&flag);
                async move {
                    token.cancelled().await;
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

        let result = ports.run().await;
        assert!(matches!(result, Err(PortError::Failed(message)) if message == "boom"));
        assert_eq!(other_saw_cancellation.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_panicking_port_is_caught_and_reported() {
        let ports = Ports::new().push_fn(|_token| async move {
            panic!("port panicked");
            #[allow(unreachable_code)]
            Ok(())
        });

        let result = ports.run().await;
        assert!(matches!(result, Err(PortError::Panicked(_))));
    }

    #[test]
    fn len_and_is_empty_reflect_pushed_ports() {
        let ports = Ports::new();
        assert!(ports.is_empty());
        let ports = ports.push_fn(ok_port());
        assert_eq!(ports.len(), 1);
        assert!(!ports.is_empty());
    }
}
