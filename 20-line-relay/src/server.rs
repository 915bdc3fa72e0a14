use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    relay::{Relay, RelayConfig},
};

// Pause after an accept error that is not tied to one connection (for
// example running out of file descriptors) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// Consecutive listener-level accept failures after which the endpoint is
// considered unusable.
const MAX_ACCEPT_FAILURES: u32 = 10;

/// Accepts connections and runs one session task per peer.
pub struct Server {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl Server {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            relay: Arc::new(Relay::new(config)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Accepts until `shutdown` resolves or the listener fails, then releases
    /// the listener.
    ///
    /// Sessions that are still running keep running either way; they are
    /// returned in [`Stopped::supervisor`] so the caller decides whether to
    /// wait for them.
    pub async fn run_until<F>(self, shutdown: F) -> Stopped
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, relay } = self;
        let mut supervisor = Supervisor::default();
        let mut failures = 0;
        let mut listener_error = None;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(sessions = supervisor.len(), "relay no longer accepting connections");
                    break;
                }
                accept_result = listener.accept() => {
                    match handle_accept_result(accept_result, &relay, &mut supervisor, failures)
                        .await
                    {
                        Ok(count) => failures = count,
                        Err(err) => {
                            warn!(
                                sessions = supervisor.len(),
                                error = ?err,
                                "listener failed, no longer accepting connections"
                            );
                            listener_error = Some(err);
                            break;
                        }
                    }
                }
                Some(finished) = supervisor.reap(), if !supervisor.is_empty() => {
                    log_finished_task(finished);
                }
            }
        }

        drop(listener);
        Stopped {
            supervisor,
            listener_error,
        }
    }

    pub async fn run_until_ctrl_c(self) -> Stopped {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// How an accept loop ended.
pub struct Stopped {
    /// Sessions accepted before the loop ended, still running.
    pub supervisor: Supervisor,
    /// Set when the listener became unusable rather than being asked to stop.
    pub listener_error: Option<anyhow::Error>,
}

async fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    relay: &Arc<Relay>,
    supervisor: &mut Supervisor,
    failures: u32,
) -> anyhow::Result<u32> {
    match result {
        Ok((stream, peer)) => {
            spawn_session(stream, peer, relay, supervisor);
            Ok(0)
        }
        Err(err) if is_connection_error(&err) => {
            debug!(error = ?err, "connection failed during accept");
            Ok(failures)
        }
        Err(err) => {
            let failures = failures + 1;
            if failures >= MAX_ACCEPT_FAILURES {
                return Err(anyhow::Error::new(err).context("listener is no longer usable"));
            }
            warn!(error = ?err, failures, "failed to accept connection");
            sleep(ACCEPT_BACKOFF).await;
            Ok(failures)
        }
    }
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    relay: &Arc<Relay>,
    supervisor: &mut Supervisor,
) {
    let relay = Arc::clone(relay);
    supervisor.spawn(async move {
        if let Err(err) = handle_connection(stream, peer, relay).await {
            warn!(peer = %peer, error = %err, "session ended with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    relay: Arc<Relay>,
) -> Result<(), RelayError> {
    debug!(%peer, "connection accepted");
    let (reader, writer) = stream.into_split();
    let (session, reader) = relay.admit(BufReader::new(reader), writer, Some(peer)).await?;
    relay.run_session(session, reader).await
}

fn log_finished_task(result: Result<(), JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            warn!(error = ?err, "session task panicked");
        }
    }
}

/// The session tasks spawned by a [`Server`].
#[derive(Default)]
pub struct Supervisor {
    tasks: JoinSet<()>,
}

impl Supervisor {
    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    async fn reap(&mut self) -> Option<Result<(), JoinError>> {
        self.tasks.join_next().await
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every session to end on its own.
    pub async fn join(mut self) {
        drain(&mut self.tasks).await;
    }

    /// Closes every registered session, waits up to `grace` for the session
    /// tasks to finish, then aborts whatever is left (such as peers that never
    /// completed their handshake).
    pub async fn shutdown(mut self, relay: &Relay, grace: Duration) {
        let closed = relay.registry().close_all().await;
        info!(closed, "closed active sessions");

        if timeout(grace, drain(&mut self.tasks)).await.is_err() {
            warn!(remaining = self.tasks.len(), "aborting session tasks that did not finish");
            self.tasks.shutdown().await;
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(finished) = tasks.join_next().await {
        log_finished_task(finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn listener_fault() -> io::Result<(TcpStream, SocketAddr)> {
        Err(io::Error::other("too many open files"))
    }

    #[tokio::test]
    async fn listener_failure_leaves_sessions_running() {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        let mut supervisor = Supervisor::default();
        let (release, released) = oneshot::channel::<()>();
        supervisor.spawn(async move {
            let _ = released.await;
        });

        let mut failures = 0;
        for _ in 1..MAX_ACCEPT_FAILURES {
            failures = handle_accept_result(listener_fault(), &relay, &mut supervisor, failures)
                .await
                .expect("still within the failure budget");
        }
        assert_eq!(failures, MAX_ACCEPT_FAILURES - 1);

        let last = handle_accept_result(listener_fault(), &relay, &mut supervisor, failures).await;
        assert!(last.is_err());
        assert_eq!(supervisor.len(), 1);

        release.send(()).expect("session task is alive");
        supervisor.join().await;
    }

    #[tokio::test]
    async fn connection_errors_do_not_count_as_failures() {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        let mut supervisor = Supervisor::default();
        let reset = Err(io::Error::from(io::ErrorKind::ConnectionReset));

        let failures = handle_accept_result(reset, &relay, &mut supervisor, 3)
            .await
            .expect("connection errors are ignored");
        assert_eq!(failures, 3);
    }
}
