//! Admission of new peers and the per-session read loop.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    protocol::{self, ClientLine, Notice, read_handshake},
    registry::{BroadcastReport, Registry},
    session::{Session, SessionId, SessionReader},
};

#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Upper bound on a single write to a peer. `None` lets a stalled peer
    /// hold up the broadcast that targets it indefinitely.
    pub write_timeout: Option<Duration>,
}

pub struct Relay {
    registry: Registry,
    config: RelayConfig,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Registry::new(),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn announce(&self, notice: Notice, exclude: &str) -> BroadcastReport {
        self.registry.broadcast(&notice.to_string(), exclude).await
    }

    /// Performs the handshake on a fresh connection, registers the resulting
    /// session and tells everyone else it joined.
    ///
    /// A rejected peer is sent an error line when possible; its streams are
    /// released before this returns.
    pub async fn admit<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        peer: Option<SocketAddr>,
    ) -> Result<(Arc<Session>, SessionReader<R>), RelayError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = match read_handshake(&mut reader).await {
            Ok(name) => name,
            Err(err) => {
                reject(&mut writer, &err).await;
                return Err(err);
            }
        };

        let session = Arc::new(
            Session::new(self.next_id(), name, writer)
                .with_peer(peer)
                .with_write_timeout(self.config.write_timeout),
        );

        if let Err(err) = self.registry.register(&session).await {
            let notice = Notice::Error {
                reason: err.to_string(),
            };
            if let Err(error) = session.write_line(&notice.to_string()).await {
                debug!(?peer, %error, "could not deliver rejection");
            }
            session.close().await;
            return Err(err.into());
        }

        info!(session = session.id(), name = session.name(), ?peer, "session joined");
        self.announce(
            Notice::Joined {
                name: session.name().to_string(),
            },
            session.name(),
        )
        .await;

        let reader = session.reader(reader);
        Ok((session, reader))
    }

    /// Relays lines from `session` until it exits, its stream ends, or it is
    /// closed elsewhere, then tears it down.
    pub async fn run_session<R>(
        &self,
        session: Arc<Session>,
        mut reader: SessionReader<R>,
    ) -> Result<(), RelayError>
    where
        R: AsyncBufRead + Unpin,
    {
        let outcome = self.pump(&session, &mut reader).await;
        drop(reader);
        self.teardown(&session).await;
        outcome
    }

    async fn pump<R>(
        &self,
        session: &Session,
        reader: &mut SessionReader<R>,
    ) -> Result<(), RelayError>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            let Some(line) = reader.read_line().await? else {
                debug!(session = session.id(), name = session.name(), "input ended");
                return Ok(());
            };

            match ClientLine::parse(line) {
                ClientLine::Exit => {
                    info!(session = session.id(), name = session.name(), "requested disconnect");
                    return Ok(());
                }
                ClientLine::Chat(text) => {
                    let notice = Notice::Chat {
                        name: session.name().to_string(),
                        text,
                    };
                    self.announce(notice, session.name()).await;
                }
            }
        }
    }

    /// Removes `session`, tells the others it left and closes it.
    ///
    /// Safe to run more than once; the departure is announced only the first
    /// time.
    pub async fn teardown(&self, session: &Arc<Session>) {
        session.begin_closing();
        self.registry.unregister(session).await;

        if session.claim_departure() {
            info!(session = session.id(), name = session.name(), "session left");
            self.announce(
                Notice::Left {
                    name: session.name().to_string(),
                },
                session.name(),
            )
            .await;
        }

        session.close().await;
    }
}

async fn reject<W>(writer: &mut W, err: &RelayError)
where
    W: AsyncWrite + Unpin,
{
    let notice = Notice::Error {
        reason: err.to_string(),
    };
    if let Err(error) = protocol::write_line(writer, &notice.to_string()).await {
        debug!(%error, "could not deliver handshake rejection");
    }
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to release rejected connection");
    }
}
