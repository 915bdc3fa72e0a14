//! One connected peer: its write side, shared with broadcasters, and its
//! read side, owned by the session loop.

use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    error::RelayError,
    protocol::{self, LineReader},
};

pub type SessionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

pub struct Session {
    id: SessionId,
    name: String,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    departed: AtomicBool,
    write_timeout: Option<Duration>,
    // `None` once the output stream has been released.
    writer: Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Creates a session in the `Connecting` state for a peer that has
    /// already sent its display name.
    pub fn new<W>(id: SessionId, name: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            name: name.into(),
            peer: None,
            state: AtomicU8::new(SessionState::Connecting as u8),
            departed: AtomicBool::new(false),
            write_timeout: None,
            writer: Mutex::new(Some(Box::new(writer))),
            closed,
        }
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    /// Bounds every `write_line`; an elapsed timeout counts as a transport failure.
    pub fn with_write_timeout(mut self, write_timeout: Option<Duration>) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Wraps the input stream this session reads from. The returned reader
    /// stops yielding lines as soon as the session is closed by anyone.
    pub fn reader<R>(&self, reader: R) -> SessionReader<R>
    where
        R: AsyncBufRead + Unpin,
    {
        SessionReader {
            lines: LineReader::new(reader),
            closed: self.closed.subscribe(),
        }
    }

    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves a `Connecting` or `Active` session to `Closing`. Returns `true`
    /// only for the caller that performed the transition.
    pub fn begin_closing(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match SessionState::from_u8(current) {
                    SessionState::Connecting | SessionState::Active => {
                        Some(SessionState::Closing as u8)
                    }
                    SessionState::Closing | SessionState::Closed => None,
                }
            })
            .is_ok()
    }

    /// Returns `true` exactly once per session, to whoever announces its departure.
    pub(crate) fn claim_departure(&self) -> bool {
        !self.departed.swap(true, Ordering::AcqRel)
    }

    /// Writes one line and flushes it.
    pub async fn write_line(&self, line: &str) -> Result<(), RelayError> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(RelayError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "session output already released",
            )));
        };

        let write = protocol::write_line(sink, line);
        match self.write_timeout {
            Some(limit) => timeout(limit, write).await.map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "write to peer timed out")
            })??,
            None => write.await?,
        }
        Ok(())
    }

    /// Releases both streams and marks the session `Closed`.
    ///
    /// Safe to call repeatedly and from several tasks at once; only the first
    /// call performs the release.
    pub async fn close(&self) {
        self.begin_closing();
        self.closed.send_replace(true);

        let released = self.writer.lock().await.take();
        let Some(mut writer) = released else {
            return;
        };

        if let Err(error) = writer.shutdown().await {
            warn!(
                session = self.id,
                name = %self.name,
                ?error,
                "failed to release output stream"
            );
        }
        drop(writer);

        self.state.store(SessionState::Closed as u8, Ordering::Release);
        debug!(session = self.id, name = %self.name, "session closed");
    }
}

/// The read half of a session, owned by its session loop.
pub struct SessionReader<R> {
    lines: LineReader<R>,
    closed: watch::Receiver<bool>,
}

impl<R> SessionReader<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Waits for the next line. `Ok(None)` means the stream ended or the
    /// session was closed.
    pub async fn read_line(&mut self) -> Result<Option<String>, RelayError> {
        if *self.closed.borrow() {
            return Ok(None);
        }

        select! {
            biased;
            _ = wait_closed(&mut self.closed) => Ok(None),
            line = self.lines.next_line() => Ok(line?),
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // An error means the session itself is gone, which also ends reading.
    let _ = closed.wait_for(|closed| *closed).await;
}
