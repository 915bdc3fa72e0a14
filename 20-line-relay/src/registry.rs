use std::{collections::HashMap, sync::Arc};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{error::RegistryError, session::Session};

/// The set of active sessions, keyed by display name.
///
/// Membership changes and the snapshot a broadcast fans out to are taken
/// under one lock. The lock is never held while writing to a peer, so a slow
/// peer delays only the broadcast that targets it.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

/// What happened to one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Peers whose write failed; they were removed and closed before the
    /// broadcast returned.
    pub dropped: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `session` and marks it `Active`.
    ///
    /// Registering the same session twice is a no-op. A different session
    /// holding the same name is rejected.
    pub async fn register(&self, session: &Arc<Session>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(session.name()) {
            if Arc::ptr_eq(existing, session) {
                return Ok(());
            }
            return Err(RegistryError::NameTaken(session.name().to_string()));
        }

        if !session.activate() {
            return Err(RegistryError::Inactive(session.name().to_string()));
        }

        sessions.insert(session.name().to_string(), Arc::clone(session));
        debug!(
            session = session.id(),
            name = session.name(),
            active = sessions.len(),
            "registered"
        );
        Ok(())
    }

    /// Removes `session` if it is still the registered holder of its name.
    /// Returns whether anything was removed.
    pub async fn unregister(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(session.name()) {
            Some(existing) if Arc::ptr_eq(existing, session) => {
                sessions.remove(session.name());
                debug!(
                    session = session.id(),
                    name = session.name(),
                    active = sessions.len(),
                    "unregistered"
                );
                true
            }
            _ => false,
        }
    }

    /// Sends `line` to every active session except the one named `exclude`.
    ///
    /// A failed write never stops delivery to the other peers. Sessions that
    /// fail are marked closing during the fan-out, then removed and closed
    /// before this returns.
    pub async fn broadcast(&self, line: &str, exclude: &str) -> BroadcastReport {
        let targets: Vec<Arc<Session>> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|session| session.name() != exclude && session.is_active())
                .cloned()
                .collect()
        };

        let results = join_all(targets.iter().map(|target| target.write_line(line))).await;

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (target, result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!(
                        session = target.id(),
                        name = target.name(),
                        %error,
                        "dropping peer after failed delivery"
                    );
                    target.begin_closing();
                    failed.push(target);
                }
            }
        }

        for target in failed {
            self.unregister(&target).await;
            target.close().await;
            report.dropped.push(target.name().to_string());
        }

        report
    }

    /// Removes and closes every session. Returns how many there were.
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, session)| session).collect()
        };

        for session in &sessions {
            session.begin_closing();
        }
        join_all(sessions.iter().map(|session| session.close())).await;
        sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
