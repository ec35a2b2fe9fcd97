use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::codegen;
use crate::journal::PortLog;
use crate::protocol::{Reply, sorted_users};

pub type SessionId = u64;

pub struct Session {
    pub username: String,
    /// Set once the handshake line has been processed.
    pub joined: bool,
    tx: mpsc::UnboundedSender<String>,
}

/// The live sessions of one port. Dropping a session's entry drops its
/// outbound sender, which ends the session task.
pub struct Room {
    log: PortLog,
    sessions: DashMap<SessionId, Session>,
    next_id: AtomicU64,
}

impl Room {
    pub fn new(log: PortLog) -> Self {
        Self {
            log,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn log(&self) -> &PortLog {
        &self.log
    }

    pub fn register(&self, peer: SocketAddr) -> (SessionId, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let session = Session {
            username: codegen::anonymous_alias(peer, id),
            joined: false,
            tx,
        };

        self.sessions.insert(id, session);

        (id, rx)
    }

    /// Marks the session joined, optionally renaming it, and returns the
    /// name it goes by.
    pub fn join(&self, id: SessionId, name: Option<String>) -> Option<String> {
        let mut session = self.sessions.get_mut(&id)?;

        if let Some(name) = name {
            session.username = name;
        }
        session.joined = true;

        Some(session.username.clone())
    }

    pub fn username(&self, id: SessionId) -> Option<String> {
        self.sessions.get(&id).map(|s| s.username.clone())
    }

    pub fn send<R: Display>(&self, reply: R) {
        let line = reply.to_string();

        for session in self.sessions.iter() {
            let _ = session.tx.send(line.clone());
        }
    }

    pub fn send_except<R: Display>(&self, sender: SessionId, reply: R) {
        let line = reply.to_string();

        for session in self.sessions.iter().filter(|s| *s.key() != sender) {
            let _ = session.tx.send(line.clone());
        }
    }

    /// Delivers to the earliest-connected session named `user`. Returns
    /// false when nobody goes by that name.
    pub fn send_to_user<R: Display>(&self, user: &str, reply: R) -> bool {
        let target = self
            .sessions
            .iter()
            .filter(|s| s.joined && s.username == user)
            .min_by_key(|s| *s.key())
            .map(|s| s.tx.clone());

        match target {
            Some(tx) => tx.send(reply.to_string()).is_ok(),
            None => false,
        }
    }

    /// Names of joined sessions, sorted and deduplicated.
    pub fn usernames(&self) -> Vec<String> {
        sorted_users(
            self.sessions
                .iter()
                .filter(|s| s.joined)
                .map(|s| s.username.clone()),
        )
    }

    pub fn users_reply(&self) -> Reply {
        Reply::Users(self.usernames())
    }

    pub fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    /// Drops every session, closing their connections.
    pub fn clear(&self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    fn room(dir: &std::path::Path) -> Room {
        let (feed, _) = broadcast::channel(16);

        Room::new(PortLog::new(4100, dir, feed))
    }

    fn peer(n: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000 + n))
    }

    #[tokio::test]
    async fn only_joined_sessions_are_listed() {
        let tmp = tempfile::tempdir().unwrap();
        let room = room(tmp.path());

        let (a, _ra) = room.register(peer(1));
        let (b, _rb) = room.register(peer(2));
        let (_c, _rc) = room.register(peer(3));

        room.join(a, Some("zed".into()));
        room.join(b, Some("amy".into()));

        assert_eq!(room.usernames(), vec!["amy", "zed"]);
        assert_eq!(room.len(), 3);
    }

    #[tokio::test]
    async fn join_without_name_keeps_alias() {
        let tmp = tempfile::tempdir().unwrap();
        let room = room(tmp.path());

        let (id, _rx) = room.register(peer(1));
        let alias = room.username(id).unwrap();

        assert_eq!(room.join(id, None), Some(alias.clone()));
        assert!(alias.starts_with("Anon_"));
    }

    #[tokio::test]
    async fn send_except_skips_sender() {
        let tmp = tempfile::tempdir().unwrap();
        let room = room(tmp.path());

        let (a, mut ra) = room.register(peer(1));
        let (_b, mut rb) = room.register(peer(2));

        room.send_except(a, "MSG:x|00:00:00|hi");

        assert_eq!(rb.recv().await.unwrap(), "MSG:x|00:00:00|hi");
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn private_goes_to_first_matching_session() {
        let tmp = tempfile::tempdir().unwrap();
        let room = room(tmp.path());

        let (a, mut ra) = room.register(peer(1));
        let (b, mut rb) = room.register(peer(2));
        room.join(a, Some("dup".into()));
        room.join(b, Some("dup".into()));

        assert!(room.send_to_user("dup", "psst"));
        assert!(!room.send_to_user("ghost", "psst"));

        assert_eq!(ra.recv().await.unwrap(), "psst");
        assert!(rb.try_recv().is_err());
        assert_eq!(room.usernames(), vec!["dup"]);
    }

    #[tokio::test]
    async fn clear_closes_outbound_channels() {
        let tmp = tempfile::tempdir().unwrap();
        let room = room(tmp.path());

        let (_a, mut ra) = room.register(peer(1));
        room.clear();

        assert!(ra.recv().await.is_none());
        assert!(room.is_empty());
    }
}
