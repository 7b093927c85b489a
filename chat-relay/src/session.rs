//! Server-side state for one connected, named client.

use std::{
    net::SocketAddr,
    sync::{
        Mutex as SyncMutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, watch},
};
use tracing::debug;

use crate::frame::{ChannelError, Frame, write_encoded};

pub type SessionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which presence notification the session has produced so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Pending,
    Joined,
    Left,
}

/// A registered client: its username plus the write half of its stream.
///
/// The read half belongs to the session's receive loop, which watches
/// [`Session::closed`] so that a close from any task also ends the loop.
pub struct Session {
    id: SessionId,
    username: String,
    peer: Option<SocketAddr>,
    // One frame at a time: broadcasts from many receive loops share this writer.
    writer: Mutex<BoxedWriter>,
    alive: AtomicBool,
    displaced: AtomicBool,
    presence: SyncMutex<Presence>,
    closed: watch::Sender<bool>,
}

impl Session {
    pub fn new<W>(id: SessionId, username: String, peer: Option<SocketAddr>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            username,
            peer,
            writer: Mutex::new(Box::new(writer)),
            alive: AtomicBool::new(true),
            displaced: AtomicBool::new(false),
            presence: SyncMutex::new(Presence::Pending),
            closed,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Writes one frame. Fails fast with [`ChannelError::Closed`] once the
    /// session has been closed; a write racing a close may still hit the
    /// stream and fail there instead.
    pub async fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        if !self.is_alive() {
            return Err(ChannelError::Closed);
        }
        self.send_encoded(&frame.encode()?).await
    }

    /// Writes an already encoded frame, letting a broadcast encode once for
    /// every recipient.
    pub(crate) async fn send_encoded(&self, encoded: &[u8]) -> Result<(), ChannelError> {
        if !self.is_alive() {
            return Err(ChannelError::Closed);
        }
        // A peer that stops reading can park a write forever; close() must
        // still be able to take the writer, so both waits yield to it.
        let mut writer = select! {
            writer = self.writer.lock() => writer,
            _ = self.closed() => return Err(ChannelError::Closed),
        };
        select! {
            written = write_encoded(&mut *writer, encoded) => written,
            _ = self.closed() => Err(ChannelError::Closed),
        }
    }

    /// Closes the session. Returns `true` only for the call that actually
    /// performed the close, so teardown side effects run exactly once.
    ///
    /// Any write in flight is abandoned, so this never waits on a congested peer.
    pub async fn close(&self) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.closed.send_replace(true);

        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.shutdown().await {
            debug!(username = %self.username, ?error, "failed to shut down session writer");
        }
        true
    }

    /// Resolves once [`Session::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn mark_displaced(&self) {
        self.displaced.store(true, Ordering::Release);
    }

    fn presence(&self) -> MutexGuard<'_, Presence> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `announce` unless the session was already torn down. Returns
    /// whether it ran. Pairs with [`Session::announce_leave`] so a leave is
    /// only ever reported after its join.
    pub(crate) fn announce_join(&self, announce: impl FnOnce()) -> bool {
        let mut presence = self.presence();
        if *presence != Presence::Pending {
            return false;
        }
        *presence = Presence::Joined;
        announce();
        true
    }

    /// Runs `announce` if, and only the first time after, a join was announced.
    pub(crate) fn announce_leave(&self, announce: impl FnOnce()) -> bool {
        let mut presence = self.presence();
        let previous = std::mem::replace(&mut *presence, Presence::Left);
        if previous != Presence::Joined {
            return false;
        }
        announce();
        true
    }

    /// Whether a newer registration under the same username replaced this session.
    pub fn is_displaced(&self) -> bool {
        self.displaced.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::frame::read_frame;

    #[tokio::test]
    async fn send_writes_a_frame_to_the_stream() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let session = Session::new(1, "alice".into(), None, writer);

        session
            .send(&Frame::Text("bob: hi".into()))
            .await
            .expect("send");

        let frame = read_frame(&mut reader, 1024).await.expect("read");
        assert_eq!(frame, Frame::Text("bob: hi".into()));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (writer, _reader) = tokio::io::duplex(64);
        let session = Session::new(1, "alice".into(), None, writer);

        assert!(session.close().await);
        assert!(!session.close().await);
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn send_after_close_fails_without_touching_the_stream() {
        let (writer, _reader) = tokio::io::duplex(64);
        let session = Session::new(1, "alice".into(), None, writer);
        session.close().await;

        let err = session
            .send(&Frame::Text("late".into()))
            .await
            .expect_err("closed session should refuse");
        assert!(matches!(err, ChannelError::Closed));
    }

    #[tokio::test]
    async fn closed_resolves_for_waiters_before_and_after_close() {
        let (writer, _reader) = tokio::io::duplex(64);
        let session = std::sync::Arc::new(Session::new(1, "alice".into(), None, writer));

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };
        session.close().await;

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("join");
        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .expect("late waiter should resolve immediately");
    }

    #[test]
    fn leave_is_never_reported_without_a_join() {
        let (writer, _reader) = tokio::io::duplex(64);
        let session = Session::new(1, "alice".into(), None, writer);

        assert!(!session.announce_leave(|| panic!("no join yet")));
        assert!(!session.announce_join(|| panic!("already torn down")));
    }

    #[test]
    fn leave_follows_join_exactly_once() {
        let (writer, _reader) = tokio::io::duplex(64);
        let session = Session::new(1, "alice".into(), None, writer);
        let mut notices = Vec::new();

        assert!(session.announce_join(|| notices.push("joined")));
        assert!(!session.announce_join(|| notices.push("joined again")));
        assert!(session.announce_leave(|| notices.push("left")));
        assert!(!session.announce_leave(|| notices.push("left again")));
        assert_eq!(notices, vec!["joined", "left"]);
    }

    #[tokio::test]
    async fn close_does_not_wait_behind_a_stalled_write() {
        // Nobody drains `_reader`, so the second frame cannot fit.
        let (writer, _reader) = tokio::io::duplex(1024);
        let session = std::sync::Arc::new(Session::new(1, "bob".into(), None, writer));
        let stalled = {
            let session = session.clone();
            tokio::spawn(async move {
                let body = "x".repeat(4096);
                session.send(&Frame::Text(body)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stalled.is_finished());

        let closed = tokio::time::timeout(Duration::from_secs(1), session.close())
            .await
            .expect("close should not wait for the stalled write");
        assert!(closed);

        let result = tokio::time::timeout(Duration::from_secs(1), stalled)
            .await
            .expect("stalled send should give up")
            .expect("join");
        assert!(matches!(result, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn concurrent_sends_never_interleave_frames() {
        let (writer, mut reader) = tokio::io::duplex(256);
        let session = std::sync::Arc::new(Session::new(1, "alice".into(), None, writer));

        let mut tasks = Vec::new();
        for sender in 0..8 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                let body = format!("{sender}:{}", "x".repeat(200));
                for _ in 0..10 {
                    session.send(&Frame::Text(body.clone())).await.expect("send");
                }
            }));
        }

        for _ in 0..80 {
            match read_frame(&mut reader, 1024).await.expect("read") {
                Frame::Text(body) => {
                    let (_, tail) = body.split_once(':').expect("prefix");
                    assert_eq!(tail.len(), 200);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        for task in tasks {
            task.await.expect("join");
        }
    }
}
